//! Process lifecycle primitives
//!
//! [`ProcessLauncher`] is the seam between the supervisor and the operating
//! system: the real [`CommandLauncher`] spawns `tokio::process` children,
//! while tests and the in-process mock API server provide their own
//! implementations so teardown logic can be exercised without real
//! processes.

use std::collections::VecDeque;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};

use crate::common::{Error, Result};
use crate::config::ServiceSpec;

/// Maximum lines retained per service before old output is dropped
const LOG_BUFFER_CAP: usize = 10_000;

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Pending,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

/// Append-only log buffer shared between the output pumps and the
/// supervisor's artifact capture
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == LOG_BUFFER_CAP {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// Supervisor-owned bookkeeping for one service
pub struct ProcessHandle {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub logs: LogBuffer,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self {
            state: ServiceState::Pending,
            pid: None,
            logs: LogBuffer::new(),
        }
    }
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A running supervised process
///
/// `wait` may be awaited concurrently by the crash monitor and the
/// supervisor; it resolves for every caller once the process exits.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolves with the exit code once the process has exited
    async fn wait(&self) -> i32;

    /// Graceful termination: signal, wait up to `grace`, then force-kill
    async fn terminate(&self, grace: Duration);
}

/// Launches processes for the supervisor
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        run_id: &str,
        logs: LogBuffer,
    ) -> Result<Arc<dyn ManagedProcess>>;
}

/// Real launcher backed by `tokio::process`
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        run_id: &str,
        logs: LogBuffer,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let mut cmd = TokioCommand::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .env("RUN_ID", run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so graceful/forced signals never leak to us
        #[cfg(unix)]
        cmd.as_std_mut().process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Config(format!(
                "Failed to spawn service '{}' ({}): {}",
                spec.name, spec.command, e
            ))
        })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, spec.name.clone(), logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, spec.name.clone(), logs.clone());
        }

        Ok(Arc::new(TokioProcess::new(child, pid)))
    }
}

fn pump_lines<R>(reader: R, service: String, logs: LogBuffer)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(service = %service, "{}", line);
            logs.push(line);
        }
    });
}

/// [`ManagedProcess`] implementation over a `tokio::process::Child`
///
/// The child is owned by a background reaper task; termination requests and
/// exit notifications travel over channels so `terminate` and `wait` can be
/// called through a shared reference.
pub struct TokioProcess {
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
    kill: mpsc::Sender<()>,
}

impl TokioProcess {
    fn new(mut child: tokio::process::Child, pid: Option<u32>) -> Self {
        let (exit_tx, exited) = watch::channel(None);
        let (kill, mut kill_rx) = mpsc::channel::<()>(4);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status
                            .map(|s| s.code().unwrap_or(-1))
                            .unwrap_or(-1);
                        let _ = exit_tx.send(Some(code));
                        break;
                    }
                    req = kill_rx.recv() => {
                        match req {
                            Some(()) => {
                                let _ = child.start_kill();
                            }
                            None => {
                                let code = child
                                    .wait()
                                    .await
                                    .map(|s| s.code().unwrap_or(-1))
                                    .unwrap_or(-1);
                                let _ = exit_tx.send(Some(code));
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { pid, exited, kill }
    }
}

#[async_trait]
impl ManagedProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&self) -> i32 {
        let mut rx = self.exited.clone();
        let code = match rx.wait_for(|e| e.is_some()).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        };
        code
    }

    async fn terminate(&self, grace: Duration) {
        if self.exited.borrow().is_some() {
            return;
        }

        // Signal the whole process group; services often spawn helpers
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.kill.send(()).await;
        }

        let mut rx = self.exited.clone();
        let graceful = tokio::time::timeout(grace, rx.wait_for(|e| e.is_some()))
            .await
            .is_ok();
        if !graceful {
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = self.kill.send(()).await;
            let _ = rx.wait_for(|e| e.is_some()).await;
        }
    }
}
