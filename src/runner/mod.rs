//! Test runner adapter
//!
//! Invokes the external test-execution tool once the environment is ready,
//! streams its output, and maps the exit status into a [`RunResult`]. The
//! subprocess runs in its own process group so a timeout or cancellation
//! can terminate it together with any descendants.

use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use crate::common::{Error, Result};
use crate::supervisor::cancelled;

/// Outcome of one flow inside the external suite, when the tool reports
/// them as JSON lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow: String,
    pub passed: bool,
}

/// Aggregate result of the external test run; created once, never mutated
#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub passed: bool,
    /// Per-flow results, present only when the tool emitted parseable lines
    pub flows: Vec<FlowResult>,
    /// Captured artifacts (output log, plus whatever the caller adds)
    pub artifacts: Vec<PathBuf>,
}

/// Spawns the external test command against the ready environment
pub struct TestRunnerAdapter {
    env: HashMap<String, String>,
}

impl TestRunnerAdapter {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self { env }
    }

    /// Run `command` with a timeout and the run-wide cancellation signal.
    ///
    /// Exit code 0 maps to a passing result; non-zero is preserved in the
    /// result. A timeout kills the subprocess group and returns
    /// [`Error::SubprocessTimeout`]; cancellation (a critical service
    /// crashed) kills it and returns [`Error::Cancelled`].
    pub async fn run(
        &self,
        command: &[String],
        timeout: Duration,
        cancel: watch::Receiver<bool>,
        artifacts_dir: Option<&Path>,
    ) -> Result<RunResult> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::config("Empty test command"))?;

        tracing::info!(command = %command.join(" "), "running test suite");
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.as_std_mut().process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Config(format!("Failed to spawn test command '{}': {}", program, e))
        })?;
        let pid = child.id();

        let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(stream_lines(stdout, captured.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(stream_lines(stderr, captured.clone(), true));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(timeout) => {
                tracing::error!("test command exceeded its timeout, terminating");
                kill_process_group(pid, &mut child).await;
                return Err(Error::SubprocessTimeout(timeout.as_millis() as u64));
            }
            _ = cancelled(cancel) => {
                tracing::error!("run cancelled, terminating test command");
                kill_process_group(pid, &mut child).await;
                return Err(Error::Cancelled);
            }
        };

        for pump in pumps {
            let _ = pump.await;
        }
        let lines = captured.lock().unwrap().clone();
        let flows = parse_flow_results(&lines);

        let mut artifacts = Vec::new();
        if let Some(dir) = artifacts_dir {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join("test-output.log");
            std::fs::write(&log_path, lines.join("\n"))?;
            artifacts.push(log_path);
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code == 0 {
            tracing::info!("test suite passed");
        } else {
            tracing::warn!(exit_code, "test suite failed");
        }
        Ok(RunResult {
            exit_code,
            passed: exit_code == 0,
            flows,
            artifacts,
        })
    }
}

fn stream_lines<R>(
    reader: R,
    captured: Arc<Mutex<Vec<String>>>,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
            captured.lock().unwrap().push(line);
        }
    })
}

/// Extract per-flow results from output lines shaped like
/// `{"flow": "login", "passed": true}`; anything else is ignored
fn parse_flow_results(lines: &[String]) -> Vec<FlowResult> {
    lines
        .iter()
        .filter_map(|line| serde_json::from_str::<FlowResult>(line.trim()).ok())
        .collect()
}

async fn kill_process_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid signals the whole group, descendants included
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    fn adapter() -> TestRunnerAdapter {
        TestRunnerAdapter::new(HashMap::new())
    }

    fn cmd(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn exit_zero_maps_to_a_passing_result() {
        let result = adapter()
            .run(&cmd("exit 0"), Duration::from_secs(5), never_cancelled(), None)
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_preserves_the_raw_code() {
        let result = adapter()
            .run(&cmd("exit 3"), Duration::from_secs(5), never_cancelled(), None)
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_subprocess() {
        let started = std::time::Instant::now();
        let err = adapter()
            .run(
                &cmd("sleep 30"),
                Duration::from_millis(200),
                never_cancelled(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubprocessTimeout(200)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_subprocess() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            adapter()
                .run(&cmd("sleep 30"), Duration::from_secs(60), rx, None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn parses_flow_results_from_json_lines() {
        let script = r#"echo '{"flow": "login", "passed": true}'; echo plain text; echo '{"flow": "checkout", "passed": false}'"#;
        let result = adapter()
            .run(&cmd(script), Duration::from_secs(5), never_cancelled(), None)
            .await
            .unwrap();
        assert_eq!(result.flows.len(), 2);
        assert_eq!(result.flows[0].flow, "login");
        assert!(result.flows[0].passed);
        assert!(!result.flows[1].passed);
    }

    #[tokio::test]
    async fn writes_the_output_log_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = adapter()
            .run(
                &cmd("echo captured"),
                Duration::from_secs(5),
                never_cancelled(),
                Some(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(result.artifacts.len(), 1);
        let content = std::fs::read_to_string(&result.artifacts[0]).unwrap();
        assert!(content.contains("captured"));
    }

    #[tokio::test]
    async fn environment_is_passed_to_the_test_command() {
        let mut env = HashMap::new();
        env.insert("MOCK_API_URL".to_string(), "http://127.0.0.1:1".to_string());
        let result = TestRunnerAdapter::new(env)
            .run(
                &cmd("test \"$MOCK_API_URL\" = http://127.0.0.1:1"),
                Duration::from_secs(5),
                never_cancelled(),
                None,
            )
            .await
            .unwrap();
        assert!(result.passed);
    }
}
