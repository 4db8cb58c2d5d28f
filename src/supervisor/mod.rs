//! Service supervision
//!
//! The [`ServiceSupervisor`] owns the dependency graph of services, starts
//! them in dependency order gated by readiness probes, watches for crashes,
//! and tears everything down in reverse start order. One coordinating task
//! launches a worker per service; a service's worker blocks until every
//! dependency has signalled ready, so the happens-before edge across the
//! graph is carried by per-service `watch` channels.

pub mod graph;
pub mod probe;
pub mod process;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;

use crate::common::{Error, Result};
use crate::config::ServiceSpec;

pub use probe::ReadinessProbe;
pub use process::{
    CommandLauncher, LogBuffer, ManagedProcess, ProcessHandle, ProcessLauncher, ServiceState,
};

/// Grace period between the termination signal and the forced kill
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Capacity of the lifecycle event channel; slow watchers lag, never block
const EVENT_CAPACITY: usize = 256;

/// Lifecycle notification emitted by the supervisor
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Ready {
        service: String,
    },
    Crashed {
        service: String,
        exit_code: i32,
        critical: bool,
    },
    Stopped {
        service: String,
    },
}

/// Resolves once the cancellation signal fires; pends forever if the
/// sender is gone (a dropped sender must not read as "cancelled")
pub async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct RegisteredService {
    spec: ServiceSpec,
    launcher: Arc<dyn ProcessLauncher>,
}

/// State shared between the supervisor, its per-service workers, and the
/// crash monitors
struct Shared {
    /// Process table, one entry per registered service; every mutation
    /// happens under this single lock
    table: StdMutex<HashMap<String, ProcessHandle>>,
    /// Launched processes in start order, for reverse-order teardown
    started: StdMutex<Vec<(String, Arc<dyn ManagedProcess>)>>,
    events: broadcast::Sender<LifecycleEvent>,
    cancel: watch::Sender<bool>,
    /// Name of the critical service whose crash aborted the run
    abort_reason: StdMutex<Option<String>>,
    /// Guards teardown so `stop_all` is idempotent and single-flight
    teardown_done: AsyncMutex<bool>,
    grace: Duration,
}

impl Shared {
    fn set_state(&self, name: &str, state: ServiceState) {
        if let Some(handle) = self.table.lock().unwrap().get_mut(name) {
            handle.state = state;
        }
    }

    fn set_pid(&self, name: &str, pid: Option<u32>) {
        if let Some(handle) = self.table.lock().unwrap().get_mut(name) {
            handle.pid = pid;
        }
    }

    fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.table.lock().unwrap().get(name).map(|h| h.state)
    }

    fn logs_for(&self, name: &str) -> LogBuffer {
        self.table
            .lock()
            .unwrap()
            .get(name)
            .map(|h| h.logs.clone())
            .unwrap_or_default()
    }

    fn record_started(&self, name: &str, proc: Arc<dyn ManagedProcess>) {
        self.started
            .lock()
            .unwrap()
            .push((name.to_string(), proc));
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    fn request_cancel(&self, crashed_critical: Option<String>) {
        if let Some(service) = crashed_critical {
            let mut reason = self.abort_reason.lock().unwrap();
            if reason.is_none() {
                *reason = Some(service);
            }
        }
        let _ = self.cancel.send(true);
    }

    /// Stop every started service in reverse start order. Idempotent: the
    /// first completed call wins, later calls return immediately.
    async fn stop_all(&self) {
        let mut done = self.teardown_done.lock().await;
        if *done {
            return;
        }
        let started: Vec<(String, Arc<dyn ManagedProcess>)> = {
            let list = self.started.lock().unwrap();
            list.iter().rev().cloned().collect()
        };
        for (name, proc) in started {
            if matches!(
                self.state_of(&name),
                Some(ServiceState::Stopped | ServiceState::Crashed)
            ) {
                continue;
            }
            self.set_state(&name, ServiceState::Stopping);
            tracing::info!(service = %name, "stopping");
            proc.terminate(self.grace).await;
            self.set_state(&name, ServiceState::Stopped);
            self.emit(LifecycleEvent::Stopped {
                service: name.clone(),
            });
        }
        *done = true;
    }
}

/// Owns the service graph and the lifecycle of every process in it
pub struct ServiceSupervisor {
    services: Vec<RegisteredService>,
    index: HashMap<String, usize>,
    default_launcher: Arc<dyn ProcessLauncher>,
    shared: Arc<Shared>,
    run_id: String,
}

impl ServiceSupervisor {
    pub fn new(run_id: &str) -> Self {
        Self::with_launcher(run_id, Arc::new(CommandLauncher))
    }

    /// Construct with a custom default launcher (tests inject fakes here)
    pub fn with_launcher(run_id: &str, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, _) = watch::channel(false);
        Self {
            services: Vec::new(),
            index: HashMap::new(),
            default_launcher: launcher,
            shared: Arc::new(Shared {
                table: StdMutex::new(HashMap::new()),
                started: StdMutex::new(Vec::new()),
                events,
                cancel,
                abort_reason: StdMutex::new(None),
                teardown_done: AsyncMutex::new(false),
                grace: STOP_GRACE,
            }),
            run_id: run_id.to_string(),
        }
    }

    /// Register a service, rejecting it if it would create a cycle
    pub fn register(&mut self, spec: ServiceSpec) -> Result<()> {
        let launcher = self.default_launcher.clone();
        self.register_with_launcher(spec, launcher)
    }

    /// Register a service with its own launcher (used for in-process
    /// services like the mock API server)
    pub fn register_with_launcher(
        &mut self,
        spec: ServiceSpec,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(Error::Config(format!(
                "Service '{}' is already registered",
                spec.name
            )));
        }

        let mut nodes: Vec<graph::Node> = self
            .services
            .iter()
            .map(|s| (s.spec.name.clone(), s.spec.depends_on.clone()))
            .collect();
        nodes.push((spec.name.clone(), spec.depends_on.clone()));
        if let Some(service) = graph::find_cycle(&nodes) {
            return Err(Error::DependencyCycle { service });
        }

        self.shared
            .table
            .lock()
            .unwrap()
            .insert(spec.name.clone(), ProcessHandle::new());
        self.index.insert(spec.name.clone(), self.services.len());
        self.services.push(RegisteredService { spec, launcher });
        Ok(())
    }

    /// Lifecycle events from this point on; each call gets a fresh stream
    pub fn watch(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Run-wide cancellation signal, threaded into every readiness wait
    /// and into the test subprocess wait
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.shared.cancel.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.cancel.borrow()
    }

    /// The critical service whose crash aborted the run, if any
    pub fn abort_reason(&self) -> Option<String> {
        self.shared.abort_reason.lock().unwrap().clone()
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.shared.state_of(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.spec.name.clone()).collect()
    }

    /// Snapshot of a service's captured output
    pub fn logs(&self, name: &str) -> Vec<String> {
        self.shared.logs_for(name).snapshot()
    }

    /// Map a bare cancellation into the crash that caused it, when known
    pub fn resolve_cancelled(&self, err: Error) -> Error {
        if matches!(err, Error::Cancelled) {
            if let Some(service) = self.abort_reason() {
                return Error::ProcessCrash { service };
            }
        }
        err
    }

    /// Start every registered service in dependency order.
    ///
    /// Services whose dependencies are all ready start concurrently. Any
    /// per-service readiness timeout aborts the whole startup, stops
    /// already-started services in reverse order, and surfaces
    /// [`Error::ReadinessTimeout`] naming the offender. Exceeding
    /// `aggregate` tears down the same way and surfaces
    /// [`Error::AggregateTimeout`].
    pub async fn start_all(&self, aggregate: Duration) -> Result<()> {
        // Everything below spawns processes; validate the whole graph and
        // every readiness descriptor first.
        for service in &self.services {
            for dep in &service.spec.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(Error::Config(format!(
                        "Service '{}' depends on unregistered service '{}'",
                        service.spec.name, dep
                    )));
                }
            }
            ReadinessProbe::from_spec(&service.spec.name, &service.spec.readiness)?;
        }
        let nodes: Vec<graph::Node> = self
            .services
            .iter()
            .map(|s| (s.spec.name.clone(), s.spec.depends_on.clone()))
            .collect();
        graph::topo_order(&nodes)?;

        let mut ready_tx: Vec<watch::Sender<bool>> = Vec::with_capacity(self.services.len());
        let mut ready_rx: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        for service in &self.services {
            let (tx, rx) = watch::channel(false);
            ready_tx.push(tx);
            ready_rx.insert(service.spec.name.clone(), rx);
        }

        let mut workers = JoinSet::new();
        for (service, ready) in self.services.iter().zip(ready_tx) {
            let deps: Vec<watch::Receiver<bool>> = service
                .spec
                .depends_on
                .iter()
                .map(|d| ready_rx[d].clone())
                .collect();
            workers.spawn(start_service(
                service.spec.clone(),
                service.launcher.clone(),
                deps,
                ready,
                self.shared.clone(),
                self.run_id.clone(),
            ));
        }

        let shared = self.shared.clone();
        let drain = async {
            let mut first_err: Option<Error> = None;
            while let Some(joined) = workers.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Err(Error::Internal(format!("service worker panicked: {}", e))),
                };
                if let Err(e) = outcome {
                    if first_err.is_none() {
                        first_err = Some(e);
                        // Unblock every other worker so teardown can run
                        shared.request_cancel(None);
                    }
                }
            }
            match first_err {
                None => Ok(()),
                Some(e) => Err(e),
            }
        };

        match tokio::time::timeout(aggregate, drain).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shared.stop_all().await;
                Err(self.resolve_cancelled(e))
            }
            Err(_) => {
                self.shared.request_cancel(None);
                self.shared.stop_all().await;
                Err(Error::AggregateTimeout(aggregate.as_millis() as u64))
            }
        }
    }

    /// Stop every running service in reverse start order; idempotent
    pub async fn stop_all(&self) {
        self.shared.stop_all().await;
    }
}

/// Worker for one service: wait for dependencies, launch, gate on
/// readiness, then hand off to a crash monitor.
async fn start_service(
    spec: ServiceSpec,
    launcher: Arc<dyn ProcessLauncher>,
    deps: Vec<watch::Receiver<bool>>,
    ready: watch::Sender<bool>,
    shared: Arc<Shared>,
    run_id: String,
) -> Result<()> {
    let cancel = shared.cancel.subscribe();

    for mut dep in deps {
        tokio::select! {
            _ = cancelled(cancel.clone()) => return Err(Error::Cancelled),
            result = dep.wait_for(|r| *r) => {
                // A dropped sender means the dependency's worker failed
                if result.is_err() {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
    if *cancel.borrow() {
        return Err(Error::Cancelled);
    }

    shared.set_state(&spec.name, ServiceState::Starting);
    tracing::info!(service = %spec.name, command = %spec.command, "starting");
    let logs = shared.logs_for(&spec.name);
    let proc = launcher.launch(&spec, &run_id, logs).await?;
    shared.record_started(&spec.name, proc.clone());
    shared.set_pid(&spec.name, proc.pid());

    let probe = ReadinessProbe::from_spec(&spec.name, &spec.readiness)?;
    let became_ready = tokio::select! {
        outcome = probe.wait_ready(cancel.clone()) => outcome?,
        exit_code = proc.wait() => {
            shared.set_state(&spec.name, ServiceState::Crashed);
            shared.emit(LifecycleEvent::Crashed {
                service: spec.name.clone(),
                exit_code,
                critical: spec.critical,
            });
            tracing::error!(service = %spec.name, exit_code, "service exited during startup");
            return Err(Error::ProcessCrash {
                service: spec.name.clone(),
            });
        }
    };
    if !became_ready {
        return Err(Error::ReadinessTimeout {
            service: spec.name.clone(),
            timeout_ms: spec.readiness.timeout_ms,
        });
    }

    shared.set_state(&spec.name, ServiceState::Ready);
    let _ = ready.send(true);
    shared.emit(LifecycleEvent::Ready {
        service: spec.name.clone(),
    });
    tracing::info!(service = %spec.name, "ready");

    spawn_crash_monitor(spec, proc, shared);
    Ok(())
}

/// Watch a ready service for unexpected exits. A critical crash cancels
/// the run and tears everything down; a non-critical crash only degrades
/// it.
fn spawn_crash_monitor(spec: ServiceSpec, proc: Arc<dyn ManagedProcess>, shared: Arc<Shared>) {
    tokio::spawn(async move {
        let cancel = shared.cancel.subscribe();
        tokio::select! {
            _ = cancelled(cancel) => {}
            exit_code = proc.wait() => {
                // Teardown moves the state off Ready before terminating,
                // so an exit seen here while Ready is a genuine crash
                if shared.state_of(&spec.name) == Some(ServiceState::Ready) {
                    shared.set_state(&spec.name, ServiceState::Crashed);
                    tracing::error!(
                        service = %spec.name,
                        exit_code,
                        critical = spec.critical,
                        "service crashed"
                    );
                    shared.emit(LifecycleEvent::Crashed {
                        service: spec.name.clone(),
                        exit_code,
                        critical: spec.critical,
                    });
                    if spec.critical {
                        shared.request_cancel(Some(spec.name.clone()));
                        shared.stop_all().await;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProbeKind, ReadinessSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct FakeProcess {
        exit_tx: Arc<watch::Sender<Option<i32>>>,
        exited: watch::Receiver<Option<i32>>,
        terminations: Arc<AtomicUsize>,
    }

    impl FakeProcess {
        fn new() -> Self {
            let (tx, rx) = watch::channel(None);
            Self {
                exit_tx: Arc::new(tx),
                exited: rx,
                terminations: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn exit_with(&self, code: i32) {
            let _ = self.exit_tx.send(Some(code));
        }
    }

    #[async_trait]
    impl ManagedProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&self) -> i32 {
            let mut rx = self.exited.clone();
            let code = match rx.wait_for(|e| e.is_some()).await {
                Ok(code) => code.unwrap_or(-1),
                Err(_) => -1,
            };
            code
        }

        async fn terminate(&self, _grace: Duration) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            let _ = self.exit_tx.send(Some(0));
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: StdMutex<Vec<String>>,
        procs: StdMutex<HashMap<String, FakeProcess>>,
    }

    impl FakeLauncher {
        fn launch_order(&self) -> Vec<String> {
            self.launched.lock().unwrap().clone()
        }

        fn proc(&self, name: &str) -> FakeProcess {
            self.procs.lock().unwrap().get(name).unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(
            &self,
            spec: &ServiceSpec,
            _run_id: &str,
            _logs: LogBuffer,
        ) -> Result<Arc<dyn ManagedProcess>> {
            self.launched.lock().unwrap().push(spec.name.clone());
            let proc = FakeProcess::new();
            self.procs
                .lock()
                .unwrap()
                .insert(spec.name.clone(), proc.clone());
            Ok(Arc::new(proc))
        }
    }

    fn spec(name: &str, deps: &[&str], probe: &str, timeout_ms: u64, critical: bool) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            command: "fake".into(),
            args: Vec::new(),
            env: HashMap::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            readiness: ReadinessSpec {
                kind: ProbeKind::Command,
                target: probe.into(),
                timeout_ms,
                poll_interval_ms: 50,
            },
            critical,
        }
    }

    fn supervisor_with(launcher: Arc<FakeLauncher>) -> ServiceSupervisor {
        ServiceSupervisor::with_launcher("run-test", launcher)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn dependencies_gate_start_order() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("db", &[], "true", 5000, true)).unwrap();
        sup.register(spec("auth", &["db"], "true", 5000, false)).unwrap();
        sup.register(spec("mock", &["db"], "true", 5000, false)).unwrap();

        sup.start_all(Duration::from_secs(10)).await.unwrap();

        let order = launcher.launch_order();
        assert_eq!(order[0], "db");
        assert!(order.contains(&"auth".to_string()));
        assert!(order.contains(&"mock".to_string()));
        for name in ["db", "auth", "mock"] {
            assert_eq!(sup.state(name), Some(ServiceState::Ready));
        }

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn register_rejects_cycles_before_any_spawn() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("a", &["b"], "true", 1000, false)).unwrap();
        let err = sup
            .register(spec("b", &["a"], "true", 1000, false))
            .unwrap_err();

        assert!(matches!(err, Error::DependencyCycle { .. }));
        assert!(launcher.launch_order().is_empty());
    }

    #[tokio::test]
    async fn readiness_timeout_names_offender_and_leaves_dependents_pending() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("db", &[], "false", 300, true)).unwrap();
        sup.register(spec("auth", &["db"], "true", 5000, false)).unwrap();
        sup.register(spec("mock", &["db"], "true", 5000, false)).unwrap();

        let err = sup.start_all(Duration::from_secs(30)).await.unwrap_err();
        match err {
            Error::ReadinessTimeout { service, .. } => assert_eq!(service, "db"),
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }

        assert_eq!(launcher.launch_order(), vec!["db"]);
        assert_eq!(sup.state("auth"), Some(ServiceState::Pending));
        assert_eq!(sup.state("mock"), Some(ServiceState::Pending));
        assert_eq!(sup.state("db"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("db", &[], "true", 5000, true)).unwrap();
        sup.start_all(Duration::from_secs(10)).await.unwrap();

        sup.stop_all().await;
        let state_after_first = sup.state("db");
        sup.stop_all().await;

        assert_eq!(state_after_first, Some(ServiceState::Stopped));
        assert_eq!(sup.state("db"), state_after_first);
        assert_eq!(launcher.proc("db").terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_crash_cancels_run_and_stops_everything() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("db", &[], "true", 5000, true)).unwrap();
        sup.register(spec("telemetry", &[], "true", 5000, false)).unwrap();
        sup.start_all(Duration::from_secs(10)).await.unwrap();

        let mut events = sup.watch();
        launcher.proc("db").exit_with(9);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within 2s")
            .unwrap();
        match event {
            LifecycleEvent::Crashed {
                service, critical, ..
            } => {
                assert_eq!(service, "db");
                assert!(critical);
            }
            other => panic!("expected Crashed, got {other:?}"),
        }

        eventually(|| sup.is_cancelled()).await;
        assert_eq!(sup.abort_reason().as_deref(), Some("db"));
        eventually(|| sup.state("telemetry") == Some(ServiceState::Stopped)).await;
        assert_eq!(sup.state("db"), Some(ServiceState::Crashed));
    }

    #[tokio::test]
    async fn noncritical_crash_degrades_without_cancelling() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        sup.register(spec("db", &[], "true", 5000, true)).unwrap();
        sup.register(spec("telemetry", &[], "true", 5000, false)).unwrap();
        sup.start_all(Duration::from_secs(10)).await.unwrap();

        let mut events = sup.watch();
        launcher.proc("telemetry").exit_with(1);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within 2s")
            .unwrap();
        assert!(matches!(
            event,
            LifecycleEvent::Crashed { critical: false, .. }
        ));

        assert!(!sup.is_cancelled());
        assert_eq!(sup.state("db"), Some(ServiceState::Ready));
        assert_eq!(sup.state("telemetry"), Some(ServiceState::Crashed));

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn aggregate_timeout_tears_down_and_reports() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor_with(launcher.clone());
        // Per-service budget far larger than the aggregate one
        sup.register(spec("db", &[], "false", 60_000, true)).unwrap();

        let err = sup.start_all(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, Error::AggregateTimeout(300)));
        assert_ne!(sup.state("db"), Some(ServiceState::Ready));
    }
}
