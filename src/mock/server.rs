//! Mock API server
//!
//! Serves HTTP requests by matching them against the fixture registry. The
//! server is a managed service: it registers with the supervisor through an
//! in-process launcher, so dependency ordering, readiness gating, and
//! teardown treat it exactly like an external process.
//!
//! Requests are handled independently; the only cross-request state is a
//! pair of atomic counters, an append-only request log, and the run-scoped
//! seeded random source used for failure injection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::common::{Error, Result};
use crate::config::{ProbeKind, ReadinessSpec, ServiceSpec};
use crate::supervisor::{cancelled, LogBuffer, ManagedProcess, ProcessLauncher};

use super::registry::{FixtureRegistry, MatchOutcome};

/// Service name the mock server registers under
pub const MOCK_SERVICE_NAME: &str = "mock-api";

/// One observed request, recorded append-only for later inspection
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    /// Raw pattern of the fixture that matched, if any
    pub matched: Option<String>,
    pub status: u16,
}

/// Shared handler state
struct MockState {
    registry: FixtureRegistry,
    rng: StdMutex<StdRng>,
    matched_total: AtomicU64,
    unmatched_total: AtomicU64,
    request_log: StdMutex<Vec<RequestRecord>>,
}

impl MockState {
    fn record(&self, record: RequestRecord) {
        self.request_log.lock().unwrap().push(record);
    }
}

/// Fixture-backed HTTP server bound to one port
pub struct MockApiServer {
    state: Arc<MockState>,
    addr: SocketAddr,
    listener: StdMutex<Option<TcpListener>>,
}

impl MockApiServer {
    /// Bind the listener up front so the address is known before the
    /// supervisor starts anything; port 0 picks an ephemeral port.
    pub async fn bind(registry: FixtureRegistry, seed: u64, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            state: Arc::new(MockState {
                registry,
                rng: StdMutex::new(StdRng::seed_from_u64(seed)),
                matched_total: AtomicU64::new(0),
                unmatched_total: AtomicU64::new(0),
                request_log: StdMutex::new(Vec::new()),
            }),
            addr,
            listener: StdMutex::new(Some(listener)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Service entry for registering this server with the supervisor
    pub fn service_spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: MOCK_SERVICE_NAME.to_string(),
            command: "internal:mock-api".to_string(),
            args: Vec::new(),
            env: Default::default(),
            depends_on: Vec::new(),
            readiness: ReadinessSpec {
                kind: ProbeKind::Tcp,
                target: self.addr.to_string(),
                timeout_ms: 5_000,
                poll_interval_ms: 50,
            },
            critical: true,
        }
    }

    /// Launcher that runs this server in-process as a managed service
    pub fn launcher(&self) -> Arc<dyn ProcessLauncher> {
        Arc::new(InProcessLauncher {
            state: self.state.clone(),
            listener: StdMutex::new(self.listener.lock().unwrap().take()),
        })
    }

    pub fn matched_total(&self) -> u64 {
        self.state.matched_total.load(Ordering::Relaxed)
    }

    pub fn unmatched_total(&self) -> u64 {
        self.state.unmatched_total.load(Ordering::Relaxed)
    }

    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.state.request_log.lock().unwrap().clone()
    }

    /// Requests that matched no fixture, kept for post-run diagnostics
    pub fn unmatched_requests(&self) -> Vec<RequestRecord> {
        self.request_log()
            .into_iter()
            .filter(|r| r.matched.is_none())
            .collect()
    }
}

fn router(state: Arc<MockState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<MockState>>, req: Request) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    match state.registry.match_request(&method, &path) {
        MatchOutcome::Fixture(entry) => {
            if let Some(ms) = entry.definition.latency_ms {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }

            let inject_failure = match entry.definition.failure_rate {
                Some(rate) => state.rng.lock().unwrap().gen::<f64>() < rate,
                None => false,
            };
            let (status, body) = if inject_failure {
                (
                    entry.definition.failure_status.unwrap_or(500),
                    entry
                        .definition
                        .failure_body
                        .clone()
                        .unwrap_or_else(|| json!({ "error": "injected failure" })),
                )
            } else {
                (entry.definition.status, entry.definition.body.clone())
            };

            state.matched_total.fetch_add(1, Ordering::Relaxed);
            state.record(RequestRecord {
                method,
                path,
                matched: Some(entry.pattern.raw.clone()),
                status,
            });

            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(body)).into_response()
        }
        MatchOutcome::Unmatched => {
            state.unmatched_total.fetch_add(1, Ordering::Relaxed);
            state.record(RequestRecord {
                method: method.clone(),
                path: path.clone(),
                matched: None,
                status: 404,
            });
            tracing::warn!(%method, %path, "no fixture matched request");
            (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "no fixture matched request",
                    "method": method,
                    "path": path,
                })),
            )
                .into_response()
        }
    }
}

/// Launches the mock server inside the orchestrator process
struct InProcessLauncher {
    state: Arc<MockState>,
    listener: StdMutex<Option<TcpListener>>,
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        _run_id: &str,
        _logs: LogBuffer,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let listener = self.listener.lock().unwrap().take().ok_or_else(|| {
            Error::Internal(format!("service '{}' was already launched", spec.name))
        })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exited) = watch::channel(None);

        let app = router(self.state.clone());
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(cancelled(shutdown_rx));
            if let Err(e) = serve.await {
                tracing::error!("mock API server terminated: {}", e);
                let _ = exit_tx.send(Some(1));
            } else {
                let _ = exit_tx.send(Some(0));
            }
        });

        Ok(Arc::new(InProcessService {
            shutdown: shutdown_tx,
            exited,
        }))
    }
}

/// Managed-process facade over the in-process server task
struct InProcessService {
    shutdown: watch::Sender<bool>,
    exited: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl ManagedProcess for InProcessService {
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

    async fn terminate(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut rx = self.exited.clone();
        let _ = tokio::time::timeout(grace, rx.wait_for(|e| e.is_some())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixtureDefinition;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use std::path::PathBuf;
    use tokio::time::Instant;
    use tower::ServiceExt;

    fn fixture(method: &str, path: &str, status: u16, body: serde_json::Value) -> FixtureDefinition {
        FixtureDefinition {
            method: method.into(),
            path: path.into(),
            status,
            body,
            latency_ms: None,
            failure_rate: None,
            failure_status: None,
            failure_body: None,
        }
    }

    fn state_with(defs: Vec<FixtureDefinition>, seed: u64) -> Arc<MockState> {
        let defs = defs
            .into_iter()
            .map(|d| (d, PathBuf::from("inline.yaml")))
            .collect();
        Arc::new(MockState {
            registry: FixtureRegistry::from_definitions(defs).unwrap(),
            rng: StdMutex::new(StdRng::seed_from_u64(seed)),
            matched_total: AtomicU64::new(0),
            unmatched_total: AtomicU64::new(0),
            request_log: StdMutex::new(Vec::new()),
        })
    }

    async fn get(app: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn serves_the_configured_body_and_status() {
        let body = serde_json::json!({"messages": [{"id": 1}]});
        let state = state_with(
            vec![fixture("GET", "/api/v1/messages", 200, body.clone())],
            0,
        );
        let app = router(state);

        let (status, got) = get(&app, "/api/v1/messages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn unmatched_request_gets_diagnostic_404_and_is_recorded() {
        let state = state_with(vec![], 0);
        let app = router(state.clone());

        let (status, body) = get(&app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no fixture matched request");
        assert_eq!(body["path"], "/nope");

        assert_eq!(state.unmatched_total.load(Ordering::Relaxed), 1);
        let log = state.request_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].matched.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_the_response() {
        let mut def = fixture("GET", "/slow", 200, serde_json::json!({}));
        def.latency_ms = Some(200);
        let app = router(state_with(vec![def], 0));

        let started = Instant::now();
        let (status, _) = get(&app, "/slow").await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn failure_rate_one_always_injects_the_failure_response() {
        let mut def = fixture("GET", "/flaky", 200, serde_json::json!({"ok": true}));
        def.failure_rate = Some(1.0);
        def.failure_status = Some(503);
        def.failure_body = Some(serde_json::json!({"error": "down"}));
        let app = router(state_with(vec![def], 42));

        for _ in 0..5 {
            let (status, body) = get(&app, "/flaky").await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["error"], "down");
        }
    }

    #[tokio::test]
    async fn failure_injection_is_deterministic_per_seed() {
        let mut def = fixture("GET", "/flaky", 200, serde_json::json!({}));
        def.failure_rate = Some(0.5);

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let app = router(state_with(vec![def.clone()], 1234));
            let mut statuses = Vec::new();
            for _ in 0..20 {
                let (status, _) = get(&app, "/flaky").await;
                statuses.push(status.as_u16());
            }
            outcomes.push(statuses);
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn runs_as_a_managed_service_over_real_http() {
        let body = serde_json::json!({"messages": [{"id": 1}]});
        let registry = FixtureRegistry::from_definitions(vec![(
            fixture("GET", "/api/v1/messages", 200, body.clone()),
            PathBuf::from("inline.yaml"),
        )])
        .unwrap();
        let server = MockApiServer::bind(registry, 7, 0).await.unwrap();
        let spec = server.service_spec();
        let launcher = server.launcher();
        let logs = LogBuffer::new();

        let proc = launcher.launch(&spec, "run-1", logs).await.unwrap();

        let url = format!("{}/api/v1/messages", server.base_url());
        let got: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(got, body);
        assert_eq!(server.matched_total(), 1);

        proc.terminate(Duration::from_secs(2)).await;
        assert_eq!(proc.wait().await, 0);
        assert!(reqwest::get(&url).await.is_err());
    }
}
