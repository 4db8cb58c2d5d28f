//! Configuration loading for service graphs, fixtures, and seeds
//!
//! All three inputs are read-only once loaded: the service graph and seed
//! list are parsed from YAML, fixture files may be YAML or JSON. Validation
//! happens here, before any process is spawned, so configuration mistakes
//! never leave partial state behind.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::common::{Error, Result};

/// Top-level shape of the service graph file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGraphFile {
    pub services: Vec<ServiceSpec>,
}

/// One service entry in the dependency graph
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Unique service name, referenced by `dependsOn` entries
    pub name: String,
    /// Launch command (resolved through PATH at spawn time)
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables passed through to the process
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub readiness: ReadinessSpec,
    /// A crash of a critical service aborts the whole run; non-critical
    /// crashes degrade it
    #[serde(default)]
    pub critical: bool,
}

/// Readiness descriptor for a service
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessSpec {
    pub kind: ProbeKind,
    /// `host:port` for tcp, a URL for http, a shell command for command
    pub target: String,
    #[serde(default = "default_readiness_timeout_ms")]
    pub timeout_ms: u64,
    /// Base interval for the exponential backoff between checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

/// Kind of readiness check to run
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// TCP connect succeeds
    Tcp,
    /// HTTP GET returns a status in 200..=399
    Http,
    /// Shell command exits zero
    Command,
}

/// A canned request/response fixture served by the mock API server
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureDefinition {
    pub method: String,
    /// Path pattern: literal segments plus `:name` parameters
    pub path: String,
    pub status: u16,
    pub body: serde_json::Value,
    /// Artificial response delay in milliseconds
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Probability in [0, 1] that the request gets the failure response
    /// instead, rolled against the run-scoped seeded random source
    #[serde(default)]
    pub failure_rate: Option<f64>,
    #[serde(default)]
    pub failure_status: Option<u16>,
    #[serde(default)]
    pub failure_body: Option<serde_json::Value>,
}

/// A single idempotent data-seeding step
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStep {
    pub name: String,
    /// Ascending application order; steps sharing a value keep their file
    /// order
    #[serde(default)]
    pub order: u32,
    /// A given key is applied at most once per run
    pub idempotency_key: String,
    /// Shell command executed via `sh -c`
    pub action: String,
    /// Optional compensating command, run in reverse order when a later
    /// step in the same invocation fails
    #[serde(default)]
    pub rollback: Option<String>,
}

/// Load and validate the service graph file
pub fn load_service_graph(path: &Path) -> Result<Vec<ServiceSpec>> {
    let content =
        std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
    let file: ServiceGraphFile = serde_yaml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse service graph '{}': {}",
            path.display(),
            e
        ))
    })?;
    validate_services(&file.services)?;
    Ok(file.services)
}

fn validate_services(services: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in services {
        if spec.name.is_empty() {
            return Err(Error::config("Service with empty name"));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate service name '{}'",
                spec.name
            )));
        }
        if spec.command.is_empty() {
            return Err(Error::Config(format!(
                "Service '{}' has an empty command",
                spec.name
            )));
        }
        validate_readiness(&spec.name, &spec.readiness)?;
    }
    // Dangling dependsOn entries are configuration errors, not cycles
    for spec in services {
        for dep in &spec.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(Error::Config(format!(
                    "Service '{}' depends on unknown service '{}'",
                    spec.name, dep
                )));
            }
        }
    }
    Ok(())
}

/// Validate a readiness descriptor; malformed descriptors are the only
/// probe errors surfaced to callers, ordinary check failures are not
pub fn validate_readiness(service: &str, spec: &ReadinessSpec) -> Result<()> {
    if spec.timeout_ms == 0 {
        return Err(Error::Config(format!(
            "Service '{}': readiness timeoutMs must be positive",
            service
        )));
    }
    if spec.poll_interval_ms == 0 {
        return Err(Error::Config(format!(
            "Service '{}': readiness pollIntervalMs must be positive",
            service
        )));
    }
    match spec.kind {
        ProbeKind::Tcp => {
            let valid = spec
                .target
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(Error::Config(format!(
                    "Service '{}': tcp readiness target '{}' is not host:port",
                    service, spec.target
                )));
            }
        }
        ProbeKind::Http => {
            if !spec.target.starts_with("http://") && !spec.target.starts_with("https://") {
                return Err(Error::Config(format!(
                    "Service '{}': http readiness target '{}' is not a URL",
                    service, spec.target
                )));
            }
        }
        ProbeKind::Command => {
            if spec.target.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Service '{}': command readiness target is empty",
                    service
                )));
            }
        }
    }
    Ok(())
}

/// Load seed steps from every YAML file in a directory
///
/// Files are visited in lexicographic order; each file holds an ordered
/// list of steps, so the on-disk order is the application order.
pub fn load_seed_steps(dir: &Path) -> Result<Vec<SeedStep>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::file_read(dir, e))? {
        let path = entry.map_err(|e| Error::file_read(dir, e))?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut steps = Vec::new();
    for path in paths {
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::file_read(&path, e))?;
        let mut file_steps: Vec<SeedStep> = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse seed file '{}': {}",
                path.display(),
                e
            ))
        })?;
        for step in &file_steps {
            if step.name.is_empty() || step.idempotency_key.is_empty() {
                return Err(Error::Config(format!(
                    "Seed file '{}' contains a step without name or idempotencyKey",
                    path.display()
                )));
            }
        }
        steps.append(&mut file_steps);
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GRAPH: &str = r#"
services:
  - name: db
    command: postgres
    args: ["-D", "/tmp/data"]
    env:
      PGPORT: "5433"
    readiness:
      kind: tcp
      target: 127.0.0.1:5433
  - name: auth
    command: auth-server
    dependsOn: [db]
    critical: true
    readiness:
      kind: http
      target: http://127.0.0.1:9000/health
      timeoutMs: 15000
"#;

    #[test]
    fn parses_service_graph_with_defaults() {
        let file: ServiceGraphFile = serde_yaml::from_str(GRAPH).unwrap();
        validate_services(&file.services).unwrap();

        let db = &file.services[0];
        assert_eq!(db.name, "db");
        assert_eq!(db.args, vec!["-D", "/tmp/data"]);
        assert_eq!(db.env.get("PGPORT").unwrap(), "5433");
        assert!(!db.critical);
        assert_eq!(db.readiness.timeout_ms, 30_000);
        assert_eq!(db.readiness.poll_interval_ms, 200);

        let auth = &file.services[1];
        assert_eq!(auth.depends_on, vec!["db"]);
        assert!(auth.critical);
        assert_eq!(auth.readiness.timeout_ms, 15_000);
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let yaml = r#"
services:
  - name: db
    command: a
    readiness: { kind: command, target: "true" }
  - name: db
    command: b
    readiness: { kind: command, target: "true" }
"#;
        let file: ServiceGraphFile = serde_yaml::from_str(yaml).unwrap();
        let err = validate_services(&file.services).unwrap_err();
        assert!(err.to_string().contains("Duplicate service name 'db'"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
services:
  - name: auth
    command: a
    dependsOn: [db]
    readiness: { kind: command, target: "true" }
"#;
        let file: ServiceGraphFile = serde_yaml::from_str(yaml).unwrap();
        let err = validate_services(&file.services).unwrap_err();
        assert!(err.to_string().contains("unknown service 'db'"));
    }

    #[test]
    fn rejects_malformed_readiness_targets() {
        let tcp = ReadinessSpec {
            kind: ProbeKind::Tcp,
            target: "not-a-socket-addr".into(),
            timeout_ms: 1000,
            poll_interval_ms: 200,
        };
        assert!(validate_readiness("db", &tcp).is_err());

        let http = ReadinessSpec {
            kind: ProbeKind::Http,
            target: "127.0.0.1:8080/health".into(),
            timeout_ms: 1000,
            poll_interval_ms: 200,
        };
        assert!(validate_readiness("api", &http).is_err());

        let zero = ReadinessSpec {
            kind: ProbeKind::Command,
            target: "true".into(),
            timeout_ms: 0,
            poll_interval_ms: 200,
        };
        assert!(validate_readiness("x", &zero).is_err());
    }

    #[test]
    fn loads_seed_files_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut f2 = std::fs::File::create(dir.path().join("20-users.yaml")).unwrap();
        writeln!(
            f2,
            "- name: seed-users\n  idempotencyKey: users-v1\n  action: \"true\""
        )
        .unwrap();
        let mut f1 = std::fs::File::create(dir.path().join("10-schema.yaml")).unwrap();
        writeln!(
            f1,
            "- name: create-schema\n  idempotencyKey: schema-v1\n  action: \"true\"\n  rollback: \"true\""
        )
        .unwrap();

        let steps = load_seed_steps(dir.path()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "create-schema");
        assert!(steps[0].rollback.is_some());
        assert_eq!(steps[1].name, "seed-users");
    }

    #[test]
    fn seed_step_order_parses_and_defaults_to_zero() {
        let yaml = r#"
- name: later
  order: 5
  idempotencyKey: later-v1
  action: "true"
- name: untagged
  idempotencyKey: untagged-v1
  action: "true"
"#;
        let steps: Vec<SeedStep> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps[0].order, 5);
        assert_eq!(steps[1].order, 0);
    }

    #[test]
    fn fixture_definition_accepts_optional_fields() {
        let yaml = r#"
method: GET
path: /api/v1/messages
status: 200
body:
  messages:
    - id: 1
latencyMs: 200
failureRate: 0.25
"#;
        let def: FixtureDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.method, "GET");
        assert_eq!(def.latency_ms, Some(200));
        assert_eq!(def.failure_rate, Some(0.25));
        assert_eq!(def.body["messages"][0]["id"], 1);
    }
}
