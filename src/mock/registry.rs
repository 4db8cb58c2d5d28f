//! Fixture registry
//!
//! Loads canned request/response fixtures from a directory and indexes them
//! by HTTP method. Matching is deterministic: an exact literal path beats
//! any parameterized pattern, more literal segments beat fewer, and
//! registration order breaks remaining ties. The registry is built once and
//! treated as an immutable snapshot while the mock server runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::{Error, Result};
use crate::config::FixtureDefinition;

/// One segment of a path pattern
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    /// `:name` placeholder matching any single segment
    Param(String),
}

/// Parsed path pattern: literal segments plus `:name` parameters
#[derive(Debug, Clone)]
pub struct Pattern {
    pub raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(Error::Config(format!(
                "Fixture path '{}' must start with '/'",
                raw
            )));
        }
        let mut segments = Vec::new();
        if raw != "/" {
            for part in raw[1..].split('/') {
                if part.is_empty() {
                    return Err(Error::Config(format!(
                        "Fixture path '{}' has an empty segment",
                        raw
                    )));
                }
                if let Some(name) = part.strip_prefix(':') {
                    if name.is_empty() {
                        return Err(Error::Config(format!(
                            "Fixture path '{}' has an unnamed parameter",
                            raw
                        )));
                    }
                    segments.push(Segment::Param(name.to_string()));
                } else {
                    segments.push(Segment::Literal(part.to_string()));
                }
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Canonical form where every parameter collapses to `:`; two patterns
    /// that can match the same requests share a canonical form
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Param(_) => out.push(':'),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = if path == "/" || path.is_empty() {
            Vec::new()
        } else {
            path.trim_start_matches('/').split('/').collect()
        };
        if parts.len() != self.segments.len() {
            return false;
        }
        self.segments.iter().zip(parts).all(|(seg, part)| match seg {
            Segment::Literal(s) => s == part,
            Segment::Param(_) => true,
        })
    }
}

/// A loaded fixture plus its matching metadata
#[derive(Debug)]
pub struct FixtureEntry {
    pub definition: FixtureDefinition,
    pub pattern: Pattern,
    pub source: PathBuf,
    /// Registration index, used as the final tie-breaker
    pub index: usize,
}

/// Result of matching a request against the registry
pub enum MatchOutcome<'a> {
    Fixture(&'a FixtureEntry),
    Unmatched,
}

/// Indexed, immutable collection of fixtures
#[derive(Debug, Default)]
pub struct FixtureRegistry {
    entries: Vec<FixtureEntry>,
    by_method: HashMap<String, Vec<usize>>,
}

/// A fixture file holds either a single definition or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(FixtureDefinition),
    Many(Vec<FixtureDefinition>),
}

impl FixtureRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every fixture file under `dir`, recursively.
    ///
    /// Files are visited in sorted path order so registration indices are
    /// stable across runs. Load fails on the first duplicate
    /// (method, literal-pattern) pair.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        collect_fixture_files(dir, &mut files)?;
        files.sort();

        let mut definitions = Vec::new();
        for path in files {
            let content =
                std::fs::read_to_string(&path).map_err(|e| Error::file_read(&path, e))?;
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let parsed: OneOrMany = if is_json {
                serde_json::from_str(&content).map_err(|e| {
                    Error::Config(format!(
                        "Failed to parse fixture file '{}': {}",
                        path.display(),
                        e
                    ))
                })?
            } else {
                serde_yaml::from_str(&content).map_err(|e| {
                    Error::Config(format!(
                        "Failed to parse fixture file '{}': {}",
                        path.display(),
                        e
                    ))
                })?
            };
            match parsed {
                OneOrMany::One(def) => definitions.push((def, path.clone())),
                OneOrMany::Many(defs) => {
                    definitions.extend(defs.into_iter().map(|d| (d, path.clone())))
                }
            }
        }
        Self::from_definitions(definitions)
    }

    /// Build a registry from in-memory definitions (the loader and tests
    /// share this path)
    pub fn from_definitions(definitions: Vec<(FixtureDefinition, PathBuf)>) -> Result<Self> {
        let mut registry = Self::default();
        let mut seen: HashMap<(String, String), usize> = HashMap::new();

        for (definition, source) in definitions {
            let method = definition.method.to_uppercase();
            if method.is_empty() {
                return Err(Error::Config(format!(
                    "Fixture in '{}' has an empty method",
                    source.display()
                )));
            }
            if !(100..=599).contains(&definition.status) {
                return Err(Error::Config(format!(
                    "Fixture {} {} has invalid status {}",
                    method, definition.path, definition.status
                )));
            }
            if let Some(rate) = definition.failure_rate {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(Error::Config(format!(
                        "Fixture {} {} has failureRate {} outside [0, 1]",
                        method, definition.path, rate
                    )));
                }
            }
            let pattern = Pattern::parse(&definition.path)?;

            let key = (method.clone(), pattern.canonical());
            let index = registry.entries.len();
            if let Some(&existing) = seen.get(&key) {
                return Err(Error::FixtureConflict {
                    method,
                    pattern: pattern.canonical(),
                    first: registry.entries[existing].source.display().to_string(),
                    second: source.display().to_string(),
                });
            }
            seen.insert(key, index);

            registry.by_method.entry(method).or_default().push(index);
            registry.entries.push(FixtureEntry {
                definition,
                pattern,
                source,
                index,
            });
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match a request against the registry.
    ///
    /// Precedence: exact literal path, then the parameterized pattern with
    /// the most literal segments, then the first-registered among ties. No
    /// match yields [`MatchOutcome::Unmatched`].
    pub fn match_request(&self, method: &str, path: &str) -> MatchOutcome<'_> {
        let Some(indices) = self.by_method.get(&method.to_uppercase()) else {
            return MatchOutcome::Unmatched;
        };

        let mut best: Option<&FixtureEntry> = None;
        for &i in indices {
            let entry = &self.entries[i];
            if !entry.pattern.matches(path) {
                continue;
            }
            if entry.pattern.is_literal() {
                return MatchOutcome::Fixture(entry);
            }
            let better = match best {
                None => true,
                Some(current) => {
                    entry.pattern.literal_count() > current.pattern.literal_count()
                }
            };
            if better {
                best = Some(entry);
            }
        }
        match best {
            Some(entry) => MatchOutcome::Fixture(entry),
            None => MatchOutcome::Unmatched,
        }
    }
}

fn collect_fixture_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::file_read(dir, e))? {
        let path = entry.map_err(|e| Error::file_read(dir, e))?.path();
        if path.is_dir() {
            collect_fixture_files(&path, out)?;
            continue;
        }
        let keep = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
        if keep {
            out.push(path);
        }
    }
    Ok(())
}
