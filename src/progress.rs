//! Sync progress reporting.
//!
//! Reports observable progress during `catalog-sync sync` and `dry-run` so
//! users see which phase is running and how far each entity kind has got.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::str::FromStr;

use crate::models::EntityKind;

/// What the orchestrator tells the user while a run is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// The identity directory has been built.
    Identities { users: usize, groups: usize },
    /// A page of `kind` was processed.
    Kind {
        kind: EntityKind,
        fetched: usize,
        mapped: usize,
        uploaded: usize,
    },
    /// Every page of `kind` has been read and its uploader closed.
    KindDone {
        kind: EntityKind,
        mapped: usize,
        skipped: usize,
        rejected: usize,
    },
    /// Signalling generation complete to the index.
    Finalizing { generation: String },
}

pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync pipeline, possibly from
    /// several kind workers at once.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr:
/// "sync component  1,234 fetched  1,200 mapped  1,150 uploaded".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Identities { users, groups } => format!(
                "sync identities  {} users  {} groups",
                grouped(*users),
                grouped(*groups)
            ),
            SyncProgressEvent::Kind {
                kind,
                fetched,
                mapped,
                uploaded,
            } => format!(
                "sync {}  {} fetched  {} mapped  {} uploaded",
                kind.slug(),
                grouped(*fetched),
                grouped(*mapped),
                grouped(*uploaded)
            ),
            SyncProgressEvent::KindDone {
                kind,
                mapped,
                skipped,
                rejected,
            } => format!(
                "sync {}  done  {} mapped  {} skipped  {} rejected",
                kind.slug(),
                grouped(*mapped),
                grouped(*skipped),
                grouped(*rejected)
            ),
            SyncProgressEvent::Finalizing { generation } => {
                format!("sync finalizing generation {}", generation)
            }
        };
        emit(&line);
    }
}

/// JSON lines on stderr, for wrappers and CI logs.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &SyncProgressEvent) -> serde_json::Value {
        match event {
            SyncProgressEvent::Identities { users, groups } => serde_json::json!({
                "event": "progress",
                "phase": "identities",
                "users": users,
                "groups": groups
            }),
            SyncProgressEvent::Kind {
                kind,
                fetched,
                mapped,
                uploaded,
            } => serde_json::json!({
                "event": "progress",
                "phase": "entities",
                "kind": kind,
                "fetched": fetched,
                "mapped": mapped,
                "uploaded": uploaded
            }),
            SyncProgressEvent::KindDone {
                kind,
                mapped,
                skipped,
                rejected,
            } => serde_json::json!({
                "event": "kind_done",
                "kind": kind,
                "mapped": mapped,
                "skipped": skipped,
                "rejected": rejected
            }),
            SyncProgressEvent::Finalizing { generation } => serde_json::json!({
                "event": "progress",
                "phase": "finalizing",
                "generation": generation
            }),
        }
    }
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        emit(&Self::to_json(&event).to_string());
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
fn grouped(n: usize) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.char_indices() {
        if i > 0 && (i + 3 - head) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn emit(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", line);
    let _ = stderr.flush();
}

/// Value of the global `--progress` flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// `Human` on a terminal, `Off` when stderr is piped.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}' (expected off, human, or json)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_thousands() {
        assert_eq!(grouped(0), "0");
        assert_eq!(grouped(999), "999");
        assert_eq!(grouped(1000), "1,000");
        assert_eq!(grouped(12_345), "12,345");
        assert_eq!(grouped(123_456), "123,456");
        assert_eq!(grouped(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert_eq!("OFF".parse::<ProgressMode>().unwrap(), ProgressMode::Off);
        assert!("loud".parse::<ProgressMode>().is_err());
    }

    #[test]
    fn json_events_name_the_kind() {
        let value = JsonProgress::to_json(&SyncProgressEvent::Kind {
            kind: EntityKind::Api,
            fetched: 10,
            mapped: 9,
            uploaded: 0,
        });
        assert_eq!(value["kind"], "api");
        assert_eq!(value["phase"], "entities");
    }
}
