//! Append-only audit log of tool invocations, one JSONL file per session.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};

/// Audit record of one tool invocation inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

pub struct ToolEventStore {
    base_dir: PathBuf,
}

impl ToolEventStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Append one event. Best-effort.
    pub fn append(&self, event: &ToolEvent) {
        let line = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize tool event");
                return;
            }
        };

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(&event.session_id))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(
                session_id = %event.session_id,
                error = %e,
                "failed to append tool event"
            );
        }
    }

    /// All events for a session in append order.
    pub fn list(&self, session_id: &str) -> Vec<ToolEvent> {
        let path = self.path(session_id);
        if !path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to read tool events");
                return Vec::new();
            }
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_list_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolEventStore::new(dir.path()).unwrap();

        for i in 0..3 {
            store.append(&ToolEvent {
                id: format!("e{i}"),
                session_id: "s1".into(),
                tool_name: "read_file".into(),
                input: serde_json::json!({"n": i}),
                output: format!("out{i}"),
                created_at: Utc::now(),
            });
        }

        let events = store.list("s1");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].output, "out0");
        assert_eq!(events[2].output, "out2");
    }

    #[test]
    fn unknown_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolEventStore::new(dir.path()).unwrap();
        assert!(store.list("ghost").is_empty());
    }
}
