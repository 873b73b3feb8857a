//! Append-only conversation turns.
//!
//! Each session gets a `<session_id>.jsonl` file under the transcripts
//! directory. A turn is appended once after the handler finishes with it;
//! reads return an ordered window of the most recent turns.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};
use sb_domain::tool::{Role, ToolCall};

/// A persisted conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "d_version")]
    pub version: u32,
}

impl Turn {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
            version: d_version(),
        }
    }
}

fn d_version() -> u32 {
    1
}

/// Writes and reads per-session turn logs.
pub struct TurnStore {
    base_dir: PathBuf,
}

impl TurnStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir).map_err(Error::Io)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Append one turn. Best-effort: failures are logged, not returned.
    pub fn append(&self, turn: &Turn) {
        let line = match serde_json::to_string(turn) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize turn");
                return;
            }
        };

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(&turn.session_id))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(
                session_id = %turn.session_id,
                error = %e,
                "failed to append turn"
            );
        }
    }

    /// The last `n` turns of a session in chronological order.
    pub fn window(&self, session_id: &str, n: usize) -> Vec<Turn> {
        let path = self.path(session_id);
        if !path.exists() {
            return Vec::new();
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "failed to read turns");
                return Vec::new();
            }
        };

        let mut turns: Vec<Turn> = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Turn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed turn line");
                }
            }
        }

        let skip = turns.len().saturating_sub(n);
        turns.split_off(skip)
    }
}
