//! Background run records for the subagent pool.
//!
//! Run state is the durable source of truth: retry counters live on the
//! record, workers mutate it through [`SubagentRunStore::update`], and the
//! per-run JSONL event log is the audit trail. Terminal runs are immutable
//! except for the idempotent notification flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};
use sb_domain::tool::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of a background run. Shared by subagent and federation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context packet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How much of the originating session travels with the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    #[default]
    Minimal,
    Session,
    SessionMemory,
}

/// The conversation seed a worker builds the provider request from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextPacket {
    #[serde(default)]
    pub mode: ContextMode,
    /// Prior session turns, present for `session` and `session_memory`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,
    /// Retrieved memory block, present for `session_memory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_paths: Vec<String>,
    /// Base system prompt supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stored result of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubagentResult {
    pub summary: String,
    pub output: String,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
}

/// A background task record. Created on enqueue, mutated by the worker,
/// final once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentRun {
    pub id: String,
    pub session_id: String,
    pub channel: String,
    pub chat_id: String,
    pub task: String,
    #[serde(default)]
    pub label: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_sec: u64,
    #[serde(default)]
    pub depth: u32,
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub context: ContextPacket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubagentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Completion notification already emitted for this run.
    #[serde(default)]
    pub notified: bool,
}

impl SubagentRun {
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// One line in a run's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentEvent {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SubagentRunStore {
    path: PathBuf,
    events_dir: PathBuf,
    runs: RwLock<HashMap<String, SubagentRun>>,
}

impl SubagentRunStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("subagent_runs.json");
        let events_dir = state_path.join("subagent_events");
        std::fs::create_dir_all(&events_dir).map_err(Error::Io)?;

        let runs = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            events_dir,
            runs: RwLock::new(runs),
        })
    }

    pub fn insert(&self, run: SubagentRun) {
        self.runs.write().insert(run.id.clone(), run);
        self.persist();
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.read().get(run_id).cloned()
    }

    /// Mutate a non-terminal run in place. Returns `false` when the run is
    /// unknown or already terminal (terminal records are immutable).
    pub fn update<F>(&self, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut SubagentRun),
    {
        let updated = {
            let mut runs = self.runs.write();
            match runs.get_mut(run_id) {
                Some(run) if !run.status.is_terminal() => {
                    f(run);
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.persist();
        }
        updated
    }

    /// Record that the completion notification went out. Permitted on
    /// terminal runs. Returns `true` only for the transition, so exactly
    /// one caller wins the right to notify.
    pub fn mark_notified(&self, run_id: &str) -> bool {
        let newly_marked = {
            let mut runs = self.runs.write();
            match runs.get_mut(run_id) {
                Some(run) if !run.notified => {
                    run.notified = true;
                    true
                }
                _ => false,
            }
        };
        if newly_marked {
            self.persist();
        }
        newly_marked
    }

    /// Runs currently in the given status.
    pub fn count_in_status(&self, status: RunStatus) -> usize {
        self.runs
            .read()
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Append one audit event for a run. Best-effort.
    pub fn append_event(&self, run_id: &str, event_type: &str, message: &str) {
        let event = SubagentEvent {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_owned(),
            event_type: event_type.to_owned(),
            message: message.to_owned(),
            created_at: Utc::now(),
        };
        let line = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize subagent event");
                return;
            }
        };

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_dir.join(format!("{run_id}.jsonl")))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(run_id, error = %e, "failed to append subagent event");
        }
    }

    /// Audit trail for a run in append order.
    pub fn events(&self, run_id: &str) -> Vec<SubagentEvent> {
        let path = self.events_dir.join(format!("{run_id}.jsonl"));
        if !path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "failed to read subagent events");
                return Vec::new();
            }
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn persist(&self) {
        let snapshot = {
            let runs = self.runs.read();
            serde_json::to_string(&*runs)
        };
        let result = snapshot
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist subagent runs");
        }
    }
}
