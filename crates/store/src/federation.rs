//! Remote delegation records and idempotency bookkeeping.
//!
//! `(origin_node_id, idempotency_key)` is a compound key with a 24 h TTL.
//! [`FederationStore::resolve_or_insert`] is the single atomic region the
//! submit endpoint goes through: two concurrent submits with the same key
//! resolve to the same run id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};

use crate::subagents::{ContextPacket, RunStatus, SubagentResult};

/// Idempotency records expire this long after creation.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One HTTP delivery try against one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub peer_id: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Why the client picked the peer it picked.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteDecision {
    pub candidate_peer_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_peer_id: Option<String>,
    pub reason: String,
}

/// A delegation record. On the server side `origin_node_id` is the caller;
/// on the client side it is this node and `peer_id` the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationRun {
    pub id: String,
    pub origin_node_id: String,
    #[serde(default)]
    pub idempotency_key: String,
    pub status: RunStatus,
    pub task: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivery_attempts: Vec<DeliveryAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_decision: Option<RouteDecision>,
    pub timeout_sec: u64,
    pub max_attempts: u32,
    #[serde(default)]
    pub context: ContextPacket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubagentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Tokens the executor committed to this run's scope, for the
    /// origin's federation/peer counters.
    #[serde(default)]
    pub usage_tokens: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl FederationRun {
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    run_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Result of the atomic submit lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// A fresh run was created.
    New,
    /// The key was seen before; the existing run is returned.
    Hit,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    runs: HashMap<String, FederationRun>,
    /// `"{origin}\n{key}"` → record.
    idempotency: HashMap<String, IdempotencyRecord>,
}

pub struct FederationStore {
    path: PathBuf,
    events_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl FederationStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("federation_runs.json");
        let events_dir = state_path.join("federation_events");
        std::fs::create_dir_all(&events_dir).map_err(Error::Io)?;

        let inner = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Inner::default()
        };

        Ok(Self {
            path,
            events_dir,
            inner: RwLock::new(inner),
        })
    }

    fn dedup_key(origin: &str, key: &str) -> String {
        format!("{origin}\n{key}")
    }

    /// Atomically resolve `(origin, idempotency_key)` to an existing run or
    /// insert the run built by `make_run`. Expired records are treated as
    /// absent and replaced.
    pub fn resolve_or_insert<F>(
        &self,
        origin: &str,
        idempotency_key: &str,
        make_run: F,
    ) -> (FederationRun, IdempotencyOutcome)
    where
        F: FnOnce() -> FederationRun,
    {
        let now = Utc::now();
        let key = Self::dedup_key(origin, idempotency_key);

        let (run, outcome) = {
            let mut inner = self.inner.write();

            if let Some(record) = inner.idempotency.get(&key) {
                if record.expires_at > now {
                    if let Some(run) = inner.runs.get(&record.run_id) {
                        return (run.clone(), IdempotencyOutcome::Hit);
                    }
                }
            }

            let run = make_run();
            inner.idempotency.insert(
                key,
                IdempotencyRecord {
                    run_id: run.id.clone(),
                    created_at: now,
                    expires_at: now + Duration::hours(IDEMPOTENCY_TTL_HOURS),
                },
            );
            inner.runs.insert(run.id.clone(), run.clone());
            (run, IdempotencyOutcome::New)
        };

        self.persist();
        (run, outcome)
    }

    /// Insert a run without idempotency bookkeeping (client-side mirrors,
    /// or submits that carried no key).
    pub fn insert(&self, run: FederationRun) {
        self.inner.write().runs.insert(run.id.clone(), run);
        self.persist();
    }

    pub fn get(&self, run_id: &str) -> Option<FederationRun> {
        self.inner.read().runs.get(run_id).cloned()
    }

    /// Mutate a non-terminal run. Returns `false` for unknown or terminal
    /// runs.
    pub fn update<F>(&self, run_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut FederationRun),
    {
        let updated = {
            let mut inner = self.inner.write();
            match inner.runs.get_mut(run_id) {
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

    pub fn count_in_status(&self, status: RunStatus) -> usize {
        self.inner
            .read()
            .runs
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Drop expired idempotency records. Returns how many were removed.
    pub fn sweep_idempotency(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut inner = self.inner.write();
            let before = inner.idempotency.len();
            inner.idempotency.retain(|_, rec| rec.expires_at > now);
            before - inner.idempotency.len()
        };
        if removed > 0 {
            self.persist();
        }
        removed
    }

    /// Append one audit event for a run. Best-effort.
    pub fn append_event(&self, run_id: &str, event_type: &str, message: &str) {
        let event = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "run_id": run_id,
            "type": event_type,
            "message": message,
            "created_at": Utc::now().to_rfc3339(),
        });

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_dir.join(format!("{run_id}.jsonl")))
            .and_then(|mut f| writeln!(f, "{event}"));
        if let Err(e) = result {
            tracing::warn!(run_id, error = %e, "failed to append federation event");
        }
    }

    /// Event types recorded for a run, in append order.
    pub fn event_types(&self, run_id: &str) -> Vec<String> {
        let path = self.events_dir.join(format!("{run_id}.jsonl"));
        if !path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "failed to read federation events");
                return Vec::new();
            }
        };
        raw.lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .filter_map(|v| v["type"].as_str().map(str::to_owned))
            .collect()
    }

    fn persist(&self) {
        let snapshot = {
            let inner = self.inner.read();
            serde_json::to_string(&*inner)
        };
        let result = snapshot
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist federation runs");
        }
    }
}
