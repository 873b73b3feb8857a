//! Persistence facade for the squidbot runtime.
//!
//! One state directory holds every typed collection: conversation turns,
//! tool events, session metadata and checkpoints, subagent runs, federation
//! runs with idempotency records, token-budget counters, and the daily log.
//! Small collections live as JSON snapshots guarded by in-memory locks;
//! append-only histories are JSONL files, one per session or run.
//!
//! Mutators on the reply path are best-effort: a failed disk write is
//! logged and the in-memory state stays authoritative for the process
//! lifetime.

pub mod budget;
pub mod daily;
pub mod federation;
pub mod sessions;
pub mod subagents;
pub mod tool_events;
pub mod turns;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sb_domain::error::{Error, Result};

pub use budget::{BudgetCounter, BudgetStore, OverrideRecord, ScopeCheck};
pub use daily::{DailyLogEntry, DailyLogStore};
pub use federation::{
    DeliveryAttempt, FederationRun, FederationStore, IdempotencyOutcome, RouteDecision,
};
pub use sessions::{Checkpoint, SessionRecord, SessionStore};
pub use subagents::{
    ContextMode, ContextPacket, RunStatus, SubagentEvent, SubagentRun, SubagentRunStore,
};
pub use tool_events::{ToolEvent, ToolEventStore};
pub use turns::{Turn, TurnStore};

/// All typed collections, rooted at one state directory.
pub struct Store {
    pub turns: TurnStore,
    pub tool_events: ToolEventStore,
    pub sessions: SessionStore,
    pub subagent_runs: SubagentRunStore,
    pub federation: FederationStore,
    pub budget: BudgetStore,
    pub daily: DailyLogStore,
    state_path: PathBuf,
}

impl Store {
    /// Load or create every collection under `state_path`.
    pub fn open(state_path: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;

        let store = Self {
            turns: TurnStore::new(&state_path.join("transcripts"))?,
            tool_events: ToolEventStore::new(&state_path.join("tool_events"))?,
            sessions: SessionStore::new(state_path)?,
            subagent_runs: SubagentRunStore::new(state_path)?,
            federation: FederationStore::new(state_path)?,
            budget: BudgetStore::new(state_path)?,
            daily: DailyLogStore::new(state_path)?,
            state_path: state_path.to_path_buf(),
        };

        tracing::info!(path = %state_path.display(), "store opened");
        Ok(Arc::new(store))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_collection_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(dir.path().join("transcripts").is_dir());
        assert!(dir.path().join("tool_events").is_dir());
        assert_eq!(store.state_path(), dir.path());
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.sessions.save_meta("s1", "cli", "local");
        }
        let store = Store::open(dir.path()).unwrap();
        let meta = store.sessions.get("s1").unwrap();
        assert_eq!(meta.last_channel.as_deref(), Some("cli"));
    }
}
