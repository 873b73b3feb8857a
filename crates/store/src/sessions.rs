//! Session metadata and actor checkpoints.
//!
//! One `sessions.json` snapshot maps session id to routing metadata
//! (`last_channel`, `last_chat_id`) and the compact checkpoint written
//! after every handled request. Checkpoint write failures are tolerated:
//! the next submission merely replays with a stale `last_request_id`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};

/// Durability blob written after each handled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_request_id: String,
    pub updated_at: DateTime<Utc>,
}

/// A single session tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub last_channel: Option<String>,
    #[serde(default)]
    pub last_chat_id: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Session store backed by a JSON snapshot file.
pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("sessions.json");
        let sessions = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Update routing metadata after a handled turn.
    pub fn save_meta(&self, session_id: &str, channel: &str, chat_id: &str) {
        {
            let mut sessions = self.sessions.write();
            let entry = sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| SessionRecord {
                    session_id: session_id.to_owned(),
                    ..Default::default()
                });
            entry.last_channel = Some(channel.to_owned());
            entry.last_chat_id = Some(chat_id.to_owned());
            entry.updated_at = Some(Utc::now());
        }
        self.persist();
    }

    /// Write the compact checkpoint for a session.
    pub fn save_checkpoint(&self, session_id: &str, last_request_id: &str) {
        {
            let mut sessions = self.sessions.write();
            let entry = sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| SessionRecord {
                    session_id: session_id.to_owned(),
                    ..Default::default()
                });
            entry.checkpoint = Some(Checkpoint {
                last_request_id: last_request_id.to_owned(),
                updated_at: Utc::now(),
            });
        }
        self.persist();
    }

    /// The checkpoint read on actor spawn, when any.
    pub fn checkpoint(&self, session_id: &str) -> Option<Checkpoint> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|s| s.checkpoint.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn persist(&self) {
        let snapshot = {
            let sessions = self.sessions.read();
            serde_json::to_string_pretty(&*sessions)
        };
        let result = snapshot
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist sessions");
        }
    }
}
