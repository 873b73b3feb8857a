//! Engine message envelopes.
//!
//! `InboundMessage` is the normalized request every channel adapter posts
//! into the engine; `OutboundMessage` is the engine-to-channel notification
//! drained from the outbound queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel name of the interactive CLI. Replies to it are returned
/// in-process rather than queued on the outbound channel.
pub const CLI_CHANNEL: &str = "cli";

/// Metadata key carrying the nesting depth of a subagent-originated message.
pub const META_SUBAGENT_DEPTH: &str = "subagent_depth";
/// Metadata key carrying the subagent run a message executes under.
pub const META_SUBAGENT_RUN_ID: &str = "subagent_run_id";
/// Metadata key identifying the producer of an outbound notification.
pub const META_SOURCE: &str = "source";
/// Metadata key carrying the session an outbound notification belongs to.
pub const META_SESSION_ID: &str = "session_id";

/// `source` values used on outbound completion notifications.
pub const SOURCE_SUBAGENT: &str = "subagent";
pub const SOURCE_SUBAGENT_REINJECTED: &str = "subagent_reinjected";
pub const SOURCE_FEDERATION: &str = "federation";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request entering the engine. Consumed once by `Engine::submit` /
/// `Engine::ask`; never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InboundMessage {
    /// Filled by the engine when empty.
    #[serde(default)]
    pub request_id: String,
    /// Defaults to `"{channel}:{chat_id}"` when empty.
    #[serde(default)]
    pub session_id: String,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Filled by the engine when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// Subagent nesting depth carried in metadata; 0 for top-level messages.
    pub fn subagent_depth(&self) -> u32 {
        self.metadata
            .get(META_SUBAGENT_DEPTH)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// The subagent run this message executes under, when any.
    pub fn subagent_run_id(&self) -> Option<&str> {
        self.metadata.get(META_SUBAGENT_RUN_ID).and_then(Value::as_str)
    }

    /// The writer identity used for trusted-writer checks.
    pub fn writer_identity(&self) -> String {
        format!("{}:{}", self.channel, self.sender_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An engine-to-channel notification. Emitted onto the bounded outbound
/// queue; dropped (and counted) when the queue is full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl OutboundMessage {
    /// A reply carrying the session it belongs to. Metadata always includes
    /// `session_id`.
    pub fn reply(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
        session_id: &str,
    ) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert(META_SESSION_ID.into(), Value::String(session_id.into()));
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            metadata,
        }
    }

    /// Attach completion metadata (`source`, `run_id`, `status`).
    pub fn with_completion(mut self, source: &str, run_id: &str, status: &str) -> Self {
        self.metadata
            .insert(META_SOURCE.into(), Value::String(source.into()));
        self.metadata
            .insert("run_id".into(), Value::String(run_id.into()));
        self.metadata
            .insert("status".into(), Value::String(status.into()));
        self
    }
}
