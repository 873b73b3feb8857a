//! Cross-node delegation over HTTP.
//!
//! [`routing`] picks candidate peers, [`client`] delivers delegations
//! with retries and idempotency, [`server`] accepts them and runs the
//! task on the local machinery.

pub mod client;
pub mod routing;
pub mod server;

use serde::{Deserialize, Serialize};

use sb_store::ContextPacket;

pub use client::{FederationClient, SpawnOptions};
pub use server::FederationServer;

/// Identifies the origin node on every federation request.
pub const HEADER_NODE_ID: &str = "X-Squidbot-Node-ID";
/// Deduplication key; constant across retries and peers for one submission.
pub const HEADER_IDEMPOTENCY_KEY: &str = "X-Idempotency-Key";

/// The JSON body of `POST /api/federation/delegations`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DelegationRequest {
    pub task: String,
    #[serde(default)]
    pub label: Option<String>,
    /// `0` takes the server's configured default.
    #[serde(default)]
    pub timeout_sec: u64,
    /// Clamped to at least 1 by the server.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub context: ContextPacket,
}

/// `GET /api/federation/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub peer_id: String,
    pub available: bool,
    pub queue_depth: usize,
    pub max_queue: usize,
    pub active_runs: usize,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
