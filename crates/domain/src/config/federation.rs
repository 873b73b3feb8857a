use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Federation configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cross-node delegation settings: this node's identity, the peers it may
/// delegate to, and the allowlist of nodes it accepts delegations from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// This node's identity, sent as `X-Squidbot-Node-ID` on every
    /// outgoing delegation.
    #[serde(default)]
    pub node_id: String,
    /// Peers this node may delegate to.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Origin node ids accepted by the local federation server. Empty
    /// means any node that authenticates as a configured peer.
    #[serde(default)]
    pub allow_from_node_ids: Vec<String>,
    /// Retries per peer on top of the first attempt.
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// Advance to the next routing candidate after a peer is exhausted.
    #[serde(default = "d_true")]
    pub fallback_enabled: bool,
    /// Interval between status polls while mirroring a remote run.
    #[serde(default = "d_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Default timeout applied to accepted delegations without one.
    #[serde(default = "d_default_timeout_sec")]
    pub default_timeout_sec: u64,
    /// Advertised queue bound reported by the health endpoint.
    #[serde(default = "d_max_queue")]
    pub max_queue: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            peers: Vec::new(),
            allow_from_node_ids: Vec::new(),
            max_retries: d_max_retries(),
            fallback_enabled: d_true(),
            poll_interval_ms: d_poll_interval_ms(),
            default_timeout_sec: d_default_timeout_sec(),
            max_queue: d_max_queue(),
        }
    }
}

/// A single remote peer this node may delegate runs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    /// Base URL, e.g. `http://peer-b:8787`.
    pub base_url: String,
    /// Bearer token presented to (and expected from) this peer.
    pub auth_token: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Lower sorts first during routing.
    #[serde(default = "d_priority")]
    pub priority: u32,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Capabilities this peer advertises; routing requires a superset of
    /// the request's `required_capabilities`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PeerConfig {
    /// Whether this peer advertises every required capability.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

fn d_true() -> bool {
    true
}

fn d_max_retries() -> u32 {
    2
}

fn d_poll_interval_ms() -> u64 {
    700
}

fn d_default_timeout_sec() -> u64 {
    300
}

fn d_max_queue() -> usize {
    32
}

fn d_priority() -> u32 {
    100
}
