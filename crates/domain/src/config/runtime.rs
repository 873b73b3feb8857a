use serde::{Deserialize, Serialize};

use super::{FederationConfig, SubagentsConfig, TokenSafetySettings};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the orchestration plane: actor mailboxes, the outbound
/// queue, and the nested subagent / federation / token-safety sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each per-session mailbox. A full mailbox rejects
    /// submissions instead of blocking.
    #[serde(default = "d_mailbox_size")]
    pub mailbox_size: usize,
    /// Seconds an idle actor lingers before its mailbox is evicted.
    #[serde(default = "d_actor_idle_ttl_sec")]
    pub actor_idle_ttl_sec: u64,
    /// Capacity of the outbound notification queue. Sends never block;
    /// overflow drops the message.
    #[serde(default = "d_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub token_safety: TokenSafetySettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_size: d_mailbox_size(),
            actor_idle_ttl_sec: d_actor_idle_ttl_sec(),
            outbound_capacity: d_outbound_capacity(),
            subagents: SubagentsConfig::default(),
            federation: FederationConfig::default(),
            token_safety: TokenSafetySettings::default(),
        }
    }
}

fn d_mailbox_size() -> usize {
    32
}

fn d_actor_idle_ttl_sec() -> u64 {
    300
}

fn d_outbound_capacity() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mailbox_size, 32);
        assert_eq!(cfg.actor_idle_ttl_sec, 300);
        assert_eq!(cfg.outbound_capacity, 512);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mailbox_size, 32);
        assert!(cfg.subagents.enabled);
    }
}
