use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token safety settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Limit enforcement mode.
///
/// `soft` only reports warnings, `hard` only enforces hard limits, and
/// `hybrid` does both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenSafetyMode {
    #[default]
    Hybrid,
    Soft,
    Hard,
}

/// Token-usage limits applied per scope. A hard limit of `0` means
/// unlimited. These are the config defaults; a persisted override record
/// (written through the governance tools) takes precedence at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSafetySettings {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TokenSafetyMode,

    #[serde(default)]
    pub global_hard_limit_tokens: u64,
    #[serde(default = "d_soft_pct")]
    pub global_soft_threshold_pct: u64,

    #[serde(default)]
    pub session_hard_limit_tokens: u64,
    #[serde(default = "d_soft_pct")]
    pub session_soft_threshold_pct: u64,

    #[serde(default)]
    pub subagent_run_hard_limit_tokens: u64,
    #[serde(default = "d_soft_pct")]
    pub subagent_run_soft_threshold_pct: u64,

    /// Estimate token usage from output length when the provider reports
    /// none.
    #[serde(default = "d_true")]
    pub estimate_on_missing_usage: bool,
    #[serde(default = "d_chars_per_token")]
    pub estimate_chars_per_token: u64,

    /// Identities allowed to mutate these settings at runtime, as
    /// `"<channel>:<sender>"`; `*` matches any channel.
    #[serde(default)]
    pub trusted_writers: Vec<String>,

    /// Lifetime of an unresolved reservation before the sweeper collects it.
    #[serde(default = "d_reservation_ttl_sec")]
    pub reservation_ttl_sec: u64,
}

impl Default for TokenSafetySettings {
    fn default() -> Self {
        Self {
            enabled: d_true(),
            mode: TokenSafetyMode::default(),
            global_hard_limit_tokens: 0,
            global_soft_threshold_pct: d_soft_pct(),
            session_hard_limit_tokens: 0,
            session_soft_threshold_pct: d_soft_pct(),
            subagent_run_hard_limit_tokens: 0,
            subagent_run_soft_threshold_pct: d_soft_pct(),
            estimate_on_missing_usage: d_true(),
            estimate_chars_per_token: d_chars_per_token(),
            trusted_writers: Vec::new(),
            reservation_ttl_sec: d_reservation_ttl_sec(),
        }
    }
}

impl TokenSafetySettings {
    /// Whether `channel:sender` may mutate the runtime settings.
    ///
    /// Comparison is case-insensitive; a `*` channel in the configured
    /// identity matches any channel.
    pub fn is_trusted_writer(&self, channel: &str, sender: &str) -> bool {
        let channel = channel.to_ascii_lowercase();
        let sender = sender.to_ascii_lowercase();
        self.trusted_writers.iter().any(|entry| {
            let Some((allowed_channel, allowed_sender)) = entry.split_once(':') else {
                return false;
            };
            let allowed_channel = allowed_channel.to_ascii_lowercase();
            (allowed_channel == "*" || allowed_channel == channel)
                && allowed_sender.to_ascii_lowercase() == sender
        })
    }
}

fn d_true() -> bool {
    true
}

fn d_soft_pct() -> u64 {
    80
}

fn d_chars_per_token() -> u64 {
    4
}

fn d_reservation_ttl_sec() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = TokenSafetySettings::default();
        assert!(s.enabled);
        assert_eq!(s.mode, TokenSafetyMode::Hybrid);
        assert_eq!(s.global_hard_limit_tokens, 0);
        assert_eq!(s.global_soft_threshold_pct, 80);
        assert_eq!(s.estimate_chars_per_token, 4);
        assert_eq!(s.reservation_ttl_sec, 120);
    }

    #[test]
    fn mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TokenSafetyMode::Hybrid).unwrap(),
            "\"hybrid\""
        );
        assert_eq!(
            serde_json::to_string(&TokenSafetyMode::Soft).unwrap(),
            "\"soft\""
        );
    }

    #[test]
    fn trusted_writer_exact_match() {
        let s = TokenSafetySettings {
            trusted_writers: vec!["cli:alice".into()],
            ..Default::default()
        };
        assert!(s.is_trusted_writer("cli", "alice"));
        assert!(!s.is_trusted_writer("cli", "bob"));
        assert!(!s.is_trusted_writer("telegram", "alice"));
    }

    #[test]
    fn trusted_writer_wildcard_channel() {
        let s = TokenSafetySettings {
            trusted_writers: vec!["*:admin".into()],
            ..Default::default()
        };
        assert!(s.is_trusted_writer("cli", "admin"));
        assert!(s.is_trusted_writer("telegram", "admin"));
        assert!(!s.is_trusted_writer("cli", "intruder"));
    }

    #[test]
    fn trusted_writer_is_case_insensitive() {
        let s = TokenSafetySettings {
            trusted_writers: vec!["CLI:Alice".into()],
            ..Default::default()
        };
        assert!(s.is_trusted_writer("cli", "alice"));
        assert!(s.is_trusted_writer("Cli", "ALICE"));
    }

    #[test]
    fn malformed_trusted_writer_entries_never_match() {
        let s = TokenSafetySettings {
            trusted_writers: vec!["no-colon".into()],
            ..Default::default()
        };
        assert!(!s.is_trusted_writer("no-colon", ""));
        assert!(!s.is_trusted_writer("cli", "no-colon"));
    }
}
