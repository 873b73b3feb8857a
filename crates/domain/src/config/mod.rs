mod agents;
mod federation;
mod runtime;
mod subagents;
mod token_safety;

pub use agents::*;
pub use federation::*;
pub use runtime::*;
pub use subagents::*;
pub use token_safety::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::from_toml_str(&raw)
    }

    /// Apply recognized environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply recognized environment overrides through a lookup function.
    ///
    /// Recognized variables:
    /// - `SQUIDBOT_TOKEN_SAFETY_ENABLED`, `SQUIDBOT_TOKEN_SAFETY_MODE`
    /// - `SQUIDBOT_TOKEN_SAFETY_GLOBAL_HARD_LIMIT`
    /// - `SQUIDBOT_TOKEN_SAFETY_SESSION_HARD_LIMIT`
    /// - `SQUIDBOT_TOKEN_SAFETY_TRUSTED_WRITERS` (comma-separated)
    /// - `SQUIDBOT_SUBAGENTS_ENABLED`
    /// - `SQUIDBOT_FEDERATION_ALLOW_FROM` (comma-separated node ids)
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let safety = &mut self.runtime.token_safety;
        if let Some(v) = lookup("SQUIDBOT_TOKEN_SAFETY_ENABLED") {
            if let Ok(b) = v.trim().parse::<bool>() {
                safety.enabled = b;
            }
        }
        if let Some(v) = lookup("SQUIDBOT_TOKEN_SAFETY_MODE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "hybrid" => safety.mode = TokenSafetyMode::Hybrid,
                "soft" => safety.mode = TokenSafetyMode::Soft,
                "hard" => safety.mode = TokenSafetyMode::Hard,
                other => tracing::warn!(value = other, "unrecognized token safety mode override"),
            }
        }
        if let Some(v) = lookup("SQUIDBOT_TOKEN_SAFETY_GLOBAL_HARD_LIMIT") {
            if let Ok(n) = v.trim().parse::<u64>() {
                safety.global_hard_limit_tokens = n;
            }
        }
        if let Some(v) = lookup("SQUIDBOT_TOKEN_SAFETY_SESSION_HARD_LIMIT") {
            if let Ok(n) = v.trim().parse::<u64>() {
                safety.session_hard_limit_tokens = n;
            }
        }
        if let Some(v) = lookup("SQUIDBOT_TOKEN_SAFETY_TRUSTED_WRITERS") {
            safety.trusted_writers = split_csv(&v);
        }
        if let Some(v) = lookup("SQUIDBOT_SUBAGENTS_ENABLED") {
            if let Ok(b) = v.trim().parse::<bool>() {
                self.runtime.subagents.enabled = b;
            }
        }
        if let Some(v) = lookup("SQUIDBOT_FEDERATION_ALLOW_FROM") {
            self.runtime.federation.allow_from_node_ids = split_csv(&v);
        }
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.runtime.mailbox_size == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "runtime.mailbox_size".into(),
                message: "mailbox size must be greater than 0".into(),
            });
        }

        if self.runtime.outbound_capacity == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "runtime.outbound_capacity".into(),
                message: "outbound capacity must be greater than 0".into(),
            });
        }

        if self.agents.defaults.max_tool_iterations == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "agents.defaults.max_tool_iterations".into(),
                message: "at least one tool iteration is required".into(),
            });
        }

        if self.runtime.token_safety.estimate_chars_per_token == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "runtime.token_safety.estimate_chars_per_token".into(),
                message: "chars-per-token estimate must be greater than 0".into(),
            });
        }

        let fed = &self.runtime.federation;
        if fed.enabled {
            if fed.node_id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "runtime.federation.node_id".into(),
                    message: "node_id is required when federation is enabled".into(),
                });
            }
            if fed.peers.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "runtime.federation.peers".into(),
                    message: "federation is enabled but no peers are configured".into(),
                });
            }
            for (i, peer) in fed.peers.iter().enumerate() {
                if peer.id.is_empty() || peer.base_url.is_empty() || peer.auth_token.is_empty() {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("runtime.federation.peers[{i}]"),
                        message: "peers need id, base_url and auth_token".into(),
                    });
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_clean() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn zero_mailbox_is_an_error() {
        let mut cfg = Config::default();
        cfg.runtime.mailbox_size = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "runtime.mailbox_size" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn federation_enabled_requires_node_id() {
        let mut cfg = Config::default();
        cfg.runtime.federation.enabled = true;
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.field == "runtime.federation.node_id"));
        // And warns about the empty peer list.
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn toml_round_trip_with_nested_sections() {
        let raw = r#"
            [runtime]
            mailbox_size = 8

            [runtime.subagents]
            max_concurrent = 2

            [runtime.token_safety]
            global_hard_limit_tokens = 1000

            [agents.defaults]
            max_tool_iterations = 5
        "#;
        let cfg = Config::from_toml_str(raw).unwrap();
        assert_eq!(cfg.runtime.mailbox_size, 8);
        assert_eq!(cfg.runtime.subagents.max_concurrent, 2);
        assert_eq!(cfg.runtime.token_safety.global_hard_limit_tokens, 1000);
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 5);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|key| match key {
            "SQUIDBOT_TOKEN_SAFETY_ENABLED" => Some("false".into()),
            "SQUIDBOT_TOKEN_SAFETY_MODE" => Some("hard".into()),
            "SQUIDBOT_TOKEN_SAFETY_GLOBAL_HARD_LIMIT" => Some("99".into()),
            "SQUIDBOT_TOKEN_SAFETY_TRUSTED_WRITERS" => Some("cli:root, *:admin".into()),
            "SQUIDBOT_SUBAGENTS_ENABLED" => Some("false".into()),
            "SQUIDBOT_FEDERATION_ALLOW_FROM" => Some("node-a,node-b".into()),
            _ => None,
        });
        let safety = &cfg.runtime.token_safety;
        assert!(!safety.enabled);
        assert_eq!(safety.mode, TokenSafetyMode::Hard);
        assert_eq!(safety.global_hard_limit_tokens, 99);
        assert_eq!(safety.trusted_writers, vec!["cli:root", "*:admin"]);
        assert!(!cfg.runtime.subagents.enabled);
        assert_eq!(
            cfg.runtime.federation.allow_from_node_ids,
            vec!["node-a", "node-b"]
        );
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let mut cfg = Config::default();
        let before = cfg.runtime.token_safety.clone();
        cfg.apply_env_overrides_from(|key| match key {
            "SQUIDBOT_TOKEN_SAFETY_ENABLED" => Some("not-a-bool".into()),
            "SQUIDBOT_TOKEN_SAFETY_GLOBAL_HARD_LIMIT" => Some("many".into()),
            _ => None,
        });
        assert_eq!(cfg.runtime.token_safety.enabled, before.enabled);
        assert_eq!(
            cfg.runtime.token_safety.global_hard_limit_tokens,
            before.global_hard_limit_tokens
        );
    }
}
