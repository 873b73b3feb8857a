use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagent pool configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the background subagent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentsConfig {
    #[serde(default = "d_enabled")]
    pub enabled: bool,
    /// Number of pool workers. Clamped to `1..=32`.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,
    /// Queue capacity; enqueue fails once it is full.
    #[serde(default = "d_max_queue")]
    pub max_queue: usize,
    #[serde(default = "d_default_timeout_sec")]
    pub default_timeout_sec: u64,
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "d_retry_backoff_sec")]
    pub retry_backoff_sec: u64,
    /// Maximum subagent-spawns-subagent nesting depth.
    #[serde(default = "d_max_depth")]
    pub max_depth: u32,
    /// Announce completions on the outbound channel.
    #[serde(default = "d_enabled")]
    pub notify_on_complete: bool,
    /// Reinject completion summaries as new inbound messages so the
    /// session picks the result up on its next turn.
    #[serde(default)]
    pub reinject_on_complete: bool,
    /// Permit write/edit tools in the subagent registry.
    #[serde(default)]
    pub allow_writes: bool,
    /// Root directory for per-run artifact directories, relative to the
    /// state path unless absolute.
    #[serde(default = "d_artifact_root")]
    pub artifact_root: PathBuf,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            enabled: d_enabled(),
            max_concurrent: d_max_concurrent(),
            max_queue: d_max_queue(),
            default_timeout_sec: d_default_timeout_sec(),
            max_attempts: d_max_attempts(),
            retry_backoff_sec: d_retry_backoff_sec(),
            max_depth: d_max_depth(),
            notify_on_complete: d_enabled(),
            reinject_on_complete: false,
            allow_writes: false,
            artifact_root: d_artifact_root(),
        }
    }
}

impl SubagentsConfig {
    /// Clamp `max_concurrent` to the allowed range `1..=32`.
    pub fn clamped(&self) -> Self {
        Self {
            max_concurrent: self.max_concurrent.clamp(1, 32),
            max_attempts: self.max_attempts.max(1),
            ..self.clone()
        }
    }
}

fn d_enabled() -> bool {
    true
}

fn d_max_concurrent() -> usize {
    4
}

fn d_max_queue() -> usize {
    64
}

fn d_default_timeout_sec() -> u64 {
    300
}

fn d_max_attempts() -> u32 {
    2
}

fn d_retry_backoff_sec() -> u64 {
    5
}

fn d_max_depth() -> u32 {
    2
}

fn d_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}
