use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// Per-turn execution defaults shared by the session handler and subagents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Model identifier passed to the provider. `None` uses the provider's
    /// own default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: Option<f32>,
    /// Wall-clock budget for one whole turn. Provider and tool calls
    /// derive their deadlines from the remaining turn time.
    #[serde(default = "d_turn_timeout_sec")]
    pub turn_timeout_sec: u64,
    /// Per-tool-call budget, capped by the remaining turn time.
    #[serde(default = "d_tool_timeout_sec")]
    pub tool_timeout_sec: u64,
    #[serde(default = "d_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// How many prior turns are loaded as history. Clamped to 50.
    #[serde(default = "d_history_window")]
    pub history_window: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: d_max_tokens(),
            temperature: d_temperature(),
            turn_timeout_sec: d_turn_timeout_sec(),
            tool_timeout_sec: d_tool_timeout_sec(),
            max_tool_iterations: d_max_tool_iterations(),
            history_window: d_history_window(),
        }
    }
}

impl AgentDefaults {
    /// History window with the hard cap applied.
    pub fn clamped_history_window(&self) -> usize {
        self.history_window.min(50)
    }
}

fn d_max_tokens() -> u32 {
    1024
}

fn d_temperature() -> Option<f32> {
    Some(0.2)
}

fn d_turn_timeout_sec() -> u64 {
    120
}

fn d_tool_timeout_sec() -> u64 {
    60
}

fn d_max_tool_iterations() -> u32 {
    20
}

fn d_history_window() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let d = AgentDefaults::default();
        assert_eq!(d.turn_timeout_sec, 120);
        assert_eq!(d.tool_timeout_sec, 60);
        assert_eq!(d.max_tool_iterations, 20);
        assert_eq!(d.history_window, 50);
    }

    #[test]
    fn history_window_is_capped() {
        let d = AgentDefaults {
            history_window: 500,
            ..Default::default()
        };
        assert_eq!(d.clamped_history_window(), 50);
    }
}
