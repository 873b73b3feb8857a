//! Daily activity log and per-day usage totals.
//!
//! Entries land in `logs/YYYY-MM-DD.jsonl`; running token totals per day
//! live in `daily_usage.json`. Truncation is code-point safe so non-ASCII
//! intents never split a character.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sb_domain::error::{Error, Result};

/// Intent text is capped at this many code points in a log entry.
pub const INTENT_MAX_CHARS: usize = 240;
/// Outcome text cap.
pub const OUTCOME_MAX_CHARS: usize = 320;

/// Outcome substrings (matched case-insensitively) that flag an entry for
/// follow-up.
const FOLLOW_UP_MARKERS: &[&str] = &[
    "follow-up",
    "follow up",
    "waiting on",
    "blocked",
    "next step",
    "need input",
    "action required",
];

/// One line in the day's activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLogEntry {
    pub time: DateTime<Utc>,
    pub source: String,
    pub session_id: String,
    pub intent: String,
    pub outcome: String,
    pub follow_up: bool,
}

impl DailyLogEntry {
    /// Build an entry with truncation and follow-up detection applied.
    pub fn new(source: &str, session_id: &str, intent: &str, outcome: &str) -> Self {
        Self {
            time: Utc::now(),
            source: source.to_owned(),
            session_id: session_id.to_owned(),
            intent: truncate_chars(intent, INTENT_MAX_CHARS),
            outcome: truncate_chars(outcome, OUTCOME_MAX_CHARS),
            follow_up: needs_follow_up(outcome),
        }
    }
}

/// Truncate at a code-point boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

/// Whether an outcome contains any follow-up marker (case-insensitive).
pub fn needs_follow_up(outcome: &str) -> bool {
    let lowered = outcome.to_lowercase();
    FOLLOW_UP_MARKERS.iter().any(|m| lowered.contains(m))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DailyLogStore {
    logs_dir: PathBuf,
    usage_path: PathBuf,
    /// date string → total tokens.
    usage: Mutex<HashMap<String, u64>>,
}

impl DailyLogStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let logs_dir = state_path.join("logs");
        std::fs::create_dir_all(&logs_dir).map_err(Error::Io)?;

        let usage_path = state_path.join("daily_usage.json");
        let usage = if usage_path.exists() {
            let raw = std::fs::read_to_string(&usage_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            logs_dir,
            usage_path,
            usage: Mutex::new(usage),
        })
    }

    fn day_path(&self, day: &str) -> PathBuf {
        self.logs_dir.join(format!("{day}.jsonl"))
    }

    /// Append an entry to today's log. Best-effort.
    pub fn append(&self, entry: &DailyLogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize daily log entry");
                return;
            }
        };

        use std::io::Write;
        let day = entry.time.date_naive().to_string();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_path(&day))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append daily log entry");
        }
    }

    /// Entries for one day (`YYYY-MM-DD`) in append order.
    pub fn entries(&self, day: &str) -> Vec<DailyLogEntry> {
        let path = self.day_path(day);
        if !path.exists() {
            return Vec::new();
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(day, error = %e, "failed to read daily log");
                return Vec::new();
            }
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Add to today's running token total.
    pub fn record_usage(&self, tokens: u64) {
        {
            let mut usage = self.usage.lock();
            *usage.entry(Utc::now().date_naive().to_string()).or_insert(0) += tokens;
        }
        self.persist_usage();
    }

    /// Total tokens recorded for one day.
    pub fn usage_for(&self, day: &str) -> u64 {
        self.usage.lock().get(day).copied().unwrap_or(0)
    }

    fn persist_usage(&self) {
        let snapshot = {
            let usage = self.usage.lock();
            serde_json::to_string(&*usage)
        };
        let result = snapshot
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|json| std::fs::write(&self.usage_path, json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist daily usage");
        }
    }
}
