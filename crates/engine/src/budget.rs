//! Token-budget enforcement: the reserve / commit / abort protocol.
//!
//! The guard is a stateless coordinator over the store's budget
//! collections. Effective settings are the config defaults unless a
//! persisted override exists; the resolution is cached for two seconds.
//! The only ways a reserved counter decreases are `commit`, `abort`, and
//! the expiry sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use sb_domain::config::{TokenSafetyMode, TokenSafetySettings};
use sb_domain::error::LimitError;
use sb_providers::Usage;
use sb_store::{ScopeCheck, Store};

/// How long one settings resolution stays cached.
const SETTINGS_CACHE_TTL: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A granted (or no-op) reservation, carried by value through the turn.
#[derive(Debug, Clone)]
pub struct BudgetReservation {
    /// `None` when token safety is disabled.
    id: Option<String>,
    tokens: u64,
}

impl BudgetReservation {
    fn noop() -> Self {
        Self {
            id: None,
            tokens: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.id.is_none()
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

/// A scope that crossed its soft threshold at commit time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SoftWarning {
    pub scope: String,
    pub threshold_pct: u64,
    /// Percent of the hard limit in use after the commit.
    pub used_pct: u64,
}

/// What a commit settled to.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Tokens actually charged (reported or estimated).
    pub total_tokens: u64,
    pub warnings: Vec<SoftWarning>,
}

struct CachedSettings {
    settings: TokenSafetySettings,
    fetched_at: Instant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BudgetGuard {
    store: Arc<Store>,
    defaults: TokenSafetySettings,
    cache: Mutex<Option<CachedSettings>>,
}

impl BudgetGuard {
    pub fn new(store: Arc<Store>, defaults: TokenSafetySettings) -> Self {
        Self {
            store,
            defaults,
            cache: Mutex::new(None),
        }
    }

    /// Config defaults overlaid by the persisted override, cached 2 s.
    pub fn effective_settings(&self) -> TokenSafetySettings {
        {
            let cache = self.cache.lock();
            if let Some(cached) = &*cache {
                if cached.fetched_at.elapsed() < SETTINGS_CACHE_TTL {
                    return cached.settings.clone();
                }
            }
        }

        let settings = self
            .store
            .budget
            .safety_override()
            .map(|record| record.settings)
            .unwrap_or_else(|| self.defaults.clone());

        *self.cache.lock() = Some(CachedSettings {
            settings: settings.clone(),
            fetched_at: Instant::now(),
        });
        settings
    }

    /// Drop the cached settings (called after a governance write).
    pub fn invalidate_cache(&self) {
        *self.cache.lock() = None;
    }

    /// Hard limit and soft threshold for a scope key, by prefix.
    fn limits_for(settings: &TokenSafetySettings, scope: &str) -> (u64, u64) {
        if scope == "global" {
            (
                settings.global_hard_limit_tokens,
                settings.global_soft_threshold_pct,
            )
        } else if scope.starts_with("session:") {
            (
                settings.session_hard_limit_tokens,
                settings.session_soft_threshold_pct,
            )
        } else if scope.starts_with("subagent:") {
            (
                settings.subagent_run_hard_limit_tokens,
                settings.subagent_run_soft_threshold_pct,
            )
        } else {
            // federation:<run>, peer:<id>: tracked but unlimited.
            (0, 0)
        }
    }

    /// Reserve `planned` tokens across every scope, failing atomically if
    /// any hard projection exceeds its limit.
    pub fn preflight(
        &self,
        scopes: &[String],
        planned: u64,
    ) -> std::result::Result<BudgetReservation, LimitError> {
        let settings = self.effective_settings();
        if !settings.enabled {
            return Ok(BudgetReservation::noop());
        }

        let enforce_hard = settings.mode != TokenSafetyMode::Soft;
        let checks: Vec<ScopeCheck> = scopes
            .iter()
            .map(|scope| {
                let (hard, _) = Self::limits_for(&settings, scope);
                ScopeCheck {
                    scope: scope.clone(),
                    hard_limit: if enforce_hard && hard > 0 {
                        Some(hard)
                    } else {
                        None
                    },
                }
            })
            .collect();

        let id = self
            .store
            .budget
            .try_reserve(&checks, planned, settings.reservation_ttl_sec)?;

        Ok(BudgetReservation {
            id: Some(id),
            tokens: planned,
        })
    }

    /// Release the reservation and commit actual usage. Usage absent from
    /// the provider is estimated from output length when enabled.
    pub fn commit(
        &self,
        reservation: &BudgetReservation,
        usage: Option<Usage>,
        output_chars: usize,
    ) -> CommitOutcome {
        let Some(id) = &reservation.id else {
            return CommitOutcome::default();
        };
        let settings = self.effective_settings();

        let reported = usage.map(|u| u.total_tokens).unwrap_or(0);
        let total = if reported > 0 {
            reported
        } else if settings.estimate_on_missing_usage {
            (output_chars as u64 / settings.estimate_chars_per_token.max(1)).max(1)
        } else {
            0
        };
        let (prompt, completion) = usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, total));

        let snapshots = self.store.budget.finalize(id, total, prompt, completion);

        let mut warnings = Vec::new();
        if settings.mode != TokenSafetyMode::Hard {
            for (scope, counter) in &snapshots {
                let (hard, soft_pct) = Self::limits_for(&settings, scope);
                if hard == 0 || soft_pct == 0 {
                    continue;
                }
                let in_use = counter.total_tokens + counter.reserved_tokens;
                if in_use * 100 >= hard * soft_pct {
                    warnings.push(SoftWarning {
                        scope: scope.clone(),
                        threshold_pct: soft_pct,
                        used_pct: in_use * 100 / hard,
                    });
                }
            }
        }

        CommitOutcome {
            total_tokens: total,
            warnings,
        }
    }

    /// Release the reservation without committing usage. Idempotent.
    pub fn abort(&self, reservation: &BudgetReservation) {
        if let Some(id) = &reservation.id {
            self.store.budget.cancel(id);
        }
    }

    /// Collect expired reservations. Returns how many were swept.
    pub fn sweep(&self) -> usize {
        self.store.budget.sweep_expired(chrono::Utc::now())
    }

    pub fn is_trusted_writer(&self, channel: &str, sender: &str) -> bool {
        self.effective_settings().is_trusted_writer(channel, sender)
    }
}
