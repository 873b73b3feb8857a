//! Token-budget counters, reservations, and the runtime override record.
//!
//! Every mutator runs inside a single lock region, so the multi-scope
//! projection check of a preflight and the reservation it creates are one
//! atomic step. Reserved counters only decrease through `finalize`,
//! `cancel`, or the expiry sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sb_domain::config::TokenSafetySettings;
use sb_domain::error::{Error, LimitError, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Committed and reserved usage for one scope.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BudgetCounter {
    pub total_tokens: u64,
    pub reserved_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A tentative allocation across one or more scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReservationRow {
    id: String,
    scopes: Vec<String>,
    tokens: u64,
    expires_at: DateTime<Utc>,
}

/// The runtime-mutable settings override. At most one exists; it
/// overwrites the config defaults wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub settings: TokenSafetySettings,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// One scope's hard-limit check for `try_reserve`. `hard_limit: None`
/// reserves without enforcement (soft mode, or no limit configured).
#[derive(Debug, Clone)]
pub struct ScopeCheck {
    pub scope: String,
    pub hard_limit: Option<u64>,
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    counters: HashMap<String, BudgetCounter>,
    reservations: HashMap<String, ReservationRow>,
    #[serde(default)]
    safety_override: Option<OverrideRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BudgetStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl BudgetStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("budget.json");
        let inner = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Inner::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Check every scope's projection against its hard limit and, when all
    /// pass, add `tokens` to each scope's reserved counter. One atomic
    /// region; on a limit failure no counter changes.
    pub fn try_reserve(
        &self,
        checks: &[ScopeCheck],
        tokens: u64,
        ttl_sec: u64,
    ) -> std::result::Result<String, LimitError> {
        let id = {
            let mut inner = self.inner.lock();

            for check in checks {
                if let Some(limit) = check.hard_limit {
                    if limit == 0 {
                        continue;
                    }
                    let counter = inner.counters.get(&check.scope).cloned().unwrap_or_default();
                    let projected = counter.total_tokens + counter.reserved_tokens + tokens;
                    if projected > limit {
                        return Err(LimitError {
                            scope: check.scope.clone(),
                            used: counter.total_tokens,
                            reserved: counter.reserved_tokens,
                            requested: tokens,
                            limit,
                        });
                    }
                }
            }

            for check in checks {
                inner
                    .counters
                    .entry(check.scope.clone())
                    .or_default()
                    .reserved_tokens += tokens;
            }

            let id = uuid::Uuid::new_v4().to_string();
            let scopes = checks.iter().map(|c| c.scope.clone()).collect();
            inner.reservations.insert(
                id.clone(),
                ReservationRow {
                    id: id.clone(),
                    scopes,
                    tokens,
                    expires_at: Utc::now() + Duration::seconds(ttl_sec as i64),
                },
            );
            id
        };

        self.persist();
        Ok(id)
    }

    /// Release a reservation and commit actual usage to every scope it
    /// covered. Returns the post-commit counter per scope, or an empty vec
    /// when the reservation was already resolved (idempotent).
    pub fn finalize(
        &self,
        reservation_id: &str,
        total: u64,
        prompt: u64,
        completion: u64,
    ) -> Vec<(String, BudgetCounter)> {
        let snapshots = {
            let mut inner = self.inner.lock();
            let Some(row) = inner.reservations.remove(reservation_id) else {
                return Vec::new();
            };

            let mut snapshots = Vec::with_capacity(row.scopes.len());
            for scope in &row.scopes {
                let counter = inner.counters.entry(scope.clone()).or_default();
                counter.reserved_tokens = counter.reserved_tokens.saturating_sub(row.tokens);
                counter.total_tokens += total;
                counter.prompt_tokens += prompt;
                counter.completion_tokens += completion;
                snapshots.push((scope.clone(), counter.clone()));
            }
            snapshots
        };

        self.persist();
        snapshots
    }

    /// Release a reservation without committing usage. Idempotent.
    pub fn cancel(&self, reservation_id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.reservations.remove(reservation_id) {
                Some(row) => {
                    for scope in &row.scopes {
                        let counter = inner.counters.entry(scope.clone()).or_default();
                        counter.reserved_tokens =
                            counter.reserved_tokens.saturating_sub(row.tokens);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.persist();
        }
    }

    /// Cancel every reservation past its expiry. Returns how many were
    /// collected.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .reservations
                .values()
                .filter(|row| row.expires_at <= now)
                .map(|row| row.id.clone())
                .collect()
        };
        for id in &expired {
            tracing::debug!(reservation_id = %id, "sweeping expired budget reservation");
            self.cancel(id);
        }
        expired.len()
    }

    /// Add committed usage to a scope outside the reservation protocol
    /// (federation and peer counters).
    pub fn add_usage(&self, scope: &str, tokens: u64) {
        {
            let mut inner = self.inner.lock();
            inner.counters.entry(scope.to_owned()).or_default().total_tokens += tokens;
        }
        self.persist();
    }

    pub fn counter(&self, scope: &str) -> BudgetCounter {
        self.inner
            .lock()
            .counters
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_reservations(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    // ── Settings override ────────────────────────────────────────────

    pub fn safety_override(&self) -> Option<OverrideRecord> {
        self.inner.lock().safety_override.clone()
    }

    /// Replace the override record, bumping its version.
    pub fn set_safety_override(&self, settings: TokenSafetySettings) -> OverrideRecord {
        let record = {
            let mut inner = self.inner.lock();
            let version = inner
                .safety_override
                .as_ref()
                .map(|o| o.version + 1)
                .unwrap_or(1);
            let record = OverrideRecord {
                settings,
                updated_at: Utc::now(),
                version,
            };
            inner.safety_override = Some(record.clone());
            record
        };
        self.persist();
        record
    }

    fn persist(&self) {
        let snapshot = {
            let inner = self.inner.lock();
            serde_json::to_string(&*inner)
        };
        let result = snapshot
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist budget state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BudgetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BudgetStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn checks(limits: &[(&str, Option<u64>)]) -> Vec<ScopeCheck> {
        limits
            .iter()
            .map(|(scope, hard_limit)| ScopeCheck {
                scope: scope.to_string(),
                hard_limit: *hard_limit,
            })
            .collect()
    }

    #[test]
    fn reserve_then_cancel_restores_counters() {
        let (_dir, store) = store();
        let before = store.counter("global");

        let id = store
            .try_reserve(&checks(&[("global", Some(100))]), 10, 60)
            .unwrap();
        assert_eq!(store.counter("global").reserved_tokens, 10);

        store.cancel(&id);
        assert_eq!(store.counter("global"), before);
        assert_eq!(store.open_reservations(), 0);
    }

    #[test]
    fn reserve_then_finalize_commits_planned() {
        let (_dir, store) = store();
        let id = store
            .try_reserve(&checks(&[("global", Some(100)), ("session:s1", None)]), 10, 60)
            .unwrap();

        let snapshots = store.finalize(&id, 10, 7, 3);
        assert_eq!(snapshots.len(), 2);

        for scope in ["global", "session:s1"] {
            let counter = store.counter(scope);
            assert_eq!(counter.total_tokens, 10);
            assert_eq!(counter.reserved_tokens, 0);
            assert_eq!(counter.prompt_tokens, 7);
            assert_eq!(counter.completion_tokens, 3);
        }
    }

    #[test]
    fn hard_limit_blocks_and_leaves_counters_unchanged() {
        let (_dir, store) = store();
        store.add_usage("global", 95);

        let err = store
            .try_reserve(&checks(&[("session:s1", None), ("global", Some(100))]), 10, 60)
            .unwrap_err();
        assert_eq!(err.scope, "global");
        assert_eq!(err.used, 95);
        assert_eq!(err.requested, 10);
        assert_eq!(err.limit, 100);

        // The passing scope was not touched either.
        assert_eq!(store.counter("session:s1").reserved_tokens, 0);
        assert_eq!(store.open_reservations(), 0);
    }

    #[test]
    fn reserved_tokens_count_toward_projection() {
        let (_dir, store) = store();
        let _held = store
            .try_reserve(&checks(&[("global", Some(100))]), 60, 60)
            .unwrap();
        assert!(store
            .try_reserve(&checks(&[("global", Some(100))]), 50, 60)
            .is_err());
        assert!(store
            .try_reserve(&checks(&[("global", Some(100))]), 40, 60)
            .is_ok());
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let (_dir, store) = store();
        store.add_usage("global", 1_000_000);
        assert!(store
            .try_reserve(&checks(&[("global", Some(0))]), 10, 60)
            .is_ok());
    }

    #[test]
    fn finalize_and_cancel_are_idempotent() {
        let (_dir, store) = store();
        let id = store
            .try_reserve(&checks(&[("global", None)]), 10, 60)
            .unwrap();
        store.finalize(&id, 10, 10, 0);
        assert!(store.finalize(&id, 10, 10, 0).is_empty());
        store.cancel(&id);
        assert_eq!(store.counter("global").total_tokens, 10);
    }

    #[test]
    fn sweep_collects_expired_reservations() {
        let (_dir, store) = store();
        store
            .try_reserve(&checks(&[("global", None)]), 10, 1)
            .unwrap();
        assert_eq!(store.counter("global").reserved_tokens, 10);

        assert_eq!(store.sweep_expired(Utc::now() + Duration::seconds(2)), 1);
        assert_eq!(store.counter("global").reserved_tokens, 0);
    }

    #[test]
    fn sweep_leaves_live_reservations() {
        let (_dir, store) = store();
        store
            .try_reserve(&checks(&[("global", None)]), 10, 3600)
            .unwrap();
        assert_eq!(store.sweep_expired(Utc::now()), 0);
        assert_eq!(store.counter("global").reserved_tokens, 10);
    }

    #[test]
    fn override_versions_increment() {
        let (_dir, store) = store();
        assert!(store.safety_override().is_none());

        let v1 = store.set_safety_override(TokenSafetySettings::default());
        assert_eq!(v1.version, 1);

        let mut settings = TokenSafetySettings::default();
        settings.global_hard_limit_tokens = 17;
        let v2 = store.set_safety_override(settings);
        assert_eq!(v2.version, 2);
        assert_eq!(
            store.safety_override().unwrap().settings.global_hard_limit_tokens,
            17
        );
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BudgetStore::new(dir.path()).unwrap();
            store.add_usage("peer:b", 42);
        }
        let store = BudgetStore::new(dir.path()).unwrap();
        assert_eq!(store.counter("peer:b").total_tokens, 42);
    }
}
