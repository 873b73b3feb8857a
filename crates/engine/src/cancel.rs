//! Run cancellation table.
//!
//! Each in-flight run registers a token under its run id. `cancel()`
//! fires the token, which wakes any suspend point selecting on it; the
//! owner removes the entry when the run settles.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Tracks active cancellation tokens per run id.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a new token for a run. A re-register replaces
    /// the previous token; the orphan is left un-cancelled.
    pub fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(run_id.to_owned(), token.clone());
        token
    }

    /// Fire the token for a run. Returns true if one was registered.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token for a run (called when the run settles).
    pub fn remove(&self, run_id: &str) {
        self.tokens.lock().remove(run_id);
    }

    /// Whether a run currently has a registered (in-flight) token.
    pub fn is_running(&self, run_id: &str) -> bool {
        self.tokens.lock().contains_key(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_cancel_remove_lifecycle() {
        let map = CancelMap::new();
        let token = map.register("r1");
        assert!(!token.is_cancelled());
        assert!(map.is_running("r1"));

        assert!(map.cancel("r1"));
        assert!(token.is_cancelled());

        map.remove("r1");
        assert!(!map.is_running("r1"));
        assert!(!map.cancel("r1"));
    }

    #[test]
    fn cancel_unknown_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        map.register("r1");
        map.remove("r1");
        map.remove("r1");
        assert!(!map.is_running("r1"));
    }

    #[test]
    fn re_register_replaces_token() {
        let map = CancelMap::new();
        let old = map.register("r1");
        let new = map.register("r1");
        map.cancel("r1");
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_token_wakes_waiters() {
        let map = CancelMap::new();
        let token = map.register("r1");

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            7
        });
        map.cancel("r1");
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
