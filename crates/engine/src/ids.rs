//! Monotonic, lexicographically sortable identifiers.
//!
//! `{millis:012x}{seq:04x}{entropy:10}`: a zero-padded millisecond
//! timestamp prefix keeps ids time-ordered as strings, the per-millisecond
//! sequence keeps concurrent callers ordered, and a uuid-derived tail makes
//! ids unique across processes. Callers are serialized through a mutex.

use chrono::Utc;
use parking_lot::Mutex;

pub struct IdGenerator {
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: u64,
    seq: u16,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GenState { last_ms: 0, seq: 0 }),
        }
    }

    pub fn next(&self) -> String {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;

        let (ms, seq) = {
            let mut state = self.state.lock();
            if now_ms > state.last_ms {
                state.last_ms = now_ms;
                state.seq = 0;
            } else {
                // Same millisecond, or the clock stepped backwards: keep
                // the prefix monotonic and bump the sequence.
                state.seq = state.seq.wrapping_add(1);
            }
            (state.last_ms, state.seq)
        };

        let entropy = uuid::Uuid::new_v4().simple().to_string();
        format!("{ms:012x}{seq:04x}{}", &entropy[..10])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_fixed_width_and_unique() {
        let ids = IdGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = ids.next();
            assert_eq!(id.len(), 26);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn ids_sort_in_generation_order() {
        let ids = IdGenerator::new();
        let generated: Vec<String> = (0..100).map(|_| ids.next()).collect();
        let mut sorted = generated.clone();
        sorted.sort();
        assert_eq!(generated, sorted);
    }

    #[test]
    fn ids_are_lowercase_hex_prefixed() {
        let ids = IdGenerator::new();
        let id = ids.next();
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
