//! Round-robin key rotation with per-request credential selection.
//!
//! [`KeyRotator`] holds an immutable list of resolved API keys and an atomic
//! index. [`KeyRotator::next_key`] atomically reads-and-advances the index
//! modulo the key count — the only mutable state the rotator carries. Unlike
//! a provider SDK with process-global credential configuration, the caller
//! receives the key value itself and threads it through a single request;
//! no lock is held across an HTTP call and no credential is ever stored as
//! ambient process state (§9's "global credential state anti-pattern").

use std::sync::atomic::{AtomicUsize, Ordering};

use swarm_domain::error::{Error, Result};

/// Thread-safe round-robin credential rotator.
pub struct KeyRotator {
    keys: Vec<String>,
    index: AtomicUsize,
}

impl KeyRotator {
    /// Build a rotator from a resolved key list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalStartup`] if `keys` is empty.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::FatalStartup(
                "KeyRotator requires at least one resolved API key".into(),
            ));
        }
        Ok(Self {
            keys,
            index: AtomicUsize::new(0),
        })
    }

    /// Atomically read-and-advance the index modulo the key count and
    /// return that key. Never blocks; safe to call concurrently.
    pub fn next_key(&self) -> &str {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        &self.keys[idx]
    }

    /// Number of keys in the rotator.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// Manual Debug impl to avoid leaking key values.
impl std::fmt::Debug for KeyRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotator")
            .field("key_count", &self.keys.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_keys_is_fatal() {
        assert!(KeyRotator::new(vec![]).is_err());
    }

    #[test]
    fn single_key_always_returns_same() {
        let rotator = KeyRotator::new(vec!["only".into()]).unwrap();
        assert_eq!(rotator.next_key(), "only");
        assert_eq!(rotator.next_key(), "only");
    }

    #[test]
    fn round_robin_cycles_through_keys() {
        let rotator = KeyRotator::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let seen: Vec<_> = (0..6).map(|_| rotator.next_key().to_string()).collect();
        assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c"]);
    }

    /// *Key fairness* (§8): for `N` concurrent calls against `K` keys, each
    /// key is selected at least `floor(N/K)` times.
    #[test]
    fn concurrent_callers_are_fair() {
        let rotator = Arc::new(KeyRotator::new(vec!["a".into(), "b".into(), "c".into()]).unwrap());
        let n_per_thread = 300;
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let r = Arc::clone(&rotator);
                thread::spawn(move || {
                    let mut counts = [0usize; 3];
                    for _ in 0..n_per_thread {
                        match r.next_key() {
                            "a" => counts[0] += 1,
                            "b" => counts[1] += 1,
                            "c" => counts[2] += 1,
                            _ => unreachable!(),
                        }
                    }
                    counts
                })
            })
            .collect();

        let mut totals = [0usize; 3];
        for h in handles {
            let counts = h.join().unwrap();
            for i in 0..3 {
                totals[i] += counts[i];
            }
        }

        let n = n_per_thread * 6;
        let k = 3;
        let floor = n / k;
        for total in totals {
            assert!(total >= floor, "key got {total} calls, expected >= {floor}");
        }
    }
}
