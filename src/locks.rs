// =============================================================================
// KeyedTryLock — per-(account, symbol) advisory try-acquire guards
// =============================================================================
//
// Generalizes the `RwLock<HashMap<...>>` idiom this engine uses elsewhere for
// read-mostly caches (the trade-processor and VPIN-state registries) into a
// keyed mutual-exclusion registry: a contending tick gets `None` back
// immediately rather than queueing behind the holder, which is exactly the
// semantics the entry lock and trigger lock need.
// =============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};

/// Registry of per-key `Mutex<()>` guards, created lazily on first contention
/// for a given key and retained for the process lifetime.
pub struct KeyedTryLock<K> {
    locks: RwLock<HashMap<K, Arc<Mutex<()>>>>,
}

/// A try-acquired lock for one key. Releases on drop.
pub type LockGuard = ArcMutexGuard<RawMutex, ()>;

impl<K: Eq + Hash + Clone> KeyedTryLock<K> {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(key) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write();
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Attempt to acquire the lock for `key`. Returns `None` immediately if
    /// it is already held — callers must treat that as "skip this tick",
    /// never block waiting for it.
    pub fn try_acquire(&self, key: &K) -> Option<LockGuard> {
        self.entry(key).try_lock_arc()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedTryLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_acquire_fails_while_first_held() {
        let registry: KeyedTryLock<(String, String)> = KeyedTryLock::new();
        let key = ("acct-a".to_string(), "BTCUSDT".to_string());
        let first = registry.try_acquire(&key);
        assert!(first.is_some());
        let second = registry.try_acquire(&key);
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let registry: KeyedTryLock<(String, String)> = KeyedTryLock::new();
        let key = ("acct-a".to_string(), "BTCUSDT".to_string());
        {
            let _guard = registry.try_acquire(&key).unwrap();
        }
        let again = registry.try_acquire(&key);
        assert!(again.is_some());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let registry: KeyedTryLock<(String, String)> = KeyedTryLock::new();
        let a = ("acct-a".to_string(), "BTCUSDT".to_string());
        let b = ("acct-a".to_string(), "ETHUSDT".to_string());
        let _g1 = registry.try_acquire(&a).unwrap();
        let g2 = registry.try_acquire(&b);
        assert!(g2.is_some());
    }
}
