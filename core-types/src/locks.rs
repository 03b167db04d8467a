// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

/// Mutex per key, created on first use and dropped once nobody holds or
/// waits on it. Holders of distinct keys never contend.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    inner: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one key. Releasing the last hold removes the key's
/// entry from the table.
pub struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    locks: &'a KeyedLocks<K>,
    key: K,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until `key` is free.
    pub fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let entry = {
            let mut map = self.inner.lock();
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        // The clone keeps the entry alive while this thread waits.
        let guard = entry.lock_arc();
        KeyedGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.inner.lock();
        // Clones are only taken under the map lock, so a count of one means
        // no other thread holds or awaits this key.
        if map
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn same_key_excludes_and_distinct_keys_do_not() {
        let locks = Arc::new(KeyedLocks::new());
        let held = locks.lock(&"a".to_string());
        drop(locks.lock(&"b".to_string()));

        let entered = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let (locks, entered) = (locks.clone(), entered.clone());
            std::thread::spawn(move || {
                let _guard = locks.lock(&"a".to_string());
                entered.fetch_add(1, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(held);
        waiter.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_keys_are_evicted() {
        let locks = KeyedLocks::new();
        for i in 0..1_000 {
            let _guard = locks.lock(&i);
        }
        assert!(locks.is_empty());

        let first = locks.lock(&7);
        let second = locks.lock(&8);
        assert_eq!(locks.len(), 2);
        drop(first);
        assert_eq!(locks.len(), 1);
        drop(second);
        assert!(locks.is_empty());
    }

    #[test]
    fn entry_survives_while_another_thread_waits() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, counter) = (locks.clone(), counter.clone());
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = locks.lock(&"shared");
                        let value = *counter.lock();
                        std::thread::yield_now();
                        *counter.lock() = value + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 800);
        assert!(locks.is_empty());
    }
}
