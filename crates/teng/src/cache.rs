/*
 * cache.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Memoizing store for compiled programs and loaded dictionaries.
//!
//! A bounded LRU map guarded by one mutex. `get_or_build` guarantees
//! at-most-one concurrent build per key: the first caller marks the key as
//! building and releases the map lock for the duration of the build, other
//! callers for the same key block on a condvar until the result lands.
//! Entries are revalidated on every hit so stale file-backed artifacts are
//! rebuilt.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use hashlink::LruCache;

struct CacheState<V> {
    ready: LruCache<String, Arc<V>>,
    building: HashSet<String>,
}

/// A keyed cache shared between renders; values are immutable once built.
pub struct SharedCache<V> {
    state: Mutex<CacheState<V>>,
    cond: Condvar,
}

impl<V> SharedCache<V> {
    pub fn new(capacity: usize) -> Self {
        SharedCache {
            state: Mutex::new(CacheState {
                ready: LruCache::new(capacity.max(1)),
                building: HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetch the value for `key`, building it when missing or no longer
    /// valid. Concurrent callers for the same missing key wait for the
    /// first build's result; the map lock is never held across a build.
    pub fn get_or_build<B, P>(&self, key: &str, still_valid: P, build: B) -> Arc<V>
    where
        B: FnOnce() -> V,
        P: Fn(&V) -> bool,
    {
        let mut state = self.lock();
        loop {
            if state.building.contains(key) {
                state = match self.cond.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                continue;
            }
            if let Some(found) = state.ready.get(key) {
                if still_valid(found) {
                    return Arc::clone(found);
                }
                tracing::debug!(key, "cache entry is stale, rebuilding");
                state.ready.remove(key);
            }
            break;
        }
        state.building.insert(key.to_string());
        drop(state);

        tracing::debug!(key, "building cache entry");
        let built = Arc::new(build());

        let mut state = self.lock();
        state.building.remove(key);
        state.ready.insert(key.to_string(), Arc::clone(&built));
        self.cond.notify_all();
        built
    }
}
