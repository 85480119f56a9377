//! Per-task memoization of object metadata reads.
//!
//! A `CachedStore` is created at the top of each object task and dropped with
//! it, so cached heads are never visible to another object's task.

use crate::models::cos::HeadObject;
use crate::services::{error::StoreResult, store::ObjectStore};
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};
use tracing::debug;

/// Memoizes the successful results of one operation, keyed by a JSON
/// serialization of its arguments. Failures are not cached.
pub struct MetadataCache<T> {
    entries: Mutex<HashMap<String, T>>,
}

impl<T: Clone> MetadataCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `args`, or run `fetch` and remember its result.
    pub async fn get<A, F, Fut, E>(&self, args: &A, fetch: F) -> Result<T, E>
    where
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Ok(key) = serde_json::to_string(args) else {
            return fetch().await;
        };

        if let Some(hit) = self.lookup(&key) {
            debug!("metadata cache hit for {}", key);
            return Ok(hit);
        }

        let value = fetch().await?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<T> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl<T: Clone> Default for MetadataCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Decorates an `ObjectStore` so `head_object` goes through a `MetadataCache`.
pub struct CachedStore<'a> {
    store: &'a dyn ObjectStore,
    heads: MetadataCache<HeadObject>,
}

impl<'a> CachedStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            heads: MetadataCache::new(),
        }
    }

    pub async fn head_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<HeadObject> {
        self.heads
            .get(&(bucket, region, key), || self.store.head_object(bucket, region, key))
            .await
    }

    /// The undecorated store, for operations that are not cached.
    pub fn inner(&self) -> &'a dyn ObjectStore {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::MockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn identical_arguments_hit_the_cache() {
        let calls = AtomicUsize::new(0);
        let cache: MetadataCache<String> = MetadataCache::new();
        let fetch = |a: &str, b: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = format!("{a}:{b}");
            async move { Ok::<_, ()>(value) }
        };

        let first = cache.get(&("a", "b"), || fetch("a", "b")).await.unwrap();
        let second = cache.get(&("a", "b"), || fetch("a", "b")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.get(&("a", "c"), || fetch("a", "c")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let calls = AtomicUsize::new(0);
        let cache: MetadataCache<u32> = MetadataCache::new();

        let result = cache
            .get(&["k"], || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, &str>("boom") }
            })
            .await;
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());

        let result = cache
            .get(&["k"], || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, &str>(7) }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_store_heads_once_per_object() {
        let store = MockStore::new();
        store.put_object("b", "r", "a.txt", b"hello");
        store.put_object("b", "r", "b.txt", b"world");
        let cached = CachedStore::new(&store);

        let first = cached.head_object("b", "r", "a.txt").await.unwrap();
        let again = cached.head_object("b", "r", "a.txt").await.unwrap();
        assert_eq!(first, again);
        cached.head_object("b", "r", "b.txt").await.unwrap();

        assert_eq!(store.calls("head_object"), 2);
    }

    #[tokio::test]
    async fn separate_caches_do_not_share_entries() {
        let store = MockStore::new();
        store.put_object("b", "r", "a.txt", b"hello");

        CachedStore::new(&store).head_object("b", "r", "a.txt").await.unwrap();
        CachedStore::new(&store).head_object("b", "r", "a.txt").await.unwrap();

        assert_eq!(store.calls("head_object"), 2);
    }
}
