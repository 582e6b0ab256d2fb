// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Key-info cache.
//!
//! Maps key names to their certificate chain, public key, and algorithms.
//! Entries are served until the owning token's TTL expires; concurrent
//! misses for one key collapse into a single custodian fetch, and a pool
//! declared dead gets its keys dropped wholesale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::SignError;
use crate::protocol::KeyInfo;
use crate::worker::WorkerPool;

struct Entry {
    info: KeyInfo,
    fetched_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

#[derive(Default)]
pub struct KeyInfoCache {
    entries: DashMap<String, Entry>,
    /// Per-key gates serializing concurrent fetches.
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a key's info through the cache.
    pub async fn get(&self, key: &str, pool: &WorkerPool) -> Result<KeyInfo, SignError> {
        self.get_with(key, pool.cache_ttl(), || pool.key_info(key))
            .await
    }

    /// Cache lookup with an arbitrary fetcher. The first miss blocks while
    /// one fetch runs; waiters for the same key share its result instead
    /// of issuing their own.
    pub async fn get_with<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<KeyInfo, SignError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KeyInfo, SignError>>,
    {
        if let Some(entry) = self.entries.get(key)
            && entry.fresh()
        {
            return Ok(entry.info.clone());
        }

        let gate = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Whoever held the gate before us may have already filled the
        // entry; don't fetch twice.
        if let Some(entry) = self.entries.get(key)
            && entry.fresh()
        {
            return Ok(entry.info.clone());
        }

        let info = fetch().await?;
        self.entries.insert(
            key.to_string(),
            Entry {
                info: info.clone(),
                fetched_at: Instant::now(),
                ttl,
            },
        );
        Ok(info)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every entry owned by a dead pool.
    pub fn invalidate_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            self.entries.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeyAlgorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info() -> KeyInfo {
        KeyInfo {
            certificate_chain: vec![],
            public_key: "-----BEGIN PUBLIC KEY-----".to_string(),
            algorithm: KeyAlgorithm::Rsa,
            pgp_certificate: None,
        }
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let cache = Arc::new(KeyInfoCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_with("release", Duration::from_secs(600), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(info())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_expire_by_ttl() {
        let cache = KeyInfoCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_with("release", Duration::from_millis(10), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(info())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        cache
            .get_with("release", Duration::from_millis(10), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(info())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = KeyInfoCache::new();
        let result = cache
            .get_with("release", Duration::from_secs(600), || async {
                Err(SignError::TokenUnavailable("hsm".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.len(), 0);

        let result = cache
            .get_with("release", Duration::from_secs(600), || async { Ok(info()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let cache = KeyInfoCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_with("release", Duration::from_secs(600), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(info())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate_keys(["release"]);
        cache
            .get_with("release", Duration::from_secs(600), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(info())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
