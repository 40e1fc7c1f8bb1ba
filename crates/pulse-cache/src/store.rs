//! Cache store abstraction.
//!
//! A [`CacheStore`] keeps a flat field map per key and can apply "write
//! fields + set TTL" as one indivisible step, so an entry never exists
//! without its expiry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{CacheError, Result};

/// Field name → encoded value for one cache entry.
pub type FieldMap = HashMap<String, String>;

/// A remote key-value store with per-key field maps and TTLs.
pub trait CacheStore: Send + Sync {
    /// Reads all fields of `key`; `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn get_fields<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FieldMap>>> + Send + 'a>>;

    /// Replaces the fields of `key` and sets its TTL atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or the script fails.
    fn set_fields_with_ttl<'a>(
        &'a self,
        key: &'a str,
        fields: FieldMap,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Round-trips to the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not answer.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

#[derive(Debug, Clone)]
struct Entry {
    fields: FieldMap,
    expires_at: Instant,
}

/// Operation counters of a [`MemoryCacheStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Successful reads.
    pub reads: u64,
    /// Successful writes.
    pub writes: u64,
    /// Calls rejected because the store was set to fail.
    pub failures: u64,
}

/// An in-process [`CacheStore`] with TTL expiry and failure injection.
///
/// Time is measured with [`tokio::time::Instant`], so paused-clock tests
/// can expire entries deterministically.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
    failing: AtomicBool,
    stall: Mutex<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`CacheError::Unavailable`] (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every call by `delay`, simulating a slow or hung store.
    pub fn set_stall(&self, delay: Option<Duration>) {
        *self.stall.lock() = delay;
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Returns true if no live entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of `key`, if present.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    /// Returns operation counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self) -> Result<()> {
        let stall = *self.stall.lock();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(CacheError::Unavailable {
                reason: "memory store set to fail".to_string(),
            });
        }
        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn get_fields<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FieldMap>>> + Send + 'a>> {
        Box::pin(async move {
            self.enter().await?;
            let now = Instant::now();
            let mut entries = self.entries.lock();
            let fields = match entries.get(key) {
                Some(entry) if entry.expires_at > now => Some(entry.fields.clone()),
                Some(_) => {
                    entries.remove(key);
                    None
                }
                None => None,
            };
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(fields)
        })
    }

    fn set_fields_with_ttl<'a>(
        &'a self,
        key: &'a str,
        fields: FieldMap,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.enter().await?;
            if ttl.is_zero() {
                return Err(CacheError::Script {
                    reason: "ttl must be positive".to_string(),
                });
            }
            // Fields and expiry land under one lock acquisition.
            self.entries.lock().insert(
                key.to_string(),
                Entry {
                    fields,
                    expires_at: Instant::now() + ttl,
                },
            );
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.enter().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_returns_fields() {
        let store = MemoryCacheStore::new();
        store
            .set_fields_with_ttl("k", fields(&[("a", "1")]), Duration::from_secs(1))
            .await
            .unwrap();

        let got = store.get_fields("k").await.unwrap();
        assert_eq!(got, Some(fields(&[("a", "1")])));
        assert_eq!(store.stats().writes, 1);
        assert_eq!(store.stats().reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryCacheStore::new();
        store
            .set_fields_with_ttl("k", fields(&[("a", "1")]), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(store.ttl("k").is_some());

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(store.get_fields("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_replaces_fields_and_ttl() {
        let store = MemoryCacheStore::new();
        store
            .set_fields_with_ttl("k", fields(&[("a", "1"), ("b", "2")]), Duration::from_millis(100))
            .await
            .unwrap();
        store
            .set_fields_with_ttl("k", fields(&[("a", "3")]), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(store.get_fields("k").await.unwrap(), Some(fields(&[("a", "3")])));
        assert!(store.ttl("k").unwrap() > Duration::from_secs(4));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected_without_writing() {
        let store = MemoryCacheStore::new();
        let err = store
            .set_fields_with_ttl("k", fields(&[("a", "1")]), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Script { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failing_store_rejects_every_call() {
        let store = MemoryCacheStore::new();
        store.set_failing(true);

        assert!(store.ping().await.is_err());
        assert!(store.get_fields("k").await.is_err());
        assert_eq!(store.stats().failures, 2);

        store.set_failing(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_delays_calls() {
        let store = MemoryCacheStore::new();
        store.set_stall(Some(Duration::from_secs(10)));

        let started = Instant::now();
        store.ping().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
