//! Distributed lock abstraction.
//!
//! Locks are owned by an opaque [`LockToken`] rather than a thread: async
//! execution hops between worker threads, so the token travels with the
//! task that acquired the lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CacheError, Result};

/// Identifies the holder of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Generates a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named mutual-exclusion lock shared across service instances.
pub trait DistributedLock: Send + Sync {
    /// Tries to acquire `name` for `token`, waiting at most `wait`.
    ///
    /// Returns `Ok(false)` if the wait elapsed. An acquired lock expires on
    /// its own after `lease` unless released first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock service cannot be reached.
    fn try_lock<'a>(
        &'a self,
        name: &'a str,
        token: LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Releases `name` if `token` holds it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LockNotHeld`] if `token` is not the holder
    /// (for instance because the lease expired).
    fn unlock<'a>(
        &'a self,
        name: &'a str,
        token: LockToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: LockToken,
    expires_at: Instant,
}

/// An in-process [`DistributedLock`] with lease expiry.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
    failing: AtomicBool,
}

impl MemoryLockService {
    /// Creates a lock service with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`CacheError::Unavailable`] (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the current holder of `name`, ignoring expired leases.
    #[must_use]
    pub fn holder(&self, name: &str) -> Option<LockToken> {
        let now = Instant::now();
        self.holders
            .lock()
            .get(name)
            .filter(|h| h.expires_at > now)
            .map(|h| h.token)
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                reason: "lock service set to fail".to_string(),
            });
        }
        Ok(())
    }

    /// Takes the lock if free; otherwise returns when the current lease ends.
    fn try_take(&self, name: &str, token: LockToken, lease: Duration) -> std::result::Result<(), Instant> {
        let now = Instant::now();
        let mut holders = self.holders.lock();
        match holders.get(name) {
            Some(holder) if holder.expires_at > now && holder.token != token => {
                Err(holder.expires_at)
            }
            _ => {
                holders.insert(
                    name.to_string(),
                    Holder {
                        token,
                        expires_at: now + lease,
                    },
                );
                Ok(())
            }
        }
    }
}

impl DistributedLock for MemoryLockService {
    fn try_lock<'a>(
        &'a self,
        name: &'a str,
        token: LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let deadline = Instant::now() + wait;

            loop {
                // Register before checking so a release in between is not missed.
                let released = self.released.notified();

                let lease_ends = match self.try_take(name, token, lease) {
                    Ok(()) => return Ok(true),
                    Err(lease_ends) => lease_ends,
                };

                if Instant::now() >= deadline {
                    return Ok(false);
                }

                let _ = tokio::time::timeout_at(deadline.min(lease_ends), released).await;
            }
        })
    }

    fn unlock<'a>(
        &'a self,
        name: &'a str,
        token: LockToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            {
                let mut holders = self.holders.lock();
                match holders.get(name) {
                    Some(holder) if holder.token == token && holder.expires_at > now => {
                        holders.remove(name);
                    }
                    _ => {
                        return Err(CacheError::LockNotHeld {
                            name: name.to_string(),
                        });
                    }
                }
            }
            self.released.notify_waiters();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn free_lock_is_acquired_immediately() {
        let locks = MemoryLockService::new();
        let token = LockToken::new();

        assert!(locks.try_lock("a", token, Duration::ZERO, LEASE).await.unwrap());
        assert_eq!(locks.holder("a"), Some(token));
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_times_out_for_others() {
        let locks = MemoryLockService::new();
        let owner = LockToken::new();
        assert!(locks.try_lock("a", owner, Duration::ZERO, Duration::from_secs(60)).await.unwrap());

        let started = Instant::now();
        let acquired = locks
            .try_lock("a", LockToken::new(), Duration::from_millis(200), LEASE)
            .await
            .unwrap();

        assert!(!acquired);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_after_release() {
        let locks = Arc::new(MemoryLockService::new());
        let owner = LockToken::new();
        assert!(locks.try_lock("a", owner, Duration::ZERO, Duration::from_secs(60)).await.unwrap());

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .try_lock("a", LockToken::new(), Duration::from_secs(5), LEASE)
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.unlock("a", owner).await.unwrap();

        assert!(waiter.await.unwrap());
        assert_ne!(locks.holder("a"), Some(owner));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_frees_the_lock() {
        let locks = MemoryLockService::new();
        let owner = LockToken::new();
        assert!(locks.try_lock("a", owner, Duration::ZERO, Duration::from_millis(100)).await.unwrap());

        let other = LockToken::new();
        assert!(locks.try_lock("a", other, Duration::from_secs(1), LEASE).await.unwrap());
        assert_eq!(locks.holder("a"), Some(other));

        let err = locks.unlock("a", owner).await.unwrap_err();
        assert!(matches!(err, CacheError::LockNotHeld { .. }));
    }

    #[tokio::test]
    async fn failing_service_reports_unavailable() {
        let locks = MemoryLockService::new();
        locks.set_failing(true);
        let err = locks
            .try_lock("a", LockToken::new(), Duration::ZERO, LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { .. }));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(LockToken::new(), LockToken::new());
    }
}
