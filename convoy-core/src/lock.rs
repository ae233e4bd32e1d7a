//! Distributed advisory locks on the backing store.
//!
//! A lock row is `{ owner, expires_at }` keyed by resource name. Acquisition is a
//! conditional create that also succeeds over an expired row, so a crashed
//! holder's lock is reclaimable once its TTL lapses. There are no fencing tokens:
//! a holder that outlives its TTL can lose the lock while still running, so
//! protected sections must stay shorter than the TTL or re-validate afterwards.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::store::{Condition, Item, ItemKey, KvStore, StoreError};
use convoy_common::config::LockBackoffConfig;

/// Lock manager errors. Contention alone is never an error for `acquire`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    /// `with_lock` could not obtain the lock before its timeout.
    #[error("Lock on '{resource}' is held by another owner (waited {waited:?})")]
    Contended { resource: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for convoy_common::Error {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Contended { .. } => Self::Conflict(e.to_string()),
            LockError::Store(inner) => inner.into(),
        }
    }
}

/// Owner id unique to this process and call, e.g. `worker-4711-9f1c2e...`.
pub fn owner_id() -> String {
    format!("worker-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

/// Retry schedule while waiting for a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for LockBackoff {
    fn default() -> Self {
        Self::from(&LockBackoffConfig::default())
    }
}

impl From<&LockBackoffConfig> for LockBackoff {
    fn from(config: &LockBackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms.max(1)),
            max: Duration::from_millis(config.max_ms.max(1)),
        }
    }
}

/// Current holder of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: String,
    pub expires_at: i64,
}

/// Acquire/release of TTL-bounded locks. Cheap to clone.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    table: Arc<str>,
    clock: Arc<dyn Clock>,
    backoff: LockBackoff,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
        backoff: LockBackoff,
    ) -> Self {
        Self {
            store,
            table: Arc::from(table.into()),
            clock,
            backoff,
        }
    }

    /// Single conditional create. `false` means someone else holds a live lock.
    pub async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let expires_at = self.clock.expiry_after(ttl);
        let item = Item::new()
            .with("owner", owner)
            .with("expires_at", expires_at)
            .with("acquired_at", now)
            .with_expiry(expires_at);
        let takeover = Condition::NotExists.or(Condition::less_than("expires_at", now));

        match self
            .store
            .put(&self.table, &ItemKey::partition(resource), item, &takeover)
            .await
        {
            Ok(()) => {
                tracing::debug!(resource, owner, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                Ok(true)
            }
            Err(e) if e.is_condition_failed() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Retry `try_acquire` with exponential backoff until `timeout` elapses.
    ///
    /// Always makes at least one attempt. Dropping the future mid-wait leaves no
    /// state behind: the lock is either held or it is not.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<bool, LockError> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.backoff.initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.try_acquire(resource, owner, ttl).await? {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(resource, owner, attempts, "Lock contended, giving up");
                return Ok(false);
            }

            tracing::debug!(
                resource,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Lock contended, backing off"
            );
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.backoff.max);
        }
    }

    /// Delete the lock if `owner` still holds it. `false` if it expired or was taken over.
    pub async fn release(&self, resource: &str, owner: &str) -> Result<bool, LockError> {
        match self
            .store
            .delete(
                &self.table,
                &ItemKey::partition(resource),
                &Condition::equals("owner", owner),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(resource, owner, "Lock released");
                Ok(true)
            }
            Err(e) if e.is_condition_failed() => {
                tracing::warn!(resource, owner, "Lock no longer owned at release");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current live holder, if any.
    pub async fn holder(&self, resource: &str) -> Result<Option<LockInfo>, LockError> {
        let Some(item) = self
            .store
            .get(&self.table, &ItemKey::partition(resource))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(LockInfo {
            owner: item.require_str("owner")?.to_string(),
            expires_at: item.get_i64("expires_at").unwrap_or_default(),
        }))
    }

    /// Acquire and return a guard that releases on `release` or on drop.
    pub async fn acquire_guard(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        if !self.acquire(resource, owner, ttl, timeout).await? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            manager: self.clone(),
            resource: resource.to_string(),
            owner: owner.to_string(),
            released: false,
        }))
    }

    /// Run `f` while holding the lock; the lock is released on every exit path.
    ///
    /// Returns [`LockError::Contended`] without running `f` if the lock could not
    /// be obtained within `timeout`.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        timeout: Duration,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self
            .acquire_guard(resource, owner, ttl, timeout)
            .await?
            .ok_or_else(|| LockError::Contended {
                resource: resource.to_string(),
                waited: timeout,
            })?;

        let output = f().await;

        if let Err(e) = guard.release().await {
            // The critical section already ran; an unreleased lock just expires
            tracing::warn!(resource, error = %e, "Failed to release lock");
        }
        Ok(output)
    }
}

/// A held lock. Released explicitly with [`LockGuard::release`], otherwise by a
/// background task when dropped inside a Tokio runtime. TTL expiry covers the rest.
pub struct LockGuard {
    manager: LockManager,
    resource: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release now. `false` if the lock had already expired and been taken over.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.manager.release(&self.resource, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(resource = %self.resource, "Lock guard dropped outside runtime; relying on TTL");
            return;
        };

        let manager = self.manager.clone();
        let resource = std::mem::take(&mut self.resource);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = manager.release(&resource, &owner).await {
                tracing::warn!(resource = %resource, error = %e, "Background lock release failed");
            }
        });
    }
}
