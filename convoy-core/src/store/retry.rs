//! Throttling retry and per-call deadline decorator.
//!
//! Only `Throttled` responses are retried: the backend refused the request, so
//! nothing was written. Timeouts are surfaced immediately because a timed-out
//! conditional write may have landed, and only the caller can tell by re-reading.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{Condition, Item, ItemKey, KvStore, StoreError, StoreResult, Update};
use convoy_common::config::RetryConfig;

/// Exponential backoff with jitter for throttled calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep before retry number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Sleep before retry `attempt`: half the ceiling plus up to half again of jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        half + Duration::from_millis(jitter)
    }
}

/// Wraps a store with throttling retry and a deadline on every call.
pub struct RetryingStore {
    inner: Arc<dyn KvStore>,
    policy: RetryPolicy,
    op_timeout: Duration,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn KvStore>, policy: RetryPolicy, op_timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            op_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.op_timeout, call()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        op,
                        timeout_ms = self.op_timeout.as_millis() as u64,
                        "Store call exceeded deadline"
                    );
                    Err(StoreError::Timeout)
                }
            };

            match result {
                Err(StoreError::Throttled(reason)) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    tracing::debug!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Store throttled, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(StoreError::Throttled(reason)) => {
                    tracing::warn!(
                        op,
                        attempts = attempt,
                        reason = %reason,
                        "Store still throttled after retries"
                    );
                    return Err(StoreError::Throttled(reason));
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl KvStore for RetryingStore {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn get(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        self.run("get", || self.inner.get(table, key)).await
    }

    async fn put(
        &self,
        table: &str,
        key: &ItemKey,
        item: Item,
        condition: &Condition,
    ) -> StoreResult<()> {
        self.run("put", || self.inner.put(table, key, item.clone(), condition))
            .await
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        update: &Update,
        condition: &Condition,
    ) -> StoreResult<Item> {
        self.run("update", || self.inner.update(table, key, update, condition))
            .await
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: &Condition) -> StoreResult<()> {
        self.run("delete", || self.inner.delete(table, key, condition))
            .await
    }

    async fn scan_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> StoreResult<Vec<(String, Item)>> {
        self.run("scan_partition", || self.inner.scan_partition(table, partition))
            .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.run("health_check", || self.inner.health_check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use mockall::predicate::eq;
    use mockall::Sequence;

    mock! {
        Backend {}

        #[async_trait]
        impl KvStore for Backend {
            fn backend_name(&self) -> &'static str;
            async fn get(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>>;
            async fn put(&self, table: &str, key: &ItemKey, item: Item, condition: &Condition) -> StoreResult<()>;
            async fn update(&self, table: &str, key: &ItemKey, update: &Update, condition: &Condition) -> StoreResult<Item>;
            async fn delete(&self, table: &str, key: &ItemKey, condition: &Condition) -> StoreResult<()>;
            async fn scan_partition(&self, table: &str, partition: &str) -> StoreResult<Vec<(String, Item)>>;
            async fn health_check(&self) -> StoreResult<()>;
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
        }
    }

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.ceiling(1), Duration::from_millis(50));
        assert_eq!(p.ceiling(2), Duration::from_millis(100));
        assert_eq!(p.ceiling(3), Duration::from_millis(200));
        assert_eq!(p.ceiling(4), Duration::from_millis(400));
        assert_eq!(p.ceiling(9), Duration::from_millis(400));
        assert_eq!(p.ceiling(64), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_within_bounds() {
        let p = policy(10);
        for attempt in 1..6 {
            let d = p.delay(attempt);
            assert!(d >= p.ceiling(attempt) / 2);
            assert!(d <= p.ceiling(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_then_success() {
        let mut backend = MockBackend::new();
        let mut seq = Sequence::new();
        backend
            .expect_get()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StoreError::Throttled("busy".into())));
        backend
            .expect_get()
            .with(eq("sessions"), eq(ItemKey::partition("s1")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(Item::new().with("version", 1))));

        let store = RetryingStore::new(Arc::new(backend), policy(4), Duration::from_secs(1));
        let item = store
            .get("sessions", &ItemKey::partition("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.get_u64("version"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_gives_up_after_max_attempts() {
        let mut backend = MockBackend::new();
        backend
            .expect_delete()
            .times(3)
            .returning(|_, _, _| Err(StoreError::Throttled("busy".into())));

        let store = RetryingStore::new(Arc::new(backend), policy(3), Duration::from_secs(1));
        let err = store
            .delete("locks", &ItemKey::partition("r1"), &Condition::Always)
            .await
            .unwrap_err();
        assert!(err.is_throttled());
    }

    #[tokio::test]
    async fn test_condition_failure_not_retried() {
        let mut backend = MockBackend::new();
        backend.expect_put().times(1).returning(|table, key, _, _| {
            Err(StoreError::condition_failed(table, key))
        });

        let store = RetryingStore::new(Arc::new(backend), policy(5), Duration::from_secs(1));
        let err = store
            .put("sessions", &ItemKey::partition("s1"), Item::new(), &Condition::NotExists)
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
    }

    struct SlowStore;

    #[async_trait]
    impl KvStore for SlowStore {
        fn backend_name(&self) -> &'static str {
            "slow"
        }
        async fn get(&self, _: &str, _: &ItemKey) -> StoreResult<Option<Item>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn put(&self, _: &str, _: &ItemKey, _: Item, _: &Condition) -> StoreResult<()> {
            Ok(())
        }
        async fn update(&self, _: &str, _: &ItemKey, u: &Update, _: &Condition) -> StoreResult<Item> {
            Ok(u.apply(None))
        }
        async fn delete(&self, _: &str, _: &ItemKey, _: &Condition) -> StoreResult<()> {
            Ok(())
        }
        async fn scan_partition(&self, _: &str, _: &str) -> StoreResult<Vec<(String, Item)>> {
            Ok(Vec::new())
        }
        async fn health_check(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let store = RetryingStore::new(Arc::new(SlowStore), policy(3), Duration::from_millis(200));
        let err = store.get("t", &ItemKey::partition("k")).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout);
        assert_eq!(store.backend_name(), "slow");
    }
}
