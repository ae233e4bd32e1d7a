//! Key-value backing store adapter.
//!
//! Every coordination primitive is built on one small contract: rows addressed by
//! a partition key (and optionally a sort key), conditional put/update/delete
//! evaluated atomically with the write, and per-row absolute expiry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ┌────────────┐ ┌────────────┐ ┌──────────────┐
//! │ SessionStore │ │ LockManager│ │ Idempotency│ │ ActionCoord. │
//! └──────┬───────┘ └─────┬──────┘ └─────┬──────┘ └──────┬───────┘
//!        └───────────────┴──────┬───────┴───────────────┘
//!                    ┌──────────▼──────────┐
//!                    │   RetryingStore     │  throttling backoff, op timeout
//!                    └──────────┬──────────┘
//!                    ┌──────────▼──────────┐
//!                    │   KvStore trait     │
//!                    └──────────┬──────────┘
//!              ┌────────────────┴───────────────┐
//!       ┌──────▼──────┐                  ┌──────▼──────┐
//!       │  InMemory   │                  │ Redis (Lua) │
//!       └─────────────┘                  └─────────────┘
//! ```
//!
//! Rows past their `expires_at` are invisible to every operation, whether or not
//! the backend has physically removed them yet.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis_store;
mod retry;

pub use memory::InMemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStore;
pub use retry::{RetryPolicy, RetryingStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use convoy_common::config::{RetryConfig, StoreBackend, StoreConfig};

// ============================================================================
// Error Types
// ============================================================================

/// Backing store errors, classified so callers can decide what is retryable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The write condition did not hold; nothing was written.
    #[error("Conditional check failed on {table}/{key}")]
    ConditionFailed { table: String, key: String },

    /// Backend rate limit or busy signal.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Backend unreachable or failing.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline. A write may still have landed.
    #[error("Store operation timed out")]
    Timeout,

    /// Row contents could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The key cannot be represented by the backend.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    pub(crate) fn condition_failed(table: &str, key: &ItemKey) -> Self {
        Self::ConditionFailed {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<StoreError> for convoy_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConditionFailed { .. } => Self::Conflict(e.to_string()),
            StoreError::Throttled(msg) => Self::Throttled(msg),
            StoreError::Unavailable(msg) => Self::Unavailable(msg),
            StoreError::Timeout => Self::Timeout,
            StoreError::Serialization(msg) => Self::Internal(msg),
            StoreError::InvalidKey(msg) => Self::InvalidInput(msg),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Keys and Items
// ============================================================================

/// Address of a row: partition key plus optional sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl ItemKey {
    /// Key for a table with a simple partition-only schema.
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    /// Key for a table with a composite schema.
    pub fn composite(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }

    /// Reject keys the backends cannot address unambiguously.
    ///
    /// `#` joins partition and sort in backend row keys, so it is only refused in
    /// composite keys. A table holds a single key shape.
    pub fn validate(&self) -> StoreResult<()> {
        fn check(part: &str, what: &str, composite: bool) -> StoreResult<()> {
            if part.is_empty() {
                return Err(StoreError::InvalidKey(format!("{what} must not be empty")));
            }
            if part.len() > 1024 {
                return Err(StoreError::InvalidKey(format!("{what} exceeds 1024 bytes")));
            }
            if part.chars().any(char::is_control) {
                return Err(StoreError::InvalidKey(format!(
                    "{what} '{part}' contains control characters"
                )));
            }
            if composite && part.contains('#') {
                return Err(StoreError::InvalidKey(format!(
                    "{what} '{part}' of a composite key contains '#'"
                )));
            }
            Ok(())
        }

        let composite = self.sort.is_some();
        check(&self.partition, "partition key", composite)?;
        if let Some(sort) = &self.sort {
            check(sort, "sort key", true)?;
        }
        Ok(())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}#{}", self.partition, sort),
            None => write!(f, "{}", self.partition),
        }
    }
}

/// A stored row: named attributes plus an optional absolute expiry (epoch ms).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(attr.into(), value.into());
        self
    }

    pub fn with_expiry(mut self, expires_at_ms: i64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    pub fn set(&mut self, attr: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(attr.into(), value.into());
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.get(attr).and_then(Value::as_str)
    }

    /// Integer attribute. Accepts float encodings produced by script-side JSON.
    pub fn get_i64(&self, attr: &str) -> Option<i64> {
        self.get(attr)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
    }

    pub fn get_u64(&self, attr: &str) -> Option<u64> {
        self.get(attr)
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
    }

    /// String attribute that must be present.
    pub fn require_str(&self, attr: &str) -> StoreResult<&str> {
        self.get_str(attr)
            .ok_or_else(|| StoreError::Serialization(format!("missing string attribute '{attr}'")))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

// ============================================================================
// Conditions and Updates
// ============================================================================

/// Precondition evaluated atomically against the currently stored row.
///
/// Attribute comparisons are false when the row or the attribute is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Exists,
    NotExists,
    Equals { attr: String, value: Value },
    In { attr: String, values: Vec<Value> },
    LessThan { attr: String, value: i64 },
    And { all: Vec<Condition> },
    Or { any: Vec<Condition> },
}

impl Condition {
    pub fn equals(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn one_of<V: Into<Value>>(attr: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In {
            attr: attr.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn less_than(attr: impl Into<String>, value: i64) -> Self {
        Self::LessThan {
            attr: attr.into(),
            value,
        }
    }

    pub fn and(self, other: Condition) -> Self {
        Self::And {
            all: vec![self, other],
        }
    }

    pub fn or(self, other: Condition) -> Self {
        Self::Or {
            any: vec![self, other],
        }
    }

    /// Evaluate against the live (non-expired) row, if any.
    pub fn evaluate(&self, current: Option<&Item>) -> bool {
        match self {
            Self::Always => true,
            Self::Exists => current.is_some(),
            Self::NotExists => current.is_none(),
            Self::Equals { attr, value } => current
                .and_then(|item| item.get(attr))
                .is_some_and(|stored| values_equal(stored, value)),
            Self::In { attr, values } => current.and_then(|item| item.get(attr)).is_some_and(
                |stored| values.iter().any(|candidate| values_equal(stored, candidate)),
            ),
            Self::LessThan { attr, value } => current
                .and_then(|item| item.get_i64(attr))
                .is_some_and(|stored| stored < *value),
            Self::And { all } => all.iter().all(|c| c.evaluate(current)),
            Self::Or { any } => any.iter().any(|c| c.evaluate(current)),
        }
    }
}

/// Numeric equality that ignores integer/float encoding differences.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Partial modification of a row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Update {
    pub set: Map<String, Value>,
    pub remove: Vec<String>,
    /// New absolute expiry; `None` keeps the current one.
    pub expires_at: Option<i64>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(attr.into(), value.into());
        self
    }

    pub fn remove(mut self, attr: impl Into<String>) -> Self {
        self.remove.push(attr.into());
        self
    }

    pub fn expires_at(mut self, expires_at_ms: i64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    /// Apply to an existing row (or an empty one) and return the result.
    pub fn apply(&self, current: Option<Item>) -> Item {
        let mut item = current.unwrap_or_default();
        for (k, v) in &self.set {
            item.attrs.insert(k.clone(), v.clone());
        }
        for k in &self.remove {
            item.attrs.remove(k);
        }
        if let Some(at) = self.expires_at {
            item.expires_at = Some(at);
        }
        item
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Conditional key-value store with per-row expiry.
///
/// All writes take a [`Condition`]; a failed condition yields
/// [`StoreError::ConditionFailed`] and leaves the row untouched.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Fetch a live row.
    async fn get(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>>;

    /// Write a whole row if `condition` holds.
    async fn put(&self, table: &str, key: &ItemKey, item: Item, condition: &Condition)
        -> StoreResult<()>;

    /// Merge `update` into the row if `condition` holds; absent rows start empty.
    /// Returns the row as written.
    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        update: &Update,
        condition: &Condition,
    ) -> StoreResult<Item>;

    /// Delete the row if `condition` holds. Deleting an absent row under
    /// `Condition::Always` succeeds.
    async fn delete(&self, table: &str, key: &ItemKey, condition: &Condition) -> StoreResult<()>;

    /// All live rows of a composite-key partition, ordered by sort key.
    async fn scan_partition(&self, table: &str, partition: &str)
        -> StoreResult<Vec<(String, Item)>>;

    /// Cheap round trip proving the backend is reachable.
    async fn health_check(&self) -> StoreResult<()>;
}

// ============================================================================
// Store Factory
// ============================================================================

/// Build the configured backend wrapped in throttling retry and call timeouts.
pub async fn create_store(
    config: &StoreConfig,
    retry: &RetryConfig,
    clock: Arc<dyn Clock>,
) -> StoreResult<Arc<dyn KvStore>> {
    let inner: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new(clock)),
        StoreBackend::Redis => connect_redis(config, clock).await?,
    };

    tracing::info!(
        backend = inner.backend_name(),
        url = %convoy_common::util::redact_url(&config.url),
        op_timeout_ms = config.op_timeout_ms,
        max_attempts = retry.max_attempts,
        "Backing store ready"
    );

    Ok(Arc::new(RetryingStore::new(
        inner,
        RetryPolicy::from(retry),
        Duration::from_millis(config.op_timeout_ms),
    )))
}

#[cfg(feature = "redis-backend")]
async fn connect_redis(config: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Arc<dyn KvStore>> {
    Ok(Arc::new(
        RedisStore::connect(&config.url, &config.key_prefix, clock).await?,
    ))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_redis(
    _config: &StoreConfig,
    _clock: Arc<dyn Clock>,
) -> StoreResult<Arc<dyn KvStore>> {
    // An in-memory fallback would silently drop cross-instance exclusion.
    Err(StoreError::Unavailable(
        "redis backend requested but the redis-backend feature is not enabled".into(),
    ))
}
