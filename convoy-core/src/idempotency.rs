//! Request idempotency ledger.
//!
//! The first caller to `begin` a key owns the request; everybody else either
//! replays the cached response or is told the request is still in progress.
//! Records expire after the idempotency window, after which the key is reusable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{Condition, Item, ItemKey, KvStore, StoreError, Update};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Idempotency record '{key}' is malformed: {reason}")]
    Corrupt { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for convoy_common::Error {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Corrupt { .. } => Self::Internal(e.to_string()),
            LedgerError::Store(inner) => inner.into(),
        }
    }
}

/// Lifecycle of a ledger record: `processing` then exactly one of `done` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Processing,
    Done,
    Error,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown ledger status '{other}'")),
        }
    }
}

/// Snapshot of a live ledger record.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub key: String,
    pub session_id: String,
    pub status: LedgerStatus,
    pub first_seen_at: i64,
    pub expires_at: Option<i64>,
    pub response: Option<Vec<u8>>,
}

/// What `run` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotentOutcome {
    /// This caller ran the operation; the response is now cached.
    Executed(Vec<u8>),
    /// A previous caller completed it; this is their exact response.
    Replayed(Vec<u8>),
    /// Another caller holds the key without a cached response.
    InProgress,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn KvStore>,
    table: Arc<str>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn KvStore>, table: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            table: Arc::from(table.into()),
            clock,
        }
    }

    /// Claim `key`. `true` means this caller owns the request and must finish it
    /// with `end_ok` or `end_error`.
    pub async fn begin(&self, key: &str, session_id: &str, ttl: Duration) -> Result<bool, LedgerError> {
        let item = Item::new()
            .with("status", LedgerStatus::Processing.as_str())
            .with("session_id", session_id)
            .with("first_seen_at", self.clock.now_ms())
            .with_expiry(self.clock.expiry_after(ttl));

        match self
            .store
            .put(&self.table, &ItemKey::partition(key), item, &Condition::NotExists)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_condition_failed() => {
                tracing::debug!(idempotency_key = key, session_id, "Duplicate request");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cached response, only once the record is `done`.
    pub async fn get_cached(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self
            .status(key)
            .await?
            .filter(|entry| entry.status == LedgerStatus::Done)
            .and_then(|entry| entry.response))
    }

    /// `processing` → `done`, caching `response`. `false` if the record was not
    /// processing (already finalized, or expired).
    pub async fn end_ok(&self, key: &str, response: &[u8]) -> Result<bool, LedgerError> {
        let update = Update::new()
            .set("status", LedgerStatus::Done.as_str())
            .set("response", BASE64.encode(response))
            .set("completed_at", self.clock.now_ms());
        self.finish(key, update, LedgerStatus::Done).await
    }

    /// `processing` → `error`. Nothing is cached; the key frees up when the record expires.
    pub async fn end_error(&self, key: &str) -> Result<bool, LedgerError> {
        let update = Update::new()
            .set("status", LedgerStatus::Error.as_str())
            .set("completed_at", self.clock.now_ms());
        self.finish(key, update, LedgerStatus::Error).await
    }

    /// Drop a `processing` claim whose operation never started, freeing the key
    /// for an immediate retry.
    pub async fn abandon(&self, key: &str) -> Result<bool, LedgerError> {
        let expect = Condition::equals("status", LedgerStatus::Processing.as_str());
        match self
            .store
            .delete(&self.table, &ItemKey::partition(key), &expect)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_condition_failed() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Live record for `key`, if any.
    pub async fn status(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let Some(item) = self.store.get(&self.table, &ItemKey::partition(key)).await? else {
            return Ok(None);
        };
        let corrupt = |reason: String| LedgerError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let status: LedgerStatus = item.require_str("status")?.parse().map_err(corrupt)?;
        let response = item
            .get_str("response")
            .map(|encoded| BASE64.decode(encoded))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(LedgerEntry {
            key: key.to_string(),
            session_id: item.get_str("session_id").unwrap_or_default().to_string(),
            status,
            first_seen_at: item.get_i64("first_seen_at").unwrap_or_default(),
            expires_at: item.expires_at,
            response,
        }))
    }

    /// Full caller pattern: claim the key, run `op`, and finalize; or replay the
    /// cached response; or report that another caller is still on it.
    ///
    /// If `op` fails the record moves to `error` and the failure is returned. If this
    /// future is dropped mid-operation the record stays `processing` until it expires.
    pub async fn run<F, Fut, E>(
        &self,
        key: &str,
        session_id: &str,
        ttl: Duration,
        op: F,
    ) -> Result<IdempotentOutcome, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: From<LedgerError>,
    {
        if !self.begin(key, session_id, ttl).await? {
            return Ok(match self.get_cached(key).await? {
                Some(response) => IdempotentOutcome::Replayed(response),
                None => IdempotentOutcome::InProgress,
            });
        }

        match op().await {
            Ok(response) => {
                self.end_ok(key, &response).await?;
                Ok(IdempotentOutcome::Executed(response))
            }
            Err(e) => {
                if let Err(ledger_err) = self.end_error(key).await {
                    tracing::warn!(idempotency_key = key, error = %ledger_err, "Failed to record error");
                }
                Err(e)
            }
        }
    }

    async fn finish(&self, key: &str, update: Update, to: LedgerStatus) -> Result<bool, LedgerError> {
        let expect = Condition::equals("status", LedgerStatus::Processing.as_str());
        match self
            .store
            .update(&self.table, &ItemKey::partition(key), &update, &expect)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_condition_failed() => {
                tracing::warn!(idempotency_key = key, to = %to, "Idempotency record not processing");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
