//! Versioned session state with optimistic concurrency control.
//!
//! One row per conversation. `version` starts at 0 ("no row") and every
//! successful save moves it forward by exactly one: the write is conditioned on
//! the stored version equalling the version the writer read. The `state` blob is
//! opaque to this module; [`VersionedState`] adds a typed layer with an embedded
//! schema version for callers that want one.
//!
//! Auxiliary metadata (such as the pointer to the action awaiting confirmation)
//! lives beside the state under `meta.` attributes and is never touched by `save`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{Condition, ItemKey, KvStore, StoreError, Update};

const META_PREFIX: &str = "meta.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The stored version did not match the expected one; reload and retry.
    #[error("Version conflict on session '{session_id}' (expected version {expected})")]
    VersionConflict { session_id: String, expected: u64 },

    /// A reload-merge-retry also conflicted; the caller should give up on this turn.
    #[error("Session '{session_id}' kept changing underneath the writer")]
    ConcurrencyConflict { session_id: String },

    #[error("Session '{session_id}' has schema version {found}, expected {expected}")]
    SchemaMismatch {
        session_id: String,
        found: u32,
        expected: u32,
    },

    #[error("Session '{session_id}' is malformed: {reason}")]
    Corrupt { session_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<SessionError> for convoy_common::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::VersionConflict { .. } | SessionError::ConcurrencyConflict { .. } => {
                Self::Conflict(e.to_string())
            }
            SessionError::SchemaMismatch { .. } | SessionError::Corrupt { .. } => {
                Self::Internal(e.to_string())
            }
            SessionError::Store(inner) => inner.into(),
        }
    }
}

/// Snapshot of a session row. An absent row loads as version 0 with empty state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Session {
    pub session_id: String,
    pub version: u64,
    /// Opaque serialized state owned by business logic.
    pub state: String,
    pub updated_at: Option<i64>,
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn exists(&self) -> bool {
        self.version > 0
    }

    pub fn meta_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).and_then(Value::as_str)
    }
}

/// Typed session state serialized with its schema version.
pub trait VersionedState: Serialize + DeserializeOwned + Default + Send + Sync {
    const SCHEMA_VERSION: u32;
}

/// Wire envelope for [`VersionedState`] values.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateBlob<T> {
    pub schema_version: u32,
    pub data: T,
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    table: Arc<str>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn KvStore>,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            table: Arc::from(table.into()),
            clock,
            retention,
        }
    }

    /// Current state and version. Never fails for a missing row.
    pub async fn load(&self, session_id: &str) -> Result<Session, SessionError> {
        let Some(item) = self
            .store
            .get(&self.table, &ItemKey::partition(session_id))
            .await?
        else {
            return Ok(Session {
                session_id: session_id.to_string(),
                ..Session::default()
            });
        };

        let version = item.get_u64("version").ok_or_else(|| SessionError::Corrupt {
            session_id: session_id.to_string(),
            reason: "missing version".into(),
        })?;
        let metadata = item
            .attrs
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(META_PREFIX).map(|k| (k.to_string(), v.clone())))
            .collect();

        Ok(Session {
            session_id: session_id.to_string(),
            version,
            state: item.get_str("state").unwrap_or_default().to_string(),
            updated_at: item.get_i64("updated_at"),
            metadata,
        })
    }

    /// Conditional write of `state`. `expected_version` 0 creates the row.
    /// Returns the new version, `expected_version + 1`.
    pub async fn save(
        &self,
        session_id: &str,
        state: &str,
        expected_version: u64,
    ) -> Result<u64, SessionError> {
        // No stored row can be at u64::MAX, so the write could never match
        let Some(next) = expected_version.checked_add(1) else {
            return Err(SessionError::VersionConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
            });
        };
        let condition = if expected_version == 0 {
            Condition::NotExists
        } else {
            Condition::equals("version", expected_version)
        };
        let update = Update::new()
            .set("session_id", session_id)
            .set("version", next)
            .set("state", state)
            .set("updated_at", self.clock.now_ms())
            .expires_at(self.clock.expiry_after(self.retention));

        match self
            .store
            .update(&self.table, &ItemKey::partition(session_id), &update, &condition)
            .await
        {
            Ok(_) => Ok(next),
            Err(e) if e.is_condition_failed() => {
                tracing::debug!(session_id, expected_version, "Session version conflict");
                Err(SessionError::VersionConflict {
                    session_id: session_id.to_string(),
                    expected: expected_version,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge auxiliary fields without touching state or version.
    /// Best effort: `false` if the session does not exist.
    pub async fn update_metadata(
        &self,
        session_id: &str,
        fields: Map<String, Value>,
    ) -> Result<bool, SessionError> {
        self.write_metadata(session_id, fields, Condition::Exists).await
    }

    /// Like [`update_metadata`](Self::update_metadata), but only while metadata
    /// field `field` still equals `expected`. `false` otherwise.
    pub async fn update_metadata_if(
        &self,
        session_id: &str,
        fields: Map<String, Value>,
        field: &str,
        expected: impl Into<Value>,
    ) -> Result<bool, SessionError> {
        let condition = Condition::equals(format!("{META_PREFIX}{field}"), expected);
        self.write_metadata(session_id, fields, condition).await
    }

    async fn write_metadata(
        &self,
        session_id: &str,
        fields: Map<String, Value>,
        condition: Condition,
    ) -> Result<bool, SessionError> {
        let update = fields.into_iter().fold(Update::new(), |update, (k, v)| {
            if v.is_null() {
                update.remove(format!("{META_PREFIX}{k}"))
            } else {
                update.set(format!("{META_PREFIX}{k}"), v)
            }
        });

        match self
            .store
            .update(&self.table, &ItemKey::partition(session_id), &update, &condition)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_condition_failed() => {
                tracing::debug!(session_id, "Metadata update skipped, condition not met");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the row if it is still at `expected_version`.
    pub async fn delete(&self, session_id: &str, expected_version: u64) -> Result<bool, SessionError> {
        match self
            .store
            .delete(
                &self.table,
                &ItemKey::partition(session_id),
                &Condition::equals("version", expected_version),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_condition_failed() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Typed load. An absent row yields `T::default()` at version 0.
    pub async fn load_typed<T: VersionedState>(&self, session_id: &str) -> Result<(T, u64), SessionError> {
        let session = self.load(session_id).await?;
        Ok((decode_state(&session)?, session.version))
    }

    /// Typed save wrapping `state` in a [`StateBlob`].
    pub async fn save_typed<T: VersionedState>(
        &self,
        session_id: &str,
        state: &T,
        expected_version: u64,
    ) -> Result<u64, SessionError> {
        self.save(session_id, &encode_state(state)?, expected_version)
            .await
    }

    /// Save `state`; on a version conflict reload and retry once with the state
    /// returned by `merge` for the fresh row. A second conflict is a
    /// [`SessionError::ConcurrencyConflict`].
    pub async fn save_or_merge<F>(
        &self,
        session_id: &str,
        state: &str,
        expected_version: u64,
        merge: F,
    ) -> Result<u64, SessionError>
    where
        F: FnOnce(&Session) -> Result<String, SessionError>,
    {
        match self.save(session_id, state, expected_version).await {
            Err(SessionError::VersionConflict { .. }) => {}
            other => return other,
        }

        let fresh = self.load(session_id).await?;
        let merged = merge(&fresh)?;
        tracing::debug!(
            session_id,
            expected_version,
            reloaded_version = fresh.version,
            "Retrying save after merge"
        );

        match self.save(session_id, &merged, fresh.version).await {
            Err(SessionError::VersionConflict { .. }) => {
                tracing::warn!(session_id, "Session save conflicted twice");
                Err(SessionError::ConcurrencyConflict {
                    session_id: session_id.to_string(),
                })
            }
            other => other,
        }
    }

    /// Typed [`save_or_merge`](Self::save_or_merge): on conflict, `apply` re-applies
    /// the caller's pending changes to the freshly loaded state.
    pub async fn save_with_merge<T, F>(
        &self,
        session_id: &str,
        state: &T,
        expected_version: u64,
        apply: F,
    ) -> Result<u64, SessionError>
    where
        T: VersionedState,
        F: FnOnce(&mut T),
    {
        let encoded = encode_state(state)?;
        self.save_or_merge(session_id, &encoded, expected_version, |fresh| {
            let mut value: T = decode_state(fresh)?;
            apply(&mut value);
            encode_state(&value)
        })
        .await
    }
}

fn encode_state<T: VersionedState>(state: &T) -> Result<String, SessionError> {
    let blob = StateBlob {
        schema_version: T::SCHEMA_VERSION,
        data: state,
    };
    Ok(serde_json::to_string(&blob).map_err(StoreError::from)?)
}

fn decode_state<T: VersionedState>(session: &Session) -> Result<T, SessionError> {
    if !session.exists() || session.state.is_empty() {
        return Ok(T::default());
    }

    let blob: StateBlob<T> =
        serde_json::from_str(&session.state).map_err(|e| SessionError::Corrupt {
            session_id: session.session_id.clone(),
            reason: e.to_string(),
        })?;
    // Older blobs fill in through `#[serde(default)]`; newer ones may carry fields this build drops
    if blob.schema_version > T::SCHEMA_VERSION {
        return Err(SessionError::SchemaMismatch {
            session_id: session.session_id.clone(),
            found: blob.schema_version,
            expected: T::SCHEMA_VERSION,
        });
    }
    Ok(blob.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use serde_json::json;

    const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Cart {
        items: Vec<String>,
        step: String,
    }

    impl VersionedState for Cart {
        const SCHEMA_VERSION: u32 = 2;
    }

    fn sessions() -> (Arc<ManualClock>, SessionStore) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        (clock.clone(), SessionStore::new(store, "sessions", clock, RETENTION))
    }

    #[tokio::test]
    async fn test_missing_session_loads_as_version_zero() {
        let (_, sessions) = sessions();
        let session = sessions.load("s1").await.unwrap();
        assert_eq!(session.version, 0);
        assert_eq!(session.state, "");
        assert!(!session.exists());
    }

    #[tokio::test]
    async fn test_save_increments_version() {
        let (_, sessions) = sessions();
        assert_eq!(sessions.save("s1", "A", 0).await.unwrap(), 1);
        assert_eq!(sessions.save("s1", "B", 1).await.unwrap(), 2);

        let session = sessions.load("s1").await.unwrap();
        assert_eq!((session.state.as_str(), session.version), ("B", 2));
        assert_eq!(session.updated_at, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts() {
        let (_, sessions) = sessions();
        sessions.save("s1", "A", 0).await.unwrap();

        let err = sessions.save("s1", "dup-create", 0).await.unwrap_err();
        assert!(err.is_version_conflict());

        sessions.save("s1", "B", 1).await.unwrap();
        let err = sessions.save("s1", "stale", 1).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::VersionConflict {
                session_id: "s1".into(),
                expected: 1
            }
        );
        assert_eq!(sessions.load("s1").await.unwrap().state, "B");
    }

    #[tokio::test]
    async fn test_max_expected_version_conflicts() {
        let (_, sessions) = sessions();
        sessions.save("s1", "A", 0).await.unwrap();

        let err = sessions.save("s1", "x", u64::MAX).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::VersionConflict {
                session_id: "s1".into(),
                expected: u64::MAX
            }
        );
        assert_eq!(sessions.load("s1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_session_expires_after_retention() {
        let (clock, sessions) = sessions();
        sessions.save("s1", "A", 0).await.unwrap();
        clock.advance(RETENTION);
        assert_eq!(sessions.load("s1").await.unwrap().version, 0);
        assert_eq!(sessions.save("s1", "fresh", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_metadata_is_separate_from_state() {
        let (_, sessions) = sessions();
        let fields = |v: Value| json!({ "awaiting_action": v }).as_object().cloned().unwrap();

        assert!(!sessions.update_metadata("s1", fields(json!("a1"))).await.unwrap());

        sessions.save("s1", "A", 0).await.unwrap();
        assert!(sessions.update_metadata("s1", fields(json!("a1"))).await.unwrap());
        sessions.save("s1", "B", 1).await.unwrap();

        let session = sessions.load("s1").await.unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.meta_str("awaiting_action"), Some("a1"));

        sessions.update_metadata("s1", fields(Value::Null)).await.unwrap();
        let session = sessions.load("s1").await.unwrap();
        assert!(session.meta_str("awaiting_action").is_none());
        assert_eq!(session.version, 2);
    }

    #[tokio::test]
    async fn test_conditional_metadata_update() {
        let (_, sessions) = sessions();
        let fields = |v: Value| json!({ "awaiting_action": v }).as_object().cloned().unwrap();
        sessions.save("s1", "A", 0).await.unwrap();
        sessions.update_metadata("s1", fields(json!("a2"))).await.unwrap();

        let cleared = sessions
            .update_metadata_if("s1", fields(Value::Null), "awaiting_action", "a1")
            .await
            .unwrap();
        assert!(!cleared);
        assert_eq!(sessions.load("s1").await.unwrap().meta_str("awaiting_action"), Some("a2"));

        let cleared = sessions
            .update_metadata_if("s1", fields(Value::Null), "awaiting_action", "a2")
            .await
            .unwrap();
        assert!(cleared);
        assert!(sessions.load("s1").await.unwrap().meta_str("awaiting_action").is_none());
    }

    #[tokio::test]
    async fn test_typed_round_trip_and_schema_check() {
        let (_, sessions) = sessions();
        let (cart, version) = sessions.load_typed::<Cart>("s1").await.unwrap();
        assert_eq!((cart, version), (Cart::default(), 0));

        let cart = Cart {
            items: vec!["sku-1".into()],
            step: "checkout".into(),
        };
        let version = sessions.save_typed("s1", &cart, 0).await.unwrap();
        assert_eq!(sessions.load_typed::<Cart>("s1").await.unwrap(), (cart, version));

        let version = sessions
            .save("s1", r#"{"schema_version":1,"data":{"items":["sku-0"]}}"#, version)
            .await
            .unwrap();
        let (older, _) = sessions.load_typed::<Cart>("s1").await.unwrap();
        assert_eq!(older.items, vec!["sku-0".to_string()]);
        assert_eq!(older.step, String::default());

        sessions
            .save("s1", r#"{"schema_version":3,"data":{}}"#, version)
            .await
            .unwrap();
        let err = sessions.load_typed::<Cart>("s1").await.unwrap_err();
        assert!(matches!(err, SessionError::SchemaMismatch { found: 3, expected: 2, .. }));
    }

    #[tokio::test]
    async fn test_save_with_merge_retries_once() {
        let (_, sessions) = sessions();
        let base = Cart::default();
        sessions.save_typed("s1", &base, 0).await.unwrap();

        // Another writer gets in first
        let theirs = Cart {
            items: vec!["theirs".into()],
            step: "browse".into(),
        };
        sessions.save_typed("s1", &theirs, 1).await.unwrap();

        let mut mine = base.clone();
        mine.items.push("mine".into());
        let version = sessions
            .save_with_merge("s1", &mine, 1, |fresh: &mut Cart| fresh.items.push("mine".into()))
            .await
            .unwrap();
        assert_eq!(version, 3);

        let (merged, _) = sessions.load_typed::<Cart>("s1").await.unwrap();
        assert_eq!(merged.items, vec!["theirs".to_string(), "mine".to_string()]);
        assert_eq!(merged.step, "browse");
    }

    /// Store whose conditional updates always lose the race.
    struct AlwaysConflicting(InMemoryStore);

    #[async_trait::async_trait]
    impl KvStore for AlwaysConflicting {
        fn backend_name(&self) -> &'static str {
            "conflicting"
        }
        async fn get(&self, table: &str, key: &ItemKey) -> crate::store::StoreResult<Option<crate::store::Item>> {
            self.0.get(table, key).await
        }
        async fn put(&self, table: &str, key: &ItemKey, item: crate::store::Item, c: &Condition) -> crate::store::StoreResult<()> {
            self.0.put(table, key, item, c).await
        }
        async fn update(&self, table: &str, key: &ItemKey, _: &Update, _: &Condition) -> crate::store::StoreResult<crate::store::Item> {
            Err(StoreError::condition_failed(table, key))
        }
        async fn delete(&self, table: &str, key: &ItemKey, c: &Condition) -> crate::store::StoreResult<()> {
            self.0.delete(table, key, c).await
        }
        async fn scan_partition(&self, table: &str, p: &str) -> crate::store::StoreResult<Vec<(String, crate::store::Item)>> {
            self.0.scan_partition(table, p).await
        }
        async fn health_check(&self) -> crate::store::StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_save_with_merge_second_conflict_is_definitive() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(AlwaysConflicting(InMemoryStore::new(clock.clone())));
        let sessions = SessionStore::new(store, "sessions", clock, RETENTION);

        let mut merges = 0;
        let err = sessions
            .save_with_merge("s1", &Cart::default(), 0, |_: &mut Cart| merges += 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::ConcurrencyConflict {
                session_id: "s1".into()
            }
        );
        assert_eq!(merges, 1);
    }

    #[tokio::test]
    async fn test_delete_requires_version() {
        let (_, sessions) = sessions();
        sessions.save("s1", "A", 0).await.unwrap();
        assert!(!sessions.delete("s1", 7).await.unwrap());
        assert!(sessions.delete("s1", 1).await.unwrap());
        assert_eq!(sessions.load("s1").await.unwrap().version, 0);
    }

    proptest! {
        #[test]
        fn prop_versions_advance_by_exactly_one(reads in proptest::collection::vec(0u64..6, 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (_, sessions) = sessions();
                let mut current = 0u64;
                for expected in reads {
                    match sessions.save("s1", "x", expected).await {
                        Ok(next) => {
                            prop_assert_eq!(expected, current);
                            prop_assert_eq!(next, current + 1);
                            current = next;
                        }
                        Err(e) => {
                            prop_assert!(e.is_version_conflict());
                            prop_assert_ne!(expected, current);
                        }
                    }
                }
                prop_assert_eq!(sessions.load("s1").await.unwrap().version, current);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
