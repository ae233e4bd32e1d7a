//! Two-phase lifecycle for side-effecting actions awaiting confirmation.
//!
//! ```text
//!   stage ──▶ STAGED ──confirm──▶ CONFIRMED ──execute──▶ EXECUTED
//!               │                     │
//!               └──────abort──────────┴──────────────▶ ABORTED
//! ```
//!
//! Each transition is a conditional update on the stored status, so a retried or
//! duplicated confirm/execute is rejected instead of repeated. Staging a new
//! action aborts the previous live one first, so callers holding the session
//! lock see at most one live action per session.

use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::session::SessionStore;
use crate::store::{Condition, Item, ItemKey, KvStore, StoreError, Update};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Invalid action: {0}")]
    InvalidInput(String),

    #[error("Action '{action_id}' is malformed: {reason}")]
    Corrupt { action_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ActionError> for convoy_common::Error {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::InvalidInput(msg) => Self::InvalidInput(msg),
            ActionError::Corrupt { .. } => Self::Internal(e.to_string()),
            ActionError::Store(inner) => inner.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    Staged,
    Confirmed,
    Executed,
    Aborted,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Confirmed => "confirmed",
            Self::Executed => "executed",
            Self::Aborted => "aborted",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Aborted)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(Self::Staged),
            "confirmed" => Ok(Self::Confirmed),
            "executed" => Ok(Self::Executed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown action status '{other}'")),
        }
    }
}

/// A staged side effect and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub session_id: String,
    /// UUIDv7, so lexical order is creation order.
    pub action_id: String,
    /// Business label identifying what the action resolves to.
    pub flow: String,
    pub description: String,
    /// Opaque serialized payload.
    pub payload: String,
    pub status: ActionStatus,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub executed_at: Option<i64>,
    pub aborted_at: Option<i64>,
    pub expires_at: i64,
}

impl PendingAction {
    fn to_item(&self) -> Item {
        Item::new()
            .with("session_id", self.session_id.as_str())
            .with("action_id", self.action_id.as_str())
            .with("flow", self.flow.as_str())
            .with("description", self.description.as_str())
            .with("payload", self.payload.as_str())
            .with("status", self.status.as_str())
            .with("created_at", self.created_at)
            .with_expiry(self.expires_at)
    }

    fn from_item(item: &Item) -> Result<Self, ActionError> {
        let action_id = item.require_str("action_id")?.to_string();
        let status: ActionStatus = item
            .require_str("status")?
            .parse()
            .map_err(|reason| ActionError::Corrupt {
                action_id: action_id.clone(),
                reason,
            })?;

        Ok(Self {
            session_id: item.require_str("session_id")?.to_string(),
            flow: item.require_str("flow")?.to_string(),
            description: item.get_str("description").unwrap_or_default().to_string(),
            payload: item.get_str("payload").unwrap_or_default().to_string(),
            status,
            created_at: item.get_i64("created_at").unwrap_or_default(),
            confirmed_at: item.get_i64("confirmed_at"),
            executed_at: item.get_i64("executed_at"),
            aborted_at: item.get_i64("aborted_at"),
            expires_at: item.expires_at.unwrap_or(i64::MAX),
            action_id,
        })
    }
}

#[derive(Clone)]
pub struct ActionCoordinator {
    store: Arc<dyn KvStore>,
    table: Arc<str>,
    sessions: SessionStore,
    clock: Arc<dyn Clock>,
}

impl ActionCoordinator {
    pub fn new(
        store: Arc<dyn KvStore>,
        table: impl Into<String>,
        sessions: SessionStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            table: Arc::from(table.into()),
            sessions,
            clock,
        }
    }

    /// Stage a new action, superseding any live one, and point the session at it.
    ///
    /// Supersession is a read followed by separate writes. "At most one live
    /// action" holds only while the caller serializes on the session lock.
    pub async fn stage(
        &self,
        session_id: &str,
        flow: &str,
        description: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<PendingAction, ActionError> {
        if flow.trim().is_empty() {
            return Err(ActionError::InvalidInput("flow must not be empty".into()));
        }
        if ttl.is_zero() {
            return Err(ActionError::InvalidInput("ttl must be greater than 0".into()));
        }

        if let Some(live) = self.current(session_id).await? {
            if self.abort(session_id, &live.action_id).await? {
                tracing::info!(
                    session_id,
                    superseded = %live.action_id,
                    flow = %live.flow,
                    "Superseded live action"
                );
            }
        }

        let action = PendingAction {
            session_id: session_id.to_string(),
            action_id: Uuid::now_v7().to_string(),
            flow: flow.to_string(),
            description: description.to_string(),
            payload: payload.to_string(),
            status: ActionStatus::Staged,
            created_at: self.clock.now_ms(),
            confirmed_at: None,
            executed_at: None,
            aborted_at: None,
            expires_at: self.clock.expiry_after(ttl),
        };
        self.store
            .put(
                &self.table,
                &self.key(session_id, &action.action_id),
                action.to_item(),
                &Condition::NotExists,
            )
            .await?;

        self.point_session_at(session_id, &action).await;
        tracing::info!(session_id, action_id = %action.action_id, flow, "Action staged");
        Ok(action)
    }

    /// staged → confirmed. `false` if the action is not staged.
    pub async fn confirm(&self, session_id: &str, action_id: &str) -> Result<bool, ActionError> {
        self.transition(session_id, action_id, &[ActionStatus::Staged], ActionStatus::Confirmed)
            .await
    }

    /// confirmed → executed. Records that the side effect already ran.
    pub async fn execute(&self, session_id: &str, action_id: &str) -> Result<bool, ActionError> {
        self.transition(session_id, action_id, &[ActionStatus::Confirmed], ActionStatus::Executed)
            .await
    }

    /// staged or confirmed → aborted.
    pub async fn abort(&self, session_id: &str, action_id: &str) -> Result<bool, ActionError> {
        self.transition(
            session_id,
            action_id,
            &[ActionStatus::Staged, ActionStatus::Confirmed],
            ActionStatus::Aborted,
        )
        .await
    }

    /// The most recent live (non-terminal, unexpired) action for the session.
    pub async fn current(&self, session_id: &str) -> Result<Option<PendingAction>, ActionError> {
        let rows = self.store.scan_partition(&self.table, session_id).await?;
        let mut live = None;
        for (_, item) in rows.iter().rev() {
            let action = PendingAction::from_item(item)?;
            if !action.status.is_terminal() {
                live = Some(action);
                break;
            }
        }
        Ok(live)
    }

    pub async fn get(&self, session_id: &str, action_id: &str) -> Result<Option<PendingAction>, ActionError> {
        self.store
            .get(&self.table, &self.key(session_id, action_id))
            .await?
            .map(|item| PendingAction::from_item(&item))
            .transpose()
    }

    /// Run `side_effect` only if the action is confirmed, then record execution.
    ///
    /// Returns `Ok(None)` without running anything when the action is missing or
    /// not confirmed. Two callers can both observe `confirmed`, so call this under
    /// the session lock.
    pub async fn run_confirmed<F, Fut, T, E>(
        &self,
        session_id: &str,
        action_id: &str,
        side_effect: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(PendingAction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ActionError>,
    {
        let Some(action) = self.get(session_id, action_id).await? else {
            return Ok(None);
        };
        if action.status != ActionStatus::Confirmed {
            tracing::debug!(session_id, action_id, status = %action.status, "Action not confirmed, skipping");
            return Ok(None);
        }

        let output = side_effect(action).await?;
        if !self.execute(session_id, action_id).await? {
            tracing::warn!(session_id, action_id, "Side effect ran but action left confirmed state");
        }
        Ok(Some(output))
    }

    fn key(&self, session_id: &str, action_id: &str) -> ItemKey {
        ItemKey::composite(session_id, action_id)
    }

    async fn transition(
        &self,
        session_id: &str,
        action_id: &str,
        from: &[ActionStatus],
        to: ActionStatus,
    ) -> Result<bool, ActionError> {
        let now = self.clock.now_ms();
        let update = Update::new()
            .set("status", to.as_str())
            .set(format!("{}_at", to.as_str()), now);
        let expect = Condition::one_of("status", from.iter().map(ActionStatus::as_str));

        match self
            .store
            .update(&self.table, &self.key(session_id, action_id), &update, &expect)
            .await
        {
            Ok(_) => {
                tracing::info!(session_id, action_id, status = %to, "Action transitioned");
                if to.is_terminal() {
                    self.clear_session_pointer(session_id, action_id).await;
                }
                Ok(true)
            }
            Err(e) if e.is_condition_failed() => {
                tracing::debug!(session_id, action_id, to = %to, "Action not in expected state");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort update of the session's "awaiting confirmation" pointer.
    async fn point_session_at(&self, session_id: &str, action: &PendingAction) {
        let fields = pointer_fields(json!({
            "awaiting_action": action.action_id,
            "awaiting_flow": action.flow,
            "awaiting_prompt": action.description,
        }));
        if let Err(e) = self.sessions.update_metadata(session_id, fields).await {
            tracing::warn!(session_id, error = %e, "Failed to update awaiting-action pointer");
        }
    }

    /// Clear the pointer only if it still names `action_id`.
    async fn clear_session_pointer(&self, session_id: &str, action_id: &str) {
        let fields = pointer_fields(json!({
            "awaiting_action": Value::Null,
            "awaiting_flow": Value::Null,
            "awaiting_prompt": Value::Null,
        }));
        match self
            .sessions
            .update_metadata_if(session_id, fields, "awaiting_action", action_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(session_id, action_id, "Pointer names another action, left as is");
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to clear awaiting-action pointer");
            }
        }
    }
}

fn pointer_fields(fields: Value) -> Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
