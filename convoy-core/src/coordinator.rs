//! Per-turn request pipeline.
//!
//! One inbound turn goes through:
//!
//! 1. idempotency `begin` (duplicates short-circuit to a replay or "in progress")
//! 2. the session lock, bounded by the turn deadline
//! 3. session load
//! 4. the caller's [`TurnHandler`], under the same deadline
//! 5. OCC save, with one reload-and-merge retry
//! 6. lock release, then ledger finalisation
//!
//! Faults never escape [`Coordinator::handle_turn`]: every failure becomes a
//! [`TurnOutcome`] the front end can render.

use async_trait::async_trait;
use convoy_common::logging::generate_trace_id;
use convoy_common::{Config, ResultExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::actions::ActionCoordinator;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::deadline::Deadline;
use crate::idempotency::IdempotencyLedger;
use crate::lock::{owner_id, LockBackoff, LockError, LockManager};
use crate::session::{Session, SessionError, SessionStore};
use crate::store::KvStore;

/// An inbound request against one session.
#[derive(Debug, Clone)]
pub struct Turn {
    pub session_id: String,
    /// Client-supplied key; retries of the same request reuse it.
    pub idempotency_key: String,
    pub input: Vec<u8>,
}

impl Turn {
    pub fn new(
        session_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        input: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            idempotency_key: idempotency_key.into(),
            input: input.into(),
        }
    }
}

/// What a handler sees while it holds the session.
pub struct TurnContext<'a> {
    pub trace_id: &'a str,
    pub session: &'a Session,
    pub input: &'a [u8],
    pub actions: &'a ActionCoordinator,
    pub breakers: &'a CircuitBreakerRegistry,
    pub deadline: Deadline,
    /// Default confirmation window for actions staged by this turn.
    pub action_ttl: Duration,
}

/// Handler result: the new state (if it changed) and the response bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnReply {
    pub state: Option<String>,
    pub response: Vec<u8>,
}

impl TurnReply {
    pub fn respond(response: impl Into<Vec<u8>>) -> Self {
        Self {
            state: None,
            response: response.into(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Business logic plugged into the pipeline.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle(&self, ctx: &TurnContext<'_>) -> convoy_common::Result<TurnReply>;

    /// Rebuild `pending` on top of a session another writer changed.
    ///
    /// `None` gives up and fails the turn with a concurrency conflict. The
    /// default keeps the pending state (last writer wins).
    fn merge(&self, _fresh: &Session, pending: &str) -> Option<String> {
        Some(pending.to_string())
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { response: Vec<u8>, version: u64 },
    /// Duplicate of a finished request; the original response.
    Replayed { response: Vec<u8> },
    /// Duplicate of a request still running elsewhere.
    InProgress,
    /// The session lock stayed held by another worker.
    Busy,
    /// The turn failed; `reason` is safe to log, `retryable` says whether resending may help.
    Degraded { reason: String, retryable: bool },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn response(&self) -> Option<&[u8]> {
        match self {
            Self::Completed { response, .. } | Self::Replayed { response } => Some(response),
            _ => None,
        }
    }
}

/// Timing knobs for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub idempotency_ttl: Duration,
    /// Lock lease; also the turn deadline so work never outlives the lease.
    pub lock_ttl: Duration,
    pub lock_timeout: Duration,
    pub action_ttl: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(config.ttl.idempotency_secs),
            lock_ttl: Duration::from_secs(config.ttl.lock_secs),
            lock_timeout: Duration::from_secs(config.ttl.lock_timeout_secs),
            action_ttl: Duration::from_secs(config.ttl.action_secs),
        }
    }
}

/// The five primitives wired to one backing store.
#[derive(Clone)]
pub struct Coordinator {
    sessions: SessionStore,
    actions: ActionCoordinator,
    locks: LockManager,
    ledger: IdempotencyLedger,
    breakers: Arc<CircuitBreakerRegistry>,
    settings: PipelineSettings,
}

impl Coordinator {
    pub fn from_config(config: &Config, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let tables = &config.store.tables;
        let sessions = SessionStore::new(
            store.clone(),
            tables.sessions.clone(),
            clock.clone(),
            Duration::from_secs(config.ttl.session_retention_secs),
        );
        let actions = ActionCoordinator::new(
            store.clone(),
            tables.actions.clone(),
            sessions.clone(),
            clock.clone(),
        );
        let locks = LockManager::new(
            store.clone(),
            tables.locks.clone(),
            clock.clone(),
            LockBackoff::from(&config.lock_backoff),
        );
        let ledger = IdempotencyLedger::new(store, tables.idempotency.clone(), clock);

        Self {
            sessions,
            actions,
            locks,
            ledger,
            breakers: Arc::new(CircuitBreakerRegistry::new(config)),
            settings: PipelineSettings::from(config),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn actions(&self) -> &ActionCoordinator {
        &self.actions
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Lock resource name guarding a session.
    pub fn session_resource(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Run one turn end to end.
    pub async fn handle_turn(&self, turn: &Turn, handler: &dyn TurnHandler) -> TurnOutcome {
        let trace_id = generate_trace_id();
        let span = convoy_common::request_span!(
            "turn",
            trace_id,
            session_id = %turn.session_id,
            idempotency_key = %turn.idempotency_key
        );
        self.run_turn(turn, handler, &trace_id).instrument(span).await
    }

    async fn run_turn(&self, turn: &Turn, handler: &dyn TurnHandler, trace_id: &str) -> TurnOutcome {
        let key = turn.idempotency_key.as_str();
        let deadline = Deadline::after(self.settings.lock_ttl);

        match self
            .ledger
            .begin(key, &turn.session_id, self.settings.idempotency_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.duplicate(key).await,
            Err(e) => return degraded(e.into()),
        }

        let owner = owner_id();
        let resource = Self::session_resource(&turn.session_id);
        let locked = self
            .locks
            .with_lock(
                &resource,
                &owner,
                self.settings.lock_ttl,
                deadline.cap(self.settings.lock_timeout),
                || self.locked_turn(turn, handler, trace_id, deadline),
            )
            .await;

        match locked {
            Ok(Ok((response, version))) => {
                if let Err(e) = self.ledger.end_ok(key, &response).await {
                    // The work is saved; a retry with this key will see "in progress"
                    // until the ledger row expires
                    tracing::warn!(error = %e, "Failed to record turn response");
                }
                tracing::info!(version, "Turn completed");
                TurnOutcome::Completed { response, version }
            }
            Ok(Err(e)) => {
                if let Err(le) = self.ledger.end_error(key).await {
                    tracing::warn!(error = %le, "Failed to record turn failure");
                }
                degraded(e)
            }
            Err(LockError::Contended { waited, .. }) => {
                tracing::debug!(waited_ms = waited.as_millis() as u64, "Session busy");
                self.release_key(key).await;
                TurnOutcome::Busy
            }
            Err(e) => {
                self.release_key(key).await;
                degraded(e.into())
            }
        }
    }

    /// Steps run while the session lock is held.
    async fn locked_turn(
        &self,
        turn: &Turn,
        handler: &dyn TurnHandler,
        trace_id: &str,
        deadline: Deadline,
    ) -> convoy_common::Result<(Vec<u8>, u64)> {
        let session = self
            .sessions
            .load(&turn.session_id)
            .await
            .context("loading session")?;
        let ctx = TurnContext {
            trace_id,
            session: &session,
            input: &turn.input,
            actions: &self.actions,
            breakers: &self.breakers,
            deadline,
            action_ttl: self.settings.action_ttl,
        };
        let reply = deadline.run(handler.handle(&ctx)).await??;

        let version = match &reply.state {
            None => session.version,
            Some(state) => {
                self.sessions
                    .save_or_merge(&turn.session_id, state, session.version, |fresh| {
                        handler
                            .merge(fresh, state)
                            .ok_or_else(|| SessionError::ConcurrencyConflict {
                                session_id: turn.session_id.clone(),
                            })
                    })
                    .await
                    .context("saving session")?
            }
        };
        Ok((reply.response, version))
    }

    async fn duplicate(&self, key: &str) -> TurnOutcome {
        match self.ledger.get_cached(key).await {
            Ok(Some(response)) => {
                tracing::info!("Replaying cached response");
                TurnOutcome::Replayed { response }
            }
            Ok(None) => {
                tracing::debug!("Duplicate of an unfinished turn");
                TurnOutcome::InProgress
            }
            Err(e) => degraded(e.into()),
        }
    }

    /// Free the key of a turn that never ran so the client can resend it.
    async fn release_key(&self, key: &str) {
        if let Err(e) = self.ledger.abandon(key).await {
            tracing::warn!(error = %e, "Failed to release idempotency key");
        }
    }
}

fn degraded(err: convoy_common::Error) -> TurnOutcome {
    let retryable = err.is_retryable();
    tracing::warn!(
        error = %err,
        retryable,
        conflict = err.is_conflict(),
        circuit_open = err.is_circuit_open(),
        "Turn degraded"
    );
    TurnOutcome::Degraded {
        reason: err.to_string(),
        retryable,
    }
}
