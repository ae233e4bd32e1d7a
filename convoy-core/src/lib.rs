//! Convoy Core
//!
//! Session coordination primitives for a multi-step conversational orchestrator.
//! Concurrent, retried or reordered requests against one session are applied
//! safely on top of a key-value store with conditional writes and TTL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     Coordinator (per-turn pipeline)                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌────────────┐  │
//! │  │ Idempotency  │ │ Lock         │ │ Session      │ │ Action     │  │
//! │  │ Ledger       │ │ Manager      │ │ Store (OCC)  │ │ Coordinator│  │
//! │  └──────────────┘ └──────────────┘ └──────────────┘ └────────────┘  │
//! │                  ┌──────────────────────────────┐                   │
//! │                  │ Circuit Breaker Registry     │                   │
//! │                  └──────────────────────────────┘                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │             KvStore (in-memory | Redis) + retry/timeout             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Optimistic concurrency
//! - Every session row carries a version; saves are conditional on it
//! - A conflict is reported, never silently overwritten
//!
//! ## Two-phase actions
//! - Side effects are staged, confirmed by the user, then executed
//! - Transitions are conditional writes, so each happens at most once
//!
//! ## Exclusion and deduplication
//! - A TTL lease lock serialises workers on one session
//! - The idempotency ledger replays the cached response for duplicate requests

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod actions;
pub mod circuit_breaker;
pub mod clock;
pub mod coordinator;
pub mod deadline;
pub mod idempotency;
pub mod lock;
pub mod session;
pub mod store;

pub use actions::{ActionCoordinator, ActionError, ActionStatus, PendingAction};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitError, CircuitState,
};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use coordinator::{
    Coordinator, PipelineSettings, Turn, TurnContext, TurnHandler, TurnOutcome, TurnReply,
};
pub use deadline::{Deadline, DeadlineExceeded};
pub use idempotency::{IdempotencyLedger, IdempotentOutcome, LedgerEntry, LedgerError, LedgerStatus};
pub use lock::{owner_id, LockBackoff, LockError, LockGuard, LockInfo, LockManager};
pub use session::{Session, SessionError, SessionStore, StateBlob, VersionedState};
pub use store::{
    create_store, Condition, InMemoryStore, Item, ItemKey, KvStore, StoreError, StoreResult,
    Update,
};
