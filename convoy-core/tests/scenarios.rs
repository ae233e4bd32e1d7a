//! End-to-end scenarios against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use convoy_common::Config;
use convoy_core::{ActionStatus, Coordinator, InMemoryStore, KvStore, ManualClock};

// ============================================================================
// Test Utilities
// ============================================================================

fn coordinator() -> (Coordinator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new(clock.clone()));
    (
        Coordinator::from_config(&Config::default(), store, clock.clone()),
        clock,
    )
}

// ============================================================================
// Session store
// ============================================================================

#[tokio::test]
async fn test_first_save_creates_session() {
    let (c, _) = coordinator();
    let sessions = c.sessions();

    let empty = sessions.load("s1").await.unwrap();
    assert_eq!((empty.state.as_str(), empty.version), ("", 0));
    assert!(!empty.exists());

    assert_eq!(sessions.save("s1", "stateA", 0).await.unwrap(), 1);

    let loaded = sessions.load("s1").await.unwrap();
    assert_eq!((loaded.state.as_str(), loaded.version), ("stateA", 1));
}

#[tokio::test]
async fn test_stale_writer_gets_version_conflict() {
    let (c, _) = coordinator();
    let sessions = c.sessions();
    sessions.save("s1", "a", 0).await.unwrap();
    sessions.save("s1", "b", 1).await.unwrap();

    let err = sessions.save("s1", "stale", 1).await.unwrap_err();
    assert!(err.is_version_conflict());
    assert_eq!(sessions.load("s1").await.unwrap().state, "b");
}

#[tokio::test]
async fn test_session_expires_after_retention() {
    let (c, clock) = coordinator();
    c.sessions().save("s1", "a", 0).await.unwrap();

    clock.advance(Duration::from_secs(7 * 24 * 3600 + 1));
    assert_eq!(c.sessions().load("s1").await.unwrap().version, 0);
}

// ============================================================================
// Two-phase actions
// ============================================================================

#[tokio::test]
async fn test_execute_requires_confirmation() {
    let (c, _) = coordinator();
    let actions = c.actions();
    let ttl = Duration::from_secs(900);

    let action = actions
        .stage("s1", "flowX", "Transfer funds", r#"{"amount":10}"#, ttl)
        .await
        .unwrap();
    assert_eq!(action.status, ActionStatus::Staged);
    let id = action.action_id.as_str();

    assert!(!actions.execute("s1", id).await.unwrap());
    assert_eq!(
        actions.get("s1", id).await.unwrap().unwrap().status,
        ActionStatus::Staged
    );

    assert!(actions.confirm("s1", id).await.unwrap());
    assert!(actions.execute("s1", id).await.unwrap());
    assert!(!actions.execute("s1", id).await.unwrap());

    let done = actions.get("s1", id).await.unwrap().unwrap();
    assert_eq!(done.status, ActionStatus::Executed);
    assert!(done.confirmed_at.is_some() && done.executed_at.is_some());
    assert!(actions.current("s1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_action_cannot_be_confirmed() {
    let (c, clock) = coordinator();
    let actions = c.actions();
    let action = actions
        .stage("s1", "flowX", "Transfer funds", "{}", Duration::from_secs(60))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(61));
    assert!(!actions.confirm("s1", &action.action_id).await.unwrap());
    assert!(actions.current("s1").await.unwrap().is_none());
}

// ============================================================================
// Locks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lock_contention_and_ttl_takeover() {
    let (c, clock) = coordinator();
    let locks = c.locks();
    let ttl = Duration::from_secs(5);
    let timeout = Duration::from_secs(1);

    assert!(locks.acquire("r1", "A", ttl, timeout).await.unwrap());

    let started = tokio::time::Instant::now();
    assert!(!locks.acquire("r1", "B", ttl, timeout).await.unwrap());
    assert!(started.elapsed() <= Duration::from_millis(1100));

    clock.advance(ttl);
    assert!(locks.acquire("r1", "B", ttl, timeout).await.unwrap());
    assert_eq!(locks.holder("r1").await.unwrap().unwrap().owner, "B");

    // A's lease is gone; it must not release B's lock
    assert!(!locks.release("r1", "A").await.unwrap());
    assert!(locks.release("r1", "B").await.unwrap());
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_ledger_replays_exact_bytes() {
    let (c, _) = coordinator();
    let ledger = c.ledger();
    let ttl = Duration::from_secs(600);
    let response = vec![0u8, 159, 146, 150, 255, b'\n'];

    assert!(ledger.begin("k1", "s1", ttl).await.unwrap());
    assert!(!ledger.begin("k1", "s1", ttl).await.unwrap());
    assert_eq!(ledger.get_cached("k1").await.unwrap(), None);

    assert!(ledger.end_ok("k1", &response).await.unwrap());
    assert_eq!(ledger.get_cached("k1").await.unwrap(), Some(response));
}

#[tokio::test]
async fn test_ledger_key_reusable_after_window() {
    let (c, clock) = coordinator();
    let ledger = c.ledger();
    let ttl = Duration::from_secs(600);

    assert!(ledger.begin("k1", "s1", ttl).await.unwrap());
    ledger.end_ok("k1", b"first").await.unwrap();

    clock.advance(Duration::from_secs(601));
    assert!(ledger.begin("k1", "s1", ttl).await.unwrap());
}
