//! Convoy Core - coordination store self-check.
//!
//! Loads configuration, connects to the configured backing store and proves that
//! conditional writes and expiry work end to end by taking and releasing a lock.

use anyhow::{Context, Result};
use convoy_common::config::Config;
use convoy_common::logging::init_logging;
use convoy_common::Validate;
use convoy_core::{create_store, owner_id, system_clock, Coordinator};
use std::time::Duration;

const SELF_CHECK_RESOURCE: &str = "convoy:self-check";

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;
    config.validate().context("Invalid configuration")?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Convoy Core v{}", env!("CARGO_PKG_VERSION"));

    let clock = system_clock();
    let store = create_store(&config.store, &config.retry, clock.clone())
        .await
        .context("Failed to open backing store")?;
    store
        .health_check()
        .await
        .context("Backing store health check failed")?;

    let coordinator = Coordinator::from_config(&config, store, clock);

    let owner = owner_id();
    let acquired = coordinator
        .locks()
        .try_acquire(SELF_CHECK_RESOURCE, &owner, Duration::from_secs(5))
        .await
        .context("Self-check lock write failed")?;
    if acquired {
        coordinator
            .locks()
            .release(SELF_CHECK_RESOURCE, &owner)
            .await
            .context("Self-check lock release failed")?;
    } else {
        tracing::warn!(resource = SELF_CHECK_RESOURCE, "Self-check lock held by another instance");
    }

    let settings = coordinator.settings();
    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        lock_ttl_secs = settings.lock_ttl.as_secs(),
        idempotency_ttl_secs = settings.idempotency_ttl.as_secs(),
        circuits = config.circuits.len(),
        "Coordination store ready in {:?}",
        startup_duration
    );

    Ok(())
}
