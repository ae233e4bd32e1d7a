//! In-process backing store.
//!
//! A single `RwLock` guards all tables, so each conditional write is atomic
//! with respect to every other operation. Expired rows are treated as absent;
//! writes sweep them out of the touched table at most once per [`SWEEP_INTERVAL_MS`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Condition, Item, ItemKey, KvStore, StoreError, StoreResult, Update};
use crate::clock::Clock;

/// Minimum spacing between sweeps of one table, in clock milliseconds.
pub const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Default)]
struct Table {
    rows: BTreeMap<ItemKey, Item>,
    swept_at: Option<i64>,
}

impl Table {
    fn live(&self, key: &ItemKey, now: i64) -> Option<&Item> {
        self.rows.get(key).filter(|item| !item.is_expired(now))
    }

    fn sweep(&mut self, now: i64) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, item| !item.is_expired(now));
        self.swept_at = Some(now);
        before - self.rows.len()
    }

    fn sweep_if_due(&mut self, now: i64) {
        let due = self
            .swept_at
            .map_or(true, |at| now.saturating_sub(at) >= SWEEP_INTERVAL_MS);
        if due {
            let removed = self.sweep(now);
            if removed > 0 {
                tracing::trace!(removed, "Swept expired rows");
            }
        }
    }
}

/// In-memory store for local development, single-instance deployments and tests.
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Number of rows physically held, including expired ones not yet swept.
    pub async fn raw_len(&self, table: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Drop every expired row now. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let removed = tables.values_mut().map(|t| t.sweep(now)).sum();
        if removed > 0 {
            tracing::debug!(removed, "Swept expired rows");
        }
        removed
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        key.validate()?;
        let now = self.clock.now_ms();
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| t.live(key, now)).cloned())
    }

    async fn put(
        &self,
        table: &str,
        key: &ItemKey,
        item: Item,
        condition: &Condition,
    ) -> StoreResult<()> {
        key.validate()?;
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();

        if !condition.evaluate(rows.live(key, now)) {
            return Err(StoreError::condition_failed(table, key));
        }
        rows.sweep_if_due(now);
        rows.rows.insert(key.clone(), item);
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        update: &Update,
        condition: &Condition,
    ) -> StoreResult<Item> {
        key.validate()?;
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();

        let current = rows.live(key, now);
        if !condition.evaluate(current) {
            return Err(StoreError::condition_failed(table, key));
        }
        let next = update.apply(current.cloned());
        rows.sweep_if_due(now);
        rows.rows.insert(key.clone(), next.clone());
        Ok(next)
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: &Condition) -> StoreResult<()> {
        key.validate()?;
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return if condition.evaluate(None) {
                Ok(())
            } else {
                Err(StoreError::condition_failed(table, key))
            };
        };

        if !condition.evaluate(rows.live(key, now)) {
            return Err(StoreError::condition_failed(table, key));
        }
        rows.rows.remove(key);
        rows.sweep_if_due(now);
        Ok(())
    }

    async fn scan_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> StoreResult<Vec<(String, Item)>> {
        ItemKey::partition(partition).validate()?;
        let now = self.clock.now_ms();
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let start = ItemKey::partition(partition);
        Ok(rows
            .rows
            .range(start..)
            .take_while(|(k, _)| k.partition == partition)
            .filter(|(_, item)| !item.is_expired(now))
            .filter_map(|(k, item)| k.sort.clone().map(|sort| (sort, item.clone())))
            .collect())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
