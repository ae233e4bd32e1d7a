//! Redis backing store.
//!
//! Rows are JSON documents at `{prefix}{table}:{partition}[#{sort}]` expired with
//! `PEXPIREAT`. Rows with a sort key are also members of a per-partition sorted set
//! at `{prefix}{table}!idx:{partition}`, scored by expiry, so a partition scan never
//! needs `KEYS`. Every conditional write runs as one Lua script: the condition is
//! shipped as JSON and checked against the stored row inside the script, making the
//! check and the write a single atomic step on the server.
//!
//! Attribute values are compared as JSON scalars inside Lua; callers store opaque
//! blobs as strings.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use std::sync::Arc;

use super::{Condition, Item, ItemKey, KvStore, StoreError, StoreResult, Update};
use crate::clock::Clock;

/// Score used in partition indexes for rows without expiry.
const NO_EXPIRY_SCORE: f64 = 9e15;

/// Shared Lua helpers: expiry-aware load, condition evaluation, TTL and index upkeep.
const LUA_PRELUDE: &str = r#"
local function attr(item, name)
  if item == nil or item['attrs'] == nil then return nil end
  local v = item['attrs'][name]
  if v == cjson.null then return nil end
  return v
end

local function check(c, item)
  local op = c['op']
  if op == 'always' then return true end
  if op == 'exists' then return item ~= nil end
  if op == 'not_exists' then return item == nil end
  if op == 'equals' then
    local v = attr(item, c['attr'])
    return v ~= nil and v == c['value']
  end
  if op == 'in' then
    local v = attr(item, c['attr'])
    if v == nil then return false end
    for _, candidate in ipairs(c['values']) do
      if v == candidate then return true end
    end
    return false
  end
  if op == 'less_than' then
    local v = attr(item, c['attr'])
    return type(v) == 'number' and v < c['value']
  end
  if op == 'and' then
    for _, sub in ipairs(c['all']) do
      if not check(sub, item) then return false end
    end
    return true
  end
  if op == 'or' then
    for _, sub in ipairs(c['any']) do
      if check(sub, item) then return true end
    end
    return false
  end
  return false
end

local function load(key, now)
  local raw = redis.call('GET', key)
  if not raw then return nil end
  local item = cjson.decode(raw)
  local exp = item['expires_at']
  if exp ~= nil and exp ~= cjson.null and exp <= now then return nil end
  return item
end

local function expiry_of(item)
  local exp = item['expires_at']
  if exp == nil or exp == cjson.null then return nil end
  return exp
end

local function store(key, item)
  redis.call('SET', key, cjson.encode(item))
  local exp = expiry_of(item)
  if exp then
    redis.call('PEXPIREAT', key, string.format('%d', exp))
  end
end

local function index(idx, member, exp)
  if member == '' then return end
  redis.call('ZADD', idx, exp or 9e15, member)
  local top = redis.call('ZRANGE', idx, -1, -1, 'WITHSCORES')
  local score = tonumber(top[2])
  if score and score < 9e15 then
    redis.call('PEXPIREAT', idx, string.format('%d', score))
  else
    redis.call('PERSIST', idx)
  end
end

local function unindex(idx, member)
  if member == '' then return end
  redis.call('ZREM', idx, member)
  if redis.call('ZCARD', idx) == 0 then
    redis.call('DEL', idx)
  end
end
"#;

// KEYS: row, index. ARGV: now, condition, item, sort member.
const LUA_PUT: &str = r#"
local now = tonumber(ARGV[1])
if not check(cjson.decode(ARGV[2]), load(KEYS[1], now)) then return 0 end
local item = cjson.decode(ARGV[3])
store(KEYS[1], item)
index(KEYS[2], ARGV[4], expiry_of(item))
return 1
"#;

// KEYS: row, index. ARGV: now, condition, update, sort member.
const LUA_UPDATE: &str = r#"
local now = tonumber(ARGV[1])
local current = load(KEYS[1], now)
if not check(cjson.decode(ARGV[2]), current) then return false end
local item = current or { attrs = {} }
if item['attrs'] == nil then item['attrs'] = {} end
local upd = cjson.decode(ARGV[3])
for k, v in pairs(upd['set']) do item['attrs'][k] = v end
for _, k in ipairs(upd['remove']) do item['attrs'][k] = nil end
if upd['expires_at'] ~= nil and upd['expires_at'] ~= cjson.null then
  item['expires_at'] = upd['expires_at']
end
store(KEYS[1], item)
index(KEYS[2], ARGV[4], expiry_of(item))
return cjson.encode(item)
"#;

// KEYS: row, index. ARGV: now, condition, sort member.
const LUA_DELETE: &str = r#"
local now = tonumber(ARGV[1])
if not check(cjson.decode(ARGV[2]), load(KEYS[1], now)) then return 0 end
redis.call('DEL', KEYS[1])
unindex(KEYS[2], ARGV[3])
return 1
"#;

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            return StoreError::Timeout;
        }
        match e.kind() {
            ErrorKind::BusyLoadingError | ErrorKind::TryAgain => StoreError::Throttled(e.to_string()),
            _ if matches!(e.code(), Some("BUSY")) => StoreError::Throttled(e.to_string()),
            ErrorKind::TypeError => StoreError::Serialization(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Redis-backed store sharing one auto-reconnecting connection.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    put_script: Script,
    update_script: Script,
    delete_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str, prefix: &str, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;

        let store = Self {
            conn,
            prefix: prefix.to_string(),
            clock,
            put_script: Script::new(&format!("{LUA_PRELUDE}{LUA_PUT}")),
            update_script: Script::new(&format!("{LUA_PRELUDE}{LUA_UPDATE}")),
            delete_script: Script::new(&format!("{LUA_PRELUDE}{LUA_DELETE}")),
        };
        store.health_check().await?;

        tracing::info!(prefix = %store.prefix, "Connected to Redis store");
        Ok(store)
    }

    fn row_key(&self, table: &str, key: &ItemKey) -> String {
        format!("{}{}:{}", self.prefix, table, key)
    }

    fn index_key(&self, table: &str, partition: &str) -> String {
        format!("{}{}!idx:{}", self.prefix, table, partition)
    }

    fn decode(raw: &str) -> StoreResult<Item> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.row_key(table, key))
            .query_async(&mut conn)
            .await?;

        let now = self.clock.now_ms();
        match raw {
            Some(raw) => Ok(Some(Self::decode(&raw)?).filter(|item| !item.is_expired(now))),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        table: &str,
        key: &ItemKey,
        item: Item,
        condition: &Condition,
    ) -> StoreResult<()> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let mut invocation = self.put_script.prepare_invoke();
        invocation
            .key(self.row_key(table, key))
            .key(self.index_key(table, &key.partition))
            .arg(self.clock.now_ms())
            .arg(serde_json::to_string(condition)?)
            .arg(serde_json::to_string(&item)?)
            .arg(key.sort.as_deref().unwrap_or(""));

        let written: i64 = invocation.invoke_async(&mut conn).await?;
        if written == 1 {
            Ok(())
        } else {
            Err(StoreError::condition_failed(table, key))
        }
    }

    async fn update(
        &self,
        table: &str,
        key: &ItemKey,
        update: &Update,
        condition: &Condition,
    ) -> StoreResult<Item> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let mut invocation = self.update_script.prepare_invoke();
        invocation
            .key(self.row_key(table, key))
            .key(self.index_key(table, &key.partition))
            .arg(self.clock.now_ms())
            .arg(serde_json::to_string(condition)?)
            .arg(serde_json::to_string(update)?)
            .arg(key.sort.as_deref().unwrap_or(""));

        let written: Option<String> = invocation.invoke_async(&mut conn).await?;
        match written {
            Some(raw) => Self::decode(&raw),
            None => Err(StoreError::condition_failed(table, key)),
        }
    }

    async fn delete(&self, table: &str, key: &ItemKey, condition: &Condition) -> StoreResult<()> {
        key.validate()?;
        let mut conn = self.conn.clone();
        let mut invocation = self.delete_script.prepare_invoke();
        invocation
            .key(self.row_key(table, key))
            .key(self.index_key(table, &key.partition))
            .arg(self.clock.now_ms())
            .arg(serde_json::to_string(condition)?)
            .arg(key.sort.as_deref().unwrap_or(""));

        let deleted: i64 = invocation.invoke_async(&mut conn).await?;
        if deleted == 1 {
            Ok(())
        } else {
            Err(StoreError::condition_failed(table, key))
        }
    }

    async fn scan_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> StoreResult<Vec<(String, Item)>> {
        ItemKey::partition(partition).validate()?;
        let mut conn = self.conn.clone();
        let now = self.clock.now_ms();
        let idx = self.index_key(table, partition);

        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&idx)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZRANGE")
            .arg(&idx)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = members
            .iter()
            .map(|sort| self.row_key(table, &ItemKey::composite(partition, sort.as_str())))
            .collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut rows = Vec::with_capacity(members.len());
        for (sort, raw) in members.into_iter().zip(raws) {
            let Some(raw) = raw else { continue };
            let item = Self::decode(&raw)?;
            if !item.is_expired(now) {
                rows.push((sort, item));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }
}

// ============================================================================
// Redis Integration Tests (requires running Redis server)
// ============================================================================
