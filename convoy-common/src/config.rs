//! Configuration management for Convoy services.
//!
//! Configuration lives in a JSON file at `~/.convoy/config.json` (or the path in
//! `CONVOY_CONFIG`) and every field has a default, so an absent file is valid.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CONVOY_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Backing store
//! - `CONVOY_STORE_BACKEND` → store.backend (`memory` | `redis`)
//! - `CONVOY_STORE_URL` → store.url
//! - `CONVOY_KEY_PREFIX` → store.key_prefix
//! - `CONVOY_STORE_OP_TIMEOUT_MS` → store.op_timeout_ms
//! - `CONVOY_TABLE_SESSIONS` / `_ACTIONS` / `_LOCKS` / `_IDEMPOTENCY` → store.tables.*
//!
//! ## TTLs (seconds, or `30s` / `5m` / `1h` / `7d`)
//! - `CONVOY_SESSION_TTL_SECS` → ttl.session_retention_secs
//! - `CONVOY_IDEMPOTENCY_TTL_SECS` → ttl.idempotency_secs
//! - `CONVOY_LOCK_TTL_SECS` → ttl.lock_secs
//! - `CONVOY_LOCK_TIMEOUT_SECS` → ttl.lock_timeout_secs
//! - `CONVOY_ACTION_TTL_SECS` → ttl.action_secs
//!
//! ## Throttling retry
//! - `CONVOY_RETRY_MAX_ATTEMPTS` → retry.max_attempts
//! - `CONVOY_RETRY_BASE_DELAY_MS` → retry.base_delay_ms
//! - `CONVOY_RETRY_MAX_DELAY_MS` → retry.max_delay_ms
//!
//! ## Circuit breakers
//! - `CONVOY_CIRCUIT_<NAME>_FAILURE_THRESHOLD`
//! - `CONVOY_CIRCUIT_<NAME>_RETRY_AFTER_MS`
//! - `CONVOY_CIRCUIT_<NAME>_SUCCESS_THRESHOLD`
//! - `CONVOY_CIRCUIT_<NAME>_CALL_TIMEOUT_MS`
//!
//! `<NAME>` is lowercased to form the circuit name (`FULFILLMENT_API` → `fulfillment_api`).
//!
//! ## Observability
//! - `CONVOY_LOG_LEVEL` → observability.log_level
//! - `CONVOY_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::parse_duration_secs;

/// Name of the circuit whose settings apply to circuits without their own entry.
pub const DEFAULT_CIRCUIT: &str = "default";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".convoy"),
        |dirs| dirs.home_dir().join(".convoy"),
    )
}

/// Get the configuration file path, honoring `CONVOY_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var("CONVOY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Backing Store Configuration
// ============================================================================

/// Which backing store implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store (single instance, tests, local development).
    #[default]
    Memory,
    /// Redis shared across process instances.
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// Logical table names, one per entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableNames {
    #[serde(default = "default_sessions_table")]
    pub sessions: String,
    #[serde(default = "default_actions_table")]
    pub actions: String,
    #[serde(default = "default_locks_table")]
    pub locks: String,
    #[serde(default = "default_idempotency_table")]
    pub idempotency: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            sessions: default_sessions_table(),
            actions: default_actions_table(),
            locks: default_locks_table(),
            idempotency: default_idempotency_table(),
        }
    }
}

fn default_sessions_table() -> String {
    "sessions".into()
}

fn default_actions_table() -> String {
    "pending_actions".into()
}

fn default_locks_table() -> String {
    "locks".into()
}

fn default_idempotency_table() -> String {
    "idempotency".into()
}

/// Backing store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Endpoint URL (redis://host:port/db).
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix applied to every key, for sharing one server between deployments.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deadline applied to each individual store call.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    #[serde(default)]
    pub tables: TableNames,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            op_timeout_ms: default_op_timeout_ms(),
            tables: TableNames::default(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_key_prefix() -> String {
    "convoy:".into()
}

fn default_op_timeout_ms() -> u64 {
    2_000
}

// ============================================================================
// TTL Configuration
// ============================================================================

/// Default expiry windows for each entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtlConfig {
    /// Session retention after the last write (default 7 days).
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,

    /// Idempotency window (default 10 minutes).
    #[serde(default = "default_idempotency_secs")]
    pub idempotency_secs: u64,

    /// Lock lease length.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,

    /// How long a request waits for a contended lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// How long a staged action stays confirmable.
    #[serde(default = "default_action_secs")]
    pub action_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            session_retention_secs: default_session_retention_secs(),
            idempotency_secs: default_idempotency_secs(),
            lock_secs: default_lock_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            action_secs: default_action_secs(),
        }
    }
}

fn default_session_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_idempotency_secs() -> u64 {
    600
}

fn default_lock_secs() -> u64 {
    30
}

fn default_lock_timeout_secs() -> u64 {
    5
}

fn default_action_secs() -> u64 {
    900
}

// ============================================================================
// Retry / Backoff Configuration
// ============================================================================

/// Retry policy for throttled backing-store calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

/// Backoff between lock acquisition attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockBackoffConfig {
    #[serde(default = "default_lock_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_lock_max_ms")]
    pub max_ms: u64,
}

impl Default for LockBackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_lock_initial_ms(),
            max_ms: default_lock_max_ms(),
        }
    }
}

fn default_lock_initial_ms() -> u64 {
    100
}

fn default_lock_max_ms() -> u64 {
    1_000
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Thresholds for one named circuit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call.
    #[serde(default = "default_timeout_before_retry_ms")]
    pub timeout_before_retry_ms: u64,

    /// Trial successes needed to close the circuit again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold_to_close: u32,

    /// Calls running longer than this count as failures.
    #[serde(default = "default_max_call_timeout_ms")]
    pub max_call_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_before_retry_ms: default_timeout_before_retry_ms(),
            success_threshold_to_close: default_success_threshold(),
            max_call_timeout_ms: default_max_call_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_timeout_before_retry_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_call_timeout_ms() -> u64 {
    10_000
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ttl: TtlConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub lock_backoff: LockBackoffConfig,

    /// Per-dependency breaker thresholds, keyed by circuit name.
    #[serde(default)]
    pub circuits: HashMap<String, CircuitConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(std::env::vars());
    }

    /// Apply overrides from an explicit set of variables.
    ///
    /// Unparseable values are logged and ignored so a typo never blocks startup.
    pub fn apply_env_overrides_from<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("CONVOY_") else {
                continue;
            };

            if let Some(circuit) = name.strip_prefix("CIRCUIT_") {
                self.apply_circuit_override(circuit, &value);
                continue;
            }

            let applied = match name {
                "STORE_BACKEND" => set_parsed(&mut self.store.backend, &value),
                "STORE_URL" => set_string(&mut self.store.url, value.clone()),
                "KEY_PREFIX" => set_string(&mut self.store.key_prefix, value.clone()),
                "STORE_OP_TIMEOUT_MS" => set_parsed(&mut self.store.op_timeout_ms, &value),
                "TABLE_SESSIONS" => set_string(&mut self.store.tables.sessions, value.clone()),
                "TABLE_ACTIONS" => set_string(&mut self.store.tables.actions, value.clone()),
                "TABLE_LOCKS" => set_string(&mut self.store.tables.locks, value.clone()),
                "TABLE_IDEMPOTENCY" => {
                    set_string(&mut self.store.tables.idempotency, value.clone())
                }
                "SESSION_TTL_SECS" => set_duration(&mut self.ttl.session_retention_secs, &value),
                "IDEMPOTENCY_TTL_SECS" => set_duration(&mut self.ttl.idempotency_secs, &value),
                "LOCK_TTL_SECS" => set_duration(&mut self.ttl.lock_secs, &value),
                "LOCK_TIMEOUT_SECS" => set_duration(&mut self.ttl.lock_timeout_secs, &value),
                "ACTION_TTL_SECS" => set_duration(&mut self.ttl.action_secs, &value),
                "RETRY_MAX_ATTEMPTS" => set_parsed(&mut self.retry.max_attempts, &value),
                "RETRY_BASE_DELAY_MS" => set_parsed(&mut self.retry.base_delay_ms, &value),
                "RETRY_MAX_DELAY_MS" => set_parsed(&mut self.retry.max_delay_ms, &value),
                "LOCK_BACKOFF_INITIAL_MS" => set_parsed(&mut self.lock_backoff.initial_ms, &value),
                "LOCK_BACKOFF_MAX_MS" => set_parsed(&mut self.lock_backoff.max_ms, &value),
                "LOG_LEVEL" => set_string(&mut self.observability.log_level, value.clone()),
                "LOG_FORMAT" => set_string(&mut self.observability.log_format, value.clone()),
                // CONVOY_CONFIG is consumed by config_path()
                _ => true,
            };

            if !applied {
                tracing::warn!(variable = %key, value = %value, "Ignoring unparseable override");
            }
        }
    }

    fn apply_circuit_override(&mut self, rest: &str, value: &str) {
        const SUFFIXES: &[&str] = &[
            "_FAILURE_THRESHOLD",
            "_RETRY_AFTER_MS",
            "_SUCCESS_THRESHOLD",
            "_CALL_TIMEOUT_MS",
        ];

        let Some((name, suffix)) = SUFFIXES
            .iter()
            .find_map(|suffix| rest.strip_suffix(suffix).map(|name| (name, *suffix)))
        else {
            tracing::warn!(variable = %rest, "Unknown circuit override");
            return;
        };
        if name.is_empty() {
            return;
        }

        let circuit_name = name.to_ascii_lowercase();
        let template = self.circuit(&circuit_name);
        let entry = self.circuits.entry(circuit_name.clone()).or_insert(template);

        let applied = match suffix {
            "_FAILURE_THRESHOLD" => set_parsed(&mut entry.failure_threshold, value),
            "_RETRY_AFTER_MS" => set_parsed(&mut entry.timeout_before_retry_ms, value),
            "_SUCCESS_THRESHOLD" => set_parsed(&mut entry.success_threshold_to_close, value),
            _ => set_parsed(&mut entry.max_call_timeout_ms, value),
        };
        if !applied {
            tracing::warn!(circuit = %circuit_name, value = %value, "Ignoring unparseable circuit override");
        }
    }

    /// Breaker settings for a named circuit, falling back to the `default` entry.
    pub fn circuit(&self, name: &str) -> CircuitConfig {
        self.circuits
            .get(name)
            .or_else(|| self.circuits.get(DEFAULT_CIRCUIT))
            .cloned()
            .unwrap_or_default()
    }
}

fn set_string(slot: &mut String, value: String) -> bool {
    *slot = value;
    true
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn set_duration(slot: &mut u64, value: &str) -> bool {
    match parse_duration_secs(value) {
        Ok(secs) => {
            *slot = secs;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.tables.sessions, "sessions");
        assert_eq!(config.ttl.session_retention_secs, 604_800);
        assert_eq!(config.ttl.idempotency_secs, 600);
        assert_eq!(config.lock_backoff.initial_ms, 100);
        assert_eq!(config.lock_backoff.max_ms, 1_000);
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "store": { "backend": "redis", "tables": { "locks": "leases" } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.tables.locks, "leases");
        assert_eq!(config.store.tables.sessions, "sessions");
        assert_eq!(config.ttl, TtlConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "ttl": {{ "lock_secs": 12 }}, "circuits": {{ "fulfillment": {{ "failure_threshold": 2 }} }} }}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.ttl.lock_secs, 12);
        assert_eq!(config.circuit("fulfillment").failure_threshold, 2);
        assert_eq!(config.circuit("fulfillment").success_threshold_to_close, 2);
    }

    #[test]
    fn test_load_from_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides_from(vars(&[
            ("CONVOY_STORE_BACKEND", "redis"),
            ("CONVOY_STORE_URL", "redis://cache:6380"),
            ("CONVOY_TABLE_SESSIONS", "convo_sessions"),
            ("CONVOY_SESSION_TTL_SECS", "2d"),
            ("CONVOY_IDEMPOTENCY_TTL_SECS", "300"),
            ("CONVOY_RETRY_MAX_ATTEMPTS", "6"),
            ("CONVOY_LOG_FORMAT", "json"),
            ("HOME", "/root"),
        ]));

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://cache:6380");
        assert_eq!(config.store.tables.sessions, "convo_sessions");
        assert_eq!(config.ttl.session_retention_secs, 172_800);
        assert_eq!(config.ttl.idempotency_secs, 300);
        assert_eq!(config.retry.max_attempts, 6);
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_invalid_env_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides_from(vars(&[
            ("CONVOY_RETRY_MAX_ATTEMPTS", "many"),
            ("CONVOY_STORE_BACKEND", "cassandra"),
        ]));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_circuit_env_overrides() {
        let mut config = Config::default();
        config.circuits.insert(
            DEFAULT_CIRCUIT.into(),
            CircuitConfig {
                max_call_timeout_ms: 4_000,
                ..CircuitConfig::default()
            },
        );
        config.apply_env_overrides_from(vars(&[
            ("CONVOY_CIRCUIT_FULFILLMENT_API_FAILURE_THRESHOLD", "3"),
            ("CONVOY_CIRCUIT_FULFILLMENT_API_RETRY_AFTER_MS", "1500"),
            ("CONVOY_CIRCUIT_CLASSIFIER_SUCCESS_THRESHOLD", "1"),
        ]));

        let fulfillment = config.circuit("fulfillment_api");
        assert_eq!(fulfillment.failure_threshold, 3);
        assert_eq!(fulfillment.timeout_before_retry_ms, 1_500);
        // Seeded from the default entry
        assert_eq!(fulfillment.max_call_timeout_ms, 4_000);

        assert_eq!(config.circuit("classifier").success_threshold_to_close, 1);
        assert_eq!(config.circuit("unknown").max_call_timeout_ms, 4_000);
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("Redis".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert_eq!("in-memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("dynamo".parse::<StoreBackend>().is_err());
    }
}
