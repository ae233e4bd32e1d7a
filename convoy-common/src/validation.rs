//! Configuration validation for Convoy services.
//!
//! Checks that thresholds, timeouts and table names are usable before any
//! client handle is constructed from them.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::{
    CircuitConfig, Config, LockBackoffConfig, ObservabilityConfig, RetryConfig, StoreConfig,
    TtlConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let sections: [&dyn Validate; 5] = [
            &self.store,
            &self.ttl,
            &self.retry,
            &self.lock_backoff,
            &self.observability,
        ];
        for section in sections {
            if let Err(e) = section.validate() {
                errors.push(e);
            }
        }

        let mut names: Vec<&String> = self.circuits.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.circuits[name].validate() {
                errors.push(invalid(format!("circuits.{name}"), e.to_string()));
            }
        }

        collect(errors)
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.url.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "store.url".into(),
            });
        }
        if self.op_timeout_ms == 0 {
            errors.push(invalid("store.op_timeout_ms", "must be greater than 0"));
        }

        let tables = [
            ("store.tables.sessions", &self.tables.sessions),
            ("store.tables.actions", &self.tables.actions),
            ("store.tables.locks", &self.tables.locks),
            ("store.tables.idempotency", &self.tables.idempotency),
        ];
        let mut seen = HashSet::new();
        for (field, name) in tables {
            if name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: field.into(),
                });
            } else if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                errors.push(invalid(field, "may only contain [A-Za-z0-9_-]"));
            } else if !seen.insert(name.as_str()) {
                errors.push(ValidationError::Conflict {
                    reason: format!("table name '{name}' is used by more than one entity"),
                });
            }
        }

        collect(errors)
    }
}

impl Validate for TtlConfig {
    fn validate(&self) -> ValidationResult<()> {
        let fields = [
            ("ttl.session_retention_secs", self.session_retention_secs),
            ("ttl.idempotency_secs", self.idempotency_secs),
            ("ttl.lock_secs", self.lock_secs),
            ("ttl.action_secs", self.action_secs),
        ];
        collect(
            fields
                .into_iter()
                .filter(|(_, v)| *v == 0)
                .map(|(field, _)| invalid(field, "must be greater than 0"))
                .collect(),
        )
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.max_attempts == 0 {
            errors.push(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    self.base_delay_ms, self.max_delay_ms
                ),
            });
        }
        collect(errors)
    }
}

impl Validate for LockBackoffConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.initial_ms == 0 {
            return Err(invalid("lock_backoff.initial_ms", "must be greater than 0"));
        }
        if self.initial_ms > self.max_ms {
            return Err(ValidationError::Conflict {
                reason: format!(
                    "lock_backoff.initial_ms ({}) exceeds lock_backoff.max_ms ({})",
                    self.initial_ms, self.max_ms
                ),
            });
        }
        Ok(())
    }
}

impl Validate for CircuitConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.failure_threshold == 0 {
            errors.push(invalid("failure_threshold", "must be at least 1"));
        }
        if self.success_threshold_to_close == 0 {
            errors.push(invalid("success_threshold_to_close", "must be at least 1"));
        }
        if self.timeout_before_retry_ms == 0 {
            errors.push(invalid("timeout_before_retry_ms", "must be greater than 0"));
        }
        if self.max_call_timeout_ms == 0 {
            errors.push(invalid("max_call_timeout_ms", "must be greater than 0"));
        }
        collect(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        let mut errors = Vec::new();
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            errors.push(invalid(
                "observability.log_level",
                format!("'{}' is not one of {LEVELS:?}", self.log_level),
            ));
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            errors.push(invalid(
                "observability.log_format",
                format!("'{}' must be 'json' or 'pretty'", self.log_format),
            ));
        }
        collect(errors)
    }
}
