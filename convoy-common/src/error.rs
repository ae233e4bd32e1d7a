//! Error types for the Convoy core.

use thiserror::Error;

/// Result type alias using the Convoy error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type surfaced to request handlers.
///
/// Component crates keep their own precise error enums and convert into this
/// one at the boundary where a request handler has to decide on a response.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Concurrent modification that the caller could not reconcile
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backing store rate limit still in effect after local retries
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Backing store or dependency unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A circuit breaker rejected the call
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers and return the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Self::Conflict(_))
    }

    /// Check if this is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), Self::CircuitOpen(_))
    }

    /// Whether a fresh attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Throttled(_)
                | Self::Unavailable(_)
                | Self::CircuitOpen(_)
                | Self::Timeout
                | Self::Conflict(_)
        )
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Error::Throttled("x".into()) => true ; "throttled")]
    #[test_case(Error::Unavailable("x".into()) => true ; "unavailable")]
    #[test_case(Error::CircuitOpen("x".into()) => true ; "circuit open")]
    #[test_case(Error::Conflict("x".into()) => true ; "conflict")]
    #[test_case(Error::Timeout => true ; "timeout")]
    #[test_case(Error::InvalidInput("x".into()) => false ; "invalid input")]
    #[test_case(Error::Internal("x".into()) => false ; "internal")]
    fn test_error_retryability(err: Error) -> bool {
        err.is_retryable()
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::Conflict("version 3".into());
        let with_ctx = err.with_context("saving session s1");
        assert!(matches!(with_ctx, Error::WithContext { .. }));
        assert!(with_ctx.is_conflict());
        assert_eq!(with_ctx.to_string(), "saving session s1: Conflict: version 3");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Throttled("t".into()).is_retryable());
        assert!(Error::Timeout.with_context("store").is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        let err = res.context("reading config").unwrap_err();
        assert!(matches!(err.root(), Error::Io(_)));
    }
}
