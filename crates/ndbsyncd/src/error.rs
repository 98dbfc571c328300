//! Error types for ndbsyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors carry the origin and table involved

use crate::types::Origin;
use thiserror::Error;

/// Errors that can occur in ndbsyncd
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
#[derive(Debug, Error)]
pub enum NdbError {
    /// Embedded store operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Client/server store operation failed
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Store operation failed outside the backend driver
    #[error("Store error: {0}")]
    Store(String),

    /// A partial key did not resolve to exactly one row
    #[error("Object not found in {table}: {key}")]
    NotFound {
        /// The table or view searched.
        table: String,
        /// The key as provided by the caller.
        key: String,
    },

    /// A bulk query filter named a field the view does not have
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// An event lacked data required to materialize it
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Transport failure other than a peer disconnect
    /// NIST: SC-7 (Boundary Protection) - Source channel errors
    #[error("Transport error on {origin}: {message}")]
    Transport {
        /// The origin whose channel failed.
        origin: Origin,
        /// Error message.
        message: String,
    },

    /// No source is attached for the origin
    #[error("Source not attached: {0}")]
    SourceNotFound(Origin),

    /// A source reader thread panicked
    #[error("Source reader for {0} panicked")]
    SourcePanicked(Origin),

    /// An error condition reached the default dispatch path
    #[error("Fatal event: {0}")]
    Fatal(String),

    /// Configuration error
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Waiting for a signal took too long
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The event queue has no consumer left
    #[error("Event queue closed")]
    QueueClosed,

    /// The database has already been closed
    #[error("Database closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl NdbError {
    /// Creates a not found error.
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(origin: &Origin, message: impl Into<String>) -> Self {
        Self::Transport {
            origin: origin.clone(),
            message: message.into(),
        }
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type alias for ndbsyncd operations
pub type Result<T> = std::result::Result<T, NdbError>;

/// Outcome signalled by an event handler.
///
/// `Invalidate` and `Shutdown` are control signals for the dispatch loop;
/// only `Failed` is an actual error, and it is logged rather than
/// propagated.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler's target is gone; remove this registration
    #[error("handler invalidated")]
    Invalidate,

    /// Stop the dispatch loop
    #[error("shutdown requested")]
    Shutdown,

    /// The handler failed on this event
    #[error(transparent)]
    Failed(#[from] NdbError),
}

/// Result type returned by event handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NdbError::not_found("interfaces", "{name: eth0}");
        assert_eq!(err.to_string(), "Object not found in interfaces: {name: eth0}");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_transport() {
        let err = NdbError::transport(&Origin::from("h1"), "socket reset");
        assert_eq!(err.to_string(), "Transport error on h1: socket reset");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_handler_error_from_ndb_error() {
        let err: HandlerError = NdbError::FieldNotFound("mtu".into()).into();
        assert!(matches!(err, HandlerError::Failed(NdbError::FieldNotFound(_))));
        assert_eq!(err.to_string(), "Field not found: mtu");
    }
}
