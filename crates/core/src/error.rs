//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Protocol name is not one of the supported protocols.
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Event kind name is not recognised at all.
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    /// The protocol exists but does not emit the requested event kind.
    #[error("Unsupported event selector: protocol '{protocol}' has no '{event}' events")]
    UnsupportedSelector {
        /// Protocol wire name.
        protocol: String,
        /// Event kind wire name.
        event: String,
    },

    /// Invalid address format.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid time window.
    #[error("Invalid time window: start {start} is after end {end}")]
    InvalidTimeWindow {
        /// Window start (unix seconds).
        start: i64,
        /// Window end (unix seconds).
        end: i64,
    },

    /// Upstream value could not be interpreted.
    #[error("Malformed upstream value for '{field}': {value}")]
    MalformedValue {
        /// Field name as it appears upstream.
        field: &'static str,
        /// Offending raw value.
        value: String,
    },
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
