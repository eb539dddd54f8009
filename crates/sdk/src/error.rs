//! SDK-specific error types with recovery context.
//!
//! Provides a two-tier error model:
//! - **Transport errors**: connect failures, timeouts, lost links, protocol errors
//! - **Domain errors**: server error replies, exhausted resolutions, configuration
//!
//! Per-node probe failures live in [`crate::discovery`] and are aggregated
//! into [`ResolutionExhausted`] before they reach this type.

use std::sync::Arc;

use sentinel_resp::RespError;
use snafu::{Location, Snafu};

use crate::discovery::ResolutionExhausted;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SdkError {
    /// Socket-level failure (connect refused, reset).
    #[snafu(display("I/O error at {location}: {source}"))]
    Io {
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The peer sent something that is not valid RESP.
    #[snafu(display("Protocol error at {location}: {source}"))]
    Protocol {
        /// Underlying codec error.
        source: RespError,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The node answered with an error reply.
    #[snafu(display("Server error: {message}"))]
    Server {
        /// Error text sent by the node.
        message: String,
    },

    /// The node answered with a reply of the wrong shape.
    #[snafu(display("Unexpected reply: {message}"))]
    UnexpectedReply {
        /// What was expected and what arrived.
        message: String,
    },

    /// Operation timed out.
    #[snafu(display("Operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The link dropped while a request was outstanding.
    #[snafu(display("Connection lost: {message}"))]
    ConnectionLost {
        /// Disconnect reason.
        message: String,
    },

    /// A command was issued before the connection was bound to an endpoint.
    #[snafu(display("Connection is not bound to an endpoint"))]
    NotConnected,

    /// The connection was closed intentionally.
    #[snafu(display("Connection closed"))]
    Closed,

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// A `host:port` string could not be parsed.
    #[snafu(display("Invalid endpoint '{value}': {message}"))]
    InvalidEndpoint {
        /// The rejected input.
        value: String,
        /// Parse error description.
        message: String,
    },

    /// No discovery node could resolve the requested role.
    #[snafu(display("{source}"))]
    Resolution {
        /// Per-node failure detail.
        source: ResolutionExhausted,
    },

    /// The reconnect schedule ran out of attempts.
    #[snafu(display("Reconnect attempts exhausted after {attempts} attempts"))]
    ReconnectExhausted {
        /// Number of scheduled attempts made.
        attempts: u32,
    },

    /// A failure delivered as a connection event.
    #[snafu(display("{source}"))]
    Signalled {
        /// The event's error.
        source: Arc<SdkError>,
    },
}

impl SdkError {
    /// Returns true if the error is transient and the operation may succeed later.
    ///
    /// Retryable errors:
    /// - I/O, protocol and lost-link errors (the supervisor is rebinding)
    /// - Timeouts
    /// - `NotConnected` (resolution still in flight)
    /// - Exhausted resolutions (discovery nodes may come back)
    ///
    /// Non-retryable errors:
    /// - Server error replies (the command itself was rejected)
    /// - Configuration and endpoint parse errors
    /// - `Closed`, `ReconnectExhausted`
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Protocol { .. } => true,
            Self::Timeout { .. } => true,
            Self::ConnectionLost { .. } => true,
            Self::NotConnected => true,
            Self::Resolution { .. } => true,
            Self::Signalled { source } => source.is_retryable(),
            // Non-retryable
            Self::Server { .. } => false,
            Self::UnexpectedReply { .. } => false,
            Self::Closed => false,
            Self::Config { .. } => false,
            Self::InvalidEndpoint { .. } => false,
            Self::ReconnectExhausted { .. } => false,
        }
    }

    /// Returns the resolution failure detail if this error (or the event it
    /// wraps) came from an exhausted resolution.
    #[must_use]
    pub fn resolution(&self) -> Option<&ResolutionExhausted> {
        match self {
            Self::Resolution { source } => Some(source),
            Self::Signalled { source } => source.resolution(),
            _ => None,
        }
    }
}

impl From<RespError> for SdkError {
    fn from(source: RespError) -> Self {
        Self::Protocol { source, location: Location::default() }
    }
}

impl From<ResolutionExhausted> for SdkError {
    fn from(source: ResolutionExhausted) -> Self {
        Self::Resolution { source }
    }
}

impl From<Arc<SdkError>> for SdkError {
    fn from(source: Arc<SdkError>) -> Self {
        Self::Signalled { source }
    }
}
