//! Codec error types.

use snafu::Snafu;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, RespError>;

/// Errors raised while decoding or encoding RESP2 frames.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RespError {
    /// The peer sent bytes that are not valid RESP2.
    #[snafu(display("Protocol error: {message}"))]
    Protocol {
        /// What was wrong with the input.
        message: String,
    },

    /// A buffered frame grew past the configured limit.
    #[snafu(display("Frame of {len} bytes exceeds limit of {max} bytes"))]
    FrameTooLarge {
        /// Bytes buffered so far.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Underlying socket error.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The I/O error.
        source: std::io::Error,
    },
}

impl From<std::io::Error> for RespError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}
