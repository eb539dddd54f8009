//! Decoded RESP2 values.

use bytes::Bytes;

/// A single RESP2 value.
///
/// Nil replies are represented as `Bulk(None)` or `Array(None)`, matching
/// the two nil encodings the protocol allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n`, or `$-1\r\n` for nil.
    Bulk(Option<Bytes>),
    /// `*2\r\n...`, or `*-1\r\n` for nil.
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Creates a bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(Some(data.into()))
    }

    /// Creates a simple string frame.
    pub fn simple(value: impl Into<String>) -> Self {
        Self::Simple(value.into())
    }

    /// Creates an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Creates a non-nil array frame.
    #[must_use]
    pub fn array(items: Vec<Frame>) -> Self {
        Self::Array(Some(items))
    }

    /// Creates a nil bulk frame.
    #[must_use]
    pub fn nil() -> Self {
        Self::Bulk(None)
    }

    /// Returns true for either nil encoding.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Bulk(None) | Self::Array(None))
    }

    /// Returns the textual content of a simple or bulk string.
    ///
    /// Bulk strings that are not valid UTF-8 return `None`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(value) => Some(value),
            Self::Bulk(Some(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a simple or bulk string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Simple(value) => Some(value.as_bytes()),
            Self::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Returns the integer value, parsing bulk strings that hold digits.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            other => other.as_str().and_then(|s| s.parse().ok()),
        }
    }

    /// Returns the message of an error frame.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Consumes the frame, returning the items of a non-nil array.
    #[must_use]
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Self::Array(Some(items)) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Frame {
    fn from(value: &str) -> Self {
        Self::bulk(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Self::bulk(Bytes::from(value))
    }
}

impl From<i64> for Frame {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}
