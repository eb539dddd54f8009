//! RESP2 wire types for talking to discovery nodes and data nodes.
//!
//! This crate provides the minimal protocol surface the SDK needs:
//! - [`Frame`] - a decoded RESP2 value (simple string, error, integer, bulk, array)
//! - [`Command`] - a request encoded as an array of bulk strings
//! - [`RespCodec`] - a `tokio_util` codec decoding frames and encoding commands
//! - Error types using snafu

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod command;
mod error;
mod frame;

pub use codec::{DEFAULT_MAX_FRAME_LEN, RespCodec};
pub use command::Command;
pub use error::{RespError, Result};
pub use frame::Frame;
