//! Shared test utilities for the sentinel crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`next_matching`] - Wait for a matching item on a broadcast channel
//! - [`init_tracing`] - Route `tracing` output through the test harness

#![deny(unsafe_code)]

mod assertions;
pub use assertions::{assert_eventually, next_matching};

mod logging;
pub use logging::init_tracing;
