//! Discovery-node resolution.
//!
//! A role query ("which node is the primary of `mymaster`?") is answered by
//! asking discovery nodes one at a time until one answers authoritatively.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Resolver                            │
//! │   Sequential walk │ Promote winner │ Aggregate failures     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │          NodeList            │            Probe             │
//! │   ArcSwap priority order     │   One query, one node        │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```

mod nodes;
mod probe;
mod resolver;

pub use nodes::NodeList;
pub use probe::{Probe, ProbeError, SentinelProbe};
pub use resolver::{ProbeFailure, ResolutionExhausted, Resolver};
