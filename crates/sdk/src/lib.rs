//! Discovery-node aware connections for replicated key/value clusters.
//!
//! This SDK finds the node currently holding a role (primary, replica, or a
//! discovery node itself) by asking a prioritized list of discovery nodes,
//! and keeps long-lived connections bound to that role across failovers.
//!
//! # Features
//!
//! - **Ordered resolution**: discovery nodes are tried one at a time; the
//!   node that answered last is tried first next time
//! - **Supervised connections**: link failures trigger re-resolution and a
//!   rebind to the new endpoint
//! - **Failover notifications**: a single subscription per cluster forces
//!   every connection to reconnect when a primary switch is announced
//! - **Exponential backoff**: reconnect attempts are spaced with `backon`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sentinel_sdk::{ClientOptions, Cluster, ClusterConfig, Endpoint};
//! use sentinel_resp::Command;
//!
//! #[tokio::main]
//! async fn main() -> sentinel_sdk::Result<()> {
//!     let config = ClusterConfig::builder()
//!         .with_endpoint(Endpoint::new("10.0.0.1", 26379))
//!         .with_cluster_name("mymaster")
//!         .build()?;
//!
//!     let cluster = Cluster::new(config);
//!     let client = cluster.create_client(ClientOptions::default())?;
//!     client.wait_ready().await?;
//!
//!     let value = client.command(Command::new("GET").arg("user:123")).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Cluster (Public API)                     │
//! │  .create_client() │ .resolve() │ .reconnect_all()           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Registry + FailoverListener               │
//! │   Tracked connections │ +switch-master subscription         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   SentinelConnection                        │
//! │   Driver task │ Signal interceptor │ Reconnect schedule     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Resolver                                  │
//! │   NodeList (ArcSwap) │ Probe per node │ Promote winner      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Link (sentinel-resp codec over TCP)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod cluster;
mod config;
pub mod discovery;
mod endpoint;
mod error;
mod link;
mod listener;
pub mod mock;
mod registry;
mod signal;
mod supervisor;

// Public API exports
pub use cluster::Cluster;
pub use config::{
    ClientOptions, ClusterConfig, ClusterConfigBuilder, DEFAULT_CLUSTER_NAME,
    DEFAULT_FAILOVER_CHANNEL, LinkSettings, ReconnectPolicy,
};
pub use discovery::{
    NodeList, Probe, ProbeError, ProbeFailure, ResolutionExhausted, Resolver, SentinelProbe,
};
pub use endpoint::{Endpoint, Role, RoleQuery};
pub use error::{Result, SdkError};
pub use link::Link;
pub use registry::Registry;
pub use signal::{ConnectionEvent, Disposition, SignalBus, SignalInterceptor};
pub use supervisor::{ConnectionState, SentinelConnection};
