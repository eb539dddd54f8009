//! Cluster and client configuration.
//!
//! Provides type-safe configuration for:
//! - Discovery endpoints and the cluster name
//! - Connect and command timeouts
//! - The reconnect schedule
//! - Per-client role selection

use std::time::Duration;

use snafu::ensure;

use crate::{
    endpoint::{Endpoint, Role},
    error::{ConfigSnafu, Result},
};

/// Cluster name used when none is configured.
pub const DEFAULT_CLUSTER_NAME: &str = "defaultCluster";

/// Channel discovery nodes announce primary changes on.
pub const DEFAULT_FAILOVER_CHANNEL: &str = "+switch-master";

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default command timeout (10 seconds).
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration shared by every connection of one cluster handle.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) cluster_name: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) command_timeout: Duration,
    pub(crate) reconnect_policy: ReconnectPolicy,
    pub(crate) failover_channel: String,
    pub(crate) peer_learning: bool,
}

impl ClusterConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Returns the discovery endpoints in initial priority order.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Returns the default reconnect policy.
    #[must_use]
    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect_policy
    }

    /// Returns the failover notification channel.
    #[must_use]
    pub fn failover_channel(&self) -> &str {
        &self.failover_channel
    }

    /// Returns whether resolutions learn new discovery nodes from peers.
    #[must_use]
    pub fn peer_learning(&self) -> bool {
        self.peer_learning
    }

    pub(crate) fn link_settings(&self) -> LinkSettings {
        LinkSettings { connect_timeout: self.connect_timeout, command_timeout: self.command_timeout }
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    endpoints: Vec<Endpoint>,
    cluster_name: Option<String>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    reconnect_policy: Option<ReconnectPolicy>,
    failover_channel: Option<String>,
    peer_learning: bool,
}

impl ClusterConfigBuilder {
    /// Sets the discovery endpoints.
    ///
    /// At least one endpoint must be provided. The order given is the
    /// initial priority order.
    #[must_use]
    pub fn with_endpoints<I, E>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a single discovery endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Sets the name the discovery nodes know the cluster by.
    ///
    /// Default: `defaultCluster`.
    #[must_use]
    pub fn with_cluster_name<S: Into<String>>(mut self, name: S) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Sets the connection establishment timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-command timeout.
    ///
    /// Default: 10 seconds.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the reconnect schedule used by clients that do not override it.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = Some(policy);
        self
    }

    /// Sets the pub/sub channel the failover listener subscribes to.
    ///
    /// Default: `+switch-master`.
    #[must_use]
    pub fn with_failover_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.failover_channel = Some(channel.into());
        self
    }

    /// Enables learning additional discovery nodes from the winning node.
    ///
    /// Default: disabled.
    #[must_use]
    pub fn with_peer_learning(mut self, enabled: bool) -> Self {
        self.peer_learning = enabled;
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if no endpoint is given, the cluster name
    /// or failover channel is empty, a timeout is zero, or the reconnect
    /// policy is out of range.
    pub fn build(self) -> Result<ClusterConfig> {
        ensure!(
            !self.endpoints.is_empty(),
            ConfigSnafu { message: "at least one discovery endpoint is required" }
        );

        let cluster_name = self.cluster_name.unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_owned());
        ensure!(!cluster_name.is_empty(), ConfigSnafu { message: "cluster_name cannot be empty" });

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        ensure!(
            !connect_timeout.is_zero(),
            ConfigSnafu { message: "connect_timeout cannot be zero" }
        );

        let command_timeout = self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        ensure!(
            !command_timeout.is_zero(),
            ConfigSnafu { message: "command_timeout cannot be zero" }
        );

        let failover_channel =
            self.failover_channel.unwrap_or_else(|| DEFAULT_FAILOVER_CHANNEL.to_owned());
        ensure!(
            !failover_channel.is_empty(),
            ConfigSnafu { message: "failover_channel cannot be empty" }
        );

        let reconnect_policy = self.reconnect_policy.unwrap_or_default();
        reconnect_policy.validate()?;

        Ok(ClusterConfig {
            endpoints: self.endpoints,
            cluster_name,
            connect_timeout,
            command_timeout,
            reconnect_policy,
            failover_channel,
            peer_learning: self.peer_learning,
        })
    }
}

/// Reconnect schedule for a supervised connection.
///
/// Delays grow exponentially from `initial_delay` by `factor`, are capped at
/// `max_delay`, and are spread by `jitter` (0.0 to 1.0).
#[derive(Debug, Clone, PartialEq, bon::Builder)]
#[builder(derive(Debug))]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    #[builder(default = Duration::from_millis(100))]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[builder(default = Duration::from_secs(10))]
    pub max_delay: Duration,

    /// Multiplier applied after each attempt.
    #[builder(default = 2.0)]
    pub factor: f64,

    /// Jitter factor (0.0 to 1.0) for randomizing delays.
    #[builder(default = 0.25)]
    pub jitter: f64,

    /// Attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectPolicy {
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            !self.initial_delay.is_zero(),
            ConfigSnafu { message: "reconnect initial_delay cannot be zero" }
        );
        ensure!(
            self.max_delay >= self.initial_delay,
            ConfigSnafu { message: "reconnect max_delay must be at least initial_delay" }
        );
        ensure!(
            self.factor >= 1.0,
            ConfigSnafu { message: "reconnect factor must be at least 1.0" }
        );
        ensure!(
            (0.0..=1.0).contains(&self.jitter),
            ConfigSnafu { message: "reconnect jitter must be between 0.0 and 1.0" }
        );
        Ok(())
    }
}

/// Per-client options passed to `Cluster::create_client`.
#[derive(Debug, Clone, Default, bon::Builder)]
#[builder(derive(Debug))]
pub struct ClientOptions {
    /// Role the connection binds to.
    #[builder(default)]
    pub role: Role,

    /// Overrides the cluster name of the cluster handle.
    #[builder(into)]
    pub cluster_name: Option<String>,

    /// Overrides the cluster's command timeout.
    pub command_timeout: Option<Duration>,

    /// Overrides the cluster's reconnect policy.
    pub reconnect_policy: Option<ReconnectPolicy>,
}

impl ClientOptions {
    /// Options for a client bound to `role`.
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        Self { role, ..Self::default() }
    }
}

/// Transport settings for one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Bound on each request/reply exchange.
    pub command_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT, command_timeout: DEFAULT_COMMAND_TIMEOUT }
    }
}
