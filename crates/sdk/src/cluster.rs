//! Cluster handle tying resolution and supervision together.

use std::sync::Arc;

use crate::{
    config::{ClientOptions, ClusterConfig},
    discovery::{NodeList, Probe, Resolver, SentinelProbe},
    endpoint::{Endpoint, Role, RoleQuery},
    error::Result,
    registry::Registry,
    supervisor::SentinelConnection,
};

/// Entry point: one handle per logical cluster.
///
/// Owns the discovery-node list, the resolver over it and the registry of
/// connections created through it. Cloning is cheap; all clones share the
/// same state. Connections are closed when the last clone is dropped.
///
/// # Example
///
/// ```no_run
/// use sentinel_sdk::{ClientOptions, Cluster, ClusterConfig, Endpoint, Role};
/// use sentinel_resp::Command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClusterConfig::builder()
///     .with_endpoint(Endpoint::new("10.0.0.1", 26379))
///     .with_endpoint(Endpoint::new("10.0.0.2", 26379))
///     .with_cluster_name("mymaster")
///     .build()?;
/// let cluster = Cluster::new(config);
///
/// let primary = cluster.create_client(ClientOptions::default())?;
/// primary.wait_ready().await?;
/// primary.command(Command::new("SET").arg("key").arg("value")).await?;
///
/// let replica = cluster.create_client(ClientOptions::for_role(Role::Replica))?;
/// replica.wait_ready().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Cluster {
    config: Arc<ClusterConfig>,
    resolver: Resolver,
    registry: Registry,
}

impl Cluster {
    /// Creates a cluster handle that queries discovery nodes over the network.
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        let probe = Arc::new(SentinelProbe::new(config.link_settings()));
        Self::with_probe(config, probe)
    }

    /// Creates a cluster handle with a custom probe.
    #[must_use]
    pub fn with_probe(config: ClusterConfig, probe: Arc<dyn Probe>) -> Self {
        let resolver = Resolver::builder()
            .nodes(NodeList::new(config.endpoints().to_vec()))
            .probe(probe)
            .peer_learning(config.peer_learning())
            .build();
        let registry = Registry::new(config.clone(), resolver.clone());
        Self { config: Arc::new(config), resolver, registry }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns the shared discovery-node list.
    #[must_use]
    pub fn nodes(&self) -> &NodeList {
        self.resolver.nodes()
    }

    /// Returns the resolver.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Returns the connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Creates a supervised connection. See [`Registry::create_client`].
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if an override in `options` is invalid.
    pub fn create_client(&self, options: ClientOptions) -> Result<SentinelConnection> {
        self.registry.create_client(options)
    }

    /// Resolves an endpoint for `role` once, without creating a connection.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Resolution` if no discovery node answered.
    pub async fn resolve(&self, role: Role) -> Result<Endpoint> {
        let query = RoleQuery::new(role, self.config.cluster_name());
        Ok(self.resolver.resolve(&query).await?)
    }

    /// Forces every connection to reconnect. See [`Registry::reconnect_all`].
    pub fn reconnect_all(&self) -> usize {
        self.registry.reconnect_all()
    }

    /// Closes every connection and the failover listener.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{error::SdkError, mock::MockNode};

    #[tokio::test]
    async fn resolve_promotes_winner() {
        let dead = crate::mock::unreachable_endpoint().await;
        let sentinel = MockNode::start().await.unwrap();
        sentinel.set_master("mymaster", Endpoint::new("10.0.0.7", 6379));

        let config = ClusterConfig::builder()
            .with_endpoints([dead.clone(), sentinel.endpoint()])
            .with_cluster_name("mymaster")
            .build()
            .unwrap();
        let cluster = Cluster::new(config);

        assert_eq!(cluster.resolve(Role::Primary).await.unwrap(), Endpoint::new("10.0.0.7", 6379));
        assert_eq!(*cluster.nodes().snapshot(), vec![sentinel.endpoint(), dead]);
    }

    #[tokio::test]
    async fn resolve_error_carries_detail() {
        let sentinel = MockNode::start().await.unwrap();
        let config = ClusterConfig::builder().with_endpoint(sentinel.endpoint()).build().unwrap();
        let cluster = Cluster::new(config);

        let err = cluster.resolve(Role::Primary).await.unwrap_err();
        assert!(matches!(err, SdkError::Resolution { .. }));
        let detail = err.resolution().unwrap();
        assert_eq!(detail.cluster_name(), "defaultCluster");
        assert!(detail.cluster_unknown());
    }
}
