//! Tracking of the supervised connections of one cluster handle.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use snafu::ensure;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    config::{ClientOptions, ClusterConfig, LinkSettings},
    discovery::Resolver,
    endpoint::{Role, RoleQuery},
    error::{ConfigSnafu, Result},
    listener::FailoverListener,
    signal::ConnectionEvent,
    supervisor::SentinelConnection,
};

struct RegistryInner {
    config: ClusterConfig,
    resolver: Resolver,
    connections: Mutex<HashMap<u64, SentinelConnection>>,
    listener: Mutex<Option<FailoverListener>>,
    listener_started: AtomicBool,
    next_id: AtomicU64,
}

impl RegistryInner {
    /// Drops a tracked connection that ended because it was closed.
    ///
    /// Returns false if the connection is still tracked.
    fn forget_if_closing(&self, id: u64) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(&id) {
            Some(connection) if !connection.is_closing() => false,
            Some(_) => {
                connections.remove(&id);
                debug!(connection = id, remaining = connections.len(), "connection forgotten");
                true
            },
            None => true,
        }
    }

    fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.quit();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// The set of connections created by one cluster handle, plus the single
/// failover listener shared by all of them.
///
/// Cloning is cheap; all clones share the same set.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.len())
            .field("listener_started", &self.listener_started())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry. The failover listener is not started until
    /// the first client is created.
    #[must_use]
    pub fn new(config: ClusterConfig, resolver: Resolver) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                resolver,
                connections: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                listener_started: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Creates and tracks a supervised connection.
    ///
    /// Returns immediately; resolution and connect run in the background.
    /// The first call also starts the failover listener. Must be called
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Config` if the options override the cluster name
    /// with an empty one, the command timeout with zero, or the reconnect
    /// policy with an invalid one. Nothing is started in that case.
    pub fn create_client(&self, options: ClientOptions) -> Result<SentinelConnection> {
        let config = &self.inner.config;
        if let Some(policy) = &options.reconnect_policy {
            policy.validate()?;
        }
        ensure!(
            options.cluster_name.as_ref().is_none_or(|name| !name.is_empty()),
            ConfigSnafu { message: "cluster_name cannot be empty" }
        );
        ensure!(
            options.command_timeout.is_none_or(|timeout| !timeout.is_zero()),
            ConfigSnafu { message: "command_timeout cannot be zero" }
        );

        self.ensure_listener();

        let cluster_name = options.cluster_name.unwrap_or_else(|| config.cluster_name.clone());
        let settings = LinkSettings {
            connect_timeout: config.connect_timeout,
            command_timeout: options.command_timeout.unwrap_or(config.command_timeout),
        };
        let policy = options.reconnect_policy.unwrap_or_else(|| config.reconnect_policy.clone());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (connection, events) = SentinelConnection::spawn(
            id,
            RoleQuery::new(options.role, cluster_name),
            self.inner.resolver.clone(),
            settings,
            policy,
        );
        self.inner.connections.lock().insert(id, connection.clone());
        tokio::spawn(watch(Arc::downgrade(&self.inner), id, events));

        debug!(connection = id, role = %options.role, "client created");
        Ok(connection)
    }

    /// Forces every tracked connection that is not closing to re-resolve and
    /// reconnect.
    ///
    /// Connections with a reconnect already in flight are left alone, so
    /// calling this repeatedly is safe. Returns the number of connections
    /// that started a reconnect.
    pub fn reconnect_all(&self) -> usize {
        let targets: Vec<_> = self
            .inner
            .connections
            .lock()
            .values()
            .filter(|connection| !connection.is_closing())
            .cloned()
            .collect();
        let forced = targets.iter().filter(|connection| connection.force_reconnect()).count();
        info!(tracked = targets.len(), forced, "reconnecting all connections");
        forced
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Returns true when no connection is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.connections.lock().is_empty()
    }

    /// Returns true if `id` is tracked.
    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.inner.connections.lock().contains_key(&id)
    }

    /// Snapshot of the tracked connections.
    #[must_use]
    pub fn connections(&self) -> Vec<SentinelConnection> {
        self.inner.connections.lock().values().cloned().collect()
    }

    /// Returns true once the failover listener has been started.
    #[must_use]
    pub fn listener_started(&self) -> bool {
        self.inner.listener_started.load(Ordering::Acquire)
    }

    /// The failover listener's connection, once started.
    #[must_use]
    pub fn listener_connection(&self) -> Option<SentinelConnection> {
        self.inner.listener.lock().as_ref().map(|listener| listener.connection().clone())
    }

    /// Closes every tracked connection and the failover listener.
    pub fn shutdown(&self) {
        self.inner.close_all();
    }

    fn ensure_listener(&self) {
        if self.inner.listener_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let config = &self.inner.config;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (connection, events) = SentinelConnection::spawn(
            id,
            RoleQuery::new(Role::Discovery, config.cluster_name.clone()),
            self.inner.resolver.clone(),
            config.link_settings(),
            config.reconnect_policy.clone(),
        );

        let registry = Arc::downgrade(&self.inner);
        let listener =
            FailoverListener::spawn(connection, events, config.failover_channel.clone(), move || {
                if let Some(inner) = registry.upgrade() {
                    Registry { inner }.reconnect_all();
                }
            });
        *self.inner.listener.lock() = Some(listener);
        debug!(connection = id, channel = %config.failover_channel, "failover listener started");
    }
}

/// Forgets a connection once it ends after an intentional close.
///
/// A connection that ended by running out of reconnect attempts stays
/// tracked and can be revived, so watching continues past its `End`.
async fn watch(
    registry: Weak<RegistryInner>,
    id: u64,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::End) => {
                let Some(inner) = registry.upgrade() else { break };
                if inner.forget_if_closing(id) {
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use sentinel_test_utils::assert_eventually;

    use super::*;
    use crate::{
        config::ReconnectPolicy,
        discovery::{NodeList, SentinelProbe},
        mock::MockNode,
    };

    async fn registry(sentinel: &MockNode) -> Registry {
        let config = ClusterConfig::builder()
            .with_endpoint(sentinel.endpoint())
            .with_cluster_name("mymaster")
            .with_connect_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let resolver = Resolver::builder()
            .nodes(NodeList::new(config.endpoints().to_vec()))
            .probe(Arc::new(SentinelProbe::new(config.link_settings())))
            .build();
        Registry::new(config, resolver)
    }

    #[tokio::test]
    async fn listener_starts_lazily_once() {
        let sentinel = MockNode::start().await.unwrap();
        let data = MockNode::start().await.unwrap();
        sentinel.set_master("mymaster", data.endpoint());
        let registry = registry(&sentinel).await;

        assert!(!registry.listener_started());
        registry.create_client(ClientOptions::default()).unwrap();
        let listener = registry.listener_connection().unwrap();
        registry.create_client(ClientOptions::default()).unwrap();

        assert!(registry.listener_started());
        assert_eq!(registry.listener_connection().unwrap().id(), listener.id());
        assert_eq!(listener.role(), Role::Discovery);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(listener.id()));
    }

    #[tokio::test]
    async fn quit_removes_only_that_connection() {
        let sentinel = MockNode::start().await.unwrap();
        let data = MockNode::start().await.unwrap();
        sentinel.set_master("mymaster", data.endpoint());
        let registry = registry(&sentinel).await;

        let first = registry.create_client(ClientOptions::default()).unwrap();
        let second = registry.create_client(ClientOptions::default()).unwrap();
        first.wait_ready().await.unwrap();

        first.quit();
        assert!(assert_eventually(Duration::from_secs(2), || !registry.contains(first.id())).await);
        assert!(registry.contains(second.id()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let sentinel = MockNode::start().await.unwrap();
        let registry = registry(&sentinel).await;
        let client = registry.create_client(ClientOptions::default()).unwrap();

        registry.shutdown();

        assert!(client.is_closing());
        assert!(registry.listener_connection().is_none());
        assert!(assert_eventually(Duration::from_secs(2), || registry.is_empty()).await);
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected() {
        let sentinel = MockNode::start().await.unwrap();
        let registry = registry(&sentinel).await;

        let bad_policy = ClientOptions::builder()
            .reconnect_policy(ReconnectPolicy::builder().factor(0.5).build())
            .build();
        let err = registry.create_client(bad_policy).unwrap_err();
        assert!(err.to_string().contains("factor"));

        let zero_timeout = ClientOptions::builder().command_timeout(Duration::ZERO).build();
        assert!(registry.create_client(zero_timeout).is_err());

        let empty_name = ClientOptions::builder().cluster_name("").build();
        assert!(registry.create_client(empty_name).is_err());

        assert!(registry.is_empty());
        assert!(!registry.listener_started());
    }

    #[tokio::test]
    async fn reconnect_all_revives_exhausted_connection() {
        let sentinel = MockNode::start().await.unwrap();
        let data = MockNode::start().await.unwrap();
        let registry = registry(&sentinel).await;

        let once = ReconnectPolicy::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .jitter(0.0)
            .max_attempts(1)
            .build();
        let client = registry
            .create_client(ClientOptions::builder().reconnect_policy(once).build())
            .unwrap();
        let mut events = client.events();
        let ended = sentinel_test_utils::next_matching(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ConnectionEvent::End)
        })
        .await;
        assert!(ended.is_some());
        assert!(registry.contains(client.id()));

        sentinel.set_master("mymaster", data.endpoint());
        assert_eq!(registry.reconnect_all(), 1);
        assert!(assert_eventually(Duration::from_secs(5), || client.is_connected()).await);
        assert_eq!(client.current_endpoint(), Some(data.endpoint()));

        client.quit();
        assert!(assert_eventually(Duration::from_secs(2), || registry.is_empty()).await);
    }
}
