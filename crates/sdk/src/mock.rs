//! Mock RESP node for SDK integration testing.
//!
//! A [`MockNode`] is an in-process TCP server that speaks enough RESP2 to
//! stand in for both a discovery node and a data node.
//!
//! # Features
//!
//! - **Discovery answers**: primary address, replica and peer lists per cluster name
//! - **Data commands**: `PING`, `ECHO`, `SET`, `GET`
//! - **Pub/sub**: `SUBSCRIBE` and `PUBLISH`, plus [`MockNode::publish`] from the test
//! - **Failure injection**: corrupt replica replies, dropped connections
//! - **Request counting**: `SENTINEL` queries served
//!
//! # Example
//!
//! ```no_run
//! use sentinel_sdk::mock::MockNode;
//! use sentinel_sdk::{ClientOptions, Cluster, ClusterConfig};
//!
//! #[tokio::test]
//! async fn test_bind() {
//!     let data = MockNode::start().await.unwrap();
//!     let sentinel = MockNode::start().await.unwrap();
//!     sentinel.set_master("mymaster", data.endpoint());
//!
//!     let config = ClusterConfig::builder()
//!         .with_endpoint(sentinel.endpoint())
//!         .with_cluster_name("mymaster")
//!         .build()
//!         .unwrap();
//!     let cluster = Cluster::new(config);
//!     let client = cluster.create_client(ClientOptions::default()).unwrap();
//!     client.wait_ready().await.unwrap();
//! }
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use sentinel_resp::{Command, Frame, RespCodec};
use snafu::ResultExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    endpoint::Endpoint,
    error::{IoSnafu, Result},
};

/// Shared state for the mock node.
#[derive(Default)]
struct MockState {
    /// Plain key/value data.
    data: RwLock<HashMap<String, Bytes>>,
    /// Primary address per cluster name.
    masters: RwLock<HashMap<String, Endpoint>>,
    /// Replica addresses per cluster name.
    replicas: RwLock<HashMap<String, Vec<Endpoint>>>,
    /// Peer discovery nodes per cluster name.
    sentinels: RwLock<HashMap<String, Vec<Endpoint>>>,
    /// Cluster names whose replica entries are sent with an odd field count.
    corrupt_replicas: RwLock<Vec<String>>,
    /// Push channels of subscribed connections, per channel name.
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Frame>>>>,
    /// `SENTINEL` commands served.
    sentinel_queries: AtomicUsize,
    /// Connections accepted.
    accepted: AtomicUsize,
}

impl MockState {
    fn handle(&self, command: &Command, push: &mpsc::UnboundedSender<Frame>) -> Frame {
        let args = command.args();
        let name = command.name().to_ascii_uppercase();
        match (name.as_str(), args.len()) {
            ("PING", 1) => Frame::simple("PONG"),
            ("PING", 2) | ("ECHO", 2) => Frame::bulk(args[1].clone()),
            ("GET", 2) => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                self.data.read().get(&key).cloned().map_or_else(Frame::nil, |value| Frame::bulk(value))
            },
            ("SET", 3) => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                self.data.write().insert(key, args[2].clone());
                Frame::simple("OK")
            },
            ("SUBSCRIBE", 2) => {
                let channel = String::from_utf8_lossy(&args[1]).into_owned();
                self.subscribers.lock().entry(channel.clone()).or_default().push(push.clone());
                Frame::array(vec![Frame::from("subscribe"), Frame::from(channel), Frame::Integer(1)])
            },
            ("PUBLISH", 3) => {
                let channel = String::from_utf8_lossy(&args[1]).into_owned();
                let delivered = self.publish(&channel, args[2].clone());
                Frame::Integer(i64::try_from(delivered).unwrap_or(i64::MAX))
            },
            ("SENTINEL", 3) => {
                self.sentinel_queries.fetch_add(1, Ordering::SeqCst);
                let subcommand = String::from_utf8_lossy(&args[1]).to_ascii_lowercase();
                let cluster = String::from_utf8_lossy(&args[2]).into_owned();
                self.sentinel(&subcommand, &cluster)
            },
            _ => Frame::error(format!("ERR unknown command '{}'", command.name())),
        }
    }

    fn sentinel(&self, subcommand: &str, cluster: &str) -> Frame {
        match subcommand {
            "get-master-addr-by-name" => match self.masters.read().get(cluster) {
                Some(endpoint) => Frame::array(vec![
                    Frame::from(endpoint.host.as_str()),
                    Frame::from(endpoint.port.to_string()),
                ]),
                None => Frame::Array(None),
            },
            "replicas" | "slaves" => {
                if !self.masters.read().contains_key(cluster)
                    && !self.replicas.read().contains_key(cluster)
                {
                    return Frame::error("ERR No such master with that name");
                }
                let corrupt = self.corrupt_replicas.read().iter().any(|c| c == cluster);
                let replicas = self.replicas.read().get(cluster).cloned().unwrap_or_default();
                Frame::array(
                    replicas.iter().map(|endpoint| node_entry(endpoint, "slave", corrupt)).collect(),
                )
            },
            "sentinels" => {
                let peers = self.sentinels.read().get(cluster).cloned().unwrap_or_default();
                Frame::array(
                    peers.iter().map(|endpoint| node_entry(endpoint, "sentinel", false)).collect(),
                )
            },
            _ => Frame::error(format!("ERR unknown sentinel subcommand '{subcommand}'")),
        }
    }

    fn publish(&self, channel: &str, payload: Bytes) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(channel) else { return 0 };
        let message = Frame::array(vec![
            Frame::from("message"),
            Frame::from(channel),
            Frame::bulk(payload),
        ]);
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        senders.len()
    }
}

/// Flattened attribute list the way discovery nodes describe a node.
fn node_entry(endpoint: &Endpoint, flags: &str, corrupt: bool) -> Frame {
    let mut fields = vec![
        Frame::from("name"),
        Frame::from(endpoint.to_string()),
        Frame::from("ip"),
        Frame::from(endpoint.host.as_str()),
        Frame::from("port"),
        Frame::from(endpoint.port.to_string()),
        Frame::from("flags"),
        Frame::from(flags),
    ];
    if corrupt {
        fields.push(Frame::from("dangling"));
    }
    Frame::array(fields)
}

/// Mock RESP node for testing.
pub struct MockNode {
    state: Arc<MockState>,
    endpoint: Endpoint,
    shutdown: CancellationToken,
    connections: Arc<Mutex<CancellationToken>>,
}

impl MockNode {
    /// Starts a new mock node on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Io` if binding fails.
    pub async fn start() -> Result<Self> {
        Self::start_on_port(0).await
    }

    /// Starts a new mock node on a specific port.
    ///
    /// Use port 0 to let the OS assign an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Io` if binding to the port fails.
    pub async fn start_on_port(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .context(IoSnafu)?;
        let local_addr = listener.local_addr().context(IoSnafu)?;

        let state = Arc::new(MockState::default());
        let shutdown = CancellationToken::new();
        let connections = Arc::new(Mutex::new(shutdown.child_token()));

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown.clone(),
            Arc::clone(&connections),
        ));

        Ok(Self { state, endpoint: Endpoint::from(local_addr), shutdown, connections })
    }

    /// Returns the address the node listens on.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Answers `get-master-addr-by-name` for `cluster` with `endpoint`.
    pub fn set_master(&self, cluster: &str, endpoint: Endpoint) {
        self.state.masters.write().insert(cluster.to_owned(), endpoint);
    }

    /// Forgets the primary of `cluster`, so the node reports it as unknown.
    pub fn remove_master(&self, cluster: &str) {
        self.state.masters.write().remove(cluster);
        self.state.replicas.write().remove(cluster);
    }

    /// Sets the replica list reported for `cluster`.
    pub fn set_replicas(&self, cluster: &str, replicas: Vec<Endpoint>) {
        self.state.replicas.write().insert(cluster.to_owned(), replicas);
    }

    /// Makes every replica entry of `cluster` carry an odd number of fields.
    pub fn set_corrupt_replicas(&self, cluster: &str, corrupt: bool) {
        let mut names = self.state.corrupt_replicas.write();
        names.retain(|name| name != cluster);
        if corrupt {
            names.push(cluster.to_owned());
        }
    }

    /// Sets the peer discovery nodes reported for `cluster`.
    pub fn set_sentinels(&self, cluster: &str, peers: Vec<Endpoint>) {
        self.state.sentinels.write().insert(cluster.to_owned(), peers);
    }

    /// Publishes a message to every subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        self.state.publish(channel, payload.into())
    }

    /// Moves the primary of `cluster` to `new` and announces it the way a
    /// discovery node does after a failover.
    ///
    /// Returns the number of subscribers reached.
    pub fn announce_switch(&self, channel: &str, cluster: &str, new: Endpoint) -> usize {
        let old = self.state.masters.write().insert(cluster.to_owned(), new.clone());
        let old = old.unwrap_or_else(|| new.clone());
        let payload = format!("{cluster} {} {} {} {}", old.host, old.port, new.host, new.port);
        self.publish(channel, payload)
    }

    /// Closes every open client connection. The node keeps accepting new ones.
    pub fn drop_connections(&self) {
        let fresh = self.shutdown.child_token();
        let old = std::mem::replace(&mut *self.connections.lock(), fresh);
        old.cancel();
    }

    /// Returns a stored value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.data.read().get(key).cloned()
    }

    /// Returns the number of `SENTINEL` commands served.
    #[must_use]
    pub fn sentinel_query_count(&self) -> usize {
        self.state.sentinel_queries.load(Ordering::SeqCst)
    }

    /// Returns the number of connections accepted.
    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Returns the number of live subscriptions to `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut subscribers = self.state.subscribers.lock();
        subscribers.get_mut(channel).map_or(0, |senders| {
            senders.retain(|tx| !tx.is_closed());
            senders.len()
        })
    }

    /// Resets counters and discovery answers.
    pub fn reset(&self) {
        self.state.data.write().clear();
        self.state.masters.write().clear();
        self.state.replicas.write().clear();
        self.state.sentinels.write().clear();
        self.state.corrupt_replicas.write().clear();
        self.state.sentinel_queries.store(0, Ordering::SeqCst);
    }

    /// Shuts the node down, closing the listener and every connection.
    pub fn shutdown(self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<MockState>,
    shutdown: CancellationToken,
    connections: Arc<Mutex<CancellationToken>>,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, _)) = accepted else { continue };
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let token = connections.lock().clone();
        tokio::spawn(serve(stream, Arc::clone(&state), token));
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, RespCodec::default());
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Frame>();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(push) = push_rx.recv() => {
                if framed.send(push).await.is_err() {
                    break;
                }
            },
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else { break };
                let reply = match Command::from_frame(frame) {
                    Some(command) => state.handle(&command, &push_tx),
                    None => Frame::error("ERR protocol error: expected a command array"),
                };
                if framed.send(reply).await.is_err() {
                    break;
                }
            },
        }
    }
}

/// Returns a loopback endpoint nothing is listening on.
///
/// The port is bound and released, so connecting to it is refused.
pub async fn unreachable_endpoint() -> Endpoint {
    match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await {
        Ok(listener) => match listener.local_addr() {
            Ok(addr) => Endpoint::from(addr),
            Err(_) => Endpoint::new("127.0.0.1", 1),
        },
        Err(_) => Endpoint::new("127.0.0.1", 1),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn settings() -> crate::config::LinkSettings {
        crate::config::LinkSettings::default()
    }

    async fn request(node: &MockNode, command: Command) -> Frame {
        let link = crate::link::Link::connect(&node.endpoint(), &settings(), None).await.unwrap();
        link.request(command).await.unwrap_or_else(|e| Frame::error(e.to_string()))
    }

    #[tokio::test]
    async fn test_master_address_reply() {
        let node = MockNode::start().await.unwrap();
        node.set_master("mymaster", Endpoint::new("10.0.0.5", 6380));

        let reply =
            request(&node, Command::new("SENTINEL").arg("get-master-addr-by-name").arg("mymaster"))
                .await;
        assert_eq!(reply, Frame::array(vec![Frame::from("10.0.0.5"), Frame::from("6380")]));

        let reply =
            request(&node, Command::new("SENTINEL").arg("get-master-addr-by-name").arg("other"))
                .await;
        assert!(reply.is_nil());
        assert_eq!(node.sentinel_query_count(), 2);
    }

    #[tokio::test]
    async fn test_replicas_reply_for_unknown_cluster() {
        let node = MockNode::start().await.unwrap();
        let reply = request(&node, Command::new("SENTINEL").arg("replicas").arg("nope")).await;
        assert!(reply.error_message().is_some_and(|m| m.contains("No such master")));
    }

    #[tokio::test]
    async fn test_corrupt_replica_entries_have_odd_length() {
        let node = MockNode::start().await.unwrap();
        node.set_replicas("mymaster", vec![Endpoint::new("10.0.0.6", 6379)]);
        node.set_corrupt_replicas("mymaster", true);

        let reply = request(&node, Command::new("SENTINEL").arg("replicas").arg("mymaster")).await;
        let entries = reply.into_array().unwrap();
        let fields = entries.into_iter().next().unwrap().into_array().unwrap();
        assert_eq!(fields.len() % 2, 1);
    }

    #[tokio::test]
    async fn test_drop_connections_keeps_accepting() {
        let node = MockNode::start().await.unwrap();
        let link = crate::link::Link::connect(&node.endpoint(), &settings(), None).await.unwrap();
        link.request(Command::new("PING")).await.unwrap();

        node.drop_connections();
        let closed = sentinel_test_utils::assert_eventually(
            std::time::Duration::from_secs(2),
            || !link.is_connected(),
        )
        .await;
        assert!(closed);

        assert_eq!(request(&node, Command::new("PING")).await.as_str(), Some("PONG"));
        assert_eq!(node.accepted_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let node = MockNode::start().await.unwrap();
        let reply = request(&node, Command::new("FLUSHALL")).await;
        assert!(reply.error_message().is_some_and(|m| m.contains("unknown command")));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_refuses() {
        let endpoint = unreachable_endpoint().await;
        assert!(TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await.is_err());
    }
}
