//! Single-node role queries.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use rand::Rng;
use sentinel_resp::{Command, Frame};

use crate::{
    config::LinkSettings,
    endpoint::{Endpoint, Role, RoleQuery},
    error::SdkError,
    link::Link,
};

/// Why one discovery node could not answer a role query.
///
/// Every variant is non-fatal: the resolver moves on to the next node.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The node could not be reached.
    #[error("connection failed: {source}")]
    Connect { source: SdkError },

    /// The query failed on an open connection (I/O, timeout, error reply).
    #[error("query failed: {source}")]
    Command { source: SdkError },

    /// The node does not monitor a cluster by that name.
    #[error("unknown cluster name '{cluster_name}'")]
    UnknownClusterName { cluster_name: String },

    /// The cluster is known but currently has no replica.
    #[error("no replicas available for cluster '{cluster_name}'")]
    NoReplicasAvailable { cluster_name: String },

    /// The reply did not have the expected shape.
    #[error("corrupted reply: {message}")]
    CorruptedReply { message: String },

    /// The probe panicked.
    #[error("probe panicked: {message}")]
    Panicked { message: String },
}

impl ProbeError {
    /// Returns true if the node never produced an answer.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Command { .. } | Self::Panicked { .. })
    }

    fn corrupted(message: impl Into<String>) -> Self {
        Self::CorruptedReply { message: message.into() }
    }
}

/// Asks one discovery node for an endpoint holding a role.
#[async_trait]
pub trait Probe: Send + Sync + fmt::Debug {
    /// Queries `node` once.
    ///
    /// Completes exactly once; any connection the probe opened is released
    /// before it returns.
    async fn probe(&self, node: &Endpoint, query: &RoleQuery) -> Result<Endpoint, ProbeError>;

    /// Returns the other discovery nodes `node` knows for `cluster_name`.
    async fn discover_peers(
        &self,
        _node: &Endpoint,
        _cluster_name: &str,
    ) -> Result<Vec<Endpoint>, ProbeError> {
        Ok(Vec::new())
    }
}

/// Probe speaking the discovery-node command set over a short-lived link.
#[derive(Debug, Clone, Default)]
pub struct SentinelProbe {
    settings: LinkSettings,
}

impl SentinelProbe {
    /// Creates a probe using the given connect and command timeouts.
    #[must_use]
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }

    async fn open(&self, node: &Endpoint) -> Result<Link, ProbeError> {
        Link::connect(node, &self.settings, None).await.map_err(|source| ProbeError::Connect { source })
    }

    async fn query(&self, node: &Endpoint, query: &RoleQuery) -> Result<Endpoint, ProbeError> {
        let link = self.open(node).await?;
        match query.role {
            Role::Discovery => {
                link.request(Command::new("PING"))
                    .await
                    .map_err(|source| ProbeError::Command { source })?;
                Ok(node.clone())
            },
            Role::Primary => {
                let reply = link
                    .request(
                        Command::new("SENTINEL")
                            .arg("get-master-addr-by-name")
                            .arg(&query.cluster_name),
                    )
                    .await
                    .map_err(|source| ProbeError::Command { source })?;
                parse_primary_reply(reply, &query.cluster_name)
            },
            Role::Replica => {
                let reply = link
                    .request(Command::new("SENTINEL").arg("replicas").arg(&query.cluster_name))
                    .await
                    .map_err(|source| match source {
                        SdkError::Server { message } if message.contains("No such master") => {
                            ProbeError::UnknownClusterName {
                                cluster_name: query.cluster_name.clone(),
                            }
                        },
                        source => ProbeError::Command { source },
                    })?;
                pick_replica(reply, &query.cluster_name)
            },
        }
    }

    async fn peers(&self, node: &Endpoint, cluster_name: &str) -> Result<Vec<Endpoint>, ProbeError> {
        let link = self.open(node).await?;
        let reply = link
            .request(Command::new("SENTINEL").arg("sentinels").arg(cluster_name))
            .await
            .map_err(|source| ProbeError::Command { source })?;
        let Some(entries) = reply.into_array() else {
            return Err(ProbeError::corrupted("sentinels reply is not an array"));
        };
        entries.into_iter().map(node_address).collect()
    }

    fn budget(&self) -> std::time::Duration {
        self.settings.connect_timeout + self.settings.command_timeout
    }
}

#[async_trait]
impl Probe for SentinelProbe {
    async fn probe(&self, node: &Endpoint, query: &RoleQuery) -> Result<Endpoint, ProbeError> {
        let budget = self.budget();
        tokio::time::timeout(budget, self.query(node, query)).await.unwrap_or_else(|_| {
            Err(ProbeError::Command { source: SdkError::Timeout { duration_ms: millis(budget) } })
        })
    }

    async fn discover_peers(
        &self,
        node: &Endpoint,
        cluster_name: &str,
    ) -> Result<Vec<Endpoint>, ProbeError> {
        let budget = self.budget();
        tokio::time::timeout(budget, self.peers(node, cluster_name)).await.unwrap_or_else(|_| {
            Err(ProbeError::Command { source: SdkError::Timeout { duration_ms: millis(budget) } })
        })
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parses the `[host, port]` reply of `get-master-addr-by-name`.
fn parse_primary_reply(reply: Frame, cluster_name: &str) -> Result<Endpoint, ProbeError> {
    if reply.is_nil() {
        return Err(ProbeError::UnknownClusterName { cluster_name: cluster_name.to_owned() });
    }
    let items = reply
        .into_array()
        .ok_or_else(|| ProbeError::corrupted("primary address reply is not an array"))?;
    let [host, port] = items.as_slice() else {
        return Err(ProbeError::corrupted(format!(
            "primary address reply has {} elements, expected 2",
            items.len()
        )));
    };
    let host = host.as_str().ok_or_else(|| ProbeError::corrupted("primary host is not a string"))?;
    let port = parse_port(port)?;
    Ok(Endpoint::new(host, port))
}

/// Chooses one replica uniformly at random and parses its address.
fn pick_replica(reply: Frame, cluster_name: &str) -> Result<Endpoint, ProbeError> {
    if reply.is_nil() {
        return Err(ProbeError::UnknownClusterName { cluster_name: cluster_name.to_owned() });
    }
    let mut entries =
        reply.into_array().ok_or_else(|| ProbeError::corrupted("replicas reply is not an array"))?;
    if entries.is_empty() {
        return Err(ProbeError::NoReplicasAvailable { cluster_name: cluster_name.to_owned() });
    }
    let index = rand::rng().random_range(0..entries.len());
    node_address(entries.swap_remove(index))
}

/// Reads `ip` and `port` from a flattened attribute list.
fn node_address(entry: Frame) -> Result<Endpoint, ProbeError> {
    let attributes = parse_attributes(entry)?;
    let host = attributes
        .get("ip")
        .ok_or_else(|| ProbeError::corrupted("node entry has no 'ip' field"))?;
    let port = attributes
        .get("port")
        .ok_or_else(|| ProbeError::corrupted("node entry has no 'port' field"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ProbeError::corrupted(format!("invalid port '{port}'")))?;
    Ok(Endpoint::new(host.as_str(), port))
}

/// Turns `[k1, v1, k2, v2, ...]` into a map. An odd-length list is rejected
/// whole.
fn parse_attributes(entry: Frame) -> Result<HashMap<String, String>, ProbeError> {
    let fields =
        entry.into_array().ok_or_else(|| ProbeError::corrupted("node entry is not an array"))?;
    if fields.len() % 2 != 0 {
        return Err(ProbeError::corrupted(format!(
            "node entry has an odd number of fields ({})",
            fields.len()
        )));
    }
    fields
        .chunks_exact(2)
        .map(|pair| match (pair[0].as_str(), pair[1].as_str()) {
            (Some(key), Some(value)) => Ok((key.to_owned(), value.to_owned())),
            _ => Err(ProbeError::corrupted("node entry field is not a string")),
        })
        .collect()
}

fn parse_port(frame: &Frame) -> Result<u16, ProbeError> {
    frame
        .as_integer()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| ProbeError::corrupted(format!("invalid port {frame:?}")))
}
