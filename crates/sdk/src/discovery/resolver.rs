//! Endpoint resolution across the discovery-node list.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::{debug, info, warn};

use super::{NodeList, Probe, ProbeError};
use crate::endpoint::{Endpoint, Role, RoleQuery};

/// One node's failure during a resolution.
#[derive(Debug)]
pub struct ProbeFailure {
    /// The discovery node that was asked.
    pub node: Endpoint,
    /// Why it could not answer.
    pub error: ProbeError,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.error)
    }
}

/// Every discovery node failed to answer a role query.
#[derive(Debug, thiserror::Error)]
#[error("failed to find a {} from any of the discovery nodes", resolution_target(.role))]
pub struct ResolutionExhausted {
    role: Role,
    cluster_name: String,
    failures: Vec<ProbeFailure>,
}

fn resolution_target(role: &Role) -> &'static str {
    match role {
        Role::Discovery => "sentinel",
        Role::Primary | Role::Replica => "master/replica",
    }
}

impl ResolutionExhausted {
    /// Creates the error from the per-node failures, in the order tried.
    #[must_use]
    pub fn new(role: Role, cluster_name: impl Into<String>, failures: Vec<ProbeFailure>) -> Self {
        Self { role, cluster_name: cluster_name.into(), failures }
    }

    /// Requested role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Requested cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Per-node failures in the order the nodes were tried.
    #[must_use]
    pub fn failures(&self) -> &[ProbeFailure] {
        &self.failures
    }

    /// Returns true if no node produced any answer at all.
    #[must_use]
    pub fn all_unreachable(&self) -> bool {
        self.failures.iter().all(|f| f.error.is_unreachable())
    }

    /// Returns true if at least one node answered that it does not know the
    /// cluster name.
    #[must_use]
    pub fn cluster_unknown(&self) -> bool {
        self.failures.iter().any(|f| matches!(f.error, ProbeError::UnknownClusterName { .. }))
    }
}

/// Resolves role queries against a shared [`NodeList`].
///
/// Nodes are tried strictly one after another in the list's current order;
/// the first node that answers wins and is moved to the front so later
/// resolutions try it first.
#[derive(Debug, Clone)]
pub struct Resolver {
    nodes: NodeList,
    probe: Arc<dyn Probe>,
    peer_learning: bool,
}

#[bon::bon]
impl Resolver {
    /// Creates a resolver.
    #[builder]
    pub fn new(nodes: NodeList, probe: Arc<dyn Probe>, #[builder(default)] peer_learning: bool) -> Self {
        Self { nodes, probe, peer_learning }
    }

    /// Returns the shared node list.
    #[must_use]
    pub fn nodes(&self) -> &NodeList {
        &self.nodes
    }

    /// Finds an endpoint holding `query.role`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionExhausted`] if every node failed, or the list is
    /// empty. The list order is left unchanged in that case.
    pub async fn resolve(&self, query: &RoleQuery) -> Result<Endpoint, ResolutionExhausted> {
        let snapshot = self.nodes.snapshot();
        let mut failures = Vec::new();

        for node in snapshot.iter() {
            let attempt = AssertUnwindSafe(self.probe.probe(node, query)).catch_unwind().await;
            let error = match attempt {
                Ok(Ok(endpoint)) => {
                    self.nodes.promote(node);
                    info!(
                        node = %node,
                        role = %query.role,
                        cluster = %query.cluster_name,
                        endpoint = %endpoint,
                        "resolved endpoint"
                    );
                    if self.peer_learning && query.role != Role::Discovery {
                        self.learn_peers(node, &query.cluster_name).await;
                    }
                    return Ok(endpoint);
                },
                Ok(Err(error)) => error,
                Err(payload) => ProbeError::Panicked { message: panic_message(payload.as_ref()) },
            };
            debug!(node = %node, role = %query.role, error = %error, "discovery node failed");
            failures.push(ProbeFailure { node: node.clone(), error });
        }

        warn!(
            role = %query.role,
            cluster = %query.cluster_name,
            nodes = failures.len(),
            "resolution exhausted every discovery node"
        );
        Err(ResolutionExhausted::new(query.role, query.cluster_name.clone(), failures))
    }

    async fn learn_peers(&self, node: &Endpoint, cluster_name: &str) {
        let discovered =
            AssertUnwindSafe(self.probe.discover_peers(node, cluster_name)).catch_unwind().await;
        match discovered {
            Ok(Ok(peers)) => {
                let added = self.nodes.merge(&peers);
                if added > 0 {
                    info!(node = %node, added, "learned discovery nodes");
                }
            },
            Ok(Err(error)) => debug!(node = %node, error = %error, "peer discovery failed"),
            Err(_) => debug!(node = %node, "peer discovery panicked"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
