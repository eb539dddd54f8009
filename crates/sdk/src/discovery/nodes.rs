//! Shared discovery-node priority list.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::endpoint::Endpoint;

/// Ordered list of discovery nodes shared by every resolution of a cluster.
///
/// Readers take an immutable snapshot; writers publish a new list with
/// `ArcSwap::rcu`, so concurrent promotions never tear the list. When two
/// resolutions succeed at once, the last promotion wins.
///
/// Cloning is cheap; all clones share the same list.
#[derive(Debug, Clone)]
pub struct NodeList {
    inner: Arc<ArcSwap<Vec<Endpoint>>>,
}

impl NodeList {
    /// Creates a list in the given priority order. Duplicates are kept.
    #[must_use]
    pub fn new(nodes: Vec<Endpoint>) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(nodes)) }
    }

    /// Returns the current order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.inner.load_full()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Returns true when no discovery node is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Returns the node currently tried first.
    #[must_use]
    pub fn first(&self) -> Option<Endpoint> {
        self.inner.load().first().cloned()
    }

    /// Moves the first occurrence of `node` to the front.
    ///
    /// The relative order of the remaining nodes is preserved. A node that
    /// is no longer in the list is left out.
    pub fn promote(&self, node: &Endpoint) {
        self.inner.rcu(|current| {
            let Some(index) = current.iter().position(|n| n == node) else {
                return Arc::clone(current);
            };
            if index == 0 {
                return Arc::clone(current);
            }
            let mut next = Vec::with_capacity(current.len());
            next.push(current[index].clone());
            next.extend(
                current
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, n)| n.clone()),
            );
            Arc::new(next)
        });
    }

    /// Appends nodes not yet in the list, keeping existing entries in place.
    ///
    /// Returns the number of nodes added.
    pub fn merge(&self, discovered: &[Endpoint]) -> usize {
        let mut added = 0;
        self.inner.rcu(|current| {
            let mut next = current.as_ref().clone();
            added = 0;
            for node in discovered {
                if !next.contains(node) {
                    next.push(node.clone());
                    added += 1;
                }
            }
            if added == 0 { Arc::clone(current) } else { Arc::new(next) }
        });
        added
    }
}
