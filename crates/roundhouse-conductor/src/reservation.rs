//! Exclusive per-node reservations.
//!
//! The reservation field on the node row is the fleet's mutual
//! exclusion primitive: every state mutation happens under a [`Lease`]
//! obtained from the [`TaskManager`]. Acquisition checks three things
//! in order — an existing holder's liveness, ring ownership, and the
//! optimistic version — so two conductors that both believe they own a
//! node during a ring-recompute window still cannot both win.
//!
//! This module is the only writer of the `reservation` field.

use crate::error::{ConductorError, Result};
use roundhouse_common::Node;
use roundhouse_ring::{HashRing, MembershipRegistry};
use roundhouse_store::{NodePatch, Store, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retries when clearing a reservation races with another writer.
const RELEASE_ATTEMPTS: u32 = 3;

/// Acquires and releases node reservations for one conductor.
pub struct TaskManager {
    store: Arc<dyn Store>,
    membership: Arc<MembershipRegistry>,
    ring: HashRing,
    conductor_id: String,
    cas_retries: u32,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn Store>,
        membership: Arc<MembershipRegistry>,
        ring: HashRing,
        conductor_id: impl Into<String>,
        cas_retries: u32,
    ) -> Self {
        Self {
            store,
            membership,
            ring,
            conductor_id: conductor_id.into(),
            cas_retries,
        }
    }

    pub fn conductor_id(&self) -> &str {
        &self.conductor_id
    }

    /// Take the exclusive reservation on a node.
    ///
    /// Fails with [`ConductorError::NodeLocked`] when another live
    /// conductor holds it, [`ConductorError::NotOwner`] when the ring
    /// assigns the node to a different live conductor, and
    /// [`ConductorError::Conflict`] when version races exhaust the
    /// retry budget. A reservation held by a dead conductor is stolen,
    /// with the stale holder logged.
    pub async fn acquire(&self, node_id: Uuid, purpose: &str) -> Result<Lease> {
        for attempt in 0..=self.cas_retries {
            let node = self.store.get_node(node_id).await?;
            let snapshot = self.membership.snapshot().await?;

            if let Some(holder) = node.reservation.as_deref() {
                if holder != self.conductor_id {
                    if snapshot.is_alive(holder) {
                        return Err(ConductorError::NodeLocked {
                            node: node_id,
                            holder: holder.to_string(),
                        });
                    }
                    warn!(node = %node_id, holder, "stealing reservation from dead conductor");
                }
            }

            let owners = self.ring.owners_for(
                &snapshot,
                node_id,
                &node.driver,
                node.conductor_group.as_deref(),
            );
            if let Some(first) = owners.first() {
                if first != &self.conductor_id {
                    // a better-placed live conductor exists
                    return Err(ConductorError::NotOwner { node: node_id });
                }
            }

            let patch =
                NodePatch::new().with_reservation(Some(self.conductor_id.clone()));
            match self
                .store
                .compare_and_swap(node_id, node.version, patch)
                .await
            {
                Ok(node) => {
                    debug!(node = %node_id, purpose, "reservation acquired");
                    return Ok(Lease {
                        store: self.store.clone(),
                        conductor_id: self.conductor_id.clone(),
                        node,
                        purpose: purpose.to_string(),
                        released: false,
                    });
                }
                Err(StoreError::VersionConflict(_)) => {
                    debug!(node = %node_id, attempt, "acquire lost a version race; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ConductorError::Conflict { node: node_id })
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("conductor_id", &self.conductor_id)
            .field("cas_retries", &self.cas_retries)
            .finish_non_exhaustive()
    }
}

/// A held reservation.
///
/// Every conductor code path that mutates a node goes through a lease:
/// acquire before the first write, release on every exit path. The
/// `Drop` impl is a backstop that spawns a best-effort release and
/// logs the leak; correct code calls [`Lease::release`] explicitly.
pub struct Lease {
    store: Arc<dyn Store>,
    conductor_id: String,
    node: Node,
    purpose: String,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("conductor_id", &self.conductor_id)
            .field("node", &self.node)
            .field("purpose", &self.purpose)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn conductor_id(&self) -> &str {
        &self.conductor_id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Write through the lease, keeping the tracked row and version
    /// current. A version conflict here means something else wrote the
    /// row while we held the lock — surfaced, never retried silently.
    pub async fn update(&mut self, patch: NodePatch) -> Result<()> {
        match self
            .store
            .compare_and_swap(self.node.id, self.node.version, patch)
            .await
        {
            Ok(node) => {
                self.node = node;
                Ok(())
            }
            Err(StoreError::VersionConflict(_)) => Err(ConductorError::Conflict {
                node: self.node.id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Adopt a row another component updated on our behalf (the step
    /// engine writes through the store directly).
    pub fn absorb(&mut self, node: Node) {
        debug_assert_eq!(node.id, self.node.id);
        self.node = node;
    }

    /// Clear the reservation if we still hold it.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_reservation(&self.store, self.node.id, &self.conductor_id).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            node = %self.node.id,
            purpose = %self.purpose,
            "lease dropped without release; clearing reservation in the background"
        );
        let store = self.store.clone();
        let node_id = self.node.id;
        let conductor_id = self.conductor_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = release_reservation(&store, node_id, &conductor_id).await {
                    warn!(node = %node_id, error = %e, "backstop release failed");
                }
            });
        }
    }
}

/// Clear a node's reservation iff it is held by `conductor_id`,
/// retrying through version races with other writers.
async fn release_reservation(
    store: &Arc<dyn Store>,
    node_id: Uuid,
    conductor_id: &str,
) -> Result<()> {
    for _ in 0..RELEASE_ATTEMPTS {
        let node = match store.get_node(node_id).await {
            Ok(node) => node,
            // the node was deleted while we held it; nothing to clear
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if !node.is_reserved_by(conductor_id) {
            // already clear, or force-released by the sweep
            return Ok(());
        }

        match store
            .compare_and_swap(node_id, node.version, NodePatch::new().with_reservation(None))
            .await
        {
            Ok(_) => {
                debug!(node = %node_id, "reservation released");
                return Ok(());
            }
            Err(StoreError::VersionConflict(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ConductorError::Conflict { node: node_id })
}
