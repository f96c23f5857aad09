//! Storage layer for roundhouse.
//!
//! Backend-agnostic contract over the node and conductor rows. The
//! only write primitive for nodes is an optimistic-versioned
//! compare-and-swap: callers read a row (which carries its `version`),
//! build a [`NodePatch`], and submit it at the observed version.
//! Concurrent writers lose with [`StoreError::VersionConflict`] and
//! retry from a fresh read. This keeps the contract portable across
//! storage backends that have no advisory locks.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use roundhouse_common::{ConductorRecord, Node, ProvisionState};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {0}")]
    VersionConflict(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Partial update of a node row, applied atomically by
/// [`Store::compare_and_swap`]. `None` leaves a field untouched;
/// nullable fields use a double `Option` so they can be cleared.
#[derive(Debug, Default, Clone)]
pub struct NodePatch {
    pub name: Option<Option<String>>,
    pub provision_state: Option<ProvisionState>,
    pub target_provision_state: Option<Option<ProvisionState>>,
    pub reservation: Option<Option<String>>,
    pub maintenance: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub driver_internal: Option<HashMap<String, Value>>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: ProvisionState) -> Self {
        self.provision_state = Some(state);
        self
    }

    pub fn with_target(mut self, target: Option<ProvisionState>) -> Self {
        self.target_provision_state = Some(target);
        self
    }

    pub fn with_reservation(mut self, reservation: Option<String>) -> Self {
        self.reservation = Some(reservation);
        self
    }

    pub fn with_maintenance(mut self, maintenance: bool) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_driver_internal(mut self, map: HashMap<String, Value>) -> Self {
        self.driver_internal = Some(map);
        self
    }

    /// Whether this patch represents state-machine activity, i.e.
    /// whether applying it should refresh `provision_updated_at`.
    /// Step advances only touch `driver_internal`, but still count.
    pub fn touches_provisioning(&self) -> bool {
        self.provision_state.is_some()
            || self.target_provision_state.is_some()
            || self.driver_internal.is_some()
    }

    /// Apply this patch to a node in place. Backends share this so the
    /// merge semantics cannot drift between them.
    pub fn apply(&self, node: &mut Node) {
        if let Some(name) = &self.name {
            node.name = name.clone();
        }
        if let Some(state) = self.provision_state {
            node.provision_state = state;
        }
        if let Some(target) = &self.target_provision_state {
            node.target_provision_state = *target;
        }
        if let Some(reservation) = &self.reservation {
            node.reservation = reservation.clone();
        }
        if let Some(maintenance) = self.maintenance {
            node.maintenance = maintenance;
        }
        if let Some(error) = &self.last_error {
            node.last_error = error.clone();
        }
        if let Some(map) = &self.driver_internal {
            node.driver_internal = map.clone();
        }
    }
}

/// Query filter for [`Store::list_nodes`].
#[derive(Debug, Default, Clone)]
pub struct NodeFilter {
    /// Match any of these provision states
    pub provision_states: Option<Vec<ProvisionState>>,
    /// Match nodes that do (true) or do not (false) hold a reservation
    pub reserved: Option<bool>,
    /// Match nodes reserved by this conductor
    pub reserved_by: Option<String>,
    pub conductor_group: Option<String>,
    pub driver: Option<String>,
    pub maintenance: Option<bool>,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(mut self, states: Vec<ProvisionState>) -> Self {
        self.provision_states = Some(states);
        self
    }

    pub fn with_reserved(mut self, reserved: bool) -> Self {
        self.reserved = Some(reserved);
        self
    }

    pub fn with_reserved_by(mut self, conductor: impl Into<String>) -> Self {
        self.reserved_by = Some(conductor.into());
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(states) = &self.provision_states {
            if !states.contains(&node.provision_state) {
                return false;
            }
        }
        if let Some(reserved) = self.reserved {
            if node.reservation.is_some() != reserved {
                return false;
            }
        }
        if let Some(holder) = &self.reserved_by {
            if node.reservation.as_deref() != Some(holder.as_str()) {
                return false;
            }
        }
        if let Some(group) = &self.conductor_group {
            if node.conductor_group.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        if let Some(driver) = &self.driver {
            if &node.driver != driver {
                return false;
            }
        }
        if let Some(maintenance) = self.maintenance {
            if node.maintenance != maintenance {
                return false;
            }
        }
        true
    }
}

/// Backend-agnostic storage interface.
///
/// All methods are async for compatibility with network-based
/// backends; the in-memory backend exists for tests and single-host
/// development.
#[async_trait]
pub trait Store: Send + Sync {
    // === Node operations ===

    /// Fetch a node row; the returned row carries its current version
    async fn get_node(&self, id: Uuid) -> Result<Node>;

    /// Create a node; fails if the id already exists
    async fn insert_node(&self, node: &Node) -> Result<()>;

    /// Delete a node, returning whether it existed
    async fn delete_node(&self, id: Uuid) -> Result<bool>;

    /// List nodes matching the filter
    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Apply a patch iff the row is still at `expected_version`.
    /// Bumps the version and returns the updated row.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: NodePatch,
    ) -> Result<Node>;

    // === Conductor operations ===

    /// Create or refresh a conductor's presence row
    async fn upsert_conductor(&self, record: &ConductorRecord) -> Result<()>;

    async fn get_conductor(&self, hostname: &str) -> Result<Option<ConductorRecord>>;

    async fn list_conductors(&self) -> Result<Vec<ConductorRecord>>;

    /// Graceful-shutdown marker; returns whether the row existed
    async fn mark_conductor_offline(&self, hostname: &str) -> Result<bool>;
}
