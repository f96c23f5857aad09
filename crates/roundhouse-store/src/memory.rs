//! In-memory store for tests and single-host development.

use crate::{NodeFilter, NodePatch, Result, Store, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use roundhouse_common::{ConductorRecord, Node};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// `RwLock<HashMap>`-backed [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<Uuid, Node>>,
    conductors: RwLock<HashMap<String, ConductorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_node(&self, id: Uuid) -> Result<Node> {
        self.nodes
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))
    }

    async fn insert_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.id) {
            return Err(StoreError::AlreadyExists(format!("node {}", node.id)));
        }
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: Uuid) -> Result<bool> {
        Ok(self.nodes.write().unwrap().remove(&id).is_some())
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: NodePatch,
    ) -> Result<Node> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;

        if node.version != expected_version {
            return Err(StoreError::VersionConflict(id));
        }

        let now = Utc::now();
        patch.apply(node);
        node.version += 1;
        node.updated_at = now;
        if patch.touches_provisioning() {
            node.provision_updated_at = now;
        }

        Ok(node.clone())
    }

    async fn upsert_conductor(&self, record: &ConductorRecord) -> Result<()> {
        let mut conductors = self.conductors.write().unwrap();
        let mut row = record.clone();
        // keep the original registration time across refreshes
        if let Some(existing) = conductors.get(&record.hostname) {
            row.registered_at = existing.registered_at;
        }
        conductors.insert(row.hostname.clone(), row);
        Ok(())
    }

    async fn get_conductor(&self, hostname: &str) -> Result<Option<ConductorRecord>> {
        Ok(self.conductors.read().unwrap().get(hostname).cloned())
    }

    async fn list_conductors(&self) -> Result<Vec<ConductorRecord>> {
        Ok(self.conductors.read().unwrap().values().cloned().collect())
    }

    async fn mark_conductor_offline(&self, hostname: &str) -> Result<bool> {
        let mut conductors = self.conductors.write().unwrap();
        match conductors.get_mut(hostname) {
            Some(record) => {
                record.online = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
