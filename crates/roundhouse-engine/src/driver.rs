//! Driver interfaces and the driver registry.
//!
//! A driver is a named bundle of capability interfaces: any number of
//! step sources (one per plugin facet) plus a power interface.
//! Conductors register the drivers they can operate; nodes reference a
//! driver by name. Registration is explicit — there is no global
//! registry and no runtime discovery.

use crate::error::{EngineError, Result};
use crate::step::{Step, StepInterface, StepOutcome, StepPurpose};
use async_trait::async_trait;
use roundhouse_common::Node;
use std::collections::HashMap;
use std::sync::Arc;

/// One plugin facet's contribution to step execution.
///
/// `run_step` is invoked at least once per step: a crash between a
/// step completing and its completion being persisted re-invokes it.
/// Implementations must therefore be idempotent on re-invocation —
/// this is a contract on step authors, not something the engine can
/// enforce.
#[async_trait]
pub trait StepSource: Send + Sync {
    /// Which facet this source implements
    fn interface(&self) -> StepInterface;

    /// Steps this source contributes for the given purpose. Called
    /// freshly for every transition; the result is frozen afterwards.
    async fn steps(&self, node: &Node, purpose: StepPurpose) -> Result<Vec<Step>>;

    /// Execute one step against the node.
    async fn run_step(&self, node: &Node, step: &Step) -> Result<StepOutcome>;
}

/// Out-of-band power control for a node.
#[async_trait]
pub trait PowerInterface: Send + Sync {
    async fn power_on(&self, node: &Node) -> Result<()>;

    async fn power_off(&self, node: &Node) -> Result<()>;

    /// Power-cycle, used when a step demands a reboot mid-transition
    async fn reboot(&self, node: &Node) -> Result<()>;
}

/// A named set of capability interfaces.
pub struct Driver {
    name: String,
    sources: Vec<Arc<dyn StepSource>>,
    power: Arc<dyn PowerInterface>,
}

impl Driver {
    pub fn new(name: impl Into<String>, power: Arc<dyn PowerInterface>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            power,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn StepSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[Arc<dyn StepSource>] {
        &self.sources
    }

    pub fn power(&self) -> &Arc<dyn PowerInterface> {
        &self.power
    }

    pub fn source_for(&self, interface: StepInterface) -> Option<&Arc<dyn StepSource>> {
        self.sources.iter().find(|s| s.interface() == interface)
    }

    /// Dispatch a step to the source owning its interface.
    pub async fn run_step(&self, node: &Node, step: &Step) -> Result<StepOutcome> {
        let source = self
            .source_for(step.interface)
            .ok_or_else(|| EngineError::MissingInterface {
                driver: self.name.clone(),
                interface: step.interface,
            })?;
        source.run_step(node, step).await
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("interfaces", &self.sources.iter().map(|s| s.interface()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Name-keyed driver lookup, owned by the conductor that registered it.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Driver) {
        self.drivers.insert(driver.name().to_string(), Arc::new(driver));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDriver(name.to_string()))
    }

    /// Registered driver names, used for the conductor's presence row.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}
