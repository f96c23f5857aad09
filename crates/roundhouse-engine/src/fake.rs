//! Scripted fake driver for tests and single-host development.
//!
//! The fake step source returns a configured step list and replays
//! scripted outcomes per step name, recording every invocation so
//! tests can assert exactly-once execution across suspends and
//! resumes. The fake power interface records requested power actions.

use crate::driver::{Driver, PowerInterface, StepSource};
use crate::error::Result;
use crate::step::{Step, StepInterface, StepOutcome, StepPurpose};
use async_trait::async_trait;
use roundhouse_common::Node;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Power interface that records actions instead of touching hardware.
#[derive(Debug, Default)]
pub struct FakePower {
    actions: Arc<Mutex<Vec<String>>>,
}

impl FakePower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the recorded action log
    pub fn actions(&self) -> Arc<Mutex<Vec<String>>> {
        self.actions.clone()
    }
}

#[async_trait]
impl PowerInterface for FakePower {
    async fn power_on(&self, node: &Node) -> Result<()> {
        self.actions.lock().unwrap().push(format!("power-on:{}", node.id));
        Ok(())
    }

    async fn power_off(&self, node: &Node) -> Result<()> {
        self.actions.lock().unwrap().push(format!("power-off:{}", node.id));
        Ok(())
    }

    async fn reboot(&self, node: &Node) -> Result<()> {
        self.actions.lock().unwrap().push(format!("reboot:{}", node.id));
        Ok(())
    }
}

/// Step source with a scripted step list and scripted outcomes.
///
/// Outcomes are replayed per step name in order; once a step's script
/// is exhausted (or was never set) further invocations return `Done`.
pub struct FakeStepSource {
    interface: StepInterface,
    steps: Vec<(StepPurpose, Step)>,
    outcomes: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl FakeStepSource {
    pub fn new(interface: StepInterface) -> Self {
        Self {
            interface,
            steps: Vec::new(),
            outcomes: Mutex::new(HashMap::new()),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a step offered for the given purpose
    pub fn with_step(mut self, purpose: StepPurpose, step: Step) -> Self {
        self.steps.push((purpose, step));
        self
    }

    /// Script the outcomes replayed for a step name
    pub fn with_outcomes(self, name: impl Into<String>, outcomes: Vec<StepOutcome>) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(name.into(), outcomes.into());
        self
    }

    /// Shared handle to the invocation log (step names in run order)
    pub fn invocations(&self) -> Arc<Mutex<Vec<String>>> {
        self.invocations.clone()
    }
}

#[async_trait]
impl StepSource for FakeStepSource {
    fn interface(&self) -> StepInterface {
        self.interface
    }

    async fn steps(&self, _node: &Node, purpose: StepPurpose) -> Result<Vec<Step>> {
        Ok(self
            .steps
            .iter()
            .filter(|(p, _)| *p == purpose)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn run_step(&self, _node: &Node, step: &Step) -> Result<StepOutcome> {
        self.invocations.lock().unwrap().push(step.name.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&step.name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(StepOutcome::Done);
        Ok(outcome)
    }
}

/// A ready-made fake driver for the dev binary: a three-step deploy
/// and a single clean step, all completing in-band.
pub fn default_fake_driver() -> Driver {
    let deploy = FakeStepSource::new(StepInterface::Deploy)
        .with_step(
            StepPurpose::Deploy,
            Step::new(StepInterface::Deploy, "prepare", 100),
        )
        .with_step(
            StepPurpose::Deploy,
            Step::new(StepInterface::Deploy, "write-image", 80).with_abortable(true),
        )
        .with_step(
            StepPurpose::Deploy,
            Step::new(StepInterface::Deploy, "finalize", 60),
        );
    let clean = FakeStepSource::new(StepInterface::Clean).with_step(
        StepPurpose::Clean,
        Step::new(StepInterface::Clean, "erase-disks", 80).with_abortable(true),
    );

    Driver::new("fake", Arc::new(FakePower::new()))
        .with_source(Arc::new(deploy))
        .with_source(Arc::new(clean))
}
