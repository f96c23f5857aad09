//! Step descriptors and ordering.
//!
//! Steps are explicit descriptors returned by driver interfaces, never
//! discovered by reflection. A step's priority decides its place in
//! the run order; priority zero or below means "not run by default".

use roundhouse_common::Verb;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Plugin facet a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepInterface {
    Power,
    Management,
    Deploy,
    Clean,
    Bios,
    Raid,
}

impl StepInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepInterface::Power => "power",
            StepInterface::Management => "management",
            StepInterface::Deploy => "deploy",
            StepInterface::Clean => "clean",
            StepInterface::Bios => "bios",
            StepInterface::Raid => "raid",
        }
    }

    /// Fixed precedence used to break priority ties, lowest first.
    pub fn precedence(&self) -> u8 {
        match self {
            StepInterface::Power => 0,
            StepInterface::Management => 1,
            StepInterface::Deploy => 2,
            StepInterface::Clean => 3,
            StepInterface::Bios => 4,
            StepInterface::Raid => 5,
        }
    }
}

impl fmt::Display for StepInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work contributing to a transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub interface: StepInterface,
    pub name: String,
    /// Descending run order; `<= 0` is skipped unless explicitly
    /// requested for a manual run
    pub priority: i32,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    /// Whether an abort may interrupt the transition while this step's
    /// out-of-band work is pending
    #[serde(default)]
    pub abortable: bool,
}

impl Step {
    pub fn new(interface: StepInterface, name: impl Into<String>, priority: i32) -> Self {
        Self {
            interface,
            name: name.into(),
            priority,
            args: HashMap::new(),
            abortable: false,
        }
    }

    pub fn with_args(mut self, args: HashMap<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_abortable(mut self, abortable: bool) -> Self {
        self.abortable = abortable;
        self
    }
}

/// What a step reported back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Completed in-band; run the next step
    Done,
    /// Handed off to an out-of-band job or remote agent; suspend until
    /// an external event signals completion
    Async,
    /// The node must power-cycle before execution can continue
    RebootRequired,
    /// The step failed; the transition moves to its failure sink
    Failure(String),
}

/// Why steps are being collected from a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPurpose {
    Verify,
    Deploy,
    Clean,
    Rescue,
}

impl StepPurpose {
    /// Map an operator verb to the step purpose its transition runs.
    /// `Abort` never plans steps.
    pub fn for_verb(verb: Verb) -> Option<StepPurpose> {
        match verb {
            Verb::Manage => Some(StepPurpose::Verify),
            Verb::Provide | Verb::Clean | Verb::Delete => Some(StepPurpose::Clean),
            Verb::Deploy => Some(StepPurpose::Deploy),
            Verb::Rescue | Verb::Unrescue => Some(StepPurpose::Rescue),
            Verb::Abort => None,
        }
    }
}

/// Order a merged step list for execution: drop disabled steps, then
/// sort by descending priority with interface precedence and name as
/// tie-breaks.
pub fn order_steps(mut steps: Vec<Step>) -> Vec<Step> {
    steps.retain(|s| s.priority > 0);
    steps.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.interface.precedence().cmp(&b.interface.precedence()))
            .then_with(|| a.name.cmp(&b.name))
    });
    steps
}
