//! The persisted continuation record.
//!
//! Execution state lives in the node row, not in process memory: the
//! conductor that resumes a suspended transition is routinely a
//! different process from the one that started it. The record freezes
//! the step list at transition start (re-planning mid-transition is
//! impossible) and tracks how far execution has advanced.

use crate::error::Result;
use crate::step::Step;
use roundhouse_common::{ProvisionState, TransitionPlan, Verb};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Key under which the record is stored in `Node::driver_internal`.
pub const CONTINUATION_KEY: &str = "continuation";

/// Persisted execution state of one in-flight transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Continuation {
    /// Verb that started this transition; a record is never resumed
    /// under a different verb
    pub verb: Verb,
    pub running_state: ProvisionState,
    pub wait_state: ProvisionState,
    pub success_state: ProvisionState,
    pub fail_state: ProvisionState,
    /// Whether abort is honored while suspended
    pub abortable: bool,

    /// Frozen, ordered step list
    pub steps: Vec<Step>,
    /// Index of the step the engine will run next. On suspension the
    /// suspended step counts as complete — its completion is exactly
    /// what the external event signals — so resume continues after it.
    pub step_index: usize,

    /// Suspended pending an out-of-band job or agent callback
    pub polling: bool,
    /// Suspended across a requested power-cycle
    pub reboot_requested: bool,

    /// Token the resuming agent must present; guards against stale or
    /// spoofed agents hijacking a transition
    pub agent_token: Uuid,
}

impl Continuation {
    pub fn new(plan: &TransitionPlan, steps: Vec<Step>) -> Self {
        Self {
            verb: plan.verb,
            running_state: plan.running,
            wait_state: plan.waiting,
            success_state: plan.success,
            fail_state: plan.failure,
            abortable: plan.abortable,
            steps,
            step_index: 0,
            polling: false,
            reboot_requested: false,
            agent_token: Uuid::now_v7(),
        }
    }

    /// Read the record out of a node's scratch map, if present.
    pub fn load(driver_internal: &HashMap<String, Value>) -> Result<Option<Self>> {
        match driver_internal.get(CONTINUATION_KEY) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Write the record into a node's scratch map.
    pub fn store_into(&self, driver_internal: &mut HashMap<String, Value>) -> Result<()> {
        driver_internal.insert(CONTINUATION_KEY.to_string(), serde_json::to_value(self)?);
        Ok(())
    }

    /// Remove the record from a node's scratch map.
    pub fn clear(driver_internal: &mut HashMap<String, Value>) {
        driver_internal.remove(CONTINUATION_KEY);
    }

    /// The step the engine will run next, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.step_index)
    }

    /// Whether the transition is suspended waiting for an external
    /// event to call resume.
    pub fn awaiting_callback(&self) -> bool {
        self.polling || self.reboot_requested
    }
}
