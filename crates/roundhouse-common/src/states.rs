//! The node provisioning state machine.
//!
//! States and verbs are validated against a static transition table:
//! `(current_state, verb)` resolves to a [`TransitionPlan`] carrying
//! the in-flight state, the wait state used while execution is
//! suspended, and the terminal success/failure states. Requests that
//! have no table entry are invalid from that state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionState {
    /// Newly registered, not yet verified
    Enroll,
    /// Driver credentials being verified
    Verifying,
    /// Verified and under operator control
    Manageable,
    /// Clean steps executing
    Cleaning,
    /// Cleaning suspended pending an external event
    CleanWait,
    /// Ready to be deployed
    Available,
    /// Deploy steps executing
    Deploying,
    /// Deployment suspended pending an external event
    DeployWait,
    /// Workload deployed and running
    Active,
    /// Being torn down
    Deleting,
    /// Rescue environment being prepared
    Rescuing,
    /// Rescue preparation suspended pending an external event
    RescueWait,
    /// Rescue environment active
    Rescue,
    /// Returning from rescue to the deployed workload
    Unrescuing,
    DeployFailed,
    CleanFailed,
    RescueFailed,
    /// Unrecoverable bookkeeping failure
    Error,
}

impl ProvisionState {
    /// Machine-readable state string for APIs and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Enroll => "enroll",
            ProvisionState::Verifying => "verifying",
            ProvisionState::Manageable => "manageable",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::CleanWait => "clean-wait",
            ProvisionState::Available => "available",
            ProvisionState::Deploying => "deploying",
            ProvisionState::DeployWait => "deploy-wait",
            ProvisionState::Active => "active",
            ProvisionState::Deleting => "deleting",
            ProvisionState::Rescuing => "rescuing",
            ProvisionState::RescueWait => "rescue-wait",
            ProvisionState::Rescue => "rescue",
            ProvisionState::Unrescuing => "unrescuing",
            ProvisionState::DeployFailed => "deploy-failed",
            ProvisionState::CleanFailed => "clean-failed",
            ProvisionState::RescueFailed => "rescue-failed",
            ProvisionState::Error => "error",
        }
    }

    /// Suspended pending an external event (agent heartbeat, reboot,
    /// or an out-of-band job completing).
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            ProvisionState::CleanWait | ProvisionState::DeployWait | ProvisionState::RescueWait
        )
    }

    /// Any state in which a transition is currently executing or
    /// suspended. These are the states the timeout sweep watches.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ProvisionState::Verifying
                | ProvisionState::Cleaning
                | ProvisionState::CleanWait
                | ProvisionState::Deploying
                | ProvisionState::DeployWait
                | ProvisionState::Deleting
                | ProvisionState::Rescuing
                | ProvisionState::RescueWait
                | ProvisionState::Unrescuing
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProvisionState::DeployFailed
                | ProvisionState::CleanFailed
                | ProvisionState::RescueFailed
                | ProvisionState::Error
        )
    }

    /// All in-flight states, for store queries
    pub fn in_flight_states() -> Vec<ProvisionState> {
        vec![
            ProvisionState::Verifying,
            ProvisionState::Cleaning,
            ProvisionState::CleanWait,
            ProvisionState::Deploying,
            ProvisionState::DeployWait,
            ProvisionState::Deleting,
            ProvisionState::Rescuing,
            ProvisionState::RescueWait,
            ProvisionState::Unrescuing,
        ]
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-requested lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Take an enrolled node under management (runs verification)
    Manage,
    /// Clean a manageable node and make it available
    Provide,
    /// Run clean steps without changing the end state
    Clean,
    /// Provision the node's workload
    Deploy,
    /// Tear the workload down and return the node to the pool
    Delete,
    /// Boot the rescue environment
    Rescue,
    /// Leave the rescue environment
    Unrescue,
    /// Cancel the in-flight transition
    Abort,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Manage => "manage",
            Verb::Provide => "provide",
            Verb::Clean => "clean",
            Verb::Deploy => "deploy",
            Verb::Delete => "delete",
            Verb::Rescue => "rescue",
            Verb::Unrescue => "unrescue",
            Verb::Abort => "abort",
        }
    }

    /// Verbs that start new workload activity are refused while the
    /// node is in maintenance; teardown and bookkeeping still work.
    pub fn allowed_in_maintenance(&self) -> bool {
        !matches!(self, Verb::Deploy | Verb::Provide | Verb::Rescue)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved transition for a `(state, verb)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub verb: Verb,
    /// State while steps are executing under the reservation
    pub running: ProvisionState,
    /// State while execution is suspended awaiting a callback
    pub waiting: ProvisionState,
    pub success: ProvisionState,
    pub failure: ProvisionState,
    /// Whether `abort` is honored from the waiting state
    pub abortable: bool,
}

/// Look up the transition table.
///
/// Returns `None` when the verb is not legal from the given state.
/// `Abort` is deliberately absent: it is resolved against the
/// in-flight transition's plan, not against the table.
pub fn transition(from: ProvisionState, verb: Verb) -> Option<TransitionPlan> {
    use ProvisionState::*;

    let plan = |running, waiting, success, failure, abortable| {
        Some(TransitionPlan { verb, running, waiting, success, failure, abortable })
    };

    match (from, verb) {
        (Enroll, Verb::Manage) => plan(Verifying, Verifying, Manageable, Enroll, false),
        (CleanFailed, Verb::Manage) => plan(Verifying, Verifying, Manageable, CleanFailed, false),

        (Manageable, Verb::Provide) => plan(Cleaning, CleanWait, Available, CleanFailed, true),
        (Manageable, Verb::Clean) => plan(Cleaning, CleanWait, Manageable, CleanFailed, true),
        (CleanFailed, Verb::Clean) => plan(Cleaning, CleanWait, Manageable, CleanFailed, true),

        (Available, Verb::Deploy) => plan(Deploying, DeployWait, Active, DeployFailed, true),
        // rebuild in place, and retry from the failure sink
        (Active, Verb::Deploy) => plan(Deploying, DeployWait, Active, DeployFailed, true),
        (DeployFailed, Verb::Deploy) => plan(Deploying, DeployWait, Active, DeployFailed, true),

        (Active, Verb::Delete) => plan(Deleting, Deleting, Available, CleanFailed, false),
        (DeployFailed, Verb::Delete) => plan(Deleting, Deleting, Available, CleanFailed, false),

        (Active, Verb::Rescue) => plan(Rescuing, RescueWait, Rescue, RescueFailed, false),
        (Rescue, Verb::Unrescue) => plan(Unrescuing, Unrescuing, Active, RescueFailed, false),
        (RescueFailed, Verb::Unrescue) => plan(Unrescuing, Unrescuing, Active, RescueFailed, false),

        _ => None,
    }
}
