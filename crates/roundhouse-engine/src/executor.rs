//! The step executor.
//!
//! Runs a transition's frozen step list one step at a time, persisting
//! the continuation after every advance so that a crash at any point
//! loses at most the step in flight (which re-runs under the step
//! idempotency contract). Suspension is represented as persisted state
//! plus a released reservation, never as a blocked task: the process
//! that resumes may not be the process that suspended.
//!
//! The executor writes `provision_state`, `target_provision_state`,
//! `last_error`, and the continuation data; it never touches the
//! `reservation` field, which belongs to the reservation manager.

use crate::continuation::Continuation;
use crate::driver::DriverRegistry;
use crate::error::{EngineError, Result};
use crate::step::{order_steps, Step, StepOutcome, StepPurpose};
use roundhouse_common::{Node, ProvisionState, TransitionPlan, Verb};
use roundhouse_store::{NodePatch, Store};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event emitted during step execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started { node: Uuid, verb: Verb },
    StepStarted { node: Uuid, step: String },
    StepCompleted { node: Uuid, step: String },
    /// Execution suspended pending a callback; `reboot` marks a
    /// suspension across a requested power-cycle
    Suspended { node: Uuid, step: String, reboot: bool },
    Completed { node: Uuid, state: ProvisionState },
    Failed { node: Uuid, state: ProvisionState, error: String },
}

/// How a call into the executor left the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All steps ran; the node reached the transition's success state
    Completed(ProvisionState),
    /// Execution suspended in the given wait state; the continuation
    /// holds the resume point
    Suspended(ProvisionState),
    /// A step failed; the node is in the transition's failure sink
    Failed(ProvisionState),
}

/// Executes frozen step lists against nodes.
pub struct StepExecutor {
    registry: Arc<DriverRegistry>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl StepExecutor {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Subscribe to execution events
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Compute the ordered step list for a verb against a node.
    ///
    /// Steps are merged from every interface the driver registers,
    /// then ordered; the caller freezes the result into the
    /// continuation. Computed freshly per call — never cached.
    pub async fn plan(&self, node: &Node, verb: Verb) -> Result<Vec<Step>> {
        let purpose =
            StepPurpose::for_verb(verb).ok_or(EngineError::UnsupportedVerb(verb))?;
        let driver = self.registry.get(&node.driver)?;

        let mut steps = Vec::new();
        for source in driver.sources() {
            steps.extend(source.steps(node, purpose).await?);
        }
        Ok(order_steps(steps))
    }

    /// Begin executing a validated transition.
    ///
    /// Persists the frozen step list and the in-flight state in one
    /// write, then runs steps until the list ends, a step suspends, or
    /// a step fails. The caller must hold the node's reservation.
    pub async fn start(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        plan: &TransitionPlan,
    ) -> Result<RunOutcome> {
        let steps = self.plan(node, plan.verb).await?;
        self.launch(store, node, plan, steps).await
    }

    /// Begin a manual run with operator-supplied steps.
    ///
    /// Manual steps run exactly as requested, in the given order;
    /// disabled (priority `<= 0`) steps are allowed because the
    /// operator named them explicitly.
    pub async fn start_manual(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        plan: &TransitionPlan,
        steps: Vec<Step>,
    ) -> Result<RunOutcome> {
        self.launch(store, node, plan, steps).await
    }

    async fn launch(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        plan: &TransitionPlan,
        steps: Vec<Step>,
    ) -> Result<RunOutcome> {
        let _ = self.events.send(ExecutionEvent::Started {
            node: node.id,
            verb: plan.verb,
        });

        if steps.is_empty() {
            // nothing to run for this verb; complete immediately
            let patch = NodePatch::new()
                .with_state(plan.success)
                .with_target(None)
                .with_last_error(None);
            *node = store.compare_and_swap(node.id, node.version, patch).await?;
            info!(node = %node.id, verb = %plan.verb, state = %plan.success,
                "transition had no steps to run");
            let _ = self.events.send(ExecutionEvent::Completed {
                node: node.id,
                state: plan.success,
            });
            return Ok(RunOutcome::Completed(plan.success));
        }

        info!(node = %node.id, verb = %plan.verb, steps = steps.len(),
            "starting transition");
        let record = Continuation::new(plan, steps);
        let mut scratch = node.driver_internal.clone();
        record.store_into(&mut scratch)?;
        let patch = NodePatch::new()
            .with_state(plan.running)
            .with_target(Some(plan.success))
            .with_last_error(None)
            .with_driver_internal(scratch);
        *node = store.compare_and_swap(node.id, node.version, patch).await?;

        self.run(store, node, record).await
    }

    /// Resume a suspended transition from its persisted continuation.
    ///
    /// The caller must hold the node's reservation. A continuation is
    /// only resumed for the transition that created it; a node whose
    /// target no longer matches is rejected.
    pub async fn resume(&self, store: &Arc<dyn Store>, node: &mut Node) -> Result<RunOutcome> {
        let mut record = Continuation::load(&node.driver_internal)?
            .ok_or(EngineError::MissingContinuation(node.id))?;

        if node.target_provision_state != Some(record.success_state) {
            return Err(EngineError::VerbMismatch(node.id));
        }

        debug!(node = %node.id, verb = %record.verb, step_index = record.step_index,
            "resuming transition");
        record.polling = false;
        record.reboot_requested = false;
        let mut scratch = node.driver_internal.clone();
        record.store_into(&mut scratch)?;
        let patch = NodePatch::new()
            .with_state(record.running_state)
            .with_driver_internal(scratch);
        *node = store.compare_and_swap(node.id, node.version, patch).await?;

        self.run(store, node, record).await
    }

    /// Run steps from the continuation's current position.
    async fn run(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        mut record: Continuation,
    ) -> Result<RunOutcome> {
        let driver = self.registry.get(&node.driver)?;

        while let Some(step) = record.current_step().cloned() {
            debug!(node = %node.id, step = %step.name, interface = %step.interface,
                "running step");
            let _ = self.events.send(ExecutionEvent::StepStarted {
                node: node.id,
                step: step.name.clone(),
            });

            match driver.run_step(node, &step).await? {
                StepOutcome::Done => {
                    record.step_index += 1;
                    let mut scratch = node.driver_internal.clone();
                    record.store_into(&mut scratch)?;
                    let patch = NodePatch::new().with_driver_internal(scratch);
                    *node = store.compare_and_swap(node.id, node.version, patch).await?;
                    info!(node = %node.id, step = %step.name, "step completed");
                    let _ = self.events.send(ExecutionEvent::StepCompleted {
                        node: node.id,
                        step: step.name.clone(),
                    });
                }
                StepOutcome::Async => {
                    // the external completion signal is what finishes
                    // this step; resume continues after it
                    record.step_index += 1;
                    record.polling = true;
                    self.suspend(store, node, &record).await?;
                    info!(node = %node.id, step = %step.name,
                        "step handed off; suspended awaiting callback");
                    let _ = self.events.send(ExecutionEvent::Suspended {
                        node: node.id,
                        step: step.name.clone(),
                        reboot: false,
                    });
                    return Ok(RunOutcome::Suspended(record.wait_state));
                }
                StepOutcome::RebootRequired => {
                    record.step_index += 1;
                    record.reboot_requested = true;
                    self.suspend(store, node, &record).await?;
                    if let Err(e) = driver.power().reboot(node).await {
                        return self
                            .fail(store, node, &record, &step.name, e.to_string())
                            .await;
                    }
                    info!(node = %node.id, step = %step.name,
                        "power-cycle issued; suspended awaiting agent heartbeat");
                    let _ = self.events.send(ExecutionEvent::Suspended {
                        node: node.id,
                        step: step.name.clone(),
                        reboot: true,
                    });
                    return Ok(RunOutcome::Suspended(record.wait_state));
                }
                StepOutcome::Failure(reason) => {
                    return self.fail(store, node, &record, &step.name, reason).await;
                }
            }
        }

        // list exhausted: the transition succeeded
        let mut scratch = node.driver_internal.clone();
        Continuation::clear(&mut scratch);
        let patch = NodePatch::new()
            .with_state(record.success_state)
            .with_target(None)
            .with_driver_internal(scratch);
        *node = store.compare_and_swap(node.id, node.version, patch).await?;
        info!(node = %node.id, verb = %record.verb, state = %record.success_state,
            "transition completed");
        let _ = self.events.send(ExecutionEvent::Completed {
            node: node.id,
            state: record.success_state,
        });
        Ok(RunOutcome::Completed(record.success_state))
    }

    /// Persist the continuation and park the node in its wait state.
    async fn suspend(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        record: &Continuation,
    ) -> Result<()> {
        let mut scratch = node.driver_internal.clone();
        record.store_into(&mut scratch)?;
        let patch = NodePatch::new()
            .with_state(record.wait_state)
            .with_driver_internal(scratch);
        *node = store.compare_and_swap(node.id, node.version, patch).await?;
        Ok(())
    }

    /// Move the node to the transition's failure sink.
    async fn fail(
        &self,
        store: &Arc<dyn Store>,
        node: &mut Node,
        record: &Continuation,
        step: &str,
        reason: String,
    ) -> Result<RunOutcome> {
        let error = format!("step '{step}' failed: {reason}");
        warn!(node = %node.id, step, error = %reason, "step failed");

        let mut scratch = node.driver_internal.clone();
        Continuation::clear(&mut scratch);
        let patch = NodePatch::new()
            .with_state(record.fail_state)
            .with_target(None)
            .with_last_error(Some(error.clone()))
            .with_driver_internal(scratch);
        *node = store.compare_and_swap(node.id, node.version, patch).await?;

        let _ = self.events.send(ExecutionEvent::Failed {
            node: node.id,
            state: record.fail_state,
            error,
        });
        Ok(RunOutcome::Failed(record.fail_state))
    }
}
