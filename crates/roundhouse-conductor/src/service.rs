//! The conductor service.
//!
//! Wires the membership registry, hash ring, reservation manager, and
//! step executor together, and exposes the entry points the API and
//! agent layers call: request a transition, abort one, deliver an
//! agent heartbeat, and read nodes/conductors. Background loops keep
//! the presence row fresh and run the recovery sweeps.

use crate::config::ConductorConfig;
use crate::error::{ConductorError, Result};
use crate::reservation::{Lease, TaskManager};
use crate::sweeps::{sweep_stale_reservations, sweep_wait_timeouts};
use roundhouse_common::{
    transition, ConductorRecord, Node, ProvisionState, Verb,
};
use roundhouse_engine::{
    Continuation, DriverRegistry, ExecutionEvent, RunOutcome, Step, StepExecutor,
};
use roundhouse_ring::{HashRing, MembershipRegistry};
use roundhouse_store::{NodeFilter, Store};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What an agent heartbeat accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// State the node was left in
    pub state: ProvisionState,
    /// Whether the transition reached a terminal state
    pub finished: bool,
}

/// One worker process of the fleet.
pub struct Conductor {
    config: ConductorConfig,
    store: Arc<dyn Store>,
    membership: Arc<MembershipRegistry>,
    task_manager: TaskManager,
    executor: StepExecutor,
    registry: Arc<DriverRegistry>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Conductor {
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn Store>,
        registry: Arc<DriverRegistry>,
    ) -> Self {
        let membership = Arc::new(MembershipRegistry::new(
            store.clone(),
            config.liveness_window(),
            config.snapshot_interval(),
        ));
        let task_manager = TaskManager::new(
            store.clone(),
            membership.clone(),
            HashRing::new(config.ring_replicas),
            config.hostname.clone(),
            config.cas_retries,
        );
        let executor = StepExecutor::new(registry.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            membership,
            task_manager,
            executor,
            registry,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.hostname
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<MembershipRegistry> {
        &self.membership
    }

    /// Subscribe to the engine's execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.executor.subscribe()
    }

    fn presence_row(&self) -> ConductorRecord {
        let mut record =
            ConductorRecord::new(self.config.hostname.clone(), self.registry.names());
        record.group = self.config.group.clone();
        record
    }

    /// Write this conductor's presence row and refresh the local
    /// membership view.
    pub async fn register(&self) -> Result<()> {
        self.membership.heartbeat(&self.presence_row()).await?;
        self.membership.refresh().await?;
        info!(conductor = %self.config.hostname, drivers = ?self.registry.names(),
            "conductor registered");
        Ok(())
    }

    /// Register and spawn the heartbeat and sweep loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register().await?;

        let mut handles = self.handles.lock().await;

        let conductor = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conductor.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = conductor.membership.heartbeat(&conductor.presence_row()).await {
                            error!(error = %e, "conductor heartbeat failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let conductor = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conductor.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => conductor.run_sweeps().await,
                    _ = shutdown.changed() => break,
                }
            }
        }));

        Ok(())
    }

    /// One pass of every recovery task.
    pub async fn run_sweeps(&self) {
        if let Err(e) = sweep_stale_reservations(&self.store, &self.membership).await {
            error!(error = %e, "stale-reservation sweep failed");
        }
        if let Err(e) =
            sweep_wait_timeouts(&self.store, self.config.callback_timeout()).await
        {
            error!(error = %e, "wait-timeout sweep failed");
        }
        self.poll_waiting_nodes().await;
    }

    /// Stop the background loops and deregister gracefully, letting
    /// the rest of the fleet take over this conductor's nodes at once.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.store
            .mark_conductor_offline(&self.config.hostname)
            .await?;
        info!(conductor = %self.config.hostname, "conductor stopped");
        Ok(())
    }

    // === Entry points for the API layer ===

    /// Register a node with the fleet.
    pub async fn enroll_node(&self, node: Node) -> Result<Node> {
        self.store.insert_node(&node).await?;
        info!(node = %node.id, driver = %node.driver, "node enrolled");
        Ok(node)
    }

    pub async fn node(&self, id: Uuid) -> Result<Node> {
        Ok(self.store.get_node(id).await?)
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self.store.list_nodes(filter).await?)
    }

    pub async fn list_conductors(&self) -> Result<Vec<ConductorRecord>> {
        Ok(self.store.list_conductors().await?)
    }

    /// Validate and execute a lifecycle verb against a node.
    ///
    /// Acquires the reservation, checks the transition table and the
    /// maintenance flag, then hands the step list to the engine. The
    /// reservation is released on every exit path; a suspended
    /// transition leaves the node unlocked in its wait state with the
    /// continuation persisted.
    pub async fn request_transition(
        &self,
        node_id: Uuid,
        verb: Verb,
    ) -> Result<ProvisionState> {
        let lease = self.task_manager.acquire(node_id, verb.as_str()).await?;
        let result = self.run_transition(lease, verb).await;
        match &result {
            Ok(state) => {
                debug!(node = %node_id, verb = %verb, state = %state, "transition returned")
            }
            Err(e) => debug!(node = %node_id, verb = %verb, error = %e, "transition refused"),
        }
        result
    }

    async fn run_transition(&self, lease: Lease, verb: Verb) -> Result<ProvisionState> {
        let node = lease.node();
        let plan = match transition(node.provision_state, verb) {
            Some(plan) => plan,
            None => {
                let err = ConductorError::InvalidStateTransition {
                    state: node.provision_state,
                    verb,
                };
                self.release_quietly(lease).await;
                return Err(err);
            }
        };
        if lease.node().maintenance && !verb.allowed_in_maintenance() {
            let err = ConductorError::NodeInMaintenance { node: node.id };
            self.release_quietly(lease).await;
            return Err(err);
        }

        let mut node = lease.node().clone();
        let outcome = self.executor.start(&self.store, &mut node, &plan).await;
        self.finish_run(lease, node, outcome).await
    }

    /// Run an operator-specified list of clean steps against a node
    /// (a "manual clean"). The steps run in the order given, including
    /// steps disabled for automated runs.
    pub async fn request_manual_clean(
        &self,
        node_id: Uuid,
        steps: Vec<Step>,
    ) -> Result<ProvisionState> {
        let lease = self.task_manager.acquire(node_id, "manual clean").await?;

        let node = lease.node();
        let plan = match transition(node.provision_state, Verb::Clean) {
            Some(plan) => plan,
            None => {
                let err = ConductorError::InvalidStateTransition {
                    state: node.provision_state,
                    verb: Verb::Clean,
                };
                self.release_quietly(lease).await;
                return Err(err);
            }
        };

        let mut node = lease.node().clone();
        let outcome = self
            .executor
            .start_manual(&self.store, &mut node, &plan, steps)
            .await;
        self.finish_run(lease, node, outcome).await
    }

    /// Common tail of a transition: adopt the engine's row, release on
    /// both paths, and surface the state the node was left in.
    async fn finish_run(
        &self,
        mut lease: Lease,
        node: Node,
        outcome: roundhouse_engine::Result<RunOutcome>,
    ) -> Result<ProvisionState> {
        lease.absorb(node);
        match outcome {
            Ok(outcome) => {
                let state = match outcome {
                    RunOutcome::Completed(state)
                    | RunOutcome::Suspended(state)
                    | RunOutcome::Failed(state) => state,
                };
                lease.release().await?;
                Ok(state)
            }
            Err(e) => {
                self.release_quietly(lease).await;
                Err(e.into())
            }
        }
    }

    /// Cancel an in-flight transition.
    ///
    /// Only legal while the node is suspended in an abortable wait
    /// state; the running step of a synchronous stretch holds the
    /// reservation, so an abort during it waits its turn and applies
    /// before the next step would start.
    pub async fn abort(&self, node_id: Uuid) -> Result<ProvisionState> {
        // cheap pre-checks on an unlocked read
        let node = self.store.get_node(node_id).await?;
        let record = Continuation::load(&node.driver_internal)
            .map_err(ConductorError::from)?
            .ok_or(ConductorError::NotWaiting { node: node_id })?;
        if !node.provision_state.is_wait_state() || !record.abortable {
            return Err(ConductorError::InvalidStateTransition {
                state: node.provision_state,
                verb: Verb::Abort,
            });
        }

        let mut lease = self.task_manager.acquire(node_id, "abort").await?;

        // revalidate under the lock; the transition may have moved on
        let node = lease.node();
        let record = match Continuation::load(&node.driver_internal) {
            Ok(Some(record))
                if node.provision_state.is_wait_state() && record.abortable =>
            {
                record
            }
            _ => {
                let err = ConductorError::InvalidStateTransition {
                    state: node.provision_state,
                    verb: Verb::Abort,
                };
                self.release_quietly(lease).await;
                return Err(err);
            }
        };

        let mut scratch = lease.node().driver_internal.clone();
        Continuation::clear(&mut scratch);
        let patch = roundhouse_store::NodePatch::new()
            .with_state(record.fail_state)
            .with_target(None)
            .with_last_error(Some(format!("{} aborted by request", record.verb)))
            .with_driver_internal(scratch);
        lease.update(patch).await?;

        let state = lease.node().provision_state;
        warn!(node = %node_id, state = %state, "transition aborted");
        lease.release().await?;
        Ok(state)
    }

    /// Re-entry point for the out-of-band agent.
    ///
    /// Verifies the node is suspended expecting a callback and that
    /// the presented token matches the one issued when execution
    /// suspended, then re-acquires the reservation — on whichever
    /// conductor the heartbeat landed — and resumes the engine.
    pub async fn agent_heartbeat(
        &self,
        node_id: Uuid,
        agent_token: Uuid,
    ) -> Result<HeartbeatOutcome> {
        // cheap pre-checks on an unlocked read
        let node = self.store.get_node(node_id).await?;
        self.validate_callback(&node, agent_token)?;

        let mut lease = self.task_manager.acquire(node_id, "agent heartbeat").await?;

        // revalidate under the lock; another conductor may have won
        if let Err(e) = self.validate_callback(lease.node(), agent_token) {
            self.release_quietly(lease).await;
            return Err(e);
        }

        let mut node = lease.node().clone();
        let outcome = self.executor.resume(&self.store, &mut node).await;
        lease.absorb(node);

        match outcome {
            Ok(outcome) => {
                let result = match outcome {
                    RunOutcome::Completed(state) => HeartbeatOutcome { state, finished: true },
                    RunOutcome::Failed(state) => HeartbeatOutcome { state, finished: true },
                    RunOutcome::Suspended(state) => {
                        HeartbeatOutcome { state, finished: false }
                    }
                };
                lease.release().await?;
                Ok(result)
            }
            Err(e) => {
                self.release_quietly(lease).await;
                Err(e.into())
            }
        }
    }

    fn validate_callback(&self, node: &Node, agent_token: Uuid) -> Result<()> {
        let record = Continuation::load(&node.driver_internal)
            .map_err(ConductorError::from)?
            .ok_or(ConductorError::NotWaiting { node: node.id })?;
        if !node.provision_state.is_wait_state() || !record.awaiting_callback() {
            return Err(ConductorError::NotWaiting { node: node.id });
        }
        if record.agent_token != agent_token {
            return Err(ConductorError::TokenMismatch { node: node.id });
        }
        Ok(())
    }

    /// Resume suspended out-of-band transitions this conductor owns.
    ///
    /// Covers steps polling an external job with no agent to heartbeat
    /// for them. Reboot suspensions are excluded: those resume on the
    /// agent's next heartbeat, not on a timer. Returns how many nodes
    /// were resumed.
    pub async fn poll_waiting_nodes(&self) -> usize {
        let waiting = match self
            .store
            .list_nodes(
                &NodeFilter::new()
                    .with_states(vec![
                        ProvisionState::CleanWait,
                        ProvisionState::DeployWait,
                        ProvisionState::RescueWait,
                    ])
                    .with_reserved(false),
            )
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "polling sweep could not list nodes");
                return 0;
            }
        };

        let mut resumed = 0;
        for node in waiting {
            let record = match Continuation::load(&node.driver_internal) {
                Ok(Some(record)) if record.polling && !record.reboot_requested => record,
                _ => continue,
            };

            match self.resume_owned(node.id).await {
                Ok(()) => {
                    debug!(node = %node.id, verb = %record.verb, "polling resume advanced node");
                    resumed += 1;
                }
                Err(e) if e.is_retryable() => {
                    // another conductor owns or holds it; not ours to poll
                    debug!(node = %node.id, error = %e, "polling resume skipped");
                }
                Err(e) => {
                    warn!(node = %node.id, error = %e, "polling resume failed");
                }
            }
        }
        resumed
    }

    async fn resume_owned(&self, node_id: Uuid) -> Result<()> {
        let mut lease = self.task_manager.acquire(node_id, "polling resume").await?;

        let mut node = lease.node().clone();
        let outcome = self.executor.resume(&self.store, &mut node).await;
        lease.absorb(node);

        match outcome {
            Ok(_) => {
                lease.release().await?;
                Ok(())
            }
            Err(e) => {
                self.release_quietly(lease).await;
                Err(e.into())
            }
        }
    }

    /// Release on an error path, keeping the original error primary.
    async fn release_quietly(&self, lease: Lease) {
        let node_id = lease.node().id;
        if let Err(e) = lease.release().await {
            warn!(node = %node_id, error = %e, "failed to release reservation");
        }
    }
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("hostname", &self.config.hostname)
            .field("group", &self.config.group)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundhouse_engine::{
        Driver, FakePower, FakeStepSource, Step, StepInterface, StepOutcome, StepPurpose,
    };
    use roundhouse_store::MemoryStore;
    use std::sync::Mutex as StdMutex;

    struct TestFleet {
        store: Arc<dyn Store>,
        invocations: Arc<StdMutex<Vec<String>>>,
    }

    /// Fake driver: three deploy steps with optional scripts, one
    /// abortable clean step, and async rescue preparation.
    fn test_registry(
        scripts: Vec<(&str, Vec<StepOutcome>)>,
    ) -> (Arc<DriverRegistry>, Arc<StdMutex<Vec<String>>>) {
        let mut deploy = FakeStepSource::new(StepInterface::Deploy)
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
            )
            .with_step(
                StepPurpose::Rescue,
                Step::new(StepInterface::Deploy, "boot-rescue", 90),
            );
        for (name, outcomes) in scripts {
            deploy = deploy.with_outcomes(name, outcomes);
        }
        let invocations = deploy.invocations();

        let clean = FakeStepSource::new(StepInterface::Clean).with_step(
            StepPurpose::Clean,
            Step::new(StepInterface::Clean, "erase-disks", 80).with_abortable(true),
        );

        let mut registry = DriverRegistry::new();
        registry.register(
            Driver::new("fake", Arc::new(FakePower::new()))
                .with_source(Arc::new(deploy))
                .with_source(Arc::new(clean)),
        );
        (Arc::new(registry), invocations)
    }

    async fn conductor_with(
        scripts: Vec<(&str, Vec<StepOutcome>)>,
    ) -> (Arc<Conductor>, TestFleet) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (registry, invocations) = test_registry(scripts);
        let config = ConductorConfig {
            hostname: "alpha".to_string(),
            snapshot_interval_secs: 0,
            ..ConductorConfig::default()
        };
        let conductor = Arc::new(Conductor::new(config, store.clone(), registry));
        conductor.register().await.unwrap();
        (conductor, TestFleet { store, invocations })
    }

    async fn available_node(fleet: &TestFleet) -> Node {
        let node = Node::new("fake").with_state(ProvisionState::Available);
        fleet.store.insert_node(&node).await.unwrap();
        fleet.store.get_node(node.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_enroll_and_queries() {
        let (conductor, _fleet) = conductor_with(vec![]).await;

        let node = conductor
            .enroll_node(Node::new("fake").with_name("r2-u07"))
            .await
            .unwrap();
        assert_eq!(
            conductor.node(node.id).await.unwrap().name.as_deref(),
            Some("r2-u07")
        );

        let all = conductor.list_nodes(&NodeFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);

        let conductors = conductor.list_conductors().await.unwrap();
        assert_eq!(conductors.len(), 1);
        assert_eq!(conductors[0].hostname, "alpha");

        // re-enrolling the same id is refused
        let err = conductor.enroll_node(node).await.unwrap_err();
        assert!(matches!(
            err,
            ConductorError::Store(roundhouse_store::StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_runs_to_active() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let node = available_node(&fleet).await;

        let state = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::Active);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::Active);
        assert_eq!(row.reservation, None);
        assert_eq!(row.target_provision_state, None);
        assert_eq!(
            *fleet.invocations.lock().unwrap(),
            vec!["prepare", "write-image", "finalize"]
        );
    }

    #[tokio::test]
    async fn test_invalid_verb_is_rejected_and_unlocked() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let node = Node::new("fake");
        fleet.store.insert_node(&node).await.unwrap();

        let err = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidStateTransition { .. }));
        assert!(!err.is_retryable());

        // validation failures must not leak the reservation
        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.reservation, None);
        assert_eq!(row.provision_state, ProvisionState::Enroll);
    }

    #[tokio::test]
    async fn test_maintenance_blocks_deploy() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let mut node = Node::new("fake").with_state(ProvisionState::Available);
        node.maintenance = true;
        fleet.store.insert_node(&node).await.unwrap();

        let err = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NodeInMaintenance { .. }));
        assert_eq!(
            fleet.store.get_node(node.id).await.unwrap().reservation,
            None
        );
    }

    #[tokio::test]
    async fn test_suspended_deploy_resumes_on_heartbeat() {
        let (conductor, fleet) =
            conductor_with(vec![("write-image", vec![StepOutcome::Async])]).await;
        let node = available_node(&fleet).await;

        let state = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::DeployWait);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.reservation, None, "suspension must release the lock");
        let token = Continuation::load(&row.driver_internal)
            .unwrap()
            .unwrap()
            .agent_token;

        let outcome = conductor.agent_heartbeat(node.id, token).await.unwrap();
        assert_eq!(outcome.state, ProvisionState::Active);
        assert!(outcome.finished);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::Active);
        assert_eq!(row.reservation, None);
        assert!(Continuation::load(&row.driver_internal).unwrap().is_none());

        // the node is no longer waiting; further heartbeats are refused
        let err = conductor.agent_heartbeat(node.id, token).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotWaiting { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_with_wrong_token_rejected() {
        let (conductor, fleet) =
            conductor_with(vec![("write-image", vec![StepOutcome::Async])]).await;
        let node = available_node(&fleet).await;
        conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();

        let err = conductor
            .agent_heartbeat(node.id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::TokenMismatch { .. }));

        // the transition is untouched
        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::DeployWait);
    }

    #[tokio::test]
    async fn test_abort_in_abortable_wait() {
        let (conductor, fleet) =
            conductor_with(vec![("write-image", vec![StepOutcome::Async])]).await;
        let node = available_node(&fleet).await;
        conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();

        let state = conductor.abort(node.id).await.unwrap();
        assert_eq!(state, ProvisionState::DeployFailed);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::DeployFailed);
        assert_eq!(row.reservation, None);
        assert!(row.last_error.as_deref().unwrap().contains("aborted"));
        assert!(Continuation::load(&row.driver_internal).unwrap().is_none());

        // no further step ran
        assert_eq!(
            *fleet.invocations.lock().unwrap(),
            vec!["prepare", "write-image"]
        );
    }

    #[tokio::test]
    async fn test_abort_rejected_in_non_abortable_wait() {
        let (conductor, fleet) =
            conductor_with(vec![("boot-rescue", vec![StepOutcome::Async])]).await;
        let node = Node::new("fake").with_state(ProvisionState::Active);
        fleet.store.insert_node(&node).await.unwrap();

        let state = conductor
            .request_transition(node.id, Verb::Rescue)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::RescueWait);

        let err = conductor.abort(node.id).await.unwrap_err();
        assert!(matches!(
            err,
            ConductorError::InvalidStateTransition { verb: Verb::Abort, .. }
        ));

        // still suspended, still resumable
        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::RescueWait);
        assert!(Continuation::load(&row.driver_internal).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abort_without_transition_rejected() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let node = available_node(&fleet).await;

        let err = conductor.abort(node.id).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotWaiting { .. }));
    }

    #[tokio::test]
    async fn test_polling_sweep_resumes_out_of_band_nodes() {
        let (conductor, fleet) =
            conductor_with(vec![("write-image", vec![StepOutcome::Async])]).await;
        let node = available_node(&fleet).await;
        conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();

        let resumed = conductor.poll_waiting_nodes().await;
        assert_eq!(resumed, 1);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::Active);
        assert_eq!(row.reservation, None);
    }

    #[tokio::test]
    async fn test_polling_sweep_skips_reboot_suspensions() {
        let (conductor, fleet) =
            conductor_with(vec![("write-image", vec![StepOutcome::RebootRequired])]).await;
        let node = available_node(&fleet).await;
        conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();

        // reboot suspensions wait for the agent, not the timer
        let resumed = conductor.poll_waiting_nodes().await;
        assert_eq!(resumed, 0);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.provision_state, ProvisionState::DeployWait);
    }

    #[tokio::test]
    async fn test_manual_clean_runs_requested_steps() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let node = Node::new("fake").with_state(ProvisionState::Manageable);
        fleet.store.insert_node(&node).await.unwrap();

        // a step disabled for automated runs, requested explicitly
        let steps = vec![Step::new(StepInterface::Deploy, "burn-in", 0)];
        let state = conductor
            .request_manual_clean(node.id, steps)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::Manageable);

        let row = fleet.store.get_node(node.id).await.unwrap();
        assert_eq!(row.reservation, None);
        assert_eq!(*fleet.invocations.lock().unwrap(), vec!["burn-in"]);
    }

    #[tokio::test]
    async fn test_manual_clean_rejected_outside_manageable() {
        let (conductor, fleet) = conductor_with(vec![]).await;
        let node = available_node(&fleet).await;

        let err = conductor
            .request_manual_clean(
                node.id,
                vec![Step::new(StepInterface::Deploy, "burn-in", 0)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_transition_can_be_reissued() {
        let (conductor, fleet) = conductor_with(vec![(
            "write-image",
            vec![StepOutcome::Failure("scratched platter".into())],
        )])
        .await;
        let node = available_node(&fleet).await;

        let state = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::DeployFailed);
        let row = fleet.store.get_node(node.id).await.unwrap();
        assert!(row.last_error.as_deref().unwrap().contains("scratched platter"));

        // re-issuing the verb restarts the full list from the top
        let state = conductor
            .request_transition(node.id, Verb::Deploy)
            .await
            .unwrap();
        assert_eq!(state, ProvisionState::Active);
        assert_eq!(
            *fleet.invocations.lock().unwrap(),
            vec!["prepare", "write-image", "prepare", "write-image", "finalize"]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let (conductor, fleet) = conductor_with(vec![]).await;

        conductor.start().await.unwrap();
        let row = fleet
            .store
            .get_conductor("alpha")
            .await
            .unwrap()
            .unwrap();
        assert!(row.online);

        conductor.stop().await.unwrap();
        let row = fleet
            .store
            .get_conductor("alpha")
            .await
            .unwrap()
            .unwrap();
        assert!(!row.online);
    }
}
