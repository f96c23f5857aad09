//! Recovery sweeps.
//!
//! Two periodic tasks keep the fleet healthy without a consensus
//! protocol: the stale-reservation sweep frees nodes locked by dead
//! conductors, and the wait-timeout sweep fails transitions whose
//! remote agent stopped responding. Both are single passes over the
//! store, race-tolerant per row: a version conflict means someone else
//! got there first, and the next pass will re-check.

use crate::error::Result;
use chrono::Utc;
use roundhouse_common::ProvisionState;
use roundhouse_engine::Continuation;
use roundhouse_ring::MembershipRegistry;
use roundhouse_store::{NodeFilter, NodePatch, Store, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Free reservations held by conductors that are no longer alive.
///
/// This is the sole recovery path for a crashed conductor: its nodes
/// stay locked for at most the liveness window plus one sweep
/// interval, then become acquirable again. Returns how many
/// reservations were cleared.
pub async fn sweep_stale_reservations(
    store: &Arc<dyn Store>,
    membership: &MembershipRegistry,
) -> Result<usize> {
    // recovery decisions always use a fresh membership view
    let snapshot = membership.refresh().await?;
    let reserved = store
        .list_nodes(&NodeFilter::new().with_reserved(true))
        .await?;

    let mut released = 0;
    for node in reserved {
        let Some(holder) = node.reservation.clone() else {
            continue;
        };
        if snapshot.is_alive(&holder) {
            continue;
        }

        match store
            .compare_and_swap(node.id, node.version, NodePatch::new().with_reservation(None))
            .await
        {
            Ok(_) => {
                warn!(
                    node = %node.id,
                    previous_holder = %holder,
                    "force-released reservation held by dead conductor"
                );
                released += 1;
            }
            Err(StoreError::VersionConflict(_)) => {
                debug!(node = %node.id, "row changed mid-sweep; skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if released > 0 {
        info!(released, "stale-reservation sweep freed nodes");
    }
    Ok(released)
}

/// Fail in-flight transitions that have gone quiet for longer than the
/// callback timeout.
///
/// Runs regardless of reservation state: a crashed agent must not
/// leave a node suspended forever. Returns how many nodes were failed.
pub async fn sweep_wait_timeouts(
    store: &Arc<dyn Store>,
    timeout: chrono::Duration,
) -> Result<usize> {
    let in_flight = store
        .list_nodes(&NodeFilter::new().with_states(ProvisionState::in_flight_states()))
        .await?;
    let now = Utc::now();

    let mut failed = 0;
    for node in in_flight {
        let age = now - node.provision_updated_at;
        if age <= timeout {
            continue;
        }

        // the continuation knows this transition's failure sink; a
        // node stuck in flight without one goes to the error state
        let fail_state = Continuation::load(&node.driver_internal)
            .ok()
            .flatten()
            .map(|record| record.fail_state)
            .unwrap_or(ProvisionState::Error);

        let mut scratch = node.driver_internal.clone();
        Continuation::clear(&mut scratch);
        let error = format!(
            "transition timed out: no progress for {}s (limit {}s)",
            age.num_seconds(),
            timeout.num_seconds()
        );
        let patch = NodePatch::new()
            .with_state(fail_state)
            .with_target(None)
            .with_reservation(None)
            .with_last_error(Some(error))
            .with_driver_internal(scratch);

        match store.compare_and_swap(node.id, node.version, patch).await {
            Ok(_) => {
                warn!(
                    node = %node.id,
                    state = %node.provision_state,
                    fail_state = %fail_state,
                    idle_secs = age.num_seconds(),
                    "timed out waiting for agent; transition failed"
                );
                failed += 1;
            }
            Err(StoreError::VersionConflict(_)) => {
                debug!(node = %node.id, "row changed mid-sweep; skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundhouse_common::{transition, ConductorRecord, Node, Verb};
    use roundhouse_engine::{Step, StepInterface};
    use roundhouse_ring::MembershipRegistry;
    use roundhouse_store::MemoryStore;
    use std::time::Duration;

    fn membership(store: Arc<dyn Store>) -> MembershipRegistry {
        MembershipRegistry::new(store, Duration::from_secs(90), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_stale_sweep_frees_dead_holders_only() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let membership = membership(store.clone());
        membership
            .heartbeat(&ConductorRecord::new("alpha", vec!["fake".into()]))
            .await
            .unwrap();

        let mut held_by_live = Node::new("fake");
        held_by_live.reservation = Some("alpha".to_string());
        let mut held_by_dead = Node::new("fake");
        held_by_dead.reservation = Some("ghost".to_string());
        let unheld = Node::new("fake");

        store.insert_node(&held_by_live).await.unwrap();
        store.insert_node(&held_by_dead).await.unwrap();
        store.insert_node(&unheld).await.unwrap();

        let released = sweep_stale_reservations(&store, &membership).await.unwrap();
        assert_eq!(released, 1);

        assert!(store
            .get_node(held_by_live.id)
            .await
            .unwrap()
            .is_reserved_by("alpha"));
        assert_eq!(
            store.get_node(held_by_dead.id).await.unwrap().reservation,
            None
        );
    }

    #[tokio::test]
    async fn test_stale_sweep_counts_offline_conductor_as_dead() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let membership = membership(store.clone());
        membership
            .heartbeat(&ConductorRecord::new("alpha", vec!["fake".into()]))
            .await
            .unwrap();
        store.mark_conductor_offline("alpha").await.unwrap();

        let mut node = Node::new("fake");
        node.reservation = Some("alpha".to_string());
        store.insert_node(&node).await.unwrap();

        let released = sweep_stale_reservations(&store, &membership).await.unwrap();
        assert_eq!(released, 1);
    }

    /// Build a suspended deploy whose last activity is `idle_secs` ago.
    fn suspended_deploy(idle_secs: i64) -> Node {
        let plan = transition(ProvisionState::Available, Verb::Deploy).unwrap();
        let mut record = Continuation::new(
            &plan,
            vec![Step::new(StepInterface::Deploy, "write-image", 80)],
        );
        record.step_index = 1;
        record.polling = true;

        let mut node = Node::new("fake").with_state(ProvisionState::DeployWait);
        node.target_provision_state = Some(ProvisionState::Active);
        record.store_into(&mut node.driver_internal).unwrap();
        node.provision_updated_at = Utc::now() - chrono::Duration::seconds(idle_secs);
        node
    }

    #[tokio::test]
    async fn test_timeout_sweep_fails_expired_waits() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let expired = suspended_deploy(3600);
        let fresh = suspended_deploy(10);
        store.insert_node(&expired).await.unwrap();
        store.insert_node(&fresh).await.unwrap();

        let failed = sweep_wait_timeouts(&store, chrono::Duration::seconds(1800))
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let node = store.get_node(expired.id).await.unwrap();
        assert_eq!(node.provision_state, ProvisionState::DeployFailed);
        assert_eq!(node.target_provision_state, None);
        assert_eq!(node.reservation, None);
        assert!(node.last_error.as_deref().unwrap().contains("timed out"));
        assert!(Continuation::load(&node.driver_internal).unwrap().is_none());

        let node = store.get_node(fresh.id).await.unwrap();
        assert_eq!(node.provision_state, ProvisionState::DeployWait);
    }

    #[tokio::test]
    async fn test_timeout_sweep_works_with_zero_reservations() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let expired = suspended_deploy(3600);
        assert_eq!(expired.reservation, None);
        store.insert_node(&expired).await.unwrap();

        let failed = sweep_wait_timeouts(&store, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_sweep_without_continuation_sinks_to_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut node = Node::new("fake").with_state(ProvisionState::Deploying);
        node.provision_updated_at = Utc::now() - chrono::Duration::seconds(3600);
        store.insert_node(&node).await.unwrap();

        let failed = sweep_wait_timeouts(&store, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(failed, 1);
        assert_eq!(
            store.get_node(node.id).await.unwrap().provision_state,
            ProvisionState::Error
        );
    }

    #[tokio::test]
    async fn test_stable_states_never_time_out() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut node = Node::new("fake").with_state(ProvisionState::Active);
        node.provision_updated_at = Utc::now() - chrono::Duration::days(30);
        store.insert_node(&node).await.unwrap();

        let failed = sweep_wait_timeouts(&store, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(failed, 0);
    }
}
