//! Conductor liveness tracking.
//!
//! Each conductor upserts its own row on a heartbeat interval. A
//! conductor is alive iff its row is marked online and its last
//! heartbeat is younger than the liveness window. Snapshots of the
//! alive set are cached and refreshed on a fixed interval rather than
//! re-read on every call, to bound store load; correctness does not
//! depend on freshness because reservation acquisition validates
//! ownership independently.

use crate::error::{Result, RingError};
use chrono::{DateTime, Utc};
use roundhouse_common::ConductorRecord;
use roundhouse_store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Heartbeat writes retry locally this many times before giving up.
/// A failed heartbeat only delays re-ownership; it never blocks node
/// operations.
const HEARTBEAT_ATTEMPTS: u32 = 3;

/// Point-in-time view of the alive conductors.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    pub taken_at: DateTime<Utc>,
    conductors: Vec<ConductorRecord>,
}

impl MembershipSnapshot {
    /// Build a snapshot from raw rows, keeping only alive conductors.
    pub fn from_rows(
        rows: Vec<ConductorRecord>,
        liveness_window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let window = chrono::Duration::from_std(liveness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let conductors = rows
            .into_iter()
            .filter(|r| r.online && r.heartbeat_age(now) <= window)
            .collect();
        Self { taken_at: now, conductors }
    }

    pub fn is_alive(&self, hostname: &str) -> bool {
        self.conductors.iter().any(|r| r.hostname == hostname)
    }

    pub fn conductors(&self) -> &[ConductorRecord] {
        &self.conductors
    }

    /// Alive conductors that can own a node with the given driver and
    /// group. Group matching is strict: grouped nodes only go to
    /// conductors in the same group, ungrouped nodes to ungrouped
    /// conductors.
    pub fn candidates(&self, driver: &str, group: Option<&str>) -> Vec<&ConductorRecord> {
        self.conductors
            .iter()
            .filter(|r| r.supports_driver(driver) && r.group.as_deref() == group)
            .collect()
    }
}

struct CachedSnapshot {
    fetched: Instant,
    snapshot: MembershipSnapshot,
}

/// Tracks conductor liveness through the shared store.
pub struct MembershipRegistry {
    store: Arc<dyn Store>,
    liveness_window: Duration,
    snapshot_interval: Duration,
    cached: RwLock<Option<CachedSnapshot>>,
}

impl MembershipRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        liveness_window: Duration,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            store,
            liveness_window,
            snapshot_interval,
            cached: RwLock::new(None),
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Write or refresh the caller's presence row.
    ///
    /// Retries locally on store errors; the caller's loop carries on
    /// either way, since stale membership only affects re-ownership
    /// latency.
    pub async fn heartbeat(&self, record: &ConductorRecord) -> Result<()> {
        let mut row = record.clone();
        row.last_heartbeat = Utc::now();
        row.online = true;

        let mut last_err = None;
        for attempt in 1..=HEARTBEAT_ATTEMPTS {
            match self.store.upsert_conductor(&row).await {
                Ok(()) => {
                    debug!(conductor = %row.hostname, "heartbeat recorded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        conductor = %row.hostname,
                        attempt,
                        error = %e,
                        "heartbeat write failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(RingError::HeartbeatFailed {
            attempts: HEARTBEAT_ATTEMPTS,
            source: last_err.unwrap_or(roundhouse_store::StoreError::Database(
                "unreachable".to_string(),
            )),
        })
    }

    /// Current snapshot, served from cache within the refresh interval.
    pub async fn snapshot(&self) -> Result<MembershipSnapshot> {
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.fetched.elapsed() < self.snapshot_interval {
                    return Ok(entry.snapshot.clone());
                }
            }
        }
        self.refresh().await
    }

    /// Re-read membership from the store, bypassing the cache.
    pub async fn refresh(&self) -> Result<MembershipSnapshot> {
        let rows = self.store.list_conductors().await?;
        let snapshot = MembershipSnapshot::from_rows(rows, self.liveness_window, Utc::now());
        let mut cached = self.cached.write().await;
        *cached = Some(CachedSnapshot {
            fetched: Instant::now(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Alive conductors, optionally restricted to one group.
    pub async fn list_alive(&self, group: Option<&str>) -> Result<Vec<ConductorRecord>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .conductors()
            .iter()
            .filter(|r| group.is_none() || r.group.as_deref() == group)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundhouse_store::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> MembershipRegistry {
        // zero snapshot interval: every snapshot() is fresh
        MembershipRegistry::new(store, Duration::from_secs(90), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_heartbeat_registers_conductor() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());

        let record = ConductorRecord::new("alpha", vec!["fake".into()]);
        registry.heartbeat(&record).await.unwrap();

        let snapshot = registry.snapshot().await.unwrap();
        assert!(snapshot.is_alive("alpha"));
        assert!(!snapshot.is_alive("bravo"));

        let alive = registry.list_alive(None).await.unwrap();
        assert_eq!(alive.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_dead() {
        let store = Arc::new(MemoryStore::new());
        let registry = MembershipRegistry::new(store.clone(), Duration::ZERO, Duration::ZERO);

        let record = ConductorRecord::new("alpha", vec!["fake".into()]);
        registry.heartbeat(&record).await.unwrap();

        // liveness window of zero: any heartbeat is already too old
        tokio::time::sleep(Duration::from_millis(5)).await;
        let snapshot = registry.refresh().await.unwrap();
        assert!(!snapshot.is_alive("alpha"));
    }

    #[tokio::test]
    async fn test_offline_conductor_is_dead() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());

        let record = ConductorRecord::new("alpha", vec!["fake".into()]);
        reg.heartbeat(&record).await.unwrap();
        store.mark_conductor_offline("alpha").await.unwrap();

        let snapshot = reg.refresh().await.unwrap();
        assert!(!snapshot.is_alive("alpha"));
    }

    #[tokio::test]
    async fn test_candidates_filter_driver_and_group() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());

        reg.heartbeat(&ConductorRecord::new("alpha", vec!["fake".into()]))
            .await
            .unwrap();
        reg.heartbeat(&ConductorRecord::new("bravo", vec!["ipmi".into()]))
            .await
            .unwrap();
        reg.heartbeat(
            &ConductorRecord::new("charlie", vec!["fake".into()]).with_group("rack3"),
        )
        .await
        .unwrap();

        let snapshot = reg.refresh().await.unwrap();

        let ungrouped_fake: Vec<_> = snapshot
            .candidates("fake", None)
            .iter()
            .map(|r| r.hostname.clone())
            .collect();
        assert_eq!(ungrouped_fake, vec!["alpha"]);

        let grouped_fake: Vec<_> = snapshot
            .candidates("fake", Some("rack3"))
            .iter()
            .map(|r| r.hostname.clone())
            .collect();
        assert_eq!(grouped_fake, vec!["charlie"]);

        assert!(snapshot.candidates("redfish", None).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_cache_serves_stale_view() {
        let store = Arc::new(MemoryStore::new());
        let reg = MembershipRegistry::new(
            store.clone(),
            Duration::from_secs(90),
            Duration::from_secs(3600),
        );

        reg.heartbeat(&ConductorRecord::new("alpha", vec!["fake".into()]))
            .await
            .unwrap();
        let first = reg.snapshot().await.unwrap();
        assert!(first.is_alive("alpha"));

        // a join after the snapshot is not visible until refresh
        reg.heartbeat(&ConductorRecord::new("bravo", vec!["fake".into()]))
            .await
            .unwrap();
        let cached = reg.snapshot().await.unwrap();
        assert!(!cached.is_alive("bravo"));

        let fresh = reg.refresh().await.unwrap();
        assert!(fresh.is_alive("bravo"));
    }
}
