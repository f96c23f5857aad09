//! Consistent hash ring mapping nodes to candidate owners.
//!
//! Each alive conductor contributes `replicas` points to the ring,
//! derived from `SHA-256(hostname ':' slot)` so every conductor
//! computes identical points with no shared state. A node hashes to a
//! position and its candidate owners are the distinct conductors met
//! walking clockwise from there. Replicas smooth load; when one
//! conductor joins or leaves, only keys falling in its segments move.

use crate::membership::MembershipSnapshot;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hash an arbitrary string to a position on the u64 ring.
fn ring_point(data: &str) -> u64 {
    let digest = Sha256::digest(data.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Deterministic node-to-conductor assignment over a membership
/// snapshot. The struct only carries tuning; every call recomputes
/// from the snapshot it is given.
#[derive(Debug, Clone, Copy)]
pub struct HashRing {
    replicas: u32,
}

impl HashRing {
    /// `replicas` is the number of ring points per conductor; values
    /// below 1 are clamped.
    pub fn new(replicas: u32) -> Self {
        Self {
            replicas: replicas.max(1),
        }
    }

    /// Ordered candidate owners for a node, best first.
    ///
    /// Only alive conductors that support `driver` and match `group`
    /// participate. Returns an empty list when no conductor qualifies.
    pub fn owners_for(
        &self,
        snapshot: &MembershipSnapshot,
        node_id: Uuid,
        driver: &str,
        group: Option<&str>,
    ) -> Vec<String> {
        let candidates = snapshot.candidates(driver, group);
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut points: Vec<(u64, &str)> = Vec::with_capacity(candidates.len() * self.replicas as usize);
        for candidate in &candidates {
            for slot in 0..self.replicas {
                let point = ring_point(&format!("{}:{}", candidate.hostname, slot));
                points.push((point, candidate.hostname.as_str()));
            }
        }
        // hostname as the final tie-break keeps equal points ordered
        // identically on every conductor
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let node_point = ring_point(&node_id.to_string());
        let start = points.partition_point(|(p, _)| *p < node_point);

        let mut owners: Vec<String> = Vec::with_capacity(candidates.len());
        for i in 0..points.len() {
            let (_, hostname) = points[(start + i) % points.len()];
            if !owners.iter().any(|o| o == hostname) {
                owners.push(hostname.to_string());
                if owners.len() == candidates.len() {
                    break;
                }
            }
        }
        owners
    }

    /// The single best owner, if any conductor qualifies.
    pub fn primary_owner(
        &self,
        snapshot: &MembershipSnapshot,
        node_id: Uuid,
        driver: &str,
        group: Option<&str>,
    ) -> Option<String> {
        self.owners_for(snapshot, node_id, driver, group)
            .into_iter()
            .next()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(128)
    }
}
