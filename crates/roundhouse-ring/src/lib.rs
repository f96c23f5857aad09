//! Conductor membership and node-to-conductor assignment.
//!
//! Two pieces: the [`MembershipRegistry`] tracks which conductors are
//! alive through periodic heartbeats, and the [`HashRing`] maps a node
//! onto an ordered candidate list of live conductors. The ring is a
//! pure function of a membership snapshot, so every conductor that
//! holds the same snapshot computes the same answer; staleness is
//! bounded by the snapshot refresh interval and independently guarded
//! by the reservation discipline.

pub mod error;
pub mod membership;
pub mod ring;

pub use error::*;
pub use membership::*;
pub use ring::*;
