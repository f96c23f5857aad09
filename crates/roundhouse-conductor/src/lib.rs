//! The conductor: one worker process in the roundhouse fleet.
//!
//! A conductor owns a slice of the node fleet decided by the hash
//! ring, takes exclusive reservations before mutating a node, drives
//! lifecycle transitions through the step engine, and runs the
//! recovery sweeps that heal the fleet after a peer crashes.

pub mod config;
pub mod error;
pub mod reservation;
pub mod service;
pub mod sweeps;

pub use config::*;
pub use error::*;
pub use reservation::*;
pub use service::*;
pub use sweeps::*;
