//! Lease-based master election.
//!
//! Every instance heartbeats into the shared presence table. On each tick the
//! coordinator picks the first online user from the priority list; only that
//! user contends for the lease row, and only a store-confirmed holder reports
//! itself as master.

mod coordinator;
mod heartbeat;
mod leadership;

pub use coordinator::*;
pub use heartbeat::*;
pub use leadership::*;
