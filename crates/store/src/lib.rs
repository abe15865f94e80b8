//! Shared-database persistence for blotter coordination.
//!
//! Every cross-process decision is taken by a single conditional write whose
//! affected-row count is the answer; nothing here holds an in-memory lock that
//! pretends to span processes.

pub mod error;
pub mod memory;
pub mod sqlite_store;
pub mod store;

pub use error::*;
pub use memory::*;
pub use sqlite_store::*;
pub use store::*;
