pub mod ack;
pub mod clock;
pub mod coordination;
pub mod event;
pub mod leadership;
pub mod link;

pub use ack::*;
pub use clock::*;
pub use coordination::*;
pub use event::*;
pub use leadership::*;
pub use link::*;

/// Default lock name contended for by blotter instances.
pub const MASTER_LOCK_NAME: &str = "BLOTTER_MASTER";

/// Error returned when a persisted value does not map onto a known variant.
///
/// Unknown system codes or statuses read back from the store are a sign of
/// schema drift and are never defaulted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
