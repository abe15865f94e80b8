//! Booking and acknowledgement state machine for trade system links.
//!
//! Booking commands move a link to PENDING on any instance. Responses from
//! the booking systems and outbound acknowledgements are applied only by the
//! confirmed master.

pub mod ack;
pub mod command;
pub mod error;
pub mod machine;

pub use ack::*;
pub use command::*;
pub use error::*;
pub use machine::*;
