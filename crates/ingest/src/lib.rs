//! Leader-only ingestion of booking system response files.
//!
//! The [`IngestSupervisor`] follows the mastership signal; while this
//! instance is master it runs a [`ResponseIngestor`] over the inbound folder,
//! applying each response through the booking state machine and archiving or
//! quarantining the file.

pub mod error;
pub mod ingestor;
pub mod response;
pub mod supervisor;

pub use error::*;
pub use ingestor::*;
pub use response::*;
pub use supervisor::*;
