use blotter_store::StoreError;
use blotter_types::{LinkStatus, SystemCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("link not found: {0}")]
    NotFound(i64),

    #[error("no live link for trade {trade_id} on {system_code}")]
    LinkNotFound {
        trade_id: i64,
        system_code: SystemCode,
    },

    /// The guarded update matched no row: another writer moved the link first
    #[error("link {link_id} changed concurrently: wanted {target}, found {actual}")]
    Conflict {
        link_id: i64,
        target: LinkStatus,
        actual: LinkStatus,
    },

    #[error("link {link_id} is in terminal status {status}")]
    TerminalState { link_id: i64, status: LinkStatus },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: LinkStatus, to: LinkStatus },

    #[error("this instance is not the confirmed master")]
    NotLeader,

    #[error("{system_code} does not take acknowledgements")]
    AcknowledgementUnsupported { system_code: SystemCode },

    /// Business or data validation failure; never maps to AckFailed
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    /// Contention or a link that has moved past the requested step
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BookingError::Conflict { .. }
                | BookingError::TerminalState { .. }
                | BookingError::InvalidTransition { .. }
        )
    }

    /// Infrastructure trouble worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BookingError::Store(StoreError::ConnectionError(_))
                | BookingError::Store(StoreError::DatabaseError(_))
                | BookingError::NotLeader
        )
    }
}
