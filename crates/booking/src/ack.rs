use async_trait::async_trait;
use blotter_types::Acknowledgement;
use thiserror::Error;

/// Outbound acknowledgement channel to an ack-capable venue
#[async_trait]
pub trait AckTransport: Send + Sync {
    async fn send(&self, ack: &Acknowledgement) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Session or network failure; the acknowledgement may be retried
    #[error("transport failure: {0}")]
    Session(String),

    /// The venue refused the acknowledgement on business grounds
    #[error("rejected by venue: {0}")]
    Rejected(String),
}
