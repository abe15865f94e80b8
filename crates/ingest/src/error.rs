use blotter_booking::BookingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response file: {0}")]
    Parse(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("booking error: {0}")]
    Booking(#[from] BookingError),
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Parse(err.to_string())
    }
}
