use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{LinkStatus, ParseEnumError, SystemCode};

/// Kind of an audit trail entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkflowEventType {
    BookingRequested,
    ExportFailed,
    Booked,
    BookingFailed,
    ReadyToAck,
    AckSent,
    AckFailed,
    Rejected,
    ResponseQuarantined,
    MastershipAcquired,
    MastershipLost,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventType::BookingRequested => "BOOKING_REQUESTED",
            WorkflowEventType::ExportFailed => "EXPORT_FAILED",
            WorkflowEventType::Booked => "BOOKED",
            WorkflowEventType::BookingFailed => "BOOKING_FAILED",
            WorkflowEventType::ReadyToAck => "READY_TO_ACK",
            WorkflowEventType::AckSent => "ACK_SENT",
            WorkflowEventType::AckFailed => "ACK_FAILED",
            WorkflowEventType::Rejected => "REJECTED",
            WorkflowEventType::ResponseQuarantined => "RESPONSE_QUARANTINED",
            WorkflowEventType::MastershipAcquired => "MASTERSHIP_ACQUIRED",
            WorkflowEventType::MastershipLost => "MASTERSHIP_LOST",
        }
    }

    /// Event recorded when a link enters `status`
    pub fn for_status(status: LinkStatus) -> Option<Self> {
        match status {
            LinkStatus::New => None,
            LinkStatus::Pending => Some(WorkflowEventType::BookingRequested),
            LinkStatus::Booked => Some(WorkflowEventType::Booked),
            LinkStatus::Error => Some(WorkflowEventType::BookingFailed),
            LinkStatus::ReadyToAck => Some(WorkflowEventType::ReadyToAck),
            LinkStatus::AckSent => Some(WorkflowEventType::AckSent),
            LinkStatus::AckFailed => Some(WorkflowEventType::AckFailed),
            LinkStatus::Rejected => Some(WorkflowEventType::Rejected),
        }
    }
}

impl fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOOKING_REQUESTED" => Ok(WorkflowEventType::BookingRequested),
            "EXPORT_FAILED" => Ok(WorkflowEventType::ExportFailed),
            "BOOKED" => Ok(WorkflowEventType::Booked),
            "BOOKING_FAILED" => Ok(WorkflowEventType::BookingFailed),
            "READY_TO_ACK" => Ok(WorkflowEventType::ReadyToAck),
            "ACK_SENT" => Ok(WorkflowEventType::AckSent),
            "ACK_FAILED" => Ok(WorkflowEventType::AckFailed),
            "REJECTED" => Ok(WorkflowEventType::Rejected),
            "RESPONSE_QUARANTINED" => Ok(WorkflowEventType::ResponseQuarantined),
            "MASTERSHIP_ACQUIRED" => Ok(WorkflowEventType::MastershipAcquired),
            "MASTERSHIP_LOST" => Ok(WorkflowEventType::MastershipLost),
            other => Err(ParseEnumError::new("workflow event type", other)),
        }
    }
}

impl TryFrom<String> for WorkflowEventType {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, ParseEnumError> {
        value.parse()
    }
}

impl From<WorkflowEventType> for String {
    fn from(value: WorkflowEventType) -> Self {
        value.as_str().to_string()
    }
}

/// Persisted audit entry. Never updated or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: i64,
    /// Absent for node-level events such as mastership changes
    pub trade_id: Option<i64>,
    pub timestamp_utc: DateTime<Utc>,
    pub event_type: WorkflowEventType,
    pub system_code: Option<SystemCode>,
    pub user_id: String,
    pub details: String,
}

/// Audit entry about to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkflowEvent {
    pub trade_id: Option<i64>,
    pub timestamp_utc: DateTime<Utc>,
    pub event_type: WorkflowEventType,
    pub system_code: Option<SystemCode>,
    pub user_id: String,
    pub details: String,
}

impl NewWorkflowEvent {
    pub fn for_trade(
        trade_id: i64,
        event_type: WorkflowEventType,
        user_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: Some(trade_id),
            timestamp_utc: at,
            event_type,
            system_code: None,
            user_id: user_id.into(),
            details: String::new(),
        }
    }

    pub fn for_node(
        event_type: WorkflowEventType,
        user_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: None,
            timestamp_utc: at,
            event_type,
            system_code: None,
            user_id: user_id.into(),
            details: String::new(),
        }
    }

    pub fn with_system(mut self, system_code: SystemCode) -> Self {
        self.system_code = Some(system_code);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}
