use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ParseEnumError;

/// Downstream booking system a trade is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SystemCode {
    Mx3,
    Calypso,
    VolbrokerStp,
    Rtns,
}

impl SystemCode {
    pub const ALL: [SystemCode; 4] = [
        SystemCode::Mx3,
        SystemCode::Calypso,
        SystemCode::VolbrokerStp,
        SystemCode::Rtns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemCode::Mx3 => "MX3",
            SystemCode::Calypso => "CALYPSO",
            SystemCode::VolbrokerStp => "VOLBROKER_STP",
            SystemCode::Rtns => "RTNS",
        }
    }

    /// Venues that expect an outbound acknowledgement (AR) for each captured trade (AE)
    pub fn supports_acknowledgement(&self) -> bool {
        matches!(self, SystemCode::VolbrokerStp)
    }
}

impl fmt::Display for SystemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemCode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MX3" => Ok(SystemCode::Mx3),
            "CALYPSO" => Ok(SystemCode::Calypso),
            "VOLBROKER_STP" => Ok(SystemCode::VolbrokerStp),
            "RTNS" => Ok(SystemCode::Rtns),
            other => Err(ParseEnumError::new("system code", other)),
        }
    }
}

impl TryFrom<String> for SystemCode {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, ParseEnumError> {
        value.parse()
    }
}

impl From<SystemCode> for String {
    fn from(value: SystemCode) -> Self {
        value.as_str().to_string()
    }
}

/// Booking / acknowledgement status of a trade system link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LinkStatus {
    New,
    Pending,
    Booked,
    Error,
    ReadyToAck,
    AckSent,
    AckFailed,
    Rejected,
}

impl LinkStatus {
    /// Statuses from which a booking command may move the link to PENDING
    pub const BOOKABLE: [LinkStatus; 2] = [LinkStatus::New, LinkStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::New => "NEW",
            LinkStatus::Pending => "PENDING",
            LinkStatus::Booked => "BOOKED",
            LinkStatus::Error => "ERROR",
            LinkStatus::ReadyToAck => "ReadyToAck",
            LinkStatus::AckSent => "AckSent",
            LinkStatus::AckFailed => "AckFailed",
            LinkStatus::Rejected => "Rejected",
        }
    }

    /// No transition is permitted out of a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::AckSent | LinkStatus::Rejected)
    }

    /// Whether `self -> next` is an edge of the booking state machine.
    ///
    /// `Booked -> Booked` is allowed so that a replayed success response only
    /// refreshes the last-booked timestamp.
    pub fn can_transition_to(&self, next: LinkStatus) -> bool {
        use LinkStatus::*;
        matches!(
            (self, next),
            (New, Pending)
                | (Error, Pending)
                | (Pending, Booked)
                | (Booked, Booked)
                | (Pending, Error)
                | (New, ReadyToAck)
                | (ReadyToAck, AckSent)
                | (ReadyToAck, AckFailed)
                | (AckFailed, AckSent)
                | (ReadyToAck, Rejected)
                | (AckFailed, Rejected)
        )
    }

    /// Every status that may legally precede `next`
    pub fn predecessors(next: LinkStatus) -> Vec<LinkStatus> {
        LinkStatus::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub const ALL: [LinkStatus; 8] = [
        LinkStatus::New,
        LinkStatus::Pending,
        LinkStatus::Booked,
        LinkStatus::Error,
        LinkStatus::ReadyToAck,
        LinkStatus::AckSent,
        LinkStatus::AckFailed,
        LinkStatus::Rejected,
    ];
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(LinkStatus::New),
            "PENDING" => Ok(LinkStatus::Pending),
            "BOOKED" => Ok(LinkStatus::Booked),
            "ERROR" => Ok(LinkStatus::Error),
            "ReadyToAck" => Ok(LinkStatus::ReadyToAck),
            "AckSent" => Ok(LinkStatus::AckSent),
            "AckFailed" => Ok(LinkStatus::AckFailed),
            "Rejected" => Ok(LinkStatus::Rejected),
            other => Err(ParseEnumError::new("link status", other)),
        }
    }
}

impl TryFrom<String> for LinkStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, ParseEnumError> {
        value.parse()
    }
}

impl From<LinkStatus> for String {
    fn from(value: LinkStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Persistent link between a trade and one downstream booking system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSystemLink {
    pub link_id: i64,
    pub trade_id: i64,
    pub system_code: SystemCode,
    pub status: LinkStatus,
    pub external_trade_id: Option<String>,
    pub last_status_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub book_flag: bool,
    pub stp_mode: Option<String>,
    pub booked_by: Option<String>,
    pub first_booked_utc: Option<DateTime<Utc>>,
    pub last_booked_utc: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

/// Link as created by the trade normalization pipeline, always in NEW
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLink {
    pub trade_id: i64,
    pub system_code: SystemCode,
    pub book_flag: bool,
    pub stp_mode: Option<String>,
}

impl NewLink {
    pub fn new(trade_id: i64, system_code: SystemCode) -> Self {
        Self {
            trade_id,
            system_code,
            book_flag: true,
            stp_mode: None,
        }
    }

    pub fn with_stp_mode(mut self, mode: impl Into<String>) -> Self {
        self.stp_mode = Some(mode.into());
        self
    }

    pub fn with_book_flag(mut self, flag: bool) -> Self {
        self.book_flag = flag;
        self
    }
}

/// Field changes written together with a guarded status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUpdate {
    pub status: LinkStatus,
    pub at: DateTime<Utc>,
    pub external_trade_id: Option<String>,
    pub error: ErrorText,
    pub booked_by: Option<String>,
    /// Set first (if unset) and last booked timestamps to `at`
    pub mark_booked: bool,
}

/// What a transition does with `last_error`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorText {
    #[default]
    Keep,
    Clear,
    Set(String),
}

impl LinkUpdate {
    pub fn to(status: LinkStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            at,
            external_trade_id: None,
            error: ErrorText::Keep,
            booked_by: None,
            mark_booked: false,
        }
    }

    pub fn with_external_trade_id(mut self, id: impl Into<String>) -> Self {
        self.external_trade_id = Some(id.into());
        self
    }

    pub fn with_error(mut self, error: ErrorText) -> Self {
        self.error = error;
        self
    }

    pub fn with_booked_by(mut self, user: impl Into<String>) -> Self {
        self.booked_by = Some(user.into());
        self
    }

    pub fn booked(mut self) -> Self {
        self.mark_booked = true;
        self
    }

    /// Apply this update to an in-memory link the way the SQL store does
    pub fn apply(&self, link: &mut TradeSystemLink) {
        link.status = self.status;
        link.last_status_utc = Some(self.at);
        if let Some(ext) = &self.external_trade_id {
            link.external_trade_id = Some(ext.clone());
        }
        match &self.error {
            ErrorText::Keep => {}
            ErrorText::Clear => link.last_error = None,
            ErrorText::Set(text) => link.last_error = Some(text.clone()),
        }
        if let Some(user) = &self.booked_by {
            link.booked_by = Some(user.clone());
        }
        if self.mark_booked {
            if link.first_booked_utc.is_none() {
                link.first_booked_utc = Some(self.at);
            }
            link.last_booked_utc = Some(self.at);
        }
    }
}
