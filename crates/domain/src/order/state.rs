//! Order status codes and history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DomainError;

/// The status codes an order moves through.
///
/// State transitions:
/// ```text
/// AwaitingConfirmation ──┬──► InFulfillment
///                        └──► Conflicted
/// ```
///
/// Codes travel on the wire as the integers `1`, `2` and `99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    /// Order is recorded but its truck and driver are not both confirmed.
    AwaitingConfirmation,

    /// Both resources are assigned and the order is being delivered.
    InFulfillment,

    /// A resource could not be secured; the order is cancelled.
    Conflicted,
}

impl StatusCode {
    /// Returns the numeric wire code.
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::AwaitingConfirmation => 1,
            StatusCode::InFulfillment => 2,
            StatusCode::Conflicted => 99,
        }
    }

    /// Returns true if no further status can follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusCode::InFulfillment | StatusCode::Conflicted)
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = DomainError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(StatusCode::AwaitingConfirmation),
            2 => Ok(StatusCode::InFulfillment),
            99 => Ok(StatusCode::Conflicted),
            other => Err(DomainError::InvalidStatusCode(other)),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One entry of an order's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub code: StatusCode,
    /// Human-readable label; for conflicts this is the rejection reason.
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEntry {
    /// Creates an entry stamped with the current time.
    pub fn now(code: StatusCode, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }
}
