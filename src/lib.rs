mod collaborator;
mod def;
mod expiry;
mod pin_db;
mod pin_manager;
mod pinner;
mod reserve_companion;
mod space_db;
mod space_manager;
mod write_behind;

#[cfg(test)]
mod pin_manager_tests;

pub use collaborator::*;
pub use def::*;
pub use expiry::ExpiryScheduler;
pub use pin_db::PinDb;
pub use pin_manager::{PinManager, PinManagerConfig};
pub use pinner::{PinnerState, UnpinnerState};
pub use reserve_companion::{ReserveOutcome, ReserveSpaceCompanion, ReserveState, ReserveTarget};
pub use space_db::{LockedReservationInfo, SpaceDb};
pub use space_manager::{ReserveRequest, SpaceManager, SpaceManagerConfig};
pub use write_behind::{PinWriteOp, WriteBehindQueue};

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LeaseError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Unix-millis timestamp rendered for listings and logs.
pub fn format_millis(ms: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}
