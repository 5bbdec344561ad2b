//! Result codes returned to callers and carried in status reports.
//!
//! [`ResultCode`] is the closed set the backend and the status sink speak.
//! [`SatelliteError`] is its failure half, returned from every fallible
//! caller-facing operation.

use serde::{Deserialize, Serialize};

/// Outcome code attached to transfer results and status reports.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    /// The operation completed.
    #[default]
    Success,
    /// The backend reported a failure.
    ServiceError,
    /// The satellite could not be reached in time.
    NotReachable,
    /// No backend channel exists for the subscription.
    InvalidTelephonyState,
    /// The opposite direction is busy.
    ModemBusy,
    /// The request was aborted because the modem turned off.
    RequestAborted,
    /// The modem is not in a state that accepts requests.
    InvalidModemState,
}

impl ResultCode {
    /// Convert into a `Result`, mapping [`ResultCode::Success`] to `Ok`.
    pub fn into_result(self) -> Result<(), SatelliteError> {
        match self {
            Self::Success => Ok(()),
            Self::ServiceError => Err(SatelliteError::ServiceError),
            Self::NotReachable => Err(SatelliteError::NotReachable),
            Self::InvalidTelephonyState => Err(SatelliteError::InvalidTelephonyState),
            Self::ModemBusy => Err(SatelliteError::ModemBusy),
            Self::RequestAborted => Err(SatelliteError::RequestAborted),
            Self::InvalidModemState => Err(SatelliteError::InvalidModemState),
        }
    }
}

impl From<Result<(), SatelliteError>> for ResultCode {
    fn from(result: Result<(), SatelliteError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => e.code(),
        }
    }
}

/// Failure of a satellite datagram operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SatelliteError {
    /// The backend reported a failure.
    #[error("satellite service error")]
    ServiceError,
    /// The satellite could not be reached before the wait timed out.
    #[error("satellite not reachable")]
    NotReachable,
    /// No backend channel exists for the subscription.
    #[error("no backend channel for this subscription")]
    InvalidTelephonyState,
    /// The opposite transfer direction is busy.
    #[error("modem busy with another transfer")]
    ModemBusy,
    /// The modem turned off while the request was outstanding.
    #[error("request aborted")]
    RequestAborted,
    /// The modem is not in a state that accepts requests.
    #[error("invalid modem state")]
    InvalidModemState,
}

impl SatelliteError {
    /// The result code for this error.
    pub fn code(self) -> ResultCode {
        match self {
            Self::ServiceError => ResultCode::ServiceError,
            Self::NotReachable => ResultCode::NotReachable,
            Self::InvalidTelephonyState => ResultCode::InvalidTelephonyState,
            Self::ModemBusy => ResultCode::ModemBusy,
            Self::RequestAborted => ResultCode::RequestAborted,
            Self::InvalidModemState => ResultCode::InvalidModemState,
        }
    }
}
