//! Per-direction datagram transfer states.
//!
//! Each subscription has one [`DatagramTransferState`] for the send direction
//! and one for the receive direction. A direction is either [`Idle`] or in
//! exactly one active state; terminal states (success, failure, none) are
//! reported once and then collapse back to idle.
//!
//! [`Idle`]: DatagramTransferState::Idle

use serde::{Deserialize, Serialize};

use crate::error::ResultCode;

// ---------------------------------------------------------------------------
// TransferDirection
// ---------------------------------------------------------------------------

/// Which side of the link a state refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransferDirection {
    /// Device → satellite.
    Send,
    /// Satellite → device.
    Receive,
}

// ---------------------------------------------------------------------------
// DatagramTransferState
// ---------------------------------------------------------------------------

/// Transfer state of one direction of one subscription.
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
pub enum DatagramTransferState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A datagram is being sent.
    Sending,
    /// The last send completed.
    SendSuccess,
    /// The last send failed.
    SendFailed,
    /// A poll for pending datagrams is in progress.
    Receiving,
    /// A datagram was received.
    ReceiveSuccess,
    /// The last poll failed.
    ReceiveFailed,
    /// The poll completed with nothing to deliver.
    ReceiveNone,
    /// Waiting for the link to attach before polling.
    WaitingToConnect,
}

impl DatagramTransferState {
    /// Returns `true` for the reported-once outcome states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SendSuccess
                | Self::SendFailed
                | Self::ReceiveSuccess
                | Self::ReceiveFailed
                | Self::ReceiveNone
        )
    }

    /// Returns `true` for states that open a transfer attempt.
    pub fn is_begin(self) -> bool {
        matches!(self, Self::Sending | Self::Receiving | Self::WaitingToConnect)
    }

    /// Returns `true` if the state counts as data moving over the link.
    ///
    /// Failures and "waiting to connect" do not keep the session in its
    /// transferring state.
    pub fn is_transferring(self) -> bool {
        matches!(
            self,
            Self::Sending | Self::SendSuccess | Self::Receiving | Self::ReceiveSuccess
        )
    }

    /// The direction this state belongs to, or `None` for [`Self::Idle`].
    pub fn direction(self) -> Option<TransferDirection> {
        match self {
            Self::Idle => None,
            Self::Sending | Self::SendSuccess | Self::SendFailed => Some(TransferDirection::Send),
            Self::Receiving
            | Self::ReceiveSuccess
            | Self::ReceiveFailed
            | Self::ReceiveNone
            | Self::WaitingToConnect => Some(TransferDirection::Receive),
        }
    }
}

// ---------------------------------------------------------------------------
// TransferStatus
// ---------------------------------------------------------------------------

/// A status report for one direction: state, pending count and result code.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    /// The new state.
    pub state: DatagramTransferState,
    /// Backend-reported outstanding datagram count.
    pub pending_count: u32,
    /// Outcome code; non-success only for failure states.
    pub result: ResultCode,
}

impl TransferStatus {
    /// Build a status report.
    pub fn new(state: DatagramTransferState, pending_count: u32, result: ResultCode) -> Self {
        Self {
            state,
            pending_count,
            result,
        }
    }

    /// The idle report every transfer ends with.
    pub fn idle() -> Self {
        Self::new(DatagramTransferState::Idle, 0, ResultCode::Success)
    }
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::idle()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = DatagramTransferState::iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 5);
        assert!(!DatagramTransferState::Idle.is_terminal());
        assert!(!DatagramTransferState::WaitingToConnect.is_terminal());
    }

    #[test]
    fn every_non_idle_state_has_a_direction() {
        for state in DatagramTransferState::iter() {
            assert_eq!(state.direction().is_none(), state == DatagramTransferState::Idle);
        }
        assert_eq!(
            DatagramTransferState::WaitingToConnect.direction(),
            Some(TransferDirection::Receive)
        );
    }

    #[test]
    fn waiting_is_not_transferring() {
        assert!(!DatagramTransferState::WaitingToConnect.is_transferring());
        assert!(!DatagramTransferState::SendFailed.is_transferring());
        assert!(DatagramTransferState::SendSuccess.is_transferring());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(DatagramTransferState::SendFailed.to_string(), "SEND_FAILED");
        assert_eq!(
            DatagramTransferState::WaitingToConnect.to_string(),
            "WAITING_TO_CONNECT"
        );
    }

    #[test]
    fn idle_status() {
        let idle = TransferStatus::idle();
        assert_eq!(idle.state, DatagramTransferState::Idle);
        assert_eq!(idle.pending_count, 0);
        assert_eq!(idle.result, ResultCode::Success);
        assert_eq!(TransferStatus::default(), idle);
    }
}
