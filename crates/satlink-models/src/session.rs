//! Session and modem states.
//!
//! [`SessionState`] is the state of the session state machine itself.
//! [`ModemState`] is the vocabulary of the modem feed, and also what the
//! session publishes to its collaborators.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// State of the satellite session state machine.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Satellite communication is not supported on this device.
    Unavailable,
    /// The modem is powered off.
    PowerOff,
    /// Powered on, nothing happening.
    Idle,
    /// Attach-required link, not attached.
    NotConnected,
    /// Attach-required link, attached.
    Connected,
    /// Recently transferred; listening for more traffic.
    Listening,
    /// A datagram is moving in at least one direction.
    Transferring,
}

impl SessionState {
    /// Returns `true` for every state in which the modem is on.
    pub fn is_powered(self) -> bool {
        !matches!(self, Self::Unavailable | Self::PowerOff)
    }

    /// The modem state collaborators observe for this session state.
    pub fn modem_state(self) -> ModemState {
        match self {
            Self::Unavailable => ModemState::Unavailable,
            Self::PowerOff => ModemState::Off,
            Self::Idle => ModemState::Idle,
            Self::NotConnected => ModemState::NotConnected,
            Self::Connected => ModemState::Connected,
            Self::Listening => ModemState::Listening,
            Self::Transferring => ModemState::DatagramTransferring,
        }
    }
}

// ---------------------------------------------------------------------------
// ModemState
// ---------------------------------------------------------------------------

/// Modem state as reported by the modem feed.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModemState {
    /// Powered and idle.
    Idle,
    /// Listening for incoming traffic.
    Listening,
    /// Datagrams are being exchanged.
    DatagramTransferring,
    /// Powered off.
    Off,
    /// Not available on this device.
    Unavailable,
    /// Attach-required link, not attached.
    NotConnected,
    /// Attach-required link, attached.
    Connected,
}

impl ModemState {
    /// Returns `true` when the link can carry data without first attaching.
    pub fn is_connected_equivalent(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::DatagramTransferring | Self::Listening
        )
    }
}
