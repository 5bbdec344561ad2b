//! Datagram payloads, their classification, and subscription identity.
//!
//! A [`SatelliteDatagram`] is an opaque, immutable byte sequence. The core
//! never looks inside it; only its [`DatagramType`] influences routing
//! decisions (SOS traffic may wait for an attached link, keep-alives never do).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SubscriptionId
// ---------------------------------------------------------------------------

/// Identifier of the subscription (SIM profile) a transfer belongs to.
///
/// # Examples
///
/// ```
/// use satlink_models::SubscriptionId;
///
/// let sub = SubscriptionId::new(1);
/// assert_eq!(sub.to_string(), "sub-1");
/// assert_eq!(sub.value(), 1);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    /// Create a subscription id from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Return the raw value.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl From<u32> for SubscriptionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// DatagramId
// ---------------------------------------------------------------------------

/// Monotonically assigned identity of a received datagram.
///
/// Outbound datagrams have no id: each send is fire-and-forget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatagramId(u64);

impl DatagramId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the raw value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for DatagramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DatagramType
// ---------------------------------------------------------------------------

/// Classification tag attached to every datagram.
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
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DatagramType {
    /// Unclassified traffic.
    #[default]
    Unknown,
    /// An emergency (SOS) message.
    SosMessage,
    /// Periodic location sharing.
    LocationSharing,
    /// Link keep-alive.
    KeepAlive,
    /// Final SOS message of a session; the user still needs help.
    LastSosMessageStillNeedHelp,
    /// Final SOS message of a session; no further help needed.
    LastSosMessageNoHelpNeeded,
}

impl DatagramType {
    /// Returns `true` for the SOS family (priority traffic).
    pub fn is_sos(self) -> bool {
        matches!(
            self,
            Self::SosMessage | Self::LastSosMessageStillNeedHelp | Self::LastSosMessageNoHelpNeeded
        )
    }

    /// Returns `true` for the two "last SOS message" continuation variants.
    pub fn is_last_sos(self) -> bool {
        matches!(
            self,
            Self::LastSosMessageStillNeedHelp | Self::LastSosMessageNoHelpNeeded
        )
    }
}

// ---------------------------------------------------------------------------
// SatelliteDatagram
// ---------------------------------------------------------------------------

/// An immutable opaque payload exchanged over the satellite link.
///
/// Cloning is cheap: the bytes are shared.
///
/// # Examples
///
/// ```
/// use satlink_models::SatelliteDatagram;
///
/// let d = SatelliteDatagram::from(&b"hello"[..]);
/// assert_eq!(d.len(), 5);
/// assert_eq!(d.as_bytes(), b"hello");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SatelliteDatagram {
    data: Arc<[u8]>,
}

impl SatelliteDatagram {
    /// Create a datagram from owned bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    /// Borrow the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for SatelliteDatagram {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for SatelliteDatagram {
    fn from(data: &[u8]) -> Self {
        Self { data: data.into() }
    }
}

// ---------------------------------------------------------------------------
// ReceivedDatagram
// ---------------------------------------------------------------------------

/// A datagram pushed by the backend, together with the number of datagrams
/// still queued behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedDatagram {
    /// Backend-assigned id, used for acknowledgement.
    pub id: DatagramId,
    /// The payload.
    pub datagram: SatelliteDatagram,
    /// Datagrams still pending on the backend.
    pub pending_count: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn sos_family() {
        let sos: Vec<_> = DatagramType::iter().filter(|t| t.is_sos()).collect();
        assert_eq!(
            sos,
            vec![
                DatagramType::SosMessage,
                DatagramType::LastSosMessageStillNeedHelp,
                DatagramType::LastSosMessageNoHelpNeeded,
            ]
        );
        assert!(!DatagramType::KeepAlive.is_sos());
        assert!(!DatagramType::SosMessage.is_last_sos());
        assert!(DatagramType::LastSosMessageNoHelpNeeded.is_last_sos());
    }

    #[test]
    fn datagram_type_parses_snake_case() {
        assert_eq!(
            DatagramType::from_str("location_sharing").unwrap(),
            DatagramType::LocationSharing
        );
        assert_eq!(DatagramType::KeepAlive.to_string(), "keep_alive");
        assert!(DatagramType::from_str("sms").is_err());
    }

    #[test]
    fn datagram_clone_shares_bytes() {
        let a = SatelliteDatagram::new(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.as_bytes(), b.as_bytes()));
        assert!(SatelliteDatagram::new(vec![]).is_empty());
    }

    #[test]
    fn datagram_id_wraps() {
        assert_eq!(DatagramId::new(u64::MAX).next(), DatagramId::new(0));
        assert_eq!(DatagramId::new(7).to_string(), "#7");
    }
}
