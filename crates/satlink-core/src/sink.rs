//! Outward-facing callback interfaces.
//!
//! * [`PointingStatusSink`] receives every transfer-state change the
//!   controller fans out (the pointing UI and registered status listeners).
//! * [`SatelliteDatagramListener`] receives incoming datagrams, one at a
//!   time: the next delivery to a listener waits until it acknowledges the
//!   previous one through [`DatagramAck`].
//!
//! Both are one-way and are invoked from actor loops, so implementations
//! must return promptly.

use satlink_models::{DatagramId, DatagramType, SatelliteDatagram, SubscriptionId, TransferStatus};

use crate::receiver::DatagramAck;

/// Consumer of transfer-state changes.
pub trait PointingStatusSink: Send + Sync {
    /// The send direction of `sub` changed.
    fn update_send_datagram_transfer_state(
        &self,
        sub: SubscriptionId,
        datagram_type: DatagramType,
        status: TransferStatus,
    );

    /// The receive direction of `sub` changed.
    fn update_receive_datagram_transfer_state(&self, sub: SubscriptionId, status: TransferStatus);

    /// A send was admitted; the pointing UI may be shown.
    fn start_pointing_ui(&self, _need_full_screen: bool, _demo_mode: bool, _emergency: bool) {}
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPointingSink;

impl PointingStatusSink for NoopPointingSink {
    fn update_send_datagram_transfer_state(&self, _: SubscriptionId, _: DatagramType, _: TransferStatus) {}

    fn update_receive_datagram_transfer_state(&self, _: SubscriptionId, _: TransferStatus) {}
}

/// Consumer of incoming datagrams for one subscription.
pub trait SatelliteDatagramListener: Send + Sync {
    /// A datagram arrived. Call [`DatagramAck::acknowledge`] on
    /// `delivery.ack` to receive the next one.
    fn on_satellite_datagram_received(&self, delivery: DatagramDelivery);
}

/// One datagram handed to one listener.
#[derive(Debug)]
pub struct DatagramDelivery {
    /// Subscription the datagram arrived on.
    pub sub: SubscriptionId,
    /// Receive-side id.
    pub id: DatagramId,
    /// The payload.
    pub datagram: SatelliteDatagram,
    /// Datagrams still pending on the backend.
    pub pending_count: u32,
    /// Releases the next delivery to this listener.
    pub ack: DatagramAck,
}
