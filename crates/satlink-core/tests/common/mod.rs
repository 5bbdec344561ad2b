//! Shared fixtures for the session integration tests: a scripted backend,
//! a recording pointing sink and a recording datagram listener.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, FutureExt};
use satlink_core::{
    BackendChannel, BackendFuture, DatagramDelivery, DatagramSink, PointingStatusSink, SatelliteConfig,
    SatelliteDatagramListener, SatelliteSession,
};
use satlink_models::{
    DatagramId, DatagramTransferState, DatagramType, SatelliteDatagram, SatelliteError, SessionState,
    SubscriptionId, TransferStatus,
};

pub const SUB: SubscriptionId = SubscriptionId::new(1);

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

/// Backend whose outcomes are set by the test.
#[derive(Default)]
pub struct FakeBackend {
    pub sends: Mutex<Vec<(SubscriptionId, Vec<u8>, bool)>>,
    pub send_error: Mutex<Option<SatelliteError>>,
    /// Sends never complete while set.
    pub hang_sends: AtomicBool,
    pub polls: AtomicUsize,
    pub poll_error: Mutex<Option<SatelliteError>>,
    pub sinks: Mutex<HashMap<SubscriptionId, DatagramSink>>,
    pub registrations: AtomicUsize,
    pub unregistrations: AtomicUsize,
    pub acks: Mutex<Vec<DatagramId>>,
    pub scanning: Mutex<Vec<bool>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a datagram through the sink registered for `sub`.
    pub fn push(&self, sub: SubscriptionId, id: u64, payload: &[u8], pending_count: u32) {
        let sinks = self.sinks.lock().unwrap();
        let sink = sinks.get(&sub).expect("no datagram channel open");
        sink.on_datagram_received(DatagramId::new(id), SatelliteDatagram::from(payload), pending_count);
    }

    pub fn acks(&self) -> Vec<DatagramId> {
        self.acks.lock().unwrap().clone()
    }
}

impl BackendChannel for FakeBackend {
    fn send_datagram(&self, sub: SubscriptionId, datagram: SatelliteDatagram, is_last_sos_message: bool) -> BackendFuture {
        self.sends
            .lock()
            .unwrap()
            .push((sub, datagram.as_bytes().to_vec(), is_last_sos_message));
        if self.hang_sends.load(Ordering::SeqCst) {
            return future::pending().boxed();
        }
        let result = match *self.send_error.lock().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        future::ready(result).boxed()
    }

    fn poll_pending_datagrams(&self, _: SubscriptionId) -> BackendFuture {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let result = match *self.poll_error.lock().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        future::ready(result).boxed()
    }

    fn register_for_datagrams(&self, sub: SubscriptionId, sink: DatagramSink) -> Result<(), SatelliteError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().insert(sub, sink);
        Ok(())
    }

    fn unregister_for_datagrams(&self, sub: SubscriptionId) {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().remove(&sub);
    }

    fn acknowledge_datagram(&self, _: SubscriptionId, id: DatagramId) {
        self.acks.lock().unwrap().push(id);
    }

    fn set_cellular_scanning_suppressed(&self, suppressed: bool) -> BackendFuture {
        self.scanning.lock().unwrap().push(suppressed);
        future::ready(Ok(())).boxed()
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Pointing sink that keeps every status it is given.
#[derive(Default)]
pub struct RecordingSink {
    pub send: Mutex<Vec<TransferStatus>>,
    pub receive: Mutex<Vec<TransferStatus>>,
    pub send_types: Mutex<Vec<DatagramType>>,
    pub pointing_ui_requests: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn send_states(&self) -> Vec<DatagramTransferState> {
        self.send.lock().unwrap().iter().map(|s| s.state).collect()
    }

    pub fn receive_states(&self) -> Vec<DatagramTransferState> {
        self.receive.lock().unwrap().iter().map(|s| s.state).collect()
    }

    pub fn send_statuses(&self) -> Vec<TransferStatus> {
        self.send.lock().unwrap().clone()
    }

    pub fn receive_statuses(&self) -> Vec<TransferStatus> {
        self.receive.lock().unwrap().clone()
    }
}

impl PointingStatusSink for RecordingSink {
    fn update_send_datagram_transfer_state(&self, _: SubscriptionId, datagram_type: DatagramType, status: TransferStatus) {
        self.send.lock().unwrap().push(status);
        self.send_types.lock().unwrap().push(datagram_type);
    }

    fn update_receive_datagram_transfer_state(&self, _: SubscriptionId, status: TransferStatus) {
        self.receive.lock().unwrap().push(status);
    }

    fn start_pointing_ui(&self, _: bool, _: bool, _: bool) {
        self.pointing_ui_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Datagram listener that holds deliveries until the test acknowledges them.
#[derive(Default)]
pub struct RecordingListener {
    pub deliveries: Mutex<Vec<DatagramDelivery>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Acknowledge the oldest unacknowledged delivery and return its payload.
    pub fn ack_next(&self) -> Vec<u8> {
        let delivery = self.deliveries.lock().unwrap().remove(0);
        let payload = delivery.datagram.as_bytes().to_vec();
        delivery.ack.acknowledge();
        payload
    }
}

impl SatelliteDatagramListener for RecordingListener {
    fn on_satellite_datagram_received(&self, delivery: DatagramDelivery) {
        self.deliveries.lock().unwrap().push(delivery);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub struct TestSession {
    pub session: SatelliteSession,
    pub backend: Arc<FakeBackend>,
    pub sink: Arc<RecordingSink>,
}

pub fn start(config: SatelliteConfig) -> TestSession {
    let backend = FakeBackend::new();
    let sink = RecordingSink::new();
    let session = SatelliteSession::start(config, backend.clone(), sink.clone());
    TestSession { session, backend, sink }
}

/// Start a session and switch satellite mode on.
pub async fn start_enabled(config: SatelliteConfig) -> TestSession {
    let attach_required = config.attach_required;
    let t = start(config);
    t.session.set_satellite_enabled(true);
    let expected = if attach_required {
        SessionState::NotConnected
    } else {
        SessionState::Idle
    };
    reach(&t.session, expected).await;
    t
}

pub async fn reach(session: &SatelliteSession, expected: SessionState) {
    let mut state = session.session_state();
    tokio::time::timeout(Duration::from_secs(3_600), state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("session never reached {expected}"))
        .expect("session stopped");
}

/// Poll `condition` every 10ms of (virtual) time until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3_600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub fn datagram(bytes: &[u8]) -> SatelliteDatagram {
    SatelliteDatagram::from(bytes)
}
