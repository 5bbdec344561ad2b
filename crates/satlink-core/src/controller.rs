//! Datagram controller: the canonical owner of per-subscription transfer
//! state.
//!
//! Every caller request enters here first. The controller admits or refuses
//! it (one direction active at a time, modem powered), then hands it to the
//! dispatcher or receiver. Those actors report status changes back through
//! [`ControllerHandle::update_send_status`] and
//! [`ControllerHandle::update_receive_status`]; the controller records them
//! and fans them out to the session state machine, the pointing sink and any
//! registered transfer-state listeners.
//!
//! A request that arrives while the modem looks unpowered is bounced once
//! through the session state machine before it is judged, so a power-on fed
//! to the session ahead of the request is always seen first.
//!
//! In demo mode the controller also owns the single-slot demo datagram cache
//! and keeps the receive loop going while the device is aligned.

use std::collections::HashMap;
use std::sync::Arc;

use satlink_models::{
    DatagramTransferState, DatagramType, ModemState, SatelliteDatagram, SatelliteError,
    SubscriptionId, TransferDirection, TransferStatus,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::actor::{post, respond, Inbox, Mailbox, Responder};
use crate::config::SatelliteConfig;
use crate::dispatcher::{DispatcherHandle, SendRequest};
use crate::receiver::{PollRequest, ReceiverHandle};
use crate::sink::PointingStatusSink;
use crate::state_machine::StateMachineHandle;

/// Classification a poll is checked with: a poll drains whatever is queued
/// for the device, emergency replies included, so it waits for an attached
/// link like SOS traffic.
const POLL_CLASSIFICATION: DatagramType = DatagramType::SosMessage;

/// Returns `true` if a transfer of `datagram_type` must wait for an
/// attach-required link to reach a connected-equivalent state first.
///
/// Keep-alives and unclassified traffic never wait.
pub fn needs_waiting_for_satellite_connected(
    attach_required: bool,
    modem_state: ModemState,
    datagram_type: DatagramType,
) -> bool {
    attach_required && datagram_type.is_sos() && !modem_state.is_connected_equivalent()
}

// ---------------------------------------------------------------------------
// Events and handle
// ---------------------------------------------------------------------------

/// Point-in-time view of one subscription's transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    /// Send-direction state.
    pub send: DatagramTransferState,
    /// Receive-direction state.
    pub receive: DatagramTransferState,
    /// No send in progress or queued.
    pub sending_idle: bool,
    /// No poll in progress or queued.
    pub polling_idle: bool,
}

/// A caller request waiting to be judged against the current modem state.
pub(crate) enum Admission {
    Send(SendRequest),
    Poll {
        sub: SubscriptionId,
        responder: Option<Responder>,
    },
    Snapshot {
        sub: SubscriptionId,
        reply: oneshot::Sender<TransferSnapshot>,
    },
}

pub(crate) enum ControllerEvent {
    Admit(Admission),
    /// An admission back from its trip through the session state machine.
    Readmit(Admission),
    SendStatus {
        sub: SubscriptionId,
        datagram_type: DatagramType,
        status: TransferStatus,
    },
    ReceiveStatus {
        sub: SubscriptionId,
        status: TransferStatus,
    },
    SendFinished {
        sub: SubscriptionId,
    },
    PollFinished {
        sub: SubscriptionId,
    },
    CollapseToIdle {
        sub: SubscriptionId,
        direction: TransferDirection,
        generation: u64,
    },
    ModemStateChanged(ModemState),
    DeviceAligned(bool),
    PushDemoDatagram {
        datagram_type: DatagramType,
        datagram: SatelliteDatagram,
    },
    RegisterListener {
        sub: SubscriptionId,
        listener: Arc<dyn PointingStatusSink>,
    },
    UnregisterListener {
        sub: SubscriptionId,
        listener: Arc<dyn PointingStatusSink>,
    },
}

/// Mailbox address of the controller.
#[derive(Clone)]
pub(crate) struct ControllerHandle {
    mailbox: Mailbox<ControllerEvent>,
}

impl ControllerHandle {
    pub(crate) fn new(mailbox: Mailbox<ControllerEvent>) -> Self {
        Self { mailbox }
    }

    fn post(&self, event: ControllerEvent) {
        post(&self.mailbox, "controller", event);
    }

    pub(crate) fn request_send(&self, request: SendRequest) {
        self.post(ControllerEvent::Admit(Admission::Send(request)));
    }

    pub(crate) fn request_poll(&self, sub: SubscriptionId, responder: Responder) {
        self.post(ControllerEvent::Admit(Admission::Poll {
            sub,
            responder: Some(responder),
        }));
    }

    pub(crate) fn readmit(&self, admission: Admission) {
        self.post(ControllerEvent::Readmit(admission));
    }

    pub(crate) fn update_send_status(
        &self,
        sub: SubscriptionId,
        datagram_type: DatagramType,
        status: TransferStatus,
    ) {
        self.post(ControllerEvent::SendStatus {
            sub,
            datagram_type,
            status,
        });
    }

    pub(crate) fn update_receive_status(&self, sub: SubscriptionId, status: TransferStatus) {
        self.post(ControllerEvent::ReceiveStatus { sub, status });
    }

    pub(crate) fn send_finished(&self, sub: SubscriptionId) {
        self.post(ControllerEvent::SendFinished { sub });
    }

    pub(crate) fn poll_finished(&self, sub: SubscriptionId) {
        self.post(ControllerEvent::PollFinished { sub });
    }

    pub(crate) fn modem_state_changed(&self, state: ModemState) {
        self.post(ControllerEvent::ModemStateChanged(state));
    }

    pub(crate) fn set_device_aligned_with_satellite(&self, aligned: bool) {
        self.post(ControllerEvent::DeviceAligned(aligned));
    }

    pub(crate) fn push_demo_mode_datagram(&self, datagram_type: DatagramType, datagram: SatelliteDatagram) {
        self.post(ControllerEvent::PushDemoDatagram {
            datagram_type,
            datagram,
        });
    }

    pub(crate) fn register_listener(&self, sub: SubscriptionId, listener: Arc<dyn PointingStatusSink>) {
        self.post(ControllerEvent::RegisterListener { sub, listener });
    }

    pub(crate) fn unregister_listener(&self, sub: SubscriptionId, listener: Arc<dyn PointingStatusSink>) {
        self.post(ControllerEvent::UnregisterListener { sub, listener });
    }

    pub(crate) async fn snapshot(&self, sub: SubscriptionId) -> Option<TransferSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.post(ControllerEvent::Admit(Admission::Snapshot { sub, reply }));
        rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Canonical state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DirectionState {
    status: TransferStatus,
    datagram_type: DatagramType,
    /// Bumped on every recorded update; a scheduled collapse only applies to
    /// the generation it was scheduled for.
    generation: u64,
    /// Requests admitted to the worker and not yet finished.
    outstanding: usize,
}

impl DirectionState {
    fn is_idle(&self) -> bool {
        self.status.state == DatagramTransferState::Idle && self.outstanding == 0
    }
}

#[derive(Debug, Default)]
struct SubscriptionTransfer {
    send: DirectionState,
    receive: DirectionState,
    /// A demo-mode receive poll should run once both directions are idle.
    poll_due: bool,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub(crate) struct DatagramController {
    attach_required: bool,
    demo_mode: bool,
    mailbox: Mailbox<ControllerEvent>,
    dispatcher: DispatcherHandle,
    receiver: ReceiverHandle,
    state_machine: StateMachineHandle,
    pointing_sink: Arc<dyn PointingStatusSink>,
    listeners: HashMap<SubscriptionId, Vec<Arc<dyn PointingStatusSink>>>,
    subscriptions: HashMap<SubscriptionId, SubscriptionTransfer>,
    modem_state: ModemState,
    aligned: bool,
    demo_datagram: Option<(DatagramType, SatelliteDatagram)>,
    /// Admissions out on a trip through the state machine.
    deferred: usize,
}

impl DatagramController {
    pub(crate) fn new(
        config: &SatelliteConfig,
        mailbox: Mailbox<ControllerEvent>,
        dispatcher: DispatcherHandle,
        receiver: ReceiverHandle,
        state_machine: StateMachineHandle,
        pointing_sink: Arc<dyn PointingStatusSink>,
    ) -> Self {
        Self {
            attach_required: config.attach_required,
            demo_mode: config.demo_mode,
            mailbox,
            dispatcher,
            receiver,
            state_machine,
            pointing_sink,
            listeners: HashMap::new(),
            subscriptions: HashMap::new(),
            modem_state: if config.supported {
                ModemState::Off
            } else {
                ModemState::Unavailable
            },
            aligned: false,
            demo_datagram: None,
            deferred: 0,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox<ControllerEvent>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event);
        }
        debug!("controller stopped");
    }

    fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Admit(admission) => self.admit(admission, false),
            ControllerEvent::Readmit(admission) => self.admit(admission, true),
            ControllerEvent::SendStatus {
                sub,
                datagram_type,
                status,
            } => self.update_send_status(sub, datagram_type, status),
            ControllerEvent::ReceiveStatus { sub, status } => self.update_receive_status(sub, status),
            ControllerEvent::SendFinished { sub } => {
                let entry = self.subscription(sub);
                entry.send.outstanding = entry.send.outstanding.saturating_sub(1);
                self.maybe_poll(sub);
            }
            ControllerEvent::PollFinished { sub } => {
                let entry = self.subscription(sub);
                entry.receive.outstanding = entry.receive.outstanding.saturating_sub(1);
                self.maybe_poll(sub);
            }
            ControllerEvent::CollapseToIdle {
                sub,
                direction,
                generation,
            } => self.collapse_to_idle(sub, direction, generation),
            ControllerEvent::ModemStateChanged(state) => {
                debug!(from = %self.modem_state, to = %state, "controller observed modem state");
                self.modem_state = state;
            }
            ControllerEvent::DeviceAligned(aligned) => self.set_device_aligned_with_satellite(aligned),
            ControllerEvent::PushDemoDatagram {
                datagram_type,
                datagram,
            } => self.push_demo_mode_datagram(datagram_type, datagram),
            ControllerEvent::RegisterListener { sub, listener } => {
                let entry = self.listeners.entry(sub).or_default();
                if !entry.iter().any(|l| same_sink(l, &listener)) {
                    entry.push(listener);
                }
            }
            ControllerEvent::UnregisterListener { sub, listener } => {
                if let Some(entry) = self.listeners.get_mut(&sub) {
                    entry.retain(|l| !same_sink(l, &listener));
                    if entry.is_empty() {
                        self.listeners.remove(&sub);
                    }
                }
            }
        }
    }

    fn subscription(&mut self, sub: SubscriptionId) -> &mut SubscriptionTransfer {
        self.subscriptions.entry(sub).or_default()
    }

    fn modem_powered(&self) -> bool {
        !matches!(self.modem_state, ModemState::Off | ModemState::Unavailable)
    }

    // -- admission ---------------------------------------------------------

    /// Judge a request, or bounce it through the state machine while the
    /// modem looks unpowered. Once one request is bounced, later ones follow
    /// it until it returns so call order holds.
    fn admit(&mut self, admission: Admission, readmitted: bool) {
        if readmitted {
            self.deferred = self.deferred.saturating_sub(1);
        } else if !self.modem_powered() || self.deferred > 0 {
            self.deferred += 1;
            debug!(deferred = self.deferred, modem = %self.modem_state, "admission deferred behind session feed");
            self.state_machine.readmit(admission);
            return;
        }
        match admission {
            Admission::Send(request) => self.on_send_request(request),
            Admission::Poll { sub, responder } => self.on_poll_request(sub, responder),
            Admission::Snapshot { sub, reply } => {
                let entry = self.subscription(sub);
                let _ = reply.send(TransferSnapshot {
                    send: entry.send.status.state,
                    receive: entry.receive.status.state,
                    sending_idle: entry.send.is_idle(),
                    polling_idle: entry.receive.is_idle(),
                });
            }
        }
    }

    fn on_send_request(&mut self, request: SendRequest) {
        let sub = request.sub;
        if !self.modem_powered() {
            warn!(sub = %sub, modem = %self.modem_state, "send refused: modem not powered");
            respond(request.responder, Err(SatelliteError::InvalidModemState));
            return;
        }
        let entry = self.subscription(sub);
        if !entry.receive.is_idle() {
            warn!(sub = %sub, receive = %entry.receive.status.state, "send refused: receive direction busy");
            respond(request.responder, Err(SatelliteError::ModemBusy));
            return;
        }
        entry.send.outstanding += 1;
        self.pointing_sink.start_pointing_ui(
            request.need_full_screen_pointing_ui,
            self.demo_mode,
            request.datagram_type.is_sos(),
        );
        debug!(sub = %sub, datagram_type = %request.datagram_type, "send admitted");
        self.dispatcher.send(request);
    }

    fn on_poll_request(&mut self, sub: SubscriptionId, responder: Option<Responder>) {
        if !self.modem_powered() {
            warn!(sub = %sub, modem = %self.modem_state, "poll refused: modem not powered");
            respond(responder, Err(SatelliteError::InvalidModemState));
            return;
        }
        let entry = self.subscription(sub);
        if !entry.send.is_idle() {
            warn!(sub = %sub, send = %entry.send.status.state, "poll refused: send direction busy");
            respond(responder, Err(SatelliteError::ModemBusy));
            return;
        }
        entry.receive.outstanding += 1;
        self.forward_poll(sub, responder);
    }

    fn forward_poll(&mut self, sub: SubscriptionId, responder: Option<Responder>) {
        let wait_for_connected = self.needs_waiting_for_satellite_connected(POLL_CLASSIFICATION);
        let demo_datagram = if self.demo_mode {
            self.take_demo_mode_datagram()
        } else {
            None
        };
        debug!(sub = %sub, wait_for_connected, "poll admitted");
        self.receiver.poll(PollRequest {
            sub,
            responder,
            wait_for_connected,
            demo_datagram,
        });
    }

    /// Run a demo-mode poll nobody asked for, once it is due and the link is
    /// quiet in both directions.
    fn maybe_poll(&mut self, sub: SubscriptionId) {
        if !self.demo_mode || !self.aligned || !self.modem_powered() {
            return;
        }
        let entry = self.subscription(sub);
        if !entry.poll_due || !entry.send.is_idle() || !entry.receive.is_idle() {
            return;
        }
        entry.poll_due = false;
        entry.receive.outstanding += 1;
        debug!(sub = %sub, "demo mode: polling for pending datagrams");
        self.forward_poll(sub, None);
    }

    pub(crate) fn needs_waiting_for_satellite_connected(&self, datagram_type: DatagramType) -> bool {
        needs_waiting_for_satellite_connected(self.attach_required, self.modem_state, datagram_type)
    }

    // -- status updates ----------------------------------------------------

    /// A new state should be recorded but not propagated while the modem is
    /// off: nothing is starting on a powered-down link.
    fn suppressed(&self, state: DatagramTransferState) -> bool {
        !self.modem_powered() && state.is_begin()
    }

    fn update_send_status(&mut self, sub: SubscriptionId, datagram_type: DatagramType, status: TransferStatus) {
        let suppressed = self.suppressed(status.state);
        let demo_mode = self.demo_mode;
        let entry = self.subscription(sub);
        let previous = entry.send.status;
        entry.send.status = status;
        entry.send.datagram_type = datagram_type;
        entry.send.generation += 1;
        let generation = entry.send.generation;
        if status.state == DatagramTransferState::SendSuccess && demo_mode {
            entry.poll_due = true;
        }

        if suppressed {
            debug!(sub = %sub, state = %status.state, "send status recorded, fan-out suppressed");
            return;
        }
        if previous.state == DatagramTransferState::Idle && status.state == DatagramTransferState::Idle {
            return;
        }

        debug!(sub = %sub, from = %previous.state, to = %status.state, pending = status.pending_count, result = %status.result, "send status");
        self.notify_state_machine(sub);
        self.pointing_sink
            .update_send_datagram_transfer_state(sub, datagram_type, status);
        for listener in self.listeners.get(&sub).into_iter().flatten() {
            listener.update_send_datagram_transfer_state(sub, datagram_type, status);
        }

        if status.state.is_terminal() {
            post(
                &self.mailbox,
                "controller",
                ControllerEvent::CollapseToIdle {
                    sub,
                    direction: TransferDirection::Send,
                    generation,
                },
            );
        }
        if status.state == DatagramTransferState::Idle {
            self.maybe_poll(sub);
        }
    }

    fn update_receive_status(&mut self, sub: SubscriptionId, status: TransferStatus) {
        let suppressed = self.suppressed(status.state);
        let demo_mode = self.demo_mode;
        let entry = self.subscription(sub);
        let previous = entry.receive.status;
        entry.receive.status = status;
        entry.receive.generation += 1;
        let generation = entry.receive.generation;
        if demo_mode
            && status.state == DatagramTransferState::Idle
            && previous.state == DatagramTransferState::ReceiveSuccess
            && previous.pending_count > 0
        {
            entry.poll_due = true;
        }

        if suppressed {
            debug!(sub = %sub, state = %status.state, "receive status recorded, fan-out suppressed");
            return;
        }
        if previous.state == DatagramTransferState::Idle && status.state == DatagramTransferState::Idle {
            return;
        }

        debug!(sub = %sub, from = %previous.state, to = %status.state, pending = status.pending_count, result = %status.result, "receive status");
        self.notify_state_machine(sub);
        self.pointing_sink.update_receive_datagram_transfer_state(sub, status);
        for listener in self.listeners.get(&sub).into_iter().flatten() {
            listener.update_receive_datagram_transfer_state(sub, status);
        }

        if status.state.is_terminal() {
            post(
                &self.mailbox,
                "controller",
                ControllerEvent::CollapseToIdle {
                    sub,
                    direction: TransferDirection::Receive,
                    generation,
                },
            );
        }
        if status.state == DatagramTransferState::Idle {
            self.maybe_poll(sub);
        }
    }

    fn notify_state_machine(&mut self, sub: SubscriptionId) {
        let entry = self.subscription(sub);
        let (send, receive) = (entry.send.status.state, entry.receive.status.state);
        self.state_machine.transfer_state_changed(sub, send, receive);
    }

    fn collapse_to_idle(&mut self, sub: SubscriptionId, direction: TransferDirection, generation: u64) {
        let entry = self.subscription(sub);
        let (state, current, datagram_type) = match direction {
            TransferDirection::Send => (
                entry.send.status.state,
                entry.send.generation,
                entry.send.datagram_type,
            ),
            TransferDirection::Receive => (
                entry.receive.status.state,
                entry.receive.generation,
                DatagramType::Unknown,
            ),
        };
        if current != generation || !state.is_terminal() {
            return;
        }
        debug!(sub = %sub, %direction, from = %state, "collapsing terminal state to idle");
        match direction {
            TransferDirection::Send => self.update_send_status(sub, datagram_type, TransferStatus::idle()),
            TransferDirection::Receive => self.update_receive_status(sub, TransferStatus::idle()),
        }
    }

    // -- demo mode ---------------------------------------------------------

    fn set_device_aligned_with_satellite(&mut self, aligned: bool) {
        if !self.demo_mode {
            warn!(aligned, "alignment notification ignored outside demo mode");
            return;
        }
        info!(aligned, "device alignment changed");
        self.dispatcher.set_device_aligned_with_satellite(aligned);
        self.receiver.set_device_aligned_with_satellite(aligned);
        let newly_aligned = aligned && !self.aligned;
        self.aligned = aligned;
        if newly_aligned {
            let subs: Vec<_> = self.subscriptions.keys().copied().collect();
            for sub in subs {
                self.subscription(sub).poll_due = true;
                self.maybe_poll(sub);
            }
        }
    }

    fn push_demo_mode_datagram(&mut self, datagram_type: DatagramType, datagram: SatelliteDatagram) {
        if !self.demo_mode {
            warn!("demo datagram ignored outside demo mode");
            return;
        }
        debug!(%datagram_type, len = datagram.len(), "demo datagram cached");
        self.demo_datagram = Some((datagram_type, datagram));
    }

    fn take_demo_mode_datagram(&mut self) -> Option<(DatagramType, SatelliteDatagram)> {
        self.demo_datagram.take()
    }
}

fn same_sink(a: &Arc<dyn PointingStatusSink>, b: &Arc<dyn PointingStatusSink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
