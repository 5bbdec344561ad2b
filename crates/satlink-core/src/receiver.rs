//! Datagram receiver: runs polls and the push path for incoming datagrams.
//!
//! Polls are served one at a time in arrival order. A poll may first wait
//! for an attach-required link to connect, then reports `RECEIVING` and asks
//! the backend (or, in demo mode, the cached demo datagram) for traffic.
//!
//! Incoming datagrams are fanned out to every listener registered for the
//! subscription. Each listener has at most one unacknowledged delivery;
//! later datagrams wait in that listener's backlog until it calls
//! [`DatagramAck::acknowledge`]. The backend is acknowledged once every
//! listener that received a datagram has acknowledged it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use satlink_models::{
    DatagramId, DatagramTransferState, DatagramType, ModemState, ReceivedDatagram, ResultCode,
    SatelliteDatagram, SatelliteError, SubscriptionId, TransferStatus,
};
use tracing::{debug, info, warn};

use crate::actor::{post, respond, Inbox, Mailbox, Responder, TimerId, Timers};
use crate::backend::{spawn_request, BackendChannel, CompletionToken, DatagramSink};
use crate::config::SatelliteConfig;
use crate::controller::ControllerHandle;
use crate::sink::{DatagramDelivery, SatelliteDatagramListener};

/// A poll admitted by the controller.
pub(crate) struct PollRequest {
    pub(crate) sub: SubscriptionId,
    pub(crate) responder: Option<Responder>,
    /// Hold the poll in `WAITING_TO_CONNECT` until the link attaches.
    pub(crate) wait_for_connected: bool,
    /// Demo mode: the cached datagram this poll should deliver.
    pub(crate) demo_datagram: Option<(DatagramType, SatelliteDatagram)>,
}

/// Identifies one registered listener inside the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerKey(u64);

/// Acknowledgment handle for one delivered datagram.
///
/// Dropping it without calling [`acknowledge`](Self::acknowledge) leaves the
/// listener blocked: no further datagram is delivered to it.
pub struct DatagramAck {
    mailbox: Mailbox<ReceiverEvent>,
    sub: SubscriptionId,
    listener: ListenerKey,
    id: DatagramId,
}

impl DatagramAck {
    /// Id of the datagram this handle acknowledges.
    pub fn id(&self) -> DatagramId {
        self.id
    }

    /// Confirm the datagram was handled and release the next one.
    pub fn acknowledge(self) {
        post(
            &self.mailbox,
            "receiver",
            ReceiverEvent::Acknowledged {
                sub: self.sub,
                listener: self.listener,
                id: self.id,
            },
        );
    }
}

impl fmt::Debug for DatagramAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramAck")
            .field("sub", &self.sub)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ReceiverTimer {
    ConnectWait,
    Alignment,
    DatagramWait,
}

pub(crate) enum ReceiverEvent {
    Poll(PollRequest),
    PollCompleted {
        token: CompletionToken,
        result: Result<(), SatelliteError>,
    },
    DatagramReceived {
        sub: SubscriptionId,
        received: ReceivedDatagram,
    },
    Acknowledged {
        sub: SubscriptionId,
        listener: ListenerKey,
        id: DatagramId,
    },
    Register {
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
        responder: Responder,
    },
    Unregister {
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
        responder: Responder,
    },
    ModemStateChanged(ModemState),
    DeviceAligned(bool),
    TimerFired {
        kind: ReceiverTimer,
        id: TimerId,
    },
}

/// Mailbox address of the receiver.
#[derive(Clone)]
pub(crate) struct ReceiverHandle {
    mailbox: Mailbox<ReceiverEvent>,
}

impl ReceiverHandle {
    pub(crate) fn new(mailbox: Mailbox<ReceiverEvent>) -> Self {
        Self { mailbox }
    }

    fn post(&self, event: ReceiverEvent) {
        post(&self.mailbox, "receiver", event);
    }

    pub(crate) fn poll(&self, request: PollRequest) {
        self.post(ReceiverEvent::Poll(request));
    }

    pub(crate) fn register(
        &self,
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
        responder: Responder,
    ) {
        self.post(ReceiverEvent::Register {
            sub,
            listener,
            responder,
        });
    }

    pub(crate) fn unregister(
        &self,
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
        responder: Responder,
    ) {
        self.post(ReceiverEvent::Unregister {
            sub,
            listener,
            responder,
        });
    }

    pub(crate) fn modem_state_changed(&self, state: ModemState) {
        self.post(ReceiverEvent::ModemStateChanged(state));
    }

    pub(crate) fn set_device_aligned_with_satellite(&self, aligned: bool) {
        self.post(ReceiverEvent::DeviceAligned(aligned));
    }
}

// ---------------------------------------------------------------------------
// Actor state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollPhase {
    WaitingToConnect,
    WaitingForAlignment,
    AwaitingBackend(CompletionToken),
    AwaitingDelivery,
}

struct ActivePoll {
    sub: SubscriptionId,
    responder: Option<Responder>,
    demo_datagram: Option<(DatagramType, SatelliteDatagram)>,
    phase: PollPhase,
    /// A push arrived before the backend confirmed the poll.
    delivered: bool,
}

struct ListenerSlot {
    key: ListenerKey,
    listener: Arc<dyn SatelliteDatagramListener>,
    awaiting_ack: Option<DatagramId>,
    backlog: VecDeque<ReceivedDatagram>,
}

pub(crate) struct DatagramReceiver {
    backend: Arc<dyn BackendChannel>,
    controller: ControllerHandle,
    mailbox: Mailbox<ReceiverEvent>,
    demo_mode: bool,
    connect_wait_timeout: Duration,
    alignment_timeout: Duration,
    datagram_wait_timeout: Duration,
    modem_state: ModemState,
    aligned: bool,
    queue: VecDeque<PollRequest>,
    active: Option<ActivePoll>,
    timers: Timers<ReceiverTimer>,
    listeners: HashMap<SubscriptionId, Vec<ListenerSlot>>,
    /// Outstanding listener acknowledgments per delivered datagram.
    unacked: HashMap<(SubscriptionId, DatagramId), usize>,
    next_listener_key: u64,
    next_demo_id: DatagramId,
}

impl DatagramReceiver {
    pub(crate) fn new(
        config: &SatelliteConfig,
        mailbox: Mailbox<ReceiverEvent>,
        backend: Arc<dyn BackendChannel>,
        controller: ControllerHandle,
    ) -> Self {
        Self {
            backend,
            controller,
            mailbox,
            demo_mode: config.demo_mode,
            connect_wait_timeout: config.connect_wait_timeout(),
            alignment_timeout: config.alignment_timeout(),
            datagram_wait_timeout: config.datagram_wait_timeout(),
            modem_state: if config.supported {
                ModemState::Off
            } else {
                ModemState::Unavailable
            },
            aligned: false,
            queue: VecDeque::new(),
            active: None,
            timers: Timers::new(),
            listeners: HashMap::new(),
            unacked: HashMap::new(),
            next_listener_key: 0,
            next_demo_id: DatagramId::new(1),
        }
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox<ReceiverEvent>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event);
        }
        debug!("receiver stopped");
    }

    fn handle(&mut self, event: ReceiverEvent) {
        match event {
            ReceiverEvent::Poll(request) => {
                self.queue.push_back(request);
                if self.active.is_none() {
                    self.start_next();
                }
            }
            ReceiverEvent::PollCompleted { token, result } => self.on_poll_completed(token, result),
            ReceiverEvent::DatagramReceived { sub, received } => self.on_datagram_received(sub, received),
            ReceiverEvent::Acknowledged { sub, listener, id } => self.on_acknowledged(sub, listener, id),
            ReceiverEvent::Register {
                sub,
                listener,
                responder,
            } => {
                let result = self.register(sub, listener);
                respond(Some(responder), result);
            }
            ReceiverEvent::Unregister {
                sub,
                listener,
                responder,
            } => {
                self.unregister(sub, &listener);
                respond(Some(responder), Ok(()));
            }
            ReceiverEvent::ModemStateChanged(state) => self.on_modem_state_changed(state),
            ReceiverEvent::DeviceAligned(aligned) => self.on_device_aligned(aligned),
            ReceiverEvent::TimerFired { kind, id } => {
                if self.timers.fired(kind, id) {
                    self.on_timer(kind);
                }
            }
        }
    }

    fn report(&self, sub: SubscriptionId, state: DatagramTransferState, pending_count: u32, result: ResultCode) {
        self.controller
            .update_receive_status(sub, TransferStatus::new(state, pending_count, result));
    }

    // -- poll lifecycle ----------------------------------------------------

    fn start_next(&mut self) {
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        let PollRequest {
            sub,
            responder,
            wait_for_connected,
            demo_datagram,
        } = request;

        let waiting = wait_for_connected && !self.modem_state.is_connected_equivalent();
        self.active = Some(ActivePoll {
            sub,
            responder,
            demo_datagram,
            phase: PollPhase::WaitingToConnect,
            delivered: false,
        });
        if waiting {
            info!(sub = %sub, modem = %self.modem_state, "poll waiting for satellite connection");
            self.report(sub, DatagramTransferState::WaitingToConnect, 0, ResultCode::Success);
            self.timers
                .start(ReceiverTimer::ConnectWait, self.connect_wait_timeout, &self.mailbox, |id| {
                    ReceiverEvent::TimerFired {
                        kind: ReceiverTimer::ConnectWait,
                        id,
                    }
                });
            return;
        }
        self.begin_receiving();
    }

    fn begin_receiving(&mut self) {
        let Some(sub) = self.active.as_ref().map(|a| a.sub) else {
            return;
        };
        self.report(sub, DatagramTransferState::Receiving, 0, ResultCode::Success);

        if self.demo_mode {
            if self.aligned {
                self.deliver_demo();
            } else {
                debug!(sub = %sub, "demo mode: waiting for alignment before receiving");
                self.set_phase(PollPhase::WaitingForAlignment);
                self.timers
                    .start(ReceiverTimer::Alignment, self.alignment_timeout, &self.mailbox, |id| {
                        ReceiverEvent::TimerFired {
                            kind: ReceiverTimer::Alignment,
                            id,
                        }
                    });
            }
            return;
        }

        let token = CompletionToken::new();
        self.set_phase(PollPhase::AwaitingBackend(token));
        debug!(sub = %sub, %token, "polling backend for pending datagrams");
        spawn_request(self.backend.poll_pending_datagrams(sub), &self.mailbox, move |result| {
            ReceiverEvent::PollCompleted { token, result }
        });
    }

    fn set_phase(&mut self, phase: PollPhase) {
        if let Some(active) = self.active.as_mut() {
            active.phase = phase;
        }
    }

    fn deliver_demo(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        respond(active.responder.take(), Ok(()));
        match active.demo_datagram.take() {
            Some((datagram_type, datagram)) => {
                let id = self.next_demo_id;
                self.next_demo_id = id.next();
                debug!(sub = %active.sub, %id, %datagram_type, "delivering demo datagram");
                // The demo slot holds a single datagram, so nothing is left behind it.
                self.deliver(
                    active.sub,
                    ReceivedDatagram {
                        id,
                        datagram,
                        pending_count: 0,
                    },
                );
            }
            None => {
                self.report(active.sub, DatagramTransferState::ReceiveNone, 0, ResultCode::Success);
            }
        }
        self.complete(active.sub);
    }

    fn on_poll_completed(&mut self, token: CompletionToken, result: Result<(), SatelliteError>) {
        let matches = matches!(
            self.active.as_ref().map(|a| a.phase),
            Some(PollPhase::AwaitingBackend(t)) if t == token
        );
        if !matches {
            debug!(%token, "late poll completion ignored");
            return;
        }
        let Some(mut active) = self.active.take() else {
            return;
        };
        match result {
            Err(e) => {
                warn!(sub = %active.sub, error = %e, "poll failed");
                self.fail(active, e);
            }
            Ok(()) if active.delivered => {
                respond(active.responder.take(), Ok(()));
                self.complete(active.sub);
            }
            Ok(()) => {
                respond(active.responder.take(), Ok(()));
                active.phase = PollPhase::AwaitingDelivery;
                self.active = Some(active);
                self.timers.start(
                    ReceiverTimer::DatagramWait,
                    self.datagram_wait_timeout,
                    &self.mailbox,
                    |id| ReceiverEvent::TimerFired {
                        kind: ReceiverTimer::DatagramWait,
                        id,
                    },
                );
            }
        }
    }

    fn fail(&mut self, mut active: ActivePoll, error: SatelliteError) {
        self.report(active.sub, DatagramTransferState::ReceiveFailed, 0, error.code());
        respond(active.responder.take(), Err(error));
        self.complete(active.sub);
    }

    /// Close the current poll and start the next queued one.
    fn complete(&mut self, sub: SubscriptionId) {
        self.active = None;
        self.report(sub, DatagramTransferState::Idle, 0, ResultCode::Success);
        self.controller.poll_finished(sub);
        self.start_next();
    }

    fn on_timer(&mut self, kind: ReceiverTimer) {
        let Some(phase) = self.active.as_ref().map(|a| a.phase) else {
            return;
        };
        match (kind, phase) {
            (ReceiverTimer::ConnectWait, PollPhase::WaitingToConnect)
            | (ReceiverTimer::Alignment, PollPhase::WaitingForAlignment) => {
                if let Some(active) = self.active.take() {
                    warn!(sub = %active.sub, timer = ?kind, "poll timed out");
                    self.fail(active, SatelliteError::NotReachable);
                }
            }
            (ReceiverTimer::DatagramWait, PollPhase::AwaitingDelivery) => {
                if let Some(active) = self.active.take() {
                    debug!(sub = %active.sub, "no datagram arrived after poll");
                    self.report(active.sub, DatagramTransferState::ReceiveNone, 0, ResultCode::Success);
                    self.complete(active.sub);
                }
            }
            _ => {}
        }
    }

    fn on_modem_state_changed(&mut self, state: ModemState) {
        self.modem_state = state;
        if matches!(state, ModemState::Off | ModemState::Unavailable) {
            self.abort_all();
            return;
        }
        let waiting = matches!(
            self.active.as_ref().map(|a| a.phase),
            Some(PollPhase::WaitingToConnect)
        );
        if waiting && state.is_connected_equivalent() {
            self.timers.stop(ReceiverTimer::ConnectWait);
            debug!(modem = %state, "satellite connected, poll proceeds");
            self.begin_receiving();
        }
    }

    fn abort_all(&mut self) {
        self.timers.stop_all();
        let queued = std::mem::take(&mut self.queue);
        if let Some(mut active) = self.active.take() {
            info!(sub = %active.sub, "modem off, aborting poll");
            self.report(
                active.sub,
                DatagramTransferState::ReceiveFailed,
                0,
                ResultCode::RequestAborted,
            );
            self.report(active.sub, DatagramTransferState::Idle, 0, ResultCode::Success);
            respond(active.responder.take(), Err(SatelliteError::RequestAborted));
            self.controller.poll_finished(active.sub);
        }
        for request in queued {
            respond(request.responder, Err(SatelliteError::RequestAborted));
            self.controller.poll_finished(request.sub);
        }
    }

    fn on_device_aligned(&mut self, aligned: bool) {
        self.aligned = aligned;
        let waiting = matches!(
            self.active.as_ref().map(|a| a.phase),
            Some(PollPhase::WaitingForAlignment)
        );
        if aligned && waiting {
            self.timers.stop(ReceiverTimer::Alignment);
            self.deliver_demo();
        }
    }

    // -- push path ---------------------------------------------------------

    fn on_datagram_received(&mut self, sub: SubscriptionId, received: ReceivedDatagram) {
        self.deliver(sub, received);

        // The terminal state just reported stands until the poll closes.
        let phase = self.active.as_ref().filter(|a| a.sub == sub).map(|a| a.phase);
        match phase {
            Some(PollPhase::AwaitingDelivery) => {
                self.timers.stop(ReceiverTimer::DatagramWait);
                self.complete(sub);
            }
            Some(PollPhase::WaitingToConnect) => {
                // Datagrams are flowing, so the link the poll waited for is up.
                self.timers.stop(ReceiverTimer::ConnectWait);
                if let Some(mut active) = self.active.take() {
                    respond(active.responder.take(), Ok(()));
                }
                self.complete(sub);
            }
            Some(_) => {
                if let Some(active) = self.active.as_mut() {
                    active.delivered = true;
                }
            }
            None => self.report(sub, DatagramTransferState::Idle, 0, ResultCode::Success),
        }
    }

    /// Report the receive outcome and hand the datagram to listeners.
    ///
    /// A push with nothing pending behind it reports `ReceiveNone`; its
    /// payload, if any, is still delivered. Every push is acknowledged to the
    /// backend exactly once.
    fn deliver(&mut self, sub: SubscriptionId, received: ReceivedDatagram) {
        let id = received.id;
        if received.pending_count == 0 {
            self.report(sub, DatagramTransferState::ReceiveNone, 0, ResultCode::Success);
            if received.datagram.is_empty() {
                self.acknowledge_to_backend(sub, id);
                return;
            }
        } else {
            self.report(
                sub,
                DatagramTransferState::ReceiveSuccess,
                received.pending_count,
                ResultCode::Success,
            );
        }

        let Some(slots) = self.listeners.get_mut(&sub).filter(|s| !s.is_empty()) else {
            warn!(sub = %sub, %id, "datagram received with no listener");
            self.acknowledge_to_backend(sub, id);
            return;
        };
        self.unacked.insert((sub, id), slots.len());
        for slot in slots.iter_mut() {
            if slot.awaiting_ack.is_none() {
                hand_over(slot, sub, received.clone(), &self.mailbox);
            } else {
                slot.backlog.push_back(received.clone());
            }
        }
    }

    fn on_acknowledged(&mut self, sub: SubscriptionId, key: ListenerKey, id: DatagramId) {
        match self
            .listeners
            .get_mut(&sub)
            .and_then(|slots| slots.iter_mut().find(|s| s.key == key))
        {
            Some(slot) if slot.awaiting_ack == Some(id) => slot.awaiting_ack = None,
            _ => {
                debug!(sub = %sub, %id, "stale acknowledgment ignored");
                return;
            }
        }
        self.release(sub, id);

        if let Some(slot) = self
            .listeners
            .get_mut(&sub)
            .and_then(|slots| slots.iter_mut().find(|s| s.key == key))
        {
            if let Some(next) = slot.backlog.pop_front() {
                hand_over(slot, sub, next, &self.mailbox);
            }
        }
    }

    /// Drop one outstanding listener acknowledgment; the last one is
    /// forwarded to the backend.
    fn release(&mut self, sub: SubscriptionId, id: DatagramId) {
        let Some(remaining) = self.unacked.get_mut(&(sub, id)) else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.unacked.remove(&(sub, id));
            self.acknowledge_to_backend(sub, id);
        }
    }

    /// Demo datagrams never came from the backend and are not acknowledged
    /// to it.
    fn acknowledge_to_backend(&self, sub: SubscriptionId, id: DatagramId) {
        if self.demo_mode {
            return;
        }
        debug!(sub = %sub, %id, "acknowledging datagram to backend");
        self.backend.acknowledge_datagram(sub, id);
    }

    // -- listener registry -------------------------------------------------

    fn register(
        &mut self,
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
    ) -> Result<(), SatelliteError> {
        let slots = self.listeners.entry(sub).or_default();
        if slots.iter().any(|s| same_listener(&s.listener, &listener)) {
            return Ok(());
        }
        if slots.is_empty() {
            if let Err(e) = self
                .backend
                .register_for_datagrams(sub, DatagramSink::new(sub, self.mailbox.clone()))
            {
                warn!(sub = %sub, error = %e, "failed to open datagram channel");
                self.listeners.remove(&sub);
                return Err(e);
            }
            info!(sub = %sub, "datagram channel opened");
        }
        self.next_listener_key += 1;
        slots.push(ListenerSlot {
            key: ListenerKey(self.next_listener_key),
            listener,
            awaiting_ack: None,
            backlog: VecDeque::new(),
        });
        Ok(())
    }

    fn unregister(&mut self, sub: SubscriptionId, listener: &Arc<dyn SatelliteDatagramListener>) {
        let Some(slots) = self.listeners.get_mut(&sub) else {
            return;
        };
        let Some(index) = slots.iter().position(|s| same_listener(&s.listener, listener)) else {
            return;
        };
        let slot = slots.remove(index);
        let now_empty = slots.is_empty();
        for id in slot
            .awaiting_ack
            .into_iter()
            .chain(slot.backlog.iter().map(|r| r.id))
        {
            self.release(sub, id);
        }
        if now_empty {
            self.listeners.remove(&sub);
            self.backend.unregister_for_datagrams(sub);
            info!(sub = %sub, "datagram channel closed");
        }
    }
}

fn hand_over(
    slot: &mut ListenerSlot,
    sub: SubscriptionId,
    received: ReceivedDatagram,
    mailbox: &Mailbox<ReceiverEvent>,
) {
    slot.awaiting_ack = Some(received.id);
    slot.listener.on_satellite_datagram_received(DatagramDelivery {
        sub,
        id: received.id,
        datagram: received.datagram,
        pending_count: received.pending_count,
        ack: DatagramAck {
            mailbox: mailbox.clone(),
            sub,
            listener: slot.key,
            id: received.id,
        },
    });
}

fn same_listener(a: &Arc<dyn SatelliteDatagramListener>, b: &Arc<dyn SatelliteDatagramListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
