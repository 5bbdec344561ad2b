//! Session state machine: gates the link between power, attachment and
//! transfer activity.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | `POWER_OFF` | enabled | `IDLE` (`NOT_CONNECTED` if attach-required) |
//! | any powered state | disabled / modem off | `POWER_OFF` |
//! | `IDLE`, `LISTENING` | transfer begins | `TRANSFERRING` |
//! | `TRANSFERRING` | both directions idle | `LISTENING` (`CONNECTED` if attach-required) |
//! | `LISTENING` | listening timeout | `IDLE` |
//! | `IDLE`, `NOT_CONNECTED` | modem connected (attach-required) | `CONNECTED` |
//! | `IDLE`, `CONNECTED` | modem not connected (attach-required) | `NOT_CONNECTED` |
//! | `NOT_CONNECTED`, `CONNECTED` | inactivity timeout | `IDLE` |
//! | any | unsupported | `UNAVAILABLE` |
//! | `UNAVAILABLE` | supported | `POWER_OFF` |
//!
//! On attach-required links, entering and leaving `TRANSFERRING` first asks
//! the backend to suppress (or release) background cellular scanning. The
//! transition happens only when that request succeeds; a failure leaves the
//! machine where it was. A suppress request still running at power-off is
//! released as soon as it completes.
//!
//! Every transition is pushed to the controller, dispatcher and receiver as
//! a [`ModemState`] and published on a [`watch`] channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use satlink_models::{
    DatagramTransferState, ModemState, SatelliteError, SessionState, SubscriptionId,
};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::actor::{post, Inbox, Mailbox, TimerId, Timers};
use crate::backend::{spawn_request, BackendChannel, CompletionToken};
use crate::config::SatelliteConfig;
use crate::controller::{Admission, ControllerHandle};
use crate::dispatcher::DispatcherHandle;
use crate::receiver::ReceiverHandle;

/// Observable summary of the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: SessionState,
    /// A send started while the session was already transferring.
    pub sending_triggered_during_transferring: bool,
    /// Background cellular scanning is currently suppressed.
    pub scanning_suppressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SessionTimer {
    Listening,
    NbIotInactivity,
}

pub(crate) enum StateMachineEvent {
    SatelliteEnabled(bool),
    SatelliteSupported(bool),
    ModemStateReported(ModemState),
    TransferStateChanged {
        sub: SubscriptionId,
        send: DatagramTransferState,
        receive: DatagramTransferState,
    },
    ScanningDone {
        token: CompletionToken,
        result: Result<(), SatelliteError>,
    },
    TimerFired {
        kind: SessionTimer,
        id: TimerId,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Bounce a request back to the controller once every earlier session
    /// feed event has been applied.
    Readmit(Admission),
}

/// Mailbox address of the session state machine.
#[derive(Clone)]
pub(crate) struct StateMachineHandle {
    mailbox: Mailbox<StateMachineEvent>,
}

impl StateMachineHandle {
    pub(crate) fn new(mailbox: Mailbox<StateMachineEvent>) -> Self {
        Self { mailbox }
    }

    fn post(&self, event: StateMachineEvent) {
        post(&self.mailbox, "state machine", event);
    }

    pub(crate) fn set_satellite_enabled(&self, enabled: bool) {
        self.post(StateMachineEvent::SatelliteEnabled(enabled));
    }

    pub(crate) fn set_satellite_supported(&self, supported: bool) {
        self.post(StateMachineEvent::SatelliteSupported(supported));
    }

    pub(crate) fn on_modem_state_changed(&self, state: ModemState) {
        self.post(StateMachineEvent::ModemStateReported(state));
    }

    pub(crate) fn transfer_state_changed(
        &self,
        sub: SubscriptionId,
        send: DatagramTransferState,
        receive: DatagramTransferState,
    ) {
        self.post(StateMachineEvent::TransferStateChanged { sub, send, receive });
    }

    pub(crate) fn readmit(&self, admission: Admission) {
        self.post(StateMachineEvent::Readmit(admission));
    }

    pub(crate) async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.post(StateMachineEvent::Snapshot(tx));
        rx.await.ok()
    }
}

/// An outstanding cellular-scanning request and the transition waiting on
/// it.
#[derive(Debug, Clone, Copy)]
struct PendingScanning {
    token: CompletionToken,
    suppressed: bool,
    from: SessionState,
    target: SessionState,
}

/// Peers notified of every transition.
pub(crate) struct Peers {
    pub(crate) controller: ControllerHandle,
    pub(crate) dispatcher: DispatcherHandle,
    pub(crate) receiver: ReceiverHandle,
}

pub(crate) struct SessionStateMachine {
    attach_required: bool,
    listening_timeout: Duration,
    nb_iot_inactivity_timeout: Duration,
    backend: Arc<dyn BackendChannel>,
    peers: Peers,
    mailbox: Mailbox<StateMachineEvent>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    timers: Timers<SessionTimer>,
    transfers: HashMap<SubscriptionId, (DatagramTransferState, DatagramTransferState)>,
    pending_scanning: Option<PendingScanning>,
    /// Suppress request cut loose by a power-off; released once it lands.
    orphaned_suppress: Option<CompletionToken>,
    scanning_suppressed: bool,
    sending_triggered_during_transferring: bool,
}

impl SessionStateMachine {
    pub(crate) fn new(
        config: &SatelliteConfig,
        mailbox: Mailbox<StateMachineEvent>,
        backend: Arc<dyn BackendChannel>,
        peers: Peers,
    ) -> Self {
        let state = if config.supported {
            SessionState::PowerOff
        } else {
            SessionState::Unavailable
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            attach_required: config.attach_required,
            listening_timeout: config.listening_timeout(),
            nb_iot_inactivity_timeout: config.nb_iot_inactivity_timeout(),
            backend,
            peers,
            mailbox,
            state,
            state_tx,
            timers: Timers::new(),
            transfers: HashMap::new(),
            pending_scanning: None,
            orphaned_suppress: None,
            scanning_suppressed: false,
            sending_triggered_during_transferring: false,
        }
    }

    /// Observe state changes.
    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox<StateMachineEvent>) {
        info!(state = %self.state, attach_required = self.attach_required, "session state machine started");
        while let Some(event) = inbox.recv().await {
            self.handle(event);
        }
        debug!("session state machine stopped");
    }

    fn handle(&mut self, event: StateMachineEvent) {
        match event {
            StateMachineEvent::SatelliteEnabled(enabled) => self.on_satellite_enabled(enabled),
            StateMachineEvent::SatelliteSupported(supported) => {
                if !supported {
                    self.transition_to(SessionState::Unavailable);
                } else if self.state == SessionState::Unavailable {
                    self.transition_to(SessionState::PowerOff);
                }
            }
            StateMachineEvent::ModemStateReported(modem) => self.on_modem_state_reported(modem),
            StateMachineEvent::TransferStateChanged { sub, send, receive } => {
                if self.state == SessionState::Transferring && send == DatagramTransferState::Sending {
                    self.sending_triggered_during_transferring = true;
                }
                self.transfers.insert(sub, (send, receive));
                self.evaluate_transfer();
            }
            StateMachineEvent::ScanningDone { token, result } => self.on_scanning_done(token, result),
            StateMachineEvent::TimerFired { kind, id } => {
                if self.timers.fired(kind, id) {
                    self.on_timer(kind);
                }
            }
            StateMachineEvent::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    state: self.state,
                    sending_triggered_during_transferring: self.sending_triggered_during_transferring,
                    scanning_suppressed: self.scanning_suppressed,
                });
            }
            StateMachineEvent::Readmit(admission) => self.peers.controller.readmit(admission),
        }
    }

    fn on_satellite_enabled(&mut self, enabled: bool) {
        match (enabled, self.state) {
            (true, SessionState::PowerOff) => {
                if self.attach_required {
                    self.transition_to(SessionState::NotConnected);
                } else {
                    self.transition_to(SessionState::Idle);
                }
            }
            (false, state) if state.is_powered() => self.transition_to(SessionState::PowerOff),
            (enabled, state) => debug!(enabled, %state, "satellite mode change ignored"),
        }
    }

    fn on_modem_state_reported(&mut self, modem: ModemState) {
        match modem {
            ModemState::Off if self.state.is_powered() => self.transition_to(SessionState::PowerOff),
            ModemState::Unavailable => self.transition_to(SessionState::Unavailable),
            ModemState::Connected
                if self.attach_required
                    && matches!(self.state, SessionState::Idle | SessionState::NotConnected) =>
            {
                self.transition_to(SessionState::Connected);
                self.evaluate_transfer();
            }
            ModemState::NotConnected
                if self.attach_required
                    && matches!(self.state, SessionState::Idle | SessionState::Connected) =>
            {
                self.transition_to(SessionState::NotConnected);
                self.evaluate_transfer();
            }
            _ => debug!(%modem, state = %self.state, "modem report does not change session state"),
        }
    }

    fn any_transferring(&self) -> bool {
        self.transfers
            .values()
            .any(|(send, receive)| send.is_transferring() || receive.is_transferring())
    }

    fn any_waiting_to_connect(&self) -> bool {
        self.transfers
            .values()
            .any(|(_, receive)| *receive == DatagramTransferState::WaitingToConnect)
    }

    /// Move between idle and transferring states to match transfer activity.
    fn evaluate_transfer(&mut self) {
        if self.pending_scanning.is_some() {
            return;
        }
        let transferring = self.any_transferring();
        match self.state {
            SessionState::Idle if transferring => {
                if self.attach_required {
                    self.transition_to(SessionState::NotConnected);
                    self.evaluate_transfer();
                } else {
                    self.transition_to(SessionState::Transferring);
                }
            }
            SessionState::Listening if transferring => self.transition_to(SessionState::Transferring),
            SessionState::NotConnected | SessionState::Connected if self.attach_required => {
                if transferring {
                    self.request_scanning(true, SessionState::Transferring);
                } else if self.any_waiting_to_connect() {
                    self.timers.stop(SessionTimer::NbIotInactivity);
                } else {
                    self.start_inactivity_timer();
                }
            }
            SessionState::Transferring if !transferring => {
                if self.attach_required {
                    self.request_scanning(false, SessionState::Connected);
                } else {
                    self.transition_to(SessionState::Listening);
                }
            }
            _ => {}
        }
    }

    fn request_scanning(&mut self, suppressed: bool, target: SessionState) {
        let token = CompletionToken::new();
        debug!(suppressed, from = %self.state, to = %target, %token, "requesting cellular scanning change");
        self.pending_scanning = Some(PendingScanning {
            token,
            suppressed,
            from: self.state,
            target,
        });
        spawn_request(
            self.backend.set_cellular_scanning_suppressed(suppressed),
            &self.mailbox,
            move |result| StateMachineEvent::ScanningDone { token, result },
        );
    }

    fn on_scanning_done(&mut self, token: CompletionToken, result: Result<(), SatelliteError>) {
        if self.orphaned_suppress == Some(token) {
            self.orphaned_suppress = None;
            let suppress_in_flight = self.pending_scanning.is_some_and(|p| p.suppressed);
            if result.is_ok() && !self.scanning_suppressed && !suppress_in_flight {
                debug!(%token, "suppress request completed after power off");
                self.release_scanning();
            }
            return;
        }
        let Some(pending) = self.pending_scanning.filter(|p| p.token == token) else {
            debug!(%token, "stale scanning completion ignored");
            return;
        };
        self.pending_scanning = None;
        match result {
            Ok(()) => {
                self.scanning_suppressed = pending.suppressed;
                if self.state == pending.from {
                    self.transition_to(pending.target);
                }
                self.evaluate_transfer();
            }
            Err(e) => {
                warn!(
                    error = %e,
                    suppressed = pending.suppressed,
                    state = %self.state,
                    "cellular scanning request failed, staying in current state"
                );
            }
        }
    }

    fn on_timer(&mut self, kind: SessionTimer) {
        match (kind, self.state) {
            (SessionTimer::Listening, SessionState::Listening)
            | (SessionTimer::NbIotInactivity, SessionState::NotConnected | SessionState::Connected) => {
                debug!(timer = ?kind, "inactivity window elapsed");
                self.transition_to(SessionState::Idle);
            }
            _ => {}
        }
    }

    fn start_inactivity_timer(&mut self) {
        self.timers.start(
            SessionTimer::NbIotInactivity,
            self.nb_iot_inactivity_timeout,
            &self.mailbox,
            |id| StateMachineEvent::TimerFired {
                kind: SessionTimer::NbIotInactivity,
                id,
            },
        );
    }

    /// Release scanning outside any transition; nothing waits on the outcome.
    fn release_scanning(&self) {
        let request = self.backend.set_cellular_scanning_suppressed(false);
        tokio::spawn(async move {
            if let Err(e) = request.await {
                warn!(error = %e, "failed to release cellular scanning");
            }
        });
    }

    fn transition_to(&mut self, next: SessionState) {
        let previous = self.state;
        if previous == next {
            return;
        }

        match previous {
            SessionState::Listening => {
                self.timers.stop(SessionTimer::Listening);
            }
            SessionState::NotConnected | SessionState::Connected => {
                self.timers.stop(SessionTimer::NbIotInactivity);
            }
            SessionState::Transferring => self.sending_triggered_during_transferring = false,
            _ => {}
        }

        self.state = next;

        match next {
            SessionState::Listening => {
                self.timers.start(
                    SessionTimer::Listening,
                    self.listening_timeout,
                    &self.mailbox,
                    |id| StateMachineEvent::TimerFired {
                        kind: SessionTimer::Listening,
                        id,
                    },
                );
            }
            SessionState::NotConnected | SessionState::Connected => self.start_inactivity_timer(),
            SessionState::PowerOff | SessionState::Unavailable => {
                self.timers.stop_all();
                if let Some(pending) = self.pending_scanning.take() {
                    if pending.suppressed {
                        self.orphaned_suppress = Some(pending.token);
                    }
                }
                self.transfers.clear();
                self.sending_triggered_during_transferring = false;
                if self.scanning_suppressed {
                    self.scanning_suppressed = false;
                    self.release_scanning();
                }
            }
            _ => {}
        }

        info!(from = %previous, to = %next, "session state changed");
        let modem = next.modem_state();
        self.peers.controller.modem_state_changed(modem);
        self.peers.dispatcher.modem_state_changed(modem);
        self.peers.receiver.modem_state_changed(modem);
        self.state_tx.send_replace(next);
    }
}
