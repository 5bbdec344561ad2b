//! Datagram dispatcher: carries admitted sends to the backend.
//!
//! One send is in flight at a time; the rest wait in arrival order. Every
//! started send reports `SENDING`, exactly one terminal state, then `IDLE`,
//! and answers its caller once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use satlink_models::{
    DatagramTransferState, DatagramType, ModemState, ResultCode, SatelliteDatagram, SatelliteError,
    SubscriptionId, TransferStatus,
};
use tracing::{debug, info, warn};

use crate::actor::{post, respond, Inbox, Mailbox, Responder, TimerId, Timers};
use crate::backend::{spawn_request, BackendChannel, CompletionToken};
use crate::config::SatelliteConfig;
use crate::controller::ControllerHandle;

/// A send admitted by the controller.
pub(crate) struct SendRequest {
    pub(crate) sub: SubscriptionId,
    pub(crate) datagram_type: DatagramType,
    pub(crate) datagram: SatelliteDatagram,
    pub(crate) need_full_screen_pointing_ui: bool,
    pub(crate) responder: Option<Responder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DispatcherTimer {
    Alignment,
}

pub(crate) enum DispatcherEvent {
    Send(SendRequest),
    SendCompleted {
        token: CompletionToken,
        result: Result<(), SatelliteError>,
    },
    ModemStateChanged(ModemState),
    DeviceAligned(bool),
    TimerFired {
        kind: DispatcherTimer,
        id: TimerId,
    },
}

/// Mailbox address of the dispatcher.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    mailbox: Mailbox<DispatcherEvent>,
}

impl DispatcherHandle {
    pub(crate) fn new(mailbox: Mailbox<DispatcherEvent>) -> Self {
        Self { mailbox }
    }

    pub(crate) fn send(&self, request: SendRequest) {
        post(&self.mailbox, "dispatcher", DispatcherEvent::Send(request));
    }

    pub(crate) fn modem_state_changed(&self, state: ModemState) {
        post(&self.mailbox, "dispatcher", DispatcherEvent::ModemStateChanged(state));
    }

    pub(crate) fn set_device_aligned_with_satellite(&self, aligned: bool) {
        post(&self.mailbox, "dispatcher", DispatcherEvent::DeviceAligned(aligned));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    WaitingForAlignment,
    AwaitingBackend(CompletionToken),
}

struct InFlight {
    request: SendRequest,
    phase: SendPhase,
}

pub(crate) struct DatagramDispatcher {
    backend: Arc<dyn BackendChannel>,
    controller: ControllerHandle,
    mailbox: Mailbox<DispatcherEvent>,
    demo_mode: bool,
    alignment_timeout: Duration,
    aligned: bool,
    queue: VecDeque<SendRequest>,
    current: Option<InFlight>,
    timers: Timers<DispatcherTimer>,
}

impl DatagramDispatcher {
    pub(crate) fn new(
        config: &SatelliteConfig,
        mailbox: Mailbox<DispatcherEvent>,
        backend: Arc<dyn BackendChannel>,
        controller: ControllerHandle,
    ) -> Self {
        Self {
            backend,
            controller,
            mailbox,
            demo_mode: config.demo_mode,
            alignment_timeout: config.alignment_timeout(),
            aligned: false,
            queue: VecDeque::new(),
            current: None,
            timers: Timers::new(),
        }
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox<DispatcherEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                DispatcherEvent::Send(request) => {
                    self.queue.push_back(request);
                    if self.current.is_none() {
                        self.start_next();
                    }
                }
                DispatcherEvent::SendCompleted { token, result } => {
                    let current = self.current.as_ref().map(|c| c.phase);
                    if current == Some(SendPhase::AwaitingBackend(token)) {
                        self.finish(result);
                    } else {
                        debug!(%token, "late send completion ignored");
                    }
                }
                DispatcherEvent::ModemStateChanged(state) => {
                    if matches!(state, ModemState::Off | ModemState::Unavailable) {
                        self.abort_all();
                    }
                }
                DispatcherEvent::DeviceAligned(aligned) => {
                    self.aligned = aligned;
                    let waiting = self.current.as_ref().map(|c| c.phase) == Some(SendPhase::WaitingForAlignment);
                    if aligned && waiting {
                        self.timers.stop(DispatcherTimer::Alignment);
                        self.submit();
                    }
                }
                DispatcherEvent::TimerFired { kind, id } => {
                    if self.timers.fired(kind, id) {
                        warn!("device not aligned in time, send fails");
                        self.finish(Err(SatelliteError::NotReachable));
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    fn report(&self, request: &SendRequest, state: DatagramTransferState, pending_count: u32, result: ResultCode) {
        self.controller.update_send_status(
            request.sub,
            request.datagram_type,
            TransferStatus::new(state, pending_count, result),
        );
    }

    fn queued(&self) -> u32 {
        u32::try_from(self.queue.len()).unwrap_or(u32::MAX)
    }

    fn start_next(&mut self) {
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        debug!(
            sub = %request.sub,
            datagram_type = %request.datagram_type,
            len = request.datagram.len(),
            full_screen = request.need_full_screen_pointing_ui,
            "starting send"
        );
        self.report(
            &request,
            DatagramTransferState::Sending,
            1 + self.queued(),
            ResultCode::Success,
        );

        let sub = request.sub;
        self.current = Some(InFlight {
            request,
            phase: SendPhase::WaitingForAlignment,
        });
        if self.demo_mode && !self.aligned {
            debug!(sub = %sub, "demo mode: waiting for alignment before sending");
            self.timers
                .start(DispatcherTimer::Alignment, self.alignment_timeout, &self.mailbox, |id| {
                    DispatcherEvent::TimerFired {
                        kind: DispatcherTimer::Alignment,
                        id,
                    }
                });
            return;
        }
        self.submit();
    }

    fn submit(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let token = CompletionToken::new();
        current.phase = SendPhase::AwaitingBackend(token);
        let request = &current.request;
        let future = self.backend.send_datagram(
            request.sub,
            request.datagram.clone(),
            request.datagram_type.is_last_sos(),
        );
        spawn_request(future, &self.mailbox, move |result| DispatcherEvent::SendCompleted {
            token,
            result,
        });
    }

    fn finish(&mut self, result: Result<(), SatelliteError>) {
        let Some(InFlight { mut request, .. }) = self.current.take() else {
            return;
        };
        let pending = self.queued();
        match result {
            Ok(()) => {
                if self.demo_mode {
                    self.controller
                        .push_demo_mode_datagram(request.datagram_type, request.datagram.clone());
                }
                self.report(&request, DatagramTransferState::SendSuccess, pending, ResultCode::Success);
            }
            Err(e) => {
                warn!(sub = %request.sub, error = %e, "send failed");
                self.report(&request, DatagramTransferState::SendFailed, pending, e.code());
            }
        }
        self.report(&request, DatagramTransferState::Idle, 0, ResultCode::Success);
        respond(request.responder.take(), result);
        self.controller.send_finished(request.sub);
        self.start_next();
    }

    fn abort_all(&mut self) {
        self.timers.stop_all();
        let queued = std::mem::take(&mut self.queue);
        if let Some(InFlight { mut request, .. }) = self.current.take() {
            info!(sub = %request.sub, "modem off, aborting send");
            self.report(
                &request,
                DatagramTransferState::SendFailed,
                0,
                ResultCode::RequestAborted,
            );
            self.report(&request, DatagramTransferState::Idle, 0, ResultCode::Success);
            respond(request.responder.take(), Err(SatelliteError::RequestAborted));
            self.controller.send_finished(request.sub);
        }
        for request in queued {
            respond(request.responder, Err(SatelliteError::RequestAborted));
            self.controller.send_finished(request.sub);
        }
    }
}
