//! The session object: owns every actor and exposes the caller API.

use std::future::Future;
use std::sync::Arc;

use satlink_models::{DatagramType, ModemState, SatelliteDatagram, SatelliteError, SessionState, SubscriptionId};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::actor::{await_reply, mailbox};
use crate::backend::BackendChannel;
use crate::config::SatelliteConfig;
use crate::controller::{ControllerHandle, DatagramController, TransferSnapshot};
use crate::demo::{DemoHandle, DemoLinkState, DemoSimulator};
use crate::dispatcher::{DatagramDispatcher, DispatcherHandle, SendRequest};
use crate::receiver::{DatagramReceiver, ReceiverHandle};
use crate::sink::{PointingStatusSink, SatelliteDatagramListener};
use crate::state_machine::{Peers, SessionSnapshot, SessionStateMachine, StateMachineHandle};

/// A running satellite datagram session.
///
/// Construction spawns the controller, dispatcher, receiver and session
/// state machine (plus the demo simulator in demo mode) on the current tokio
/// runtime. Dropping the session stops them.
///
/// Request methods enqueue immediately and return a future for the result,
/// so the order of calls is the order of admission even if the futures are
/// awaited later.
pub struct SatelliteSession {
    controller: ControllerHandle,
    receiver: ReceiverHandle,
    state_machine: StateMachineHandle,
    demo: Option<DemoHandle>,
    session_state: watch::Receiver<SessionState>,
    demo_link_state: Option<watch::Receiver<DemoLinkState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SatelliteSession {
    /// Build and start a session.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(
        config: SatelliteConfig,
        backend: Arc<dyn BackendChannel>,
        pointing_sink: Arc<dyn PointingStatusSink>,
    ) -> Self {
        let (controller_tx, controller_rx) = mailbox();
        let (dispatcher_tx, dispatcher_rx) = mailbox();
        let (receiver_tx, receiver_rx) = mailbox();
        let (state_machine_tx, state_machine_rx) = mailbox();

        let controller = ControllerHandle::new(controller_tx.clone());
        let dispatcher = DispatcherHandle::new(dispatcher_tx.clone());
        let receiver = ReceiverHandle::new(receiver_tx.clone());
        let state_machine = StateMachineHandle::new(state_machine_tx.clone());

        let mut tasks = Vec::with_capacity(5);

        let machine = SessionStateMachine::new(
            &config,
            state_machine_tx,
            backend.clone(),
            Peers {
                controller: controller.clone(),
                dispatcher: dispatcher.clone(),
                receiver: receiver.clone(),
            },
        );
        let session_state = machine.subscribe();
        tasks.push(tokio::spawn(machine.run(state_machine_rx)));

        let datagram_controller = DatagramController::new(
            &config,
            controller_tx,
            dispatcher,
            receiver.clone(),
            state_machine.clone(),
            pointing_sink,
        );
        tasks.push(tokio::spawn(datagram_controller.run(controller_rx)));

        let datagram_dispatcher =
            DatagramDispatcher::new(&config, dispatcher_tx, backend.clone(), controller.clone());
        tasks.push(tokio::spawn(datagram_dispatcher.run(dispatcher_rx)));

        let datagram_receiver = DatagramReceiver::new(&config, receiver_tx, backend, controller.clone());
        tasks.push(tokio::spawn(datagram_receiver.run(receiver_rx)));

        let (demo, demo_link_state) = if config.demo_mode {
            let (demo_tx, demo_rx) = mailbox();
            let simulator = DemoSimulator::new(&config, demo_tx.clone(), state_machine.clone());
            let link_state = simulator.subscribe();
            tasks.push(tokio::spawn(simulator.run(demo_rx)));
            (Some(DemoHandle::new(demo_tx)), Some(link_state))
        } else {
            (None, None)
        };

        info!(
            supported = config.supported,
            attach_required = config.attach_required,
            demo_mode = config.demo_mode,
            "satellite session started"
        );

        Self {
            controller,
            receiver,
            state_machine,
            demo,
            session_state,
            demo_link_state,
            tasks,
        }
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Send one datagram.
    ///
    /// Fails with [`SatelliteError::ModemBusy`] while a poll is active on
    /// `sub` and with [`SatelliteError::InvalidModemState`] while the modem
    /// is off.
    pub fn send_satellite_datagram(
        &self,
        sub: SubscriptionId,
        datagram_type: DatagramType,
        datagram: SatelliteDatagram,
        need_full_screen_pointing_ui: bool,
    ) -> impl Future<Output = Result<(), SatelliteError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.controller.request_send(SendRequest {
            sub,
            datagram_type,
            datagram,
            need_full_screen_pointing_ui,
            responder: Some(tx),
        });
        await_reply(rx)
    }

    /// Ask the modem for datagrams pending for the device. Datagrams arrive
    /// through the listeners registered with
    /// [`register_for_satellite_datagram`](Self::register_for_satellite_datagram).
    ///
    /// Fails with [`SatelliteError::ModemBusy`] while a send is active on
    /// `sub`.
    pub fn poll_pending_satellite_datagrams(
        &self,
        sub: SubscriptionId,
    ) -> impl Future<Output = Result<(), SatelliteError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.controller.request_poll(sub, tx);
        await_reply(rx)
    }

    /// Register a listener for datagrams received on `sub`.
    pub fn register_for_satellite_datagram(
        &self,
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
    ) -> impl Future<Output = Result<(), SatelliteError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.receiver.register(sub, listener, tx);
        await_reply(rx)
    }

    /// Remove a listener registered with
    /// [`register_for_satellite_datagram`](Self::register_for_satellite_datagram).
    pub fn unregister_for_satellite_datagram(
        &self,
        sub: SubscriptionId,
        listener: Arc<dyn SatelliteDatagramListener>,
    ) -> impl Future<Output = Result<(), SatelliteError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.receiver.unregister(sub, listener, tx);
        await_reply(rx)
    }

    /// Receive every transfer-state change of `sub`.
    pub fn register_for_transfer_state(&self, sub: SubscriptionId, listener: Arc<dyn PointingStatusSink>) {
        self.controller.register_listener(sub, listener);
    }

    /// Stop receiving transfer-state changes of `sub`.
    pub fn unregister_for_transfer_state(&self, sub: SubscriptionId, listener: Arc<dyn PointingStatusSink>) {
        self.controller.unregister_listener(sub, listener);
    }

    // -----------------------------------------------------------------------
    // Session feed
    // -----------------------------------------------------------------------

    /// Satellite mode was switched on or off.
    pub fn set_satellite_enabled(&self, enabled: bool) {
        self.state_machine.set_satellite_enabled(enabled);
        if let Some(demo) = &self.demo {
            demo.set_satellite_mode(enabled);
        }
    }

    /// The modem reported a new state.
    pub fn on_modem_state_changed(&self, state: ModemState) {
        self.state_machine.on_modem_state_changed(state);
    }

    /// Satellite support was detected or lost.
    pub fn set_satellite_supported(&self, supported: bool) {
        self.state_machine.set_satellite_supported(supported);
    }

    // -----------------------------------------------------------------------
    // Demo mode
    // -----------------------------------------------------------------------

    /// The device gained or lost alignment with the satellite. Ignored
    /// outside demo mode.
    pub fn set_device_aligned_with_satellite(&self, aligned: bool) {
        self.controller.set_device_aligned_with_satellite(aligned);
        if let Some(demo) = &self.demo {
            demo.set_device_aligned_with_satellite(aligned);
        }
    }

    /// Cache a datagram for the next demo-mode poll to deliver. Ignored
    /// outside demo mode.
    pub fn push_demo_mode_datagram(&self, datagram_type: DatagramType, datagram: SatelliteDatagram) {
        self.controller.push_demo_mode_datagram(datagram_type, datagram);
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Watch the session state.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session_state.clone()
    }

    /// Watch the simulated link state. `None` outside demo mode.
    pub fn demo_link_state(&self) -> Option<watch::Receiver<DemoLinkState>> {
        self.demo_link_state.clone()
    }

    /// Current transfer state of `sub`, once every earlier request has been
    /// admitted.
    pub async fn transfer_snapshot(&self, sub: SubscriptionId) -> Option<TransferSnapshot> {
        self.controller.snapshot(sub).await
    }

    /// Current session machine summary.
    pub async fn session_snapshot(&self) -> Option<SessionSnapshot> {
        self.state_machine.snapshot().await
    }
}

impl Drop for SatelliteSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
