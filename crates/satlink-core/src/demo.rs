//! Demo simulator: synthesizes link connectivity from satellite mode and
//! device alignment.
//!
//! Alignment arms a connect timer, losing it arms a disconnect timer. An
//! alignment change before a timer fires cancels it, and a fired timer
//! cancels whichever other one is still pending.
//! The simulator reports connectivity to the session state machine only and
//! never touches transfer state.

use std::time::Duration;

use satlink_models::ModemState;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::actor::{post, Inbox, Mailbox, TimerId, Timers};
use crate::config::SatelliteConfig;
use crate::state_machine::StateMachineHandle;

/// Simulated link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DemoLinkState {
    /// Satellite mode is off.
    PowerOff,
    /// Satellite mode is on, no simulated connection.
    NotConnected,
    /// Simulated connection established.
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DemoTimer {
    Connect,
    Disconnect,
}

pub(crate) enum DemoEvent {
    SatelliteMode(bool),
    DeviceAligned(bool),
    TimerFired { kind: DemoTimer, id: TimerId },
}

/// Mailbox address of the demo simulator.
#[derive(Clone)]
pub(crate) struct DemoHandle {
    mailbox: Mailbox<DemoEvent>,
}

impl DemoHandle {
    pub(crate) fn new(mailbox: Mailbox<DemoEvent>) -> Self {
        Self { mailbox }
    }

    pub(crate) fn set_satellite_mode(&self, on: bool) {
        post(&self.mailbox, "demo simulator", DemoEvent::SatelliteMode(on));
    }

    pub(crate) fn set_device_aligned_with_satellite(&self, aligned: bool) {
        post(&self.mailbox, "demo simulator", DemoEvent::DeviceAligned(aligned));
    }
}

pub(crate) struct DemoSimulator {
    connect_delay: Duration,
    disconnect_delay: Duration,
    state_machine: StateMachineHandle,
    mailbox: Mailbox<DemoEvent>,
    state: DemoLinkState,
    state_tx: watch::Sender<DemoLinkState>,
    aligned: bool,
    timers: Timers<DemoTimer>,
}

impl DemoSimulator {
    pub(crate) fn new(
        config: &SatelliteConfig,
        mailbox: Mailbox<DemoEvent>,
        state_machine: StateMachineHandle,
    ) -> Self {
        let (state_tx, _) = watch::channel(DemoLinkState::PowerOff);
        Self {
            connect_delay: config.demo_connect_delay(),
            disconnect_delay: config.demo_disconnect_delay(),
            state_machine,
            mailbox,
            state: DemoLinkState::PowerOff,
            state_tx,
            aligned: false,
            timers: Timers::new(),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DemoLinkState> {
        self.state_tx.subscribe()
    }

    pub(crate) async fn run(mut self, mut inbox: Inbox<DemoEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                DemoEvent::SatelliteMode(true) => {
                    if self.state == DemoLinkState::PowerOff {
                        self.transition_to(DemoLinkState::NotConnected);
                        if self.aligned {
                            self.arm(DemoTimer::Connect);
                        }
                    }
                }
                DemoEvent::SatelliteMode(false) => {
                    self.timers.stop_all();
                    self.transition_to(DemoLinkState::PowerOff);
                }
                DemoEvent::DeviceAligned(aligned) => {
                    self.aligned = aligned;
                    match (self.state, aligned) {
                        (DemoLinkState::PowerOff, _) => {}
                        (DemoLinkState::NotConnected, true) => self.arm(DemoTimer::Connect),
                        (DemoLinkState::NotConnected, false) => {
                            self.timers.stop(DemoTimer::Connect);
                        }
                        (DemoLinkState::Connected, false) => self.arm(DemoTimer::Disconnect),
                        (DemoLinkState::Connected, true) => {
                            self.timers.stop(DemoTimer::Disconnect);
                        }
                    }
                }
                DemoEvent::TimerFired { kind, id } => {
                    if !self.timers.fired(kind, id) {
                        continue;
                    }
                    self.timers.stop_all();
                    match kind {
                        DemoTimer::Connect => self.transition_to(DemoLinkState::Connected),
                        DemoTimer::Disconnect => self.transition_to(DemoLinkState::NotConnected),
                    }
                }
            }
        }
        debug!("demo simulator stopped");
    }

    fn arm(&mut self, kind: DemoTimer) {
        let delay = match kind {
            DemoTimer::Connect => self.connect_delay,
            DemoTimer::Disconnect => self.disconnect_delay,
        };
        self.timers
            .start(kind, delay, &self.mailbox, |id| DemoEvent::TimerFired { kind, id });
    }

    fn transition_to(&mut self, next: DemoLinkState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "demo link state changed");
        self.state = next;
        match next {
            DemoLinkState::NotConnected => self.state_machine.on_modem_state_changed(ModemState::NotConnected),
            DemoLinkState::Connected => self.state_machine.on_modem_state_changed(ModemState::Connected),
            DemoLinkState::PowerOff => {}
        }
        self.state_tx.send_replace(next);
    }
}
