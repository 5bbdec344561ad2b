//! Mailbox and timer plumbing shared by every actor.
//!
//! Each actor owns an unbounded mailbox and processes one event at a time.
//! Timers are delayed self-messages: [`Timers::start`] spawns a sleeper that
//! posts the event back into the owner's mailbox, tagged with a [`TimerId`].
//! Stopping or re-arming a timer forgets the id, so a fire that was already
//! queued is recognised as stale by [`Timers::fired`] and dropped.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use satlink_models::SatelliteError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Sending half of an actor mailbox.
pub(crate) type Mailbox<E> = mpsc::UnboundedSender<E>;

/// Receiving half of an actor mailbox.
pub(crate) type Inbox<E> = mpsc::UnboundedReceiver<E>;

/// One-shot reply channel for a caller-facing request.
pub(crate) type Responder = oneshot::Sender<Result<(), SatelliteError>>;

/// Create a mailbox pair.
pub(crate) fn mailbox<E>() -> (Mailbox<E>, Inbox<E>) {
    mpsc::unbounded_channel()
}

/// Post an event, logging when the target actor has stopped.
pub(crate) fn post<E>(mailbox: &Mailbox<E>, actor: &'static str, event: E) {
    if mailbox.send(event).is_err() {
        debug!(actor, "actor stopped, event dropped");
    }
}

/// Answer a caller, if there is one waiting.
pub(crate) fn respond(responder: Option<Responder>, result: Result<(), SatelliteError>) {
    if let Some(tx) = responder {
        // The caller may have dropped its future.
        let _ = tx.send(result);
    }
}

/// Await a caller reply; a vanished actor reads as a service error.
pub(crate) async fn await_reply(
    rx: oneshot::Receiver<Result<(), SatelliteError>>,
) -> Result<(), SatelliteError> {
    rx.await.unwrap_or(Err(SatelliteError::ServiceError))
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Generation tag of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

/// A set of named one-shot timers owned by a single actor.
pub(crate) struct Timers<K> {
    next_id: u64,
    armed: HashMap<K, (TimerId, JoinHandle<()>)>,
}

impl<K> Timers<K>
where
    K: Copy + Eq + Hash + Debug,
{
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm `kind`, replacing any previous instance. After `delay`, the event
    /// built by `event` is posted to `mailbox`.
    pub(crate) fn start<E, F>(&mut self, kind: K, delay: Duration, mailbox: &Mailbox<E>, event: F)
    where
        E: Send + 'static,
        F: FnOnce(TimerId) -> E,
    {
        self.stop(kind);
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let event = event(id);
        let mailbox = mailbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(event);
        });
        trace!(timer = ?kind, ?delay, "timer armed");
        self.armed.insert(kind, (id, handle));
    }

    /// Disarm `kind`. Returns `true` if it was armed.
    pub(crate) fn stop(&mut self, kind: K) -> bool {
        match self.armed.remove(&kind) {
            Some((_, handle)) => {
                handle.abort();
                trace!(timer = ?kind, "timer stopped");
                true
            }
            None => false,
        }
    }

    /// Disarm every timer.
    pub(crate) fn stop_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, kind: K) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume a fire. Returns `false` for a fire that was stopped or
    /// re-armed after it was queued.
    pub(crate) fn fired(&mut self, kind: K, id: TimerId) -> bool {
        match self.armed.get(&kind) {
            Some((armed, _)) if *armed == id => {
                self.armed.remove(&kind);
                true
            }
            _ => {
                trace!(timer = ?kind, "stale timer fire ignored");
                false
            }
        }
    }
}

impl<K> Drop for Timers<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}
