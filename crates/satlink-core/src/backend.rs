//! The backend seam: how the core talks to the modem.
//!
//! The transport binding itself lives outside this crate. The core only sees
//! [`BackendChannel`], an asynchronous request/response interface plus a push
//! source ([`DatagramSink`]) for incoming datagrams.
//!
//! Two channel shapes exist and one is picked when the session is built
//! ([`select_backend`]):
//!
//! * the satellite service itself, any type implementing [`BackendChannel`];
//! * [`PerSubscriptionChannels`], a router over per-subscription command
//!   channels used when the service is not supported. Requests for a
//!   subscription without a channel fail with
//!   [`SatelliteError::InvalidTelephonyState`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use satlink_models::{DatagramId, ReceivedDatagram, SatelliteDatagram, SatelliteError, SubscriptionId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::actor::{post, Mailbox};
use crate::receiver::ReceiverEvent;

/// Future returned by every backend request.
pub type BackendFuture = BoxFuture<'static, Result<(), SatelliteError>>;

/// Asynchronous interface to the modem.
///
/// Requests return a future the core awaits off its actor loop; the result
/// is posted back as a completion message.
pub trait BackendChannel: Send + Sync {
    /// Transmit one datagram.
    fn send_datagram(
        &self,
        sub: SubscriptionId,
        datagram: SatelliteDatagram,
        is_last_sos_message: bool,
    ) -> BackendFuture;

    /// Ask the modem to deliver datagrams queued for the device.
    ///
    /// Datagrams themselves arrive through the [`DatagramSink`] registered
    /// for `sub`.
    fn poll_pending_datagrams(&self, sub: SubscriptionId) -> BackendFuture;

    /// Open the push channel for `sub`.
    fn register_for_datagrams(
        &self,
        sub: SubscriptionId,
        sink: DatagramSink,
    ) -> Result<(), SatelliteError>;

    /// Close the push channel for `sub`.
    fn unregister_for_datagrams(&self, sub: SubscriptionId);

    /// Acknowledge delivery of `id`, releasing the next push.
    fn acknowledge_datagram(&self, sub: SubscriptionId, id: DatagramId);

    /// Suppress (or re-enable) background cellular scanning while the
    /// satellite link is transferring.
    fn set_cellular_scanning_suppressed(&self, suppressed: bool) -> BackendFuture;
}

// ---------------------------------------------------------------------------
// DatagramSink
// ---------------------------------------------------------------------------

/// Push entry point handed to the backend when a subscription's datagram
/// channel is opened.
#[derive(Clone)]
pub struct DatagramSink {
    sub: SubscriptionId,
    mailbox: Mailbox<ReceiverEvent>,
}

impl DatagramSink {
    pub(crate) fn new(sub: SubscriptionId, mailbox: Mailbox<ReceiverEvent>) -> Self {
        Self { sub, mailbox }
    }

    /// The subscription this sink delivers for.
    pub fn subscription(&self) -> SubscriptionId {
        self.sub
    }

    /// Deliver a datagram with the number still pending behind it.
    pub fn on_datagram_received(&self, id: DatagramId, datagram: SatelliteDatagram, pending_count: u32) {
        post(
            &self.mailbox,
            "receiver",
            ReceiverEvent::DatagramReceived {
                sub: self.sub,
                received: ReceivedDatagram {
                    id,
                    datagram,
                    pending_count,
                },
            },
        );
    }
}

impl fmt::Debug for DatagramSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSink").field("sub", &self.sub).finish()
    }
}

// ---------------------------------------------------------------------------
// Request plumbing
// ---------------------------------------------------------------------------

/// Correlates a backend completion with the request that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CompletionToken(Uuid);

impl CompletionToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Run `request` off the actor loop and post its completion back.
pub(crate) fn spawn_request<E, F>(request: BackendFuture, mailbox: &Mailbox<E>, complete: F)
where
    E: Send + 'static,
    F: FnOnce(Result<(), SatelliteError>) -> E + Send + 'static,
{
    let mailbox = mailbox.clone();
    tokio::spawn(async move {
        let result = request.await;
        let _ = mailbox.send(complete(result));
    });
}

// ---------------------------------------------------------------------------
// PerSubscriptionChannels
// ---------------------------------------------------------------------------

/// Fallback backend routing each request to a per-subscription command
/// channel.
#[derive(Default, Clone)]
pub struct PerSubscriptionChannels {
    channels: BTreeMap<SubscriptionId, Arc<dyn BackendChannel>>,
}

impl PerSubscriptionChannels {
    /// An empty router. Every request fails until channels are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the channel for `sub`.
    pub fn with_channel(mut self, sub: SubscriptionId, channel: Arc<dyn BackendChannel>) -> Self {
        self.channels.insert(sub, channel);
        self
    }

    /// Returns `true` when no channel exists.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn channel(&self, sub: SubscriptionId) -> Result<&Arc<dyn BackendChannel>, SatelliteError> {
        self.channels.get(&sub).ok_or_else(|| {
            debug!(sub = %sub, "no command channel for subscription");
            SatelliteError::InvalidTelephonyState
        })
    }
}

impl BackendChannel for PerSubscriptionChannels {
    fn send_datagram(
        &self,
        sub: SubscriptionId,
        datagram: SatelliteDatagram,
        is_last_sos_message: bool,
    ) -> BackendFuture {
        match self.channel(sub) {
            Ok(channel) => channel.send_datagram(sub, datagram, is_last_sos_message),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    fn poll_pending_datagrams(&self, sub: SubscriptionId) -> BackendFuture {
        match self.channel(sub) {
            Ok(channel) => channel.poll_pending_datagrams(sub),
            Err(e) => future::ready(Err(e)).boxed(),
        }
    }

    fn register_for_datagrams(
        &self,
        sub: SubscriptionId,
        sink: DatagramSink,
    ) -> Result<(), SatelliteError> {
        self.channel(sub)?.register_for_datagrams(sub, sink)
    }

    fn unregister_for_datagrams(&self, sub: SubscriptionId) {
        if let Ok(channel) = self.channel(sub) {
            channel.unregister_for_datagrams(sub);
        }
    }

    fn acknowledge_datagram(&self, sub: SubscriptionId, id: DatagramId) {
        if let Ok(channel) = self.channel(sub) {
            channel.acknowledge_datagram(sub, id);
        }
    }

    fn set_cellular_scanning_suppressed(&self, suppressed: bool) -> BackendFuture {
        if self.channels.is_empty() {
            return future::ready(Err(SatelliteError::InvalidTelephonyState)).boxed();
        }
        let requests: Vec<_> = self
            .channels
            .values()
            .map(|c| c.set_cellular_scanning_suppressed(suppressed))
            .collect();
        async move {
            future::join_all(requests)
                .await
                .into_iter()
                .collect::<Result<Vec<()>, SatelliteError>>()
                .map(|_| ())
        }
        .boxed()
    }
}

/// Pick the backend once, at construction: the satellite service when it is
/// supported, the per-subscription command channels otherwise.
pub fn select_backend(
    service: Option<Arc<dyn BackendChannel>>,
    fallback: PerSubscriptionChannels,
) -> Arc<dyn BackendChannel> {
    match service {
        Some(service) => {
            info!("using satellite service backend");
            service
        }
        None => {
            info!(
                channels = fallback.channels.len(),
                "satellite service unsupported, using per-subscription command channels"
            );
            Arc::new(fallback)
        }
    }
}
