//! SatLink demo driver: runs a satellite session in demo mode against an
//! always-succeeding backend and narrates what happens.
//!
//! The session powers on, the device aligns after a delay, and a series of
//! SOS datagrams is sent. In demo mode every successful send is echoed back
//! through a poll, so the registered listener sees each payload again.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::{self, FutureExt};
use satlink_core::{
    BackendChannel, BackendFuture, DatagramDelivery, DatagramSink, PointingStatusSink, SatelliteConfig,
    SatelliteDatagramListener, SatelliteSession,
};
use satlink_models::{
    DatagramId, DatagramType, SatelliteDatagram, SatelliteError, SubscriptionId, TransferStatus,
};
use tracing::{info, warn};

/// Satellite datagram session demo.
#[derive(Parser, Debug)]
#[command(name = "satlink-demo", about = "Run a satellite datagram session in demo mode")]
struct Args {
    /// JSON configuration file. Without it, `SATLINK_*` environment
    /// variables and defaults apply.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model an attach-required link.
    #[arg(long)]
    attach_required: bool,

    /// Subscription to send on.
    #[arg(long, default_value_t = 1)]
    subscription: u32,

    /// Number of datagrams to send.
    #[arg(long, default_value_t = 3)]
    messages: u32,

    /// Payload prefix; the message index is appended.
    #[arg(long, default_value = "SOS")]
    payload: String,

    /// Delay before the device reports alignment.
    #[arg(long, default_value_t = 1_000)]
    align_after_ms: u64,

    /// Simulated backend round-trip time.
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,

    /// Pause between sends.
    #[arg(long, default_value_t = 2_000)]
    interval_ms: u64,
}

// ---------------------------------------------------------------------------
// Demo backend
// ---------------------------------------------------------------------------

/// Backend that accepts everything after a fixed latency.
struct DemoBackend {
    latency: Duration,
}

impl DemoBackend {
    fn delayed_ok(&self) -> BackendFuture {
        let latency = self.latency;
        async move {
            tokio::time::sleep(latency).await;
            Ok(())
        }
        .boxed()
    }
}

impl BackendChannel for DemoBackend {
    fn send_datagram(&self, sub: SubscriptionId, datagram: SatelliteDatagram, is_last_sos_message: bool) -> BackendFuture {
        info!(sub = %sub, len = datagram.len(), is_last_sos_message, "backend: transmitting");
        self.delayed_ok()
    }

    fn poll_pending_datagrams(&self, _: SubscriptionId) -> BackendFuture {
        self.delayed_ok()
    }

    fn register_for_datagrams(&self, sub: SubscriptionId, _: DatagramSink) -> Result<(), SatelliteError> {
        info!(sub = %sub, "backend: datagram channel opened");
        Ok(())
    }

    fn unregister_for_datagrams(&self, sub: SubscriptionId) {
        info!(sub = %sub, "backend: datagram channel closed");
    }

    fn acknowledge_datagram(&self, sub: SubscriptionId, id: DatagramId) {
        info!(sub = %sub, %id, "backend: datagram acknowledged");
    }

    fn set_cellular_scanning_suppressed(&self, suppressed: bool) -> BackendFuture {
        info!(suppressed, "backend: cellular scanning");
        future::ready(Ok(())).boxed()
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

struct LoggingPointingSink;

impl PointingStatusSink for LoggingPointingSink {
    fn update_send_datagram_transfer_state(&self, sub: SubscriptionId, datagram_type: DatagramType, status: TransferStatus) {
        info!(
            sub = %sub,
            %datagram_type,
            state = %status.state,
            pending = status.pending_count,
            result = %status.result,
            "send"
        );
    }

    fn update_receive_datagram_transfer_state(&self, sub: SubscriptionId, status: TransferStatus) {
        info!(
            sub = %sub,
            state = %status.state,
            pending = status.pending_count,
            result = %status.result,
            "receive"
        );
    }

    fn start_pointing_ui(&self, need_full_screen: bool, demo_mode: bool, emergency: bool) {
        info!(need_full_screen, demo_mode, emergency, "pointing UI requested");
    }
}

#[derive(Default)]
struct EchoListener {
    received: AtomicU64,
}

impl SatelliteDatagramListener for EchoListener {
    fn on_satellite_datagram_received(&self, delivery: DatagramDelivery) {
        self.received.fetch_add(1, Ordering::Relaxed);
        println!(
            "<- {} {} {:?} (pending {})",
            delivery.sub,
            delivery.id,
            String::from_utf8_lossy(delivery.datagram.as_bytes()),
            delivery.pending_count
        );
        delivery.ack.acknowledge();
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn load_config(args: &Args) -> Result<SatelliteConfig> {
    let mut config = match &args.config {
        Some(path) => SatelliteConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SatelliteConfig::from_env().context("reading SATLINK_* environment")?,
    };
    config.demo_mode = true;
    config.attach_required |= args.attach_required;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    let sub = SubscriptionId::new(args.subscription);
    let backend = Arc::new(DemoBackend {
        latency: Duration::from_millis(args.latency_ms),
    });
    let session = SatelliteSession::start(config, backend, Arc::new(LoggingPointingSink));

    let mut states = session.session_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("== session {state}");
        }
    });

    let listener = Arc::new(EchoListener::default());
    session
        .register_for_satellite_datagram(sub, listener.clone())
        .await
        .context("registering datagram listener")?;

    session.set_satellite_enabled(true);
    tokio::time::sleep(Duration::from_millis(args.align_after_ms)).await;
    session.set_device_aligned_with_satellite(true);

    let mut sent = 0_u64;
    let mut failed = 0_u64;
    for i in 0..args.messages {
        let datagram_type = if i + 1 == args.messages {
            DatagramType::LastSosMessageNoHelpNeeded
        } else {
            DatagramType::SosMessage
        };
        let payload = format!("{} #{i}", args.payload);
        println!("-> {sub} {datagram_type} {payload:?}");
        match session
            .send_satellite_datagram(sub, datagram_type, SatelliteDatagram::new(payload.into_bytes()), i == 0)
            .await
        {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(error = %e, "send failed");
                failed += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }

    if let Some(snapshot) = session.session_snapshot().await {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    session
        .unregister_for_satellite_datagram(sub, listener.clone())
        .await
        .context("unregistering datagram listener")?;
    session.set_satellite_enabled(false);
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!(
        "sent={sent} failed={failed} echoed={}",
        listener.received.load(Ordering::Relaxed)
    );
    Ok(())
}
