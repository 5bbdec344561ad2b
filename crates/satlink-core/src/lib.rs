//! # SatLink Core
//!
//! Session lifecycle and datagram transfer over an intermittent,
//! alignment-sensitive satellite link.
//!
//! The core is a set of actors, each a tokio task with its own mailbox:
//!
//! | Actor | Module | Owns |
//! |-------|--------|------|
//! | Datagram controller | [`controller`] | canonical per-subscription transfer state, admission, fan-out |
//! | Datagram dispatcher | [`dispatcher`] | outbound sends |
//! | Datagram receiver | [`receiver`] | polls, incoming datagrams, listener acknowledgments |
//! | Session state machine | [`state_machine`] | power, attachment and transfer gating |
//! | Demo simulator | [`demo`] | synthetic connectivity in demo mode |
//!
//! [`SatelliteSession`] builds and owns all of them. The modem is reached
//! through the [`BackendChannel`] trait.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use satlink_core::{NoopPointingSink, PerSubscriptionChannels, SatelliteConfig, SatelliteSession};
//! use satlink_models::{DatagramType, SatelliteDatagram, SubscriptionId};
//!
//! # async fn run() -> Result<(), satlink_models::SatelliteError> {
//! let session = SatelliteSession::start(
//!     SatelliteConfig::default(),
//!     Arc::new(PerSubscriptionChannels::new()),
//!     Arc::new(NoopPointingSink),
//! );
//! session.set_satellite_enabled(true);
//! session
//!     .send_satellite_datagram(
//!         SubscriptionId::new(1),
//!         DatagramType::SosMessage,
//!         SatelliteDatagram::new(b"help".to_vec()),
//!         true,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod actor;
pub mod backend;
pub mod config;
pub mod controller;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod receiver;
pub mod session;
pub mod sink;
pub mod state_machine;

pub use backend::{select_backend, BackendChannel, BackendFuture, DatagramSink, PerSubscriptionChannels};
pub use config::SatelliteConfig;
pub use controller::{needs_waiting_for_satellite_connected, TransferSnapshot};
pub use demo::DemoLinkState;
pub use error::CoreError;
pub use receiver::DatagramAck;
pub use session::SatelliteSession;
pub use sink::{DatagramDelivery, NoopPointingSink, PointingStatusSink, SatelliteDatagramListener};
pub use state_machine::SessionSnapshot;
