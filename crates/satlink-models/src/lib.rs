#![deny(missing_docs)]

//! # SatLink Models
//!
//! Core data types shared by every satellite-session component.
//!
//! ## Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`datagram`] | Subscriptions, datagram payloads, classification and ids |
//! | [`transfer`] | Per-direction transfer states and status reports |
//! | [`session`] | Session state machine states and modem-reported states |
//! | [`error`] | Result codes returned to callers |

pub mod datagram;
pub mod error;
pub mod session;
pub mod transfer;

// Re-export all public types at crate root for convenience.
pub use datagram::*;
pub use error::*;
pub use session::*;
pub use transfer::*;
