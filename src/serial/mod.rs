//! # Serial Module
//!
//! The serial link to the modem: opening the device, ordered writes and a
//! broadcast stream of raw chunks.

pub mod encoding;
pub mod port;

pub use port::{LinkState, PortSettings, SerialLink, SerialSession, Subscription};
