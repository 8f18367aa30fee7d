//! # Port Module
//!
//! Serial port enumeration and modem discovery.

pub mod ports;

pub use ports::{ModemFingerprint, PortDescriptor, PortLister, SystemPorts, find_modem_port};
