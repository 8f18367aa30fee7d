//! # Modem SMS
//!
//! Sends and receives SMS through a GSM/3G modem attached over a serial
//! port, speaking the AT command set in text mode.
//!
//! ## Features
//!
//! - **Port Discovery**: picks the modem among the host's serial ports by
//!   device path and USB manufacturer.
//! - **Async Serial Link**: non-blocking reads and writes on the Tokio
//!   runtime, with every received chunk broadcast to all listeners.
//! - **Inbound Parsing**: turns unsolicited `+CMT:` notifications into
//!   structured messages regardless of how the stream is chunked.
//! - **Send Correlation**: matches each outgoing message with the modem's
//!   `+CMGS:` / `+CMS ERROR:` answer, bounded by a timeout.
//! - **Auto-Reply**: optionally acknowledges every inbound message.
//!
//! ## Architecture
//!
//! - [`port`]: serial port enumeration and modem discovery
//! - [`serial`]: the open serial channel
//! - [`sms`]: message records, AT commands, parser and sender
//! - [`modem`]: the service tying them together
//! - [`config`]: RON configuration
//! - [`error`]: custom error types

pub mod config;
pub mod error;
pub mod modem;
pub mod port;
pub mod serial;
pub mod sms;

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::ModemConfig;
    pub use crate::error::*;
    pub use crate::modem::{ListenHandle, ModemService};
    pub use crate::port::SystemPorts;
    pub use crate::sms::{BatchResult, InboundSms, LogStore, MessageStore, SendStatus};
}
