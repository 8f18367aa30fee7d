//! # SMS Module
//!
//! Message records exchanged with the modem, plus the AT protocol pieces that
//! produce them:
//!
//! - [`commands`]: AT command strings and the initialization sequencer
//! - [`parser`]: turns the raw inbound stream into [`InboundSms`] records
//! - [`sender`]: sends one message and correlates the modem's answer

pub mod commands;
pub mod parser;
pub mod sender;

#[cfg(test)]
pub(crate) mod fake_modem;

use std::fmt;

use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use crate::error::Result;

/// Status stamped on every received message.
pub const STATUS_RECEIVED: &str = "received";
/// Delivery method for everything passing through the local modem.
pub const METHOD_LOCAL_MODEM: &str = "local_via_modem";

/// A message the modem delivered unsolicited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InboundSms {
    pub sender: String,
    /// `DD-MM-YYYY`, empty when the header carried no usable date.
    pub date_received: String,
    /// `HH:MM:SS` with the timezone suffix removed.
    pub time_received: String,
    pub text: String,
    /// When this process parsed the message.
    pub received_at: DateTime<Local>,
    pub status: &'static str,
    pub method: &'static str,
}

/// One message about to be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundSendRequest {
    /// Already normalized to `+<country><number>`.
    pub recipient_phone: String,
    pub message_body: String,
    pub sent_at: DateTime<Local>,
}

/// Outcome of a single send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// The modem answered `+CMGS:`.
    Sent,
    /// The modem answered `+CMS ERROR:` or the write itself failed.
    Failed,
    /// No answer before the timeout. The message may or may not have gone out.
    Unknown,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
            SendStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundSendResult {
    pub recipient_phone: String,
    pub status: SendStatus,
    /// Modem error code for [`SendStatus::Failed`], `"unknown"` if it gave none.
    pub error_code: Option<String>,
    /// Everything the modem said during the attempt, trimmed.
    pub raw_response: String,
    pub sent_at: DateTime<Local>,
}

/// Results of a multi-recipient send, in recipient order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub sender_id: &'static str,
    pub created_by: &'static str,
    pub method: &'static str,
    /// No carrier billing applies to the local modem.
    pub cost: &'static str,
    pub messages: Vec<OutboundSendResult>,
    pub batch_time: DateTime<Local>,
}

impl BatchResult {
    pub fn new(messages: Vec<OutboundSendResult>) -> Self {
        Self {
            sender_id: "local",
            created_by: "system",
            method: METHOD_LOCAL_MODEM,
            cost: "0.00",
            messages,
            batch_time: Local::now(),
        }
    }

    /// Number of messages the modem confirmed.
    pub fn sent_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.status == SendStatus::Sent)
            .count()
    }
}

/// Durable storage for message records. The driver only hands records over.
#[cfg_attr(test, mockall::automock)]
pub trait MessageStore: Send + Sync {
    fn store_inbound(&self, sms: &InboundSms) -> Result<()>;
    fn store_outbound(&self, batch: &BatchResult) -> Result<()>;
}

/// Store that only logs what it is given.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStore;

impl MessageStore for LogStore {
    fn store_inbound(&self, sms: &InboundSms) -> Result<()> {
        info!(
            "Received SMS from {} at {} {}: {:?}",
            sms.sender, sms.date_received, sms.time_received, sms.text
        );
        Ok(())
    }

    fn store_outbound(&self, batch: &BatchResult) -> Result<()> {
        info!(
            "Batch sent {}/{} at {}",
            batch.sent_count(),
            batch.messages.len(),
            batch.batch_time.to_rfc3339()
        );
        for message in &batch.messages {
            info!(
                "  {} {} {}",
                message.recipient_phone,
                message.status,
                message.error_code.as_deref().unwrap_or_default()
            );
        }
        Ok(())
    }
}
