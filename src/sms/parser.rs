//! Inbound frame parser.
//!
//! With `AT+CNMI=1,2,0,0,0` the modem pushes every new message as two lines:
//!
//! ```text
//! +CMT: "255712345678",,"25/01/02,14:30:00+02"
//! Hello there
//! ```
//!
//! [`FrameParser`] accumulates raw chunks, cuts them into `\r\n` lines and
//! pairs each `+CMT:` header with the line that follows it. Everything else the
//! modem prints (`OK`, echoes, send acknowledgments) is ignored.

use chrono::{Local, NaiveDate};
use log::warn;

use super::commands::MARKER_INCOMING;
use super::{InboundSms, METHOD_LOCAL_MODEM, STATUS_RECEIVED};
use crate::serial::encoding::decode_text;

const TERMINATOR: &[u8] = b"\r\n";

/// Unterminated data beyond this is garbage, not a line in progress.
const MAX_PENDING_BYTES: usize = 8 * 1024;

/// Bytes received but not yet cut into lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    data: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Removes every complete line, skipping blank ones. The unterminated
    /// tail stays buffered for the next chunk.
    pub fn take_lines(&mut self) -> Vec<String> {
        let Some(end) = self
            .data
            .windows(TERMINATOR.len())
            .rposition(|w| w == TERMINATOR)
        else {
            if self.data.len() > MAX_PENDING_BYTES {
                warn!(
                    "Discarding {} bytes received without a line terminator",
                    self.data.len()
                );
                self.data.clear();
            }
            return Vec::new();
        };

        let rest = self.data.split_off(end + TERMINATOR.len());
        let complete = std::mem::replace(&mut self.data, rest);
        decode_text(&complete[..end])
            .split("\r\n")
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Empties the buffer, returning what was left.
    pub fn take_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fields recovered from a `+CMT:` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub sender: String,
    /// `DD-MM-YYYY`
    pub date: String,
    pub time: String,
    /// Set when any field could not be recovered.
    pub degraded: bool,
}

fn unquote(field: &str) -> String {
    field.replace('"', "").trim().to_string()
}

fn reformat_date(token: &str) -> Option<String> {
    NaiveDate::parse_from_str(token, "%y/%m/%d")
        .ok()
        .map(|date| date.format("%d-%m-%Y").to_string())
}

/// Decodes `+CMT: "<sender>",<alpha>,"<YY/MM/DD>,<HH:MM:SS+TZ>"`.
///
/// Never fails: a missing or malformed field comes back empty and the result
/// is flagged as degraded.
pub fn decode_header(line: &str) -> HeaderFields {
    let parts: Vec<&str> = line.split(',').collect();

    let sender = parts
        .first()
        .and_then(|field| field.split_once(':'))
        .map(|(_, number)| unquote(number))
        .unwrap_or_default();
    let date = parts
        .get(2)
        .and_then(|field| reformat_date(&unquote(field)))
        .unwrap_or_default();
    let time = parts
        .get(3)
        .map(|field| {
            let time = unquote(field);
            match time.split_once('+') {
                Some((clock, _tz)) => clock.trim().to_string(),
                None => time,
            }
        })
        .unwrap_or_default();

    let degraded = sender.is_empty() || date.is_empty() || time.is_empty();
    HeaderFields {
        sender,
        date,
        time,
        degraded,
    }
}

/// Builds the record for a header and its body line.
pub fn build_inbound(header: &str, body: &str) -> InboundSms {
    let fields = decode_header(header);
    if fields.degraded {
        warn!("Incomplete SMS header, keeping recoverable fields: {header:?}");
    }
    InboundSms {
        sender: fields.sender,
        date_received: fields.date,
        time_received: fields.time,
        text: body.trim().to_string(),
        received_at: Local::now(),
        status: STATUS_RECEIVED,
        method: METHOD_LOCAL_MODEM,
    }
}

fn is_header(line: &str) -> bool {
    line.starts_with(MARKER_INCOMING)
}

/// Turns the raw inbound stream into [`InboundSms`] records.
///
/// A header is paired with the very next non-blank line, even when that line
/// is itself a header. A header that ends a batch waits for the next batch,
/// so the output does not depend on how the stream was chunked.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: LineBuffer,
    pending_header: Option<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw chunk, returning the messages it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<InboundSms> {
        self.buffer.push(chunk);
        let lines = self.buffer.take_lines();
        if lines.is_empty() {
            return Vec::new();
        }

        let mut messages = Vec::new();
        let mut lines = lines.into_iter();

        if let Some(header) = self.pending_header.take() {
            // lines is non-empty
            if let Some(body) = lines.next() {
                messages.push(build_inbound(&header, &body));
            }
        }

        while let Some(line) = lines.next() {
            if !is_header(&line) {
                continue;
            }
            match lines.next() {
                Some(body) => messages.push(build_inbound(&line, &body)),
                None => self.pending_header = Some(line),
            }
        }
        messages
    }

    /// Flushes state at end of stream. A waiting header is emitted with
    /// whatever unterminated text followed it as its body.
    pub fn finish(&mut self) -> Vec<InboundSms> {
        let rest = decode_text(&self.buffer.take_remainder());
        let rest = rest.trim();
        match self.pending_header.take() {
            Some(header) => vec![build_inbound(&header, rest)],
            None if is_header(rest) => vec![build_inbound(rest, "")],
            None => Vec::new(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_pending_header(&self) -> bool {
        self.pending_header.is_some()
    }
}
