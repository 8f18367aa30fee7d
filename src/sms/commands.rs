//! AT commands and the fire-and-forget initialization sequencer.

use log::debug;
use tokio::time::{Duration, sleep};

use crate::error::Result;
use crate::serial::SerialLink;

/// Plain attention, wakes the modem up.
pub const CMD_PING: &str = "AT\r";
/// Text mode SMS.
pub const CMD_TEXT_MODE: &str = "AT+CMGF=1\r";
/// Route new messages straight to the terminal as `+CMT:` notifications.
pub const CMD_NOTIFY_IMMEDIATE: &str = "AT+CNMI=1,2,0,0,0\r";
/// Ctrl+Z, terminates a message body.
pub const CTRL_Z: u8 = 0x1A;

/// Unsolicited incoming message header.
pub const MARKER_INCOMING: &str = "+CMT:";
/// Successful send acknowledgment.
pub const MARKER_SENT: &str = "+CMGS:";
/// Send rejected by the modem or network.
pub const MARKER_SEND_ERROR: &str = "+CMS ERROR:";

/// `AT+CMGS="<phone>"\r`, opens the body prompt for `phone`.
#[must_use]
pub fn send_prompt(phone: &str) -> String {
    format!("AT+CMGS=\"{phone}\"\r")
}

/// Writes `commands` in order, pausing `settle` after each one.
///
/// Responses are not read; a misbehaving modem shows up later as parse or
/// send anomalies.
pub async fn run_sequence<S: AsRef<str>>(
    link: &SerialLink,
    commands: &[S],
    settle: Duration,
) -> Result<()> {
    for command in commands {
        let command = command.as_ref();
        debug!("-> {}", command.trim_end());
        link.write(command)?;
        sleep(settle).await;
    }
    Ok(())
}
