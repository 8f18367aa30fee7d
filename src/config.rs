//! # Config Module
//!
//! Modem configuration, persisted as RON.
//!
//! The file is optional: a missing file yields [`ModemConfig::default`], a
//! malformed one is an error. Every field has a default, so a file only needs
//! to name what it overrides:
//!
//! ```ron
//! (
//!     device_path: "/dev/ttyUSB2",
//!     auto_reply: None,
//! )
//! ```

use std::path::Path;

use log::info;
use serde::Deserialize;
use tokio::time::Duration;

use crate::error::{ModemError, Result};
use crate::port::ports::ModemFingerprint;
use crate::sms::commands::{CMD_PING, CMD_NOTIFY_IMMEDIATE, CMD_TEXT_MODE};

/// Default configuration file path.
pub const CONFIG_FILE: &str = "config/modem.ron";

/// Runtime configuration for one modem.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModemConfig {
    /// Device path the modem must be attached at.
    pub device_path: String,
    /// Substring expected in the USB manufacturer string.
    pub manufacturer: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Prefix for numbers not already in `+` form, e.g. `+255`.
    pub country_code: String,
    /// Pause after every write before the next one.
    pub settle_delay_ms: u64,
    /// How long a send waits for `+CMGS:` or `+CMS ERROR:`.
    pub send_timeout_ms: u64,
    /// Commands written when listening starts.
    pub init_commands: Vec<String>,
    /// Acknowledgment sent back to every inbound sender; `None` disables it.
    pub auto_reply: Option<String>,
    /// Queue depth of the raw chunk broadcast.
    pub channel_capacity: usize,
}

impl Default for ModemConfig {
    fn default() -> Self {
        let device_path = if cfg!(windows) { "COM5" } else { "/dev/ttyUSB0" };
        Self {
            device_path: device_path.to_string(),
            manufacturer: "ZTE".to_string(),
            baud_rate: 9600,
            country_code: "+255".to_string(),
            settle_delay_ms: 200,
            send_timeout_ms: 3000,
            init_commands: vec![
                CMD_PING.to_string(),
                CMD_TEXT_MODE.to_string(),
                CMD_NOTIFY_IMMEDIATE.to_string(),
            ],
            auto_reply: Some("thanks for auto-reply".to_string()),
            channel_capacity: 256,
        }
    }
}

impl ModemConfig {
    /// Loads the configuration at `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: Self = ron::from_str(&data)?;
        config.validate()?;
        info!("Loaded modem config from {}", path.display());
        Ok(config)
    }

    /// Rejects values the driver cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ModemError::invalid_config("baud_rate must be non-zero"));
        }
        if self.country_code.trim().is_empty() {
            return Err(ModemError::invalid_config("country_code must not be empty"));
        }
        if self.send_timeout_ms == 0 {
            return Err(ModemError::invalid_config("send_timeout_ms must be non-zero"));
        }
        if self.channel_capacity == 0 {
            return Err(ModemError::invalid_config("channel_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Fingerprint used to pick the modem among the enumerated ports.
    #[must_use]
    pub fn fingerprint(&self) -> ModemFingerprint {
        ModemFingerprint::new(&self.device_path, &self.manufacturer)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
