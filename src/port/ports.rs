use log::{debug, info};
pub use tokio_serial::{SerialPortInfo, SerialPortType, UsbPortInfo, available_ports};

use crate::error::{ModemError, Result};

/// Identifies the modem among the ports the host enumerates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModemFingerprint {
    /// Device path, compared case-insensitively.
    pub device_path: String,
    /// Substring the USB manufacturer string must contain.
    pub manufacturer: String,
}

impl ModemFingerprint {
    pub fn new(device_path: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            manufacturer: manufacturer.into(),
        }
    }

    /// Whether `port` is the modem this fingerprint describes.
    pub fn matches(&self, port: &PortDescriptor) -> bool {
        let maker = port
            .manufacturer
            .as_deref()
            .is_some_and(|m| m.contains(&self.manufacturer));
        maker && port.path.eq_ignore_ascii_case(&self.device_path)
    }
}

/// An enumerated serial port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDescriptor {
    pub path: String,
    /// USB manufacturer, `None` for non-USB ports.
    pub manufacturer: Option<String>,
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let manufacturer = match info.port_type {
            SerialPortType::UsbPort(UsbPortInfo { manufacturer, .. }) => manufacturer,
            _ => None,
        };
        Self {
            path: info.port_name,
            manufacturer,
        }
    }
}

/// Source of the host's serial port list.
#[cfg_attr(test, mockall::automock)]
pub trait PortLister: Send + Sync {
    fn list(&self) -> Result<Vec<PortDescriptor>>;
}

/// Lists the ports the operating system reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPorts;

impl PortLister for SystemPorts {
    fn list(&self) -> Result<Vec<PortDescriptor>> {
        let ports = available_ports().map_err(|e| ModemError::PortList(e.to_string()))?;
        Ok(ports.into_iter().map(PortDescriptor::from).collect())
    }
}

/// Picks the first enumerated port matching `fingerprint`.
pub fn find_modem_port(
    lister: &dyn PortLister,
    fingerprint: &ModemFingerprint,
) -> Result<PortDescriptor> {
    let ports = lister.list()?;
    debug!("Enumerated {} serial ports", ports.len());
    match ports.into_iter().find(|p| fingerprint.matches(p)) {
        Some(port) => {
            info!(
                "Modem found at {} ({})",
                port.path,
                port.manufacturer.as_deref().unwrap_or_default()
            );
            Ok(port)
        }
        None => Err(ModemError::port_not_found(&fingerprint.device_path)),
    }
}
