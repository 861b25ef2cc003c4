//! Serial port discovery

use serialport::SerialPortType;

use crate::{Error, Result};

/// A serial port visible to the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path (e.g. `/dev/ttyACM0`)
    pub path: String,
    /// Human-readable description: product, manufacturer, serial number
    pub description: String,
}

/// List serial ports with their descriptions
///
/// # Errors
///
/// Returns error if the OS port enumeration fails
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::Transport(format!("cannot enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            path: p.port_name,
        })
        .collect())
}

/// Pick the port whose description contains `needle`, else `fallback`
///
/// Matching is case-insensitive. Enumeration failures fall back as well.
#[must_use]
pub fn discover_port(needle: &str, fallback: &str) -> String {
    match list_ports() {
        Ok(ports) => select_port(&ports, needle, fallback),
        Err(e) => {
            tracing::warn!(error = %e, fallback, "port discovery failed");
            fallback.to_string()
        }
    }
}

/// Matching rule behind [`discover_port`]
#[must_use]
pub fn select_port(ports: &[PortInfo], needle: &str, fallback: &str) -> String {
    let needle = needle.to_lowercase();

    if !needle.is_empty() {
        if let Some(port) = ports
            .iter()
            .find(|p| p.description.to_lowercase().contains(&needle))
        {
            tracing::info!(path = %port.path, description = %port.description, "discovered device port");
            return port.path.clone();
        }
    }

    tracing::info!(fallback, "no matching serial port, using fallback");
    fallback.to_string()
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [
                usb.product.as_deref(),
                usb.manufacturer.as_deref(),
                usb.serial_number.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect();

            if parts.is_empty() {
                format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
            } else {
                parts.join(" ")
            }
        }
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::Unknown => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<PortInfo> {
        vec![
            PortInfo {
                path: "/dev/ttyS0".to_string(),
                description: "PCI".to_string(),
            },
            PortInfo {
                path: "/dev/ttyACM1".to_string(),
                description: "USB Serial Device Espressif".to_string(),
            },
        ]
    }

    #[test]
    fn matches_description_case_insensitively() {
        assert_eq!(
            select_port(&ports(), "usb serial", "/dev/ttyACM0"),
            "/dev/ttyACM1"
        );
    }

    #[test]
    fn falls_back_without_match() {
        assert_eq!(select_port(&ports(), "arduino", "/dev/ttyACM0"), "/dev/ttyACM0");
        assert_eq!(select_port(&[], "usb", "/dev/ttyUSB0"), "/dev/ttyUSB0");
    }

    #[test]
    fn empty_needle_uses_fallback() {
        assert_eq!(select_port(&ports(), "", "/dev/ttyACM0"), "/dev/ttyACM0");
    }
}
