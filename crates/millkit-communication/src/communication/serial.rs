//! Serial port transport
//!
//! Provides the physical link to a GRBL controller over USB serial:
//! - Port enumeration filtered to CNC-style device names
//! - A [`Transport`] with short bounded reads
//! - A cloned port handle for realtime bytes

use super::{ConnectionParams, RealtimeWriter, Transport};
use millkit_core::{ConnectionError, ConnectionKind, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor/product IDs if applicable
    pub usb_ids: Option<(u16, u16)>,
}

/// List available serial ports on the system
///
/// Filters ports to include only CNC controller patterns:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => SerialPortInfo {
                port_name: port.port_name.clone(),
                description: format!(
                    "USB {} {}",
                    usb.manufacturer.as_deref().unwrap_or("Device"),
                    usb.product.as_deref().unwrap_or("Serial Port")
                ),
                manufacturer: usb.manufacturer.clone(),
                usb_ids: Some((usb.vid, usb.pid)),
            },
            _ => SerialPortInfo {
                port_name: port.port_name.clone(),
                description: "Serial Port".to_string(),
                manufacturer: None,
                usb_ids: None,
            },
        })
        .collect())
}

/// Check if a port name matches CNC controller patterns
pub fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// Serial transport backed by the `serialport` crate
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    realtime: Arc<SerialRealtimeWriter>,
    name: String,
    read_buf: Vec<u8>,
}

impl SerialTransport {
    /// Open the device described by `params`
    ///
    /// Fails with `LinkUnavailable` if the device cannot be opened.
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        if params.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be > 0".to_string(),
            }
            .into());
        }

        let unavailable = |e: serialport::Error| -> Error {
            tracing::warn!("Failed to open serial port {}: {}", params.port, e);
            ConnectionError::LinkUnavailable {
                port: params.port.clone(),
                reason: e.to_string(),
            }
            .into()
        };

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(params.timeout_ms.max(1)))
            .open()
            .map_err(unavailable)?;
        let clone = port.try_clone().map_err(unavailable)?;

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
        Ok(Self {
            port,
            realtime: Arc::new(SerialRealtimeWriter {
                port: Mutex::new(clone),
            }),
            name: params.port.clone(),
            read_buf: vec![0u8; 256],
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .and_then(|_| self.port.flush())
            .map_err(|e| Error::link_lost(format!("write to {} failed: {}", self.name, e)))
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>> {
        match self.port.read(&mut self.read_buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(self.read_buf[..n].to_vec())),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(Error::link_lost(format!(
                "read from {} failed: {}",
                self.name, e
            ))),
        }
    }

    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter> {
        self.realtime.clone()
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Real
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

struct SerialRealtimeWriter {
    port: Mutex<Box<dyn serialport::SerialPort>>,
}

impl RealtimeWriter for SerialRealtimeWriter {
    fn write_byte(&self, byte: u8) -> Result<()> {
        let mut port = self.port.lock();
        port.write_all(&[byte])
            .and_then(|_| port.flush())
            .map_err(|e| Error::link_lost(format!("realtime write failed: {}", e)))
    }
}
