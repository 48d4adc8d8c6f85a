//! Byte-level transports to the motion controller
//!
//! A [`Transport`] knows nothing about the line protocol: it moves bytes.
//! Realtime control bytes travel through a separate [`RealtimeWriter`]
//! handle so they can be issued while the owner of the transport is busy.

pub mod serial;
pub mod simulated;

use millkit_core::{ConnectionKind, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use serial::{list_ports, SerialPortInfo, SerialTransport};
pub use simulated::{SimulatedTransport, SimulationParams};

/// Connection parameters for the serial transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Device path (e.g. `/dev/ttyUSB0`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Bounded read wait in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            timeout_ms: 10,
        }
    }
}

/// Byte-oriented channel to a controller
pub trait Transport: Send {
    /// Write all of `data`
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available within a bounded wait
    fn try_receive(&mut self) -> Result<Option<Vec<u8>>>;

    /// Handle for out-of-band single-byte writes
    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter>;

    /// Physical or simulated
    fn kind(&self) -> ConnectionKind;

    /// Human-readable name for logs
    fn description(&self) -> String;
}

/// Out-of-band single byte writer
///
/// Implementations hold at most a leaf lock for the duration of one write.
pub trait RealtimeWriter: Send + Sync {
    /// Write one realtime byte immediately
    fn write_byte(&self, byte: u8) -> Result<()>;
}

/// Transport that accepts everything and never replies
#[derive(Debug, Default)]
pub struct NoOpTransport;

struct NoOpWriter;

impl RealtimeWriter for NoOpWriter {
    fn write_byte(&self, _byte: u8) -> Result<()> {
        Ok(())
    }
}

impl Transport for NoOpTransport {
    fn send(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter> {
        Arc::new(NoOpWriter)
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::None
    }

    fn description(&self) -> String {
        "noop".to_string()
    }
}
