//! # Millkit Communication
//!
//! Transports and the GRBL line protocol for Millkit.
//! Supports a USB serial controller and an in-process simulated controller
//! behind the same [`ControllerLink`] contract.

pub mod communication;
pub mod firmware;

pub use communication::{
    list_ports, ConnectionParams, NoOpTransport, RealtimeWriter, SerialPortInfo, SerialTransport,
    SimulatedTransport, SimulationParams, Transport,
};

pub use firmware::grbl::{GrblLink, RealLink, SimulatedLink, RX_BUFFER_SIZE};
pub use firmware::{CommandKind, ControllerLink, FrameTag, LinkEvent, RealtimeCommand, StatusReport};
