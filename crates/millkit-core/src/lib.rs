//! # Millkit Core
//!
//! Core types, errors and events for Millkit.
//! Provides the machine data model, the error taxonomy shared by every
//! layer, the event fan-out primitive and G-code word extraction.

pub mod core;
pub mod data;
pub mod error;
pub mod gcode;

pub use core::event::{EventDispatcher, MachineEvent};

pub use data::{
    tools::{ToolDefaults, ToolLookup, ToolTable},
    Axis, ConnectionKind, FaultReport, JobState, MachineSnapshot, MachineState, MachineStatus,
    Position, SpindleDirection,
};

pub use error::{ActuatorError, ConnectionError, Error, JobError, ProtocolError, Result};
