//! GRBL 1.1 line protocol
//!
//! - `flow`: character-counting flow control
//! - `status_parser`: `<...>` status reports
//! - `response_parser`: every other reply line
//! - `error_decoder`: `error:` / `ALARM:` code descriptions
//! - `controller`: [`GrblLink`], the [`ControllerLink`](super::ControllerLink) implementation

pub mod controller;
pub mod error_decoder;
pub mod flow;
pub mod response_parser;
pub mod status_parser;

use crate::communication::{SerialTransport, SimulatedTransport};

pub use controller::GrblLink;
pub use error_decoder::{decode_alarm, decode_error, format_alarm, format_error};
pub use flow::CharacterCounter;
pub use response_parser::{GrblResponse, GrblResponseParser};
pub use status_parser::StatusParser;

/// Serial RX buffer of an ATmega328p GRBL build
pub const RX_BUFFER_SIZE: usize = 128;

/// Consecutive protocol violations tolerated before the link reports a fault
pub const MAX_CONSECUTIVE_VIOLATIONS: u32 = 8;

/// Bytes buffered without a line terminator before the input is discarded
pub const MAX_PENDING_INPUT: usize = 4096;

/// Alarms a soft reset raises on its own: `3` while moving, `6` while homing
pub const RESET_ALARMS: [u8; 2] = [3, 6];

/// How long a soft reset may take before the link accepts lines again
pub const RESET_SETTLE_MS: u64 = 1000;

/// GRBL over a physical serial port
pub type RealLink = GrblLink<SerialTransport>;

/// GRBL over the in-process simulator
pub type SimulatedLink = GrblLink<SimulatedTransport>;

/// Wire length of `line`: trimmed text plus `\n`
pub fn frame_len(line: &str) -> usize {
    line.trim().len() + 1
}
