//! Controller link contract
//!
//! A controller link owns one transport and implements the controller's line
//! protocol on top of it. The job streamer only ever talks to a
//! `dyn ControllerLink`, so a real board and the simulator are driven by the
//! exact same state machine.

use crate::communication::RealtimeWriter;
use millkit_core::{ConnectionKind, MachineStatus, Position, Result};
use std::fmt;
use std::sync::Arc;

/// Non-program commands that travel through the flow-controlled queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `$H`
    Home,
    /// `$J=...`
    Jog,
    /// `G10 L2 P1 ...`
    WorkOffset,
    /// `$X`
    Unlock,
}

/// Identifies what a sent frame was, so its reply can be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// 1-based program line number
    Program(usize),
    /// Out-of-program command
    Command(CommandKind),
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameTag::Program(line) => write!(f, "line {}", line),
            FrameTag::Command(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// Single-byte commands consumed by the controller outside the line buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeCommand {
    /// `?`
    StatusQuery,
    /// `!`
    FeedHold,
    /// `~`
    CycleStart,
    /// Ctrl-X
    SoftReset,
}

impl RealtimeCommand {
    /// Wire byte
    pub fn byte(&self) -> u8 {
        match self {
            RealtimeCommand::StatusQuery => b'?',
            RealtimeCommand::FeedHold => b'!',
            RealtimeCommand::CycleStart => b'~',
            RealtimeCommand::SoftReset => 0x18,
        }
    }
}

/// Parsed status report
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Controller state
    pub status: MachineStatus,
    /// Position in the machine frame
    pub machine_position: Position,
    /// Work coordinate offset, when the report carries one
    pub work_offset: Option<Position>,
    /// Current feed rate
    pub feed_rate: Option<f64>,
    /// Current spindle speed
    pub spindle_speed: Option<f64>,
}

/// Something the controller told us
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// `ok` for the oldest in-flight frame
    Acknowledged(FrameTag),
    /// `error:<code>` for the oldest in-flight frame
    Rejected {
        /// Frame the error belongs to
        tag: FrameTag,
        /// Controller error code
        code: u8,
    },
    /// Status report
    Status(StatusReport),
    /// `ALARM:<code>`
    Alarm(u8),
    /// Controller (re)booted; everything in flight was discarded
    Reset,
    /// Informational line (`[MSG:...]` and similar)
    Message(String),
    /// Too many consecutive protocol violations
    ProtocolFault(String),
}

/// Line protocol to a motion controller
pub trait ControllerLink: Send {
    /// Real or simulated
    fn kind(&self) -> ConnectionKind;

    /// Controller receive buffer size in bytes
    fn capacity(&self) -> usize;

    /// Bytes sent but not yet acknowledged
    fn in_flight(&self) -> usize;

    /// Number of frames sent but not yet acknowledged
    fn pending_frames(&self) -> usize;

    /// Whether `line` fits in the remaining buffer budget right now
    fn can_send(&self, line: &str) -> bool;

    /// Frame and send one line under flow control
    ///
    /// Fails with `BufferFull` without sending if the frame does not fit.
    fn send_line(&mut self, line: &str, tag: FrameTag) -> Result<()>;

    /// Write a realtime byte, bypassing flow control
    fn send_realtime(&self, command: RealtimeCommand) -> Result<()>;

    /// Handle for writing realtime bytes without holding the link
    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter>;

    /// Read and decode whatever the controller has sent
    fn poll(&mut self) -> Result<Vec<LinkEvent>>;

    /// Forget everything in flight after a soft reset was written
    ///
    /// Used when the reset byte already went out through the realtime
    /// writer, without holding the link.
    fn reset_issued(&mut self);

    /// Soft-reset the controller and forget everything in flight
    fn reset(&mut self) -> Result<()> {
        self.send_realtime(RealtimeCommand::SoftReset)?;
        self.reset_issued();
        Ok(())
    }
}
