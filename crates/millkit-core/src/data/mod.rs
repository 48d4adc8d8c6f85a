//! Data models for positions, machine status and job progress
//!
//! This module provides:
//! - 3-axis position tracking in the machine frame
//! - Machine status as reported by the motion controller
//! - Job streaming state
//! - The authoritative [`MachineState`] and its serializable [`MachineSnapshot`]
//! - Tool defaults used to pre-seed the spindle at job start

pub mod tools;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl Axis {
    /// Parse an axis letter, case-insensitive
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    /// Axis letter as used in G-code words
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Position in 3D space (millimeters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
}

impl Position {
    /// Create a new position with X, Y, Z coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Read one axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Write one axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// Component-wise addition
    pub fn add(&self, other: &Position) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    /// Component-wise subtraction
    pub fn subtract(&self, other: &Position) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Euclidean distance to another position
    pub fn distance_to(&self, other: &Position) -> f64 {
        let d = other.subtract(self);
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    /// Linear interpolation towards `other`, `t` clamped to `[0, 1]`
    pub fn lerp(&self, other: &Position, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
            self.z + (other.z - self.z) * t,
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Machine status as reported by the motion controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// Idle, ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold active
    Hold,
    /// Homing cycle in progress
    Home,
    /// Alarm state, controller locked
    Alarm,
    /// Safety door open
    Door,
    /// No controller link attached
    Disconnected,
}

impl MachineStatus {
    /// Whether a controller link (real or simulated) is attached
    pub fn is_connected(&self) -> bool {
        !matches!(self, MachineStatus::Disconnected)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Run => write!(f, "Run"),
            Self::Hold => write!(f, "Hold"),
            Self::Home => write!(f, "Home"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Door => write!(f, "Door"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Spindle rotation direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpindleDirection {
    /// Stopped
    #[default]
    #[serde(rename = "OFF")]
    Off,
    /// Clockwise (M3)
    #[serde(rename = "CW")]
    Cw,
    /// Counter-clockwise (M4)
    #[serde(rename = "CCW")]
    Ccw,
}

impl fmt::Display for SpindleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::Cw => write!(f, "CW"),
            Self::Ccw => write!(f, "CCW"),
        }
    }
}

/// Which kind of controller link is attached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// No link attached
    #[default]
    None,
    /// Physical serial controller
    Real,
    /// Simulated motion source
    Simulated,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Real => write!(f, "real"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Job streaming state
///
/// `Completed`, `Stopped` and `Alarm` are terminal for a job instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// No job loaded
    #[default]
    Idle,
    /// Program loaded, not yet started
    Loaded,
    /// Lines are being dispatched
    Running,
    /// Feed hold, no new lines dispatched
    Holding,
    /// Homing cycle in progress, dispatch path blocked
    Homing,
    /// Last line acknowledged
    Completed,
    /// Operator abort
    Stopped,
    /// Aborted by a controller error, alarm or lost link
    Alarm,
}

impl JobState {
    /// Terminal for the current job instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Alarm)
    }

    /// A job is in progress (lines may be in flight)
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Running | Self::Holding)
    }

    /// States from which a new program may be loaded
    pub fn can_load(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Stopped)
    }

    /// States from which a homing cycle may start
    pub fn can_home(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Completed | Self::Stopped | Self::Alarm
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Loaded => write!(f, "Loaded"),
            Self::Running => write!(f, "Running"),
            Self::Holding => write!(f, "Holding"),
            Self::Homing => write!(f, "Homing"),
            Self::Completed => write!(f, "Completed"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Alarm => write!(f, "Alarm"),
        }
    }
}

/// A job- or connection-level failure surfaced to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Failing program line, if the fault is tied to one
    pub line: Option<usize>,
    /// Controller error or alarm code
    pub code: Option<u8>,
    /// Human-readable description
    pub message: String,
}

impl FaultReport {
    /// Fault without line or code
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            line: None,
            code: None,
            message: message.into(),
        }
    }

    /// Fault raised by the controller rejecting a line
    pub fn rejected(line: usize, code: u8, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.code) {
            (Some(line), Some(code)) => write!(f, "line {}: error:{} {}", line, code, self.message),
            (None, Some(code)) => write!(f, "code {}: {}", code, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// The single authoritative machine state
///
/// `status == Disconnected` iff `connection == ConnectionKind::None`.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// Controller status
    pub status: MachineStatus,
    /// Position in the machine frame
    pub machine_position: Position,
    /// Work coordinate offset (work = machine - offset)
    pub work_offset: Position,
    /// Current feed rate (mm/min)
    pub feed_rate: f64,
    /// Commanded spindle speed
    pub spindle_rpm: f64,
    /// Commanded spindle direction
    pub spindle_direction: SpindleDirection,
    /// Vacuum output
    pub vacuum: bool,
    /// Active program identifier
    pub job_file: Option<String>,
    /// Last acknowledged program line
    pub current_line: usize,
    /// Program length
    pub total_lines: usize,
    /// Streaming state
    pub job_state: JobState,
    /// Attached link kind
    pub connection: ConnectionKind,
    /// Most recent job/connection fault
    pub last_fault: Option<FaultReport>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: MachineStatus::Disconnected,
            machine_position: Position::default(),
            work_offset: Position::default(),
            feed_rate: 0.0,
            spindle_rpm: 0.0,
            spindle_direction: SpindleDirection::Off,
            vacuum: false,
            job_file: None,
            current_line: 0,
            total_lines: 0,
            job_state: JobState::Idle,
            connection: ConnectionKind::None,
            last_fault: None,
        }
    }
}

impl MachineState {
    /// Position in the work frame
    pub fn work_position(&self) -> Position {
        self.machine_position.subtract(&self.work_offset)
    }

    /// Take a timestamped, serializable copy
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            status: self.status,
            machine_position: self.machine_position,
            work_position: self.work_position(),
            work_offset: self.work_offset,
            feed_rate: self.feed_rate,
            spindle_rpm: self.spindle_rpm,
            spindle_direction: self.spindle_direction,
            vacuum: self.vacuum,
            job_file: self.job_file.clone(),
            current_line: self.current_line,
            total_lines: self.total_lines,
            job_state: self.job_state,
            connection: self.connection,
            last_fault: self.last_fault.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Read-only copy of [`MachineState`] handed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Controller status
    pub status: MachineStatus,
    /// Position in the machine frame
    pub machine_position: Position,
    /// Position in the work frame
    pub work_position: Position,
    /// Work coordinate offset
    pub work_offset: Position,
    /// Feed rate (mm/min)
    pub feed_rate: f64,
    /// Spindle speed
    pub spindle_rpm: f64,
    /// Spindle direction
    pub spindle_direction: SpindleDirection,
    /// Vacuum output
    pub vacuum: bool,
    /// Active program identifier
    pub job_file: Option<String>,
    /// Last acknowledged program line
    pub current_line: usize,
    /// Program length
    pub total_lines: usize,
    /// Streaming state
    pub job_state: JobState,
    /// Attached link kind
    pub connection: ConnectionKind,
    /// Most recent fault
    pub last_fault: Option<FaultReport>,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl MachineSnapshot {
    /// Serialize for a JSON transport
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
