//! Error handling for Millkit
//!
//! Provides error types for every layer of the machine control engine:
//! - Connection errors (transport open / mid-session loss)
//! - Protocol errors (malformed or out-of-order controller replies)
//! - Job errors (caller misuse, rejected lines, homing)
//! - Actuator errors (spindle/vacuum output devices)
//! - Configuration errors
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents failures of the transport underneath the controller link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The transport could not be opened.
    #[error("Link unavailable on {port}: {reason}")]
    LinkUnavailable {
        /// Device path or transport name.
        port: String,
        /// The reason the device could not be opened.
        reason: String,
    },

    /// An I/O failure after the connection was established.
    #[error("Link lost: {reason}")]
    LinkLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// No controller link is attached.
    #[error("No controller link attached")]
    NotConnected,

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Protocol error type
///
/// Raised by the line protocol when a reply cannot be matched to the
/// stream of sent frames.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Malformed or unexpected reply from the controller
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// What was wrong with the reply.
        reason: String,
    },

    /// A frame does not fit the controller receive buffer right now
    #[error("Receive buffer full: {needed} bytes needed, {available} available")]
    BufferFull {
        /// Bytes required by the frame, terminator included.
        needed: usize,
        /// Bytes currently free in the receive buffer.
        available: usize,
    },
}

/// Job error type
///
/// Caller misuse and job-level failures of the streaming state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The program contains no lines
    #[error("Program is empty")]
    EmptyJob,

    /// A line can never fit in the controller receive buffer
    #[error("Line {line} is {length} bytes, receive buffer holds {capacity}")]
    LineTooLong {
        /// 1-based program line number.
        line: usize,
        /// Frame length including terminator.
        length: usize,
        /// Receive buffer capacity.
        capacity: usize,
    },

    /// The requested operation is not valid in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        /// The rejected operation.
        operation: String,
        /// The state the request arrived in.
        state: String,
    },

    /// The controller rejected a program line
    #[error("Line {line} rejected with error:{code} ({message})")]
    LineRejected {
        /// 1-based program line number.
        line: usize,
        /// Controller error code.
        code: u8,
        /// Decoded description of the code.
        message: String,
    },

    /// The job ended in alarm for a reason not tied to one line
    #[error("Job aborted: {reason}")]
    Aborted {
        /// The recorded fault.
        reason: String,
    },

    /// Homing timed out or the controller alarmed during homing
    #[error("Homing failed: {reason}")]
    HomingFailed {
        /// The reason the homing cycle failed.
        reason: String,
    },

    /// An argument was outside its accepted range
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// The reason the argument was rejected.
        reason: String,
    },
}

/// Actuator error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    /// The output device could not be opened at initialization
    #[error("Actuator unavailable: {device}: {reason}")]
    ActuatorUnavailable {
        /// Device path.
        device: String,
        /// The reason the device could not be opened.
        reason: String,
    },

    /// A write to an already opened output failed
    #[error("Actuator write failed on {device}: {reason}")]
    WriteFailed {
        /// Device path.
        device: String,
        /// The reason the write failed.
        reason: String,
    },
}

/// Main error type for Millkit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Job error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Actuator error
    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Shorthand for an [`JobError::InvalidTransition`]
    pub fn invalid_transition(operation: impl Into<String>, state: impl ToString) -> Self {
        Error::Job(JobError::InvalidTransition {
            operation: operation.into(),
            state: state.to_string(),
        })
    }

    /// Shorthand for a [`ConnectionError::LinkLost`]
    pub fn link_lost(reason: impl Into<String>) -> Self {
        Error::Connection(ConnectionError::LinkLost {
            reason: reason.into(),
        })
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if the link was lost mid-session
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::LinkLost { .. }))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this error is caller misuse that left state untouched
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Job(
                JobError::EmptyJob
                    | JobError::LineTooLong { .. }
                    | JobError::InvalidTransition { .. }
                    | JobError::InvalidArgument { .. }
            )
        )
    }

    /// Check if this is an actuator error
    pub fn is_actuator_error(&self) -> bool {
        matches!(self, Error::Actuator(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
