//! GRBL Response Parser
//!
//! Classifies each line the controller sends: acknowledgments, errors,
//! alarms, status reports, the boot banner and bracketed feedback messages.

use super::status_parser::StatusParser;
use crate::firmware::link::StatusReport;
use millkit_core::{Position, ProtocolError};
use std::fmt;

/// GRBL response types
#[derive(Debug, Clone, PartialEq)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response with error code
    Error(u8),
    /// Alarm response with alarm code
    Alarm(u8),
    /// Status report
    Status(StatusReport),
    /// Boot banner, e.g. `Grbl 1.1h ['$' for help]`
    Welcome(String),
    /// Bracketed feedback such as `[MSG:Reset to continue]`
    Feedback(String),
    /// Any other text
    Message(String),
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "{}", super::error_decoder::format_error(*code)),
            Self::Alarm(code) => write!(f, "{}", super::error_decoder::format_alarm(*code)),
            Self::Status(report) => write!(f, "status:{}", report.status),
            Self::Welcome(banner) => write!(f, "welcome:{}", banner),
            Self::Feedback(msg) => write!(f, "feedback:{}", msg),
            Self::Message(msg) => write!(f, "message:{}", msg),
        }
    }
}

/// GRBL response parser
#[derive(Debug, Default, Clone, Copy)]
pub struct GrblResponseParser;

impl GrblResponseParser {
    /// Create a new GRBL response parser
    pub fn new() -> Self {
        Self
    }

    /// Parse one reply line
    ///
    /// Blank lines yield `Ok(None)`. A status report or code that cannot be
    /// decoded is a protocol violation.
    pub fn parse(&self, line: &str) -> Result<Option<GrblResponse>, ProtocolError> {
        self.parse_with_offset(line, Position::default())
    }

    /// [`GrblResponseParser::parse`] with the last work offset the controller
    /// reported, for `WPos` reports that omit `WCO`
    pub fn parse_with_offset(
        &self,
        line: &str,
        known_offset: Position,
    ) -> Result<Option<GrblResponse>, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if line == "ok" {
            return Ok(Some(GrblResponse::Ok));
        }

        if let Some(code) = strip_prefix_ci(line, "error:") {
            return Self::code(line, code).map(|c| Some(GrblResponse::Error(c)));
        }

        if let Some(code) = strip_prefix_ci(line, "alarm:") {
            return Self::code(line, code).map(|c| Some(GrblResponse::Alarm(c)));
        }

        if line.starts_with('<') {
            return StatusParser::parse_with_offset(line, known_offset)
                .map(|r| Some(GrblResponse::Status(r)));
        }

        if line.starts_with("Grbl ") {
            return Ok(Some(GrblResponse::Welcome(line.to_string())));
        }

        if line.starts_with('[') && line.ends_with(']') {
            return Ok(Some(GrblResponse::Feedback(
                line[1..line.len() - 1].to_string(),
            )));
        }

        Ok(Some(GrblResponse::Message(line.to_string())))
    }

    fn code(line: &str, code: &str) -> Result<u8, ProtocolError> {
        code.trim()
            .parse::<u8>()
            .map_err(|_| ProtocolError::ProtocolViolation {
                reason: format!("bad code in reply: {}", line),
            })
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
