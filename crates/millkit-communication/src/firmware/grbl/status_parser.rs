//! GRBL Status Report Parsing
//!
//! Parses `<State|MPos:x,y,z|FS:feed,speed|WCO:x,y,z>` reports. GRBL may be
//! configured (via $10) to report `WPos` instead of `MPos`; the machine
//! position is then derived as `WPos + WCO`. GRBL only includes `WCO` every
//! 10 to 30 reports, so the caller supplies the last offset it saw.

use crate::firmware::link::StatusReport;
use millkit_core::{MachineStatus, Position, ProtocolError};

/// GRBL status report parser
pub struct StatusParser;

impl StatusParser {
    /// Map a GRBL state name (with optional `:n` sub-state) to a status
    pub fn parse_machine_state(name: &str) -> Option<MachineStatus> {
        let base = name.split(':').next().unwrap_or(name);
        match base {
            "Idle" | "Check" | "Sleep" => Some(MachineStatus::Idle),
            "Run" | "Jog" => Some(MachineStatus::Run),
            "Hold" => Some(MachineStatus::Hold),
            "Home" => Some(MachineStatus::Home),
            "Alarm" => Some(MachineStatus::Alarm),
            "Door" => Some(MachineStatus::Door),
            _ => None,
        }
    }

    /// Parse an `x,y,z` triple; extra axes are ignored
    pub fn parse_triple(value: &str) -> Option<Position> {
        let coords: Vec<f64> = value
            .split(',')
            .map(|s| s.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;

        if coords.len() < 3 {
            return None;
        }

        Some(Position::new(coords[0], coords[1], coords[2]))
    }

    /// Extract field value from status report
    fn extract_field<'a>(body: &'a str, field_prefix: &str) -> Option<&'a str> {
        body.split('|')
            .skip(1)
            .find_map(|part| part.strip_prefix(field_prefix))
    }

    /// Parse a complete report line, brackets included
    ///
    /// A `WPos` report without `WCO` is taken relative to a zero offset.
    pub fn parse(line: &str) -> Result<StatusReport, ProtocolError> {
        Self::parse_with_offset(line, Position::default())
    }

    /// Parse a report, using `known_offset` when a `WPos` report omits `WCO`
    pub fn parse_with_offset(
        line: &str,
        known_offset: Position,
    ) -> Result<StatusReport, ProtocolError> {
        let malformed = |reason: &str| ProtocolError::ProtocolViolation {
            reason: format!("{}: {}", reason, line),
        };

        let body = line
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| malformed("unterminated status report"))?;

        let state = body.split('|').next().unwrap_or_default();
        let status =
            Self::parse_machine_state(state).ok_or_else(|| malformed("unknown machine state"))?;

        let triple = |prefix: &str| -> Result<Option<Position>, ProtocolError> {
            match Self::extract_field(body, prefix) {
                Some(value) => Self::parse_triple(value)
                    .map(Some)
                    .ok_or_else(|| malformed("bad coordinate triple")),
                None => Ok(None),
            }
        };

        let mpos = triple("MPos:")?;
        let wpos = triple("WPos:")?;
        let work_offset = triple("WCO:")?;

        let machine_position = match (mpos, wpos, work_offset) {
            (Some(mpos), _, _) => mpos,
            (None, Some(wpos), Some(wco)) => wpos.add(&wco),
            (None, Some(wpos), None) => wpos.add(&known_offset),
            (None, None, _) => return Err(malformed("no usable position")),
        };

        let (feed_rate, spindle_speed) = match Self::extract_field(body, "FS:") {
            Some(fs) => {
                let mut parts = fs.split(',').map(|s| s.trim().parse::<f64>().ok());
                (parts.next().flatten(), parts.next().flatten())
            }
            None => (
                Self::extract_field(body, "F:").and_then(|s| s.trim().parse().ok()),
                None,
            ),
        };

        Ok(StatusReport {
            status,
            machine_position,
            work_offset,
            feed_rate,
            spindle_speed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_report() {
        let report =
            StatusParser::parse("<Run|MPos:10.000,5.000,2.000|FS:600,12000|WCO:10.000,5.000,0.000>")
                .unwrap();
        assert_eq!(report.status, MachineStatus::Run);
        assert_eq!(report.machine_position, Position::new(10.0, 5.0, 2.0));
        assert_eq!(report.work_offset, Some(Position::new(10.0, 5.0, 0.0)));
        assert_eq!(report.feed_rate, Some(600.0));
        assert_eq!(report.spindle_speed, Some(12000.0));
    }

    #[test]
    fn test_substates_and_aliases() {
        let hold = StatusParser::parse("<Hold:0|MPos:0,0,0|FS:0,0>").unwrap();
        assert_eq!(hold.status, MachineStatus::Hold);
        assert_eq!(hold.work_offset, None);
        let jog = StatusParser::parse("<Jog|MPos:0,0,0|FS:0,0>").unwrap();
        assert_eq!(jog.status, MachineStatus::Run);
        let door = StatusParser::parse("<Door:1|MPos:0,0,0|FS:0,0>").unwrap();
        assert_eq!(door.status, MachineStatus::Door);
    }

    #[test]
    fn test_wpos_plus_wco() {
        let report = StatusParser::parse("<Idle|WPos:0.000,0.000,2.000|FS:0,0|WCO:10,5,0>").unwrap();
        assert_eq!(report.machine_position, Position::new(10.0, 5.0, 2.0));
    }

    #[test]
    fn test_wpos_without_wco_uses_known_offset() {
        let line = "<Run|WPos:1.000,0.000,2.000|FS:600,0>";
        let report = StatusParser::parse_with_offset(line, Position::new(10.0, 5.0, 0.0)).unwrap();
        assert_eq!(report.machine_position, Position::new(11.0, 5.0, 2.0));
        assert_eq!(report.work_offset, None);

        let report = StatusParser::parse(line).unwrap();
        assert_eq!(report.machine_position, Position::new(1.0, 0.0, 2.0));
    }

    #[test]
    fn test_malformed_reports() {
        assert!(StatusParser::parse("<Idle|MPos:1,2|FS:0,0>").is_err());
        assert!(StatusParser::parse("<Idle|MPos:1,x,3>").is_err());
        assert!(StatusParser::parse("<Dancing|MPos:0,0,0>").is_err());
        assert!(StatusParser::parse("<Idle|FS:0,0>").is_err());
        assert!(StatusParser::parse("<Idle|MPos:0,0,0").is_err());
    }
}
