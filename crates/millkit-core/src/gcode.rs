//! G-code word extraction
//!
//! Only what the engine needs to act on a line: comment stripping, word
//! tokenizing, spindle/vacuum/tool side effects, and a small modal tracker
//! that turns `G0`/`G1` (and arcs, as chords) into straight moves. Full
//! semantic interpretation is the controller firmware's job.

use crate::data::{Axis, Position, SpindleDirection};

/// A single letter/value word such as `X10.5` or `M3`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    /// Upper-case word letter
    pub letter: char,
    /// Numeric value
    pub value: f64,
}

impl Word {
    /// True for `letter` with an integral value equal to `code` (`M03 == M3`)
    pub fn is(&self, letter: char, code: f64) -> bool {
        self.letter == letter && (self.value - code).abs() < 1e-6
    }
}

/// Remove `;` line comments and `( ... )` inline comments, then trim
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Tokenize a comment-free line into words
///
/// Accepts both `G1 X10 Y5` and the compact `G1X10Y5`. A `$J=` jog prefix is
/// skipped so jog lines tokenize like ordinary motion. Malformed words are
/// dropped.
pub fn words(line: &str) -> Vec<Word> {
    let body = line.trim();
    let body = body
        .strip_prefix("$J=")
        .or_else(|| body.strip_prefix("$j="))
        .unwrap_or(body);
    if body.starts_with('$') {
        return Vec::new();
    }

    let chars: Vec<char> = body.chars().collect();
    let mut result = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !c.is_ascii_alphabetic() {
            i += 1;
            continue;
        }
        let letter = c.to_ascii_uppercase();
        i += 1;
        while i < chars.len() && chars[i] == ' ' {
            i += 1;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | '-' | '+')) {
            i += 1;
        }
        let number: String = chars[start..i].iter().collect();
        if let Ok(value) = number.parse::<f64>() {
            result.push(Word { letter, value });
        }
    }
    result
}

/// Side effects a line requests outside the motion controller
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineActions {
    /// `M3`/`M4`/`M5`
    pub spindle: Option<SpindleDirection>,
    /// `S` word
    pub rpm: Option<f64>,
    /// `M7`/`M8` on, `M9` off
    pub vacuum: Option<bool>,
    /// `T` word
    pub tool: Option<u32>,
}

impl LineActions {
    /// Whether the line touches spindle or vacuum
    pub fn has_actuation(&self) -> bool {
        self.spindle.is_some() || self.rpm.is_some() || self.vacuum.is_some()
    }
}

/// Extract spindle, vacuum and tool words from a line
pub fn extract_actions(line: &str) -> LineActions {
    let mut actions = LineActions::default();
    for word in words(&strip_comments(line)) {
        match word.letter {
            'M' if word.is('M', 3.0) => actions.spindle = Some(SpindleDirection::Cw),
            'M' if word.is('M', 4.0) => actions.spindle = Some(SpindleDirection::Ccw),
            'M' if word.is('M', 5.0) => actions.spindle = Some(SpindleDirection::Off),
            'M' if word.is('M', 7.0) || word.is('M', 8.0) => actions.vacuum = Some(true),
            'M' if word.is('M', 9.0) => actions.vacuum = Some(false),
            'S' if word.value >= 0.0 => actions.rpm = Some(word.value),
            'T' if word.value >= 0.0 => actions.tool = Some(word.value as u32),
            _ => {}
        }
    }
    actions
}

/// A straight move produced by [`ModalTracker::consume`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    /// Start point, machine frame
    pub from: Position,
    /// End point, machine frame
    pub to: Position,
    /// `G0` rapid
    pub rapid: bool,
    /// Commanded feed (mm/min) for non-rapid moves
    pub feed: f64,
}

impl Move {
    /// Segment length
    pub fn length(&self) -> f64 {
        self.from.distance_to(&self.to)
    }
}

/// Minimal modal state: distance mode, motion mode, feed, position
#[derive(Debug, Clone, PartialEq)]
pub struct ModalTracker {
    /// Current position
    pub position: Position,
    /// `G90` when true, `G91` when false
    pub absolute: bool,
    /// Modal feed rate
    pub feed: f64,
    rapid: bool,
}

impl Default for ModalTracker {
    fn default() -> Self {
        Self {
            position: Position::default(),
            absolute: true,
            feed: 0.0,
            rapid: true,
        }
    }
}

impl ModalTracker {
    /// Start tracking from `position`
    pub fn at(position: Position) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Apply one line; returns the move it commands, if any
    ///
    /// Jog lines (`$J=`) are relative only when they say `G91` and never
    /// change the modal distance mode.
    pub fn consume(&mut self, line: &str) -> Option<Move> {
        let stripped = strip_comments(line);
        let jog = stripped.starts_with("$J=") || stripped.starts_with("$j=");
        let words = words(&stripped);
        if words.is_empty() {
            return None;
        }

        let mut absolute = if jog { true } else { self.absolute };
        let mut rapid = if jog { false } else { self.rapid };
        let mut has_axis = false;
        let mut target = self.position;
        let mut motion_word = false;
        let mut feed = self.feed;

        for word in &words {
            match word.letter {
                'G' if word.is('G', 90.0) => absolute = true,
                'G' if word.is('G', 91.0) => absolute = false,
                'G' if word.is('G', 0.0) => {
                    rapid = true;
                    motion_word = true;
                }
                'G' if word.is('G', 1.0) || word.is('G', 2.0) || word.is('G', 3.0) => {
                    rapid = false;
                    motion_word = true;
                }
                // Non-modal coordinate words on these lines are not motion.
                'G' if word.is('G', 10.0) || word.is('G', 92.0) || word.is('G', 4.0) => {
                    return None;
                }
                'F' if word.value > 0.0 => feed = word.value,
                'X' | 'Y' | 'Z' => has_axis = true,
                _ => {}
            }
        }

        if !jog {
            self.absolute = absolute;
            self.feed = feed;
            if motion_word {
                self.rapid = rapid;
            }
        }
        if !has_axis {
            return None;
        }

        for word in &words {
            let axis = match word.letter {
                'X' => Axis::X,
                'Y' => Axis::Y,
                'Z' => Axis::Z,
                _ => continue,
            };
            let value = if absolute {
                word.value
            } else {
                self.position.get(axis) + word.value
            };
            target.set(axis, value);
        }

        let movement = Move {
            from: self.position,
            to: target,
            rapid,
            feed,
        };
        self.position = target;
        Some(movement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("G1 X1 ; move"), "G1 X1");
        assert_eq!(strip_comments("(header) G0 Z5 (lift)"), "G0 Z5");
        assert_eq!(strip_comments("; only comment"), "");
        assert_eq!(strip_comments("   "), "");
    }

    #[test]
    fn test_words_compact_and_spaced() {
        let compact = words("G1X10.5Y-2F300");
        let spaced = words("G1 X10.5 Y-2 F300");
        assert_eq!(compact, spaced);
        assert_eq!(compact.len(), 4);
        assert_eq!(compact[2], Word { letter: 'Y', value: -2.0 });
    }

    #[test]
    fn test_system_commands_have_no_words() {
        assert!(words("$H").is_empty());
        assert!(words("$$").is_empty());
        assert_eq!(words("$J=G91 X1 F100").len(), 3);
    }

    #[test]
    fn test_extract_spindle_and_vacuum() {
        let a = extract_actions("M3 S12000");
        assert_eq!(a.spindle, Some(SpindleDirection::Cw));
        assert_eq!(a.rpm, Some(12000.0));
        assert!(a.has_actuation());

        assert_eq!(extract_actions("M04").spindle, Some(SpindleDirection::Ccw));
        assert_eq!(extract_actions("M5").spindle, Some(SpindleDirection::Off));
        assert_eq!(extract_actions("M8").vacuum, Some(true));
        assert_eq!(extract_actions("M9").vacuum, Some(false));
        assert_eq!(extract_actions("T2 M6").tool, Some(2));
        assert!(!extract_actions("G1 X5 F100").has_actuation());
        // M30 must not read as M3
        assert_eq!(extract_actions("M30").spindle, None);
    }

    #[test]
    fn test_modal_tracker_absolute_and_relative() {
        let mut tracker = ModalTracker::default();
        let m = tracker.consume("G1 X10 Y5 F600").unwrap();
        assert_eq!(m.to, Position::new(10.0, 5.0, 0.0));
        assert!(!m.rapid);
        assert_eq!(m.feed, 600.0);

        tracker.consume("G91");
        let m = tracker.consume("X1 Y1").unwrap();
        assert_eq!(m.to, Position::new(11.0, 6.0, 0.0));
        assert!(!m.rapid, "motion mode is modal");

        assert!(tracker.consume("G10 L2 P1 X1 Y1 Z1").is_none());
        assert_eq!(tracker.position, Position::new(11.0, 6.0, 0.0));
    }

    #[test]
    fn test_jog_does_not_change_modal_state() {
        let mut tracker = ModalTracker::default();
        let m = tracker.consume("$J=G91 Z-1.5 F200").unwrap();
        assert_eq!(m.to, Position::new(0.0, 0.0, -1.5));
        assert_eq!(m.feed, 200.0);
        assert!(tracker.absolute);
        assert_eq!(tracker.feed, 0.0);
    }
}
