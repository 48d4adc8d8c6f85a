//! Simulated GRBL controller
//!
//! Speaks the same byte protocol as a GRBL 1.1 board so the link and the job
//! streamer run unchanged without hardware attached. Each accepted line
//! becomes a timed block; `ok` is emitted when the block finishes, and `?`
//! reports a position interpolated along the block in progress.

use super::{RealtimeWriter, Transport};
use millkit_core::gcode::{self, ModalTracker};
use millkit_core::{ConnectionKind, Position, Result, SpindleDirection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WELCOME: &str = "\r\nGrbl 1.1h ['$' for help]\r\n";
const UNLOCK_HINT: &str = "[MSG:'$H'|'$X' to unlock]\r\n";

/// Tuning for the simulated controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Time compression factor (1.0 = real time)
    pub speedup: f64,
    /// Rate used for `G0` moves (mm/min)
    pub rapid_rate: f64,
    /// Feed assumed when a program never set one (mm/min)
    pub default_feed: f64,
    /// Floor for any block duration
    pub min_line_ms: u64,
    /// Duration of a homing cycle
    pub homing_ms: u64,
    /// Receive buffer size the firmware pretends to have
    pub rx_buffer_size: usize,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            speedup: 1.0,
            rapid_rate: 3000.0,
            default_feed: 500.0,
            min_line_ms: 5,
            homing_ms: 1500,
            rx_buffer_size: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Motion { from: Position, to: Position, feed: f64 },
    Home { from: Position },
    Offset(Position),
    Instant,
    /// Answered with `error:<code>` in turn
    Reject(u8),
}

#[derive(Debug, Clone, Copy)]
struct Block {
    kind: BlockKind,
    duration: Duration,
    progress: Duration,
    frame_len: usize,
}

impl Block {
    fn fraction(&self) -> f64 {
        if self.duration.is_zero() {
            1.0
        } else {
            self.progress.as_secs_f64() / self.duration.as_secs_f64()
        }
    }
}

#[derive(Debug)]
struct SimFirmware {
    params: SimulationParams,
    planner: VecDeque<Block>,
    modal: ModalTracker,
    position: Position,
    wco: Position,
    spindle_rpm: f64,
    held: bool,
    alarm: bool,
    rx_used: usize,
    input: Vec<u8>,
    /// Bytes of the current line dropped because it outgrew the RX buffer
    overflow: usize,
    outbox: String,
    last_tick: Instant,
}

impl SimFirmware {
    fn new(params: SimulationParams) -> Self {
        Self {
            params,
            planner: VecDeque::new(),
            modal: ModalTracker::default(),
            position: Position::default(),
            wco: Position::default(),
            spindle_rpm: 0.0,
            held: false,
            alarm: false,
            rx_used: 0,
            input: Vec::new(),
            overflow: 0,
            outbox: WELCOME.to_string(),
            last_tick: Instant::now(),
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        if self.held {
            return;
        }

        let mut budget = elapsed.mul_f64(self.params.speedup.max(f64::MIN_POSITIVE));
        while let Some(block) = self.planner.front_mut() {
            let remaining = block.duration.saturating_sub(block.progress);
            if budget < remaining {
                block.progress += budget;
                break;
            }
            budget -= remaining;
            if let Some(done) = self.planner.pop_front() {
                self.complete(done);
            }
        }
    }

    fn complete(&mut self, block: Block) {
        match block.kind {
            BlockKind::Motion { to, .. } => self.position = to,
            BlockKind::Home { .. } => {
                self.position = Position::default();
                self.modal = ModalTracker::at(self.position);
                self.alarm = false;
            }
            BlockKind::Offset(wco) => self.wco = wco,
            BlockKind::Instant => {}
            BlockKind::Reject(code) => {
                self.rx_used = self.rx_used.saturating_sub(block.frame_len);
                self.outbox.push_str(&format!("error:{}\r\n", code));
                return;
            }
        }
        self.rx_used = self.rx_used.saturating_sub(block.frame_len);
        self.outbox.push_str("ok\r\n");
    }

    fn current_position(&self) -> Position {
        match self.planner.front().map(|b| (b.kind, b.fraction())) {
            Some((BlockKind::Motion { from, to, .. }, t)) => from.lerp(&to, t),
            Some((BlockKind::Home { from }, t)) => from.lerp(&Position::default(), t),
            _ => self.position,
        }
    }

    fn state_name(&self) -> &'static str {
        if self.alarm {
            "Alarm"
        } else if self.held {
            "Hold:0"
        } else {
            match self.planner.front().map(|b| b.kind) {
                Some(BlockKind::Home { .. }) => "Home",
                Some(_) => "Run",
                None => "Idle",
            }
        }
    }

    fn status_report(&self) -> String {
        let pos = self.current_position();
        let feed = match self.planner.front().map(|b| b.kind) {
            Some(BlockKind::Motion { feed, .. }) if !self.held => feed,
            _ => 0.0,
        };
        format!(
            "<{}|MPos:{:.3},{:.3},{:.3}|FS:{:.0},{:.0}|WCO:{:.3},{:.3},{:.3}>\r\n",
            self.state_name(),
            pos.x,
            pos.y,
            pos.z,
            feed,
            self.spindle_rpm,
            self.wco.x,
            self.wco.y,
            self.wco.z
        )
    }

    fn realtime(&mut self, byte: u8) {
        self.advance(Instant::now());
        match byte {
            b'?' => {
                let report = self.status_report();
                self.outbox.push_str(&report);
            }
            b'!' => {
                if !self.planner.is_empty() {
                    self.held = true;
                }
            }
            b'~' => self.held = false,
            0x18 => self.soft_reset(),
            _ => {}
        }
    }

    /// Ctrl-X: a reset while axes move loses position and locks the machine
    fn soft_reset(&mut self) {
        let interrupted = match self.planner.front().map(|b| b.kind) {
            _ if self.held => None,
            Some(BlockKind::Motion { .. }) => Some(3),
            Some(BlockKind::Home { .. }) => Some(6),
            _ => None,
        };
        self.position = self.current_position();
        self.planner.clear();
        self.modal = ModalTracker::at(self.position);
        self.held = false;
        self.rx_used = 0;
        self.input.clear();
        self.overflow = 0;
        self.outbox.clear();
        if let Some(code) = interrupted {
            self.alarm = true;
            self.outbox.push_str(&format!("ALARM:{}\r\n", code));
        }
        self.outbox.push_str(WELCOME);
        if self.alarm {
            self.outbox.push_str(UNLOCK_HINT);
        }
        tracing::debug!("Simulated controller reset at {}", self.position);
    }

    fn receive(&mut self, data: &[u8]) {
        for &byte in data {
            match byte {
                b'?' | b'!' | b'~' | 0x18 => self.realtime(byte),
                b'\n' => {
                    let raw = std::mem::take(&mut self.input);
                    let dropped = std::mem::take(&mut self.overflow);
                    if dropped > 0 {
                        let frame_len = raw.len() + dropped + 1;
                        tracing::warn!("Simulated controller dropped a {} byte line", frame_len);
                        self.rx_used += frame_len;
                        self.reject(14, frame_len);
                        continue;
                    }
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    self.accept_line(&line, raw.len() + 1);
                }
                b'\r' => {}
                _ if self.input.len() >= self.params.rx_buffer_size => self.overflow += 1,
                _ => self.input.push(byte),
            }
        }
    }

    fn accept_line(&mut self, line: &str, frame_len: usize) {
        self.advance(Instant::now());
        self.rx_used += frame_len;
        if self.rx_used > self.params.rx_buffer_size {
            tracing::error!(
                "Simulated RX buffer overrun: {} of {} bytes",
                self.rx_used,
                self.params.rx_buffer_size
            );
        }

        let upper = line.to_ascii_uppercase();
        if upper == "$X" {
            if self.alarm {
                self.alarm = false;
                self.outbox.push_str("[MSG:Caution: Unlocked]\r\n");
            }
            self.push_instant(frame_len);
            return;
        }
        if self.alarm && upper != "$H" {
            self.reject(9, frame_len);
            return;
        }

        let min = Duration::from_millis(self.params.min_line_ms);
        if upper == "$H" {
            let from = self.planned_end();
            self.planner.push_back(Block {
                kind: BlockKind::Home { from },
                duration: Duration::from_millis(self.params.homing_ms).max(min),
                progress: Duration::ZERO,
                frame_len,
            });
            self.modal = ModalTracker::at(Position::default());
            return;
        }

        if let Some(offset) = self.parse_work_offset(&upper) {
            self.planner.push_back(Block {
                kind: BlockKind::Offset(offset),
                duration: min,
                progress: Duration::ZERO,
                frame_len,
            });
            return;
        }

        let actions = gcode::extract_actions(&upper);
        if let Some(rpm) = actions.rpm {
            self.spindle_rpm = rpm;
        }
        if actions.spindle == Some(SpindleDirection::Off) {
            self.spindle_rpm = 0.0;
        }

        match self.modal.consume(&upper) {
            Some(movement) => {
                let rate = if movement.rapid {
                    self.params.rapid_rate
                } else if movement.feed > 0.0 {
                    movement.feed
                } else {
                    self.params.default_feed
                };
                let seconds = movement.length() / rate.max(f64::MIN_POSITIVE) * 60.0;
                self.planner.push_back(Block {
                    kind: BlockKind::Motion {
                        from: movement.from,
                        to: movement.to,
                        feed: rate,
                    },
                    duration: Duration::from_secs_f64(seconds).max(min),
                    progress: Duration::ZERO,
                    frame_len,
                });
            }
            None => self.push_instant(frame_len),
        }
    }

    fn reject(&mut self, code: u8, frame_len: usize) {
        self.planner.push_back(Block {
            kind: BlockKind::Reject(code),
            duration: Duration::ZERO,
            progress: Duration::ZERO,
            frame_len,
        });
    }

    fn push_instant(&mut self, frame_len: usize) {
        self.planner.push_back(Block {
            kind: BlockKind::Instant,
            duration: Duration::from_millis(self.params.min_line_ms),
            progress: Duration::ZERO,
            frame_len,
        });
    }

    fn planned_end(&self) -> Position {
        self.planner
            .iter()
            .rev()
            .find_map(|b| match b.kind {
                BlockKind::Motion { to, .. } => Some(to),
                BlockKind::Home { .. } => Some(Position::default()),
                _ => None,
            })
            .unwrap_or(self.position)
    }

    /// `G10 L2 P1` sets the G54 offset; unspecified axes keep their value
    fn parse_work_offset(&self, line: &str) -> Option<Position> {
        let words = gcode::words(&gcode::strip_comments(line));
        let is_g10_l2 = words.iter().any(|w| w.is('G', 10.0)) && words.iter().any(|w| w.is('L', 2.0));
        if !is_g10_l2 {
            return None;
        }
        let mut offset = self.wco;
        for word in &words {
            if let Some(axis) = millkit_core::Axis::from_char(word.letter) {
                offset.set(axis, word.value);
            }
        }
        Some(offset)
    }
}

/// Transport backed by an in-process simulated controller
pub struct SimulatedTransport {
    firmware: Arc<Mutex<SimFirmware>>,
}

impl SimulatedTransport {
    /// Power up a simulated controller at the machine origin
    pub fn new(params: SimulationParams) -> Self {
        tracing::info!(
            "Simulated controller started (speedup {}x, rapid {} mm/min)",
            params.speedup,
            params.rapid_rate
        );
        Self {
            firmware: Arc::new(Mutex::new(SimFirmware::new(params))),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(SimulationParams::default())
    }
}

impl Transport for SimulatedTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.firmware.lock().receive(data);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>> {
        let mut firmware = self.firmware.lock();
        firmware.advance(Instant::now());
        if firmware.outbox.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut firmware.outbox).into_bytes()))
    }

    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter> {
        Arc::new(SimulatedRealtimeWriter {
            firmware: self.firmware.clone(),
        })
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Simulated
    }

    fn description(&self) -> String {
        "simulated GRBL".to_string()
    }
}

struct SimulatedRealtimeWriter {
    firmware: Arc<Mutex<SimFirmware>>,
}

impl RealtimeWriter for SimulatedRealtimeWriter {
    fn write_byte(&self, byte: u8) -> Result<()> {
        self.firmware.lock().realtime(byte);
        Ok(())
    }
}
