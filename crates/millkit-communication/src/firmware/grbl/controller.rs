//! GRBL controller link
//!
//! Frames lines, enforces character counting, matches `ok`/`error` replies to
//! the oldest in-flight frame and turns everything else the controller says
//! into [`LinkEvent`]s. Realtime bytes go straight to the transport's
//! realtime writer and never touch the counter.

use super::flow::CharacterCounter;
use super::response_parser::{GrblResponse, GrblResponseParser};
use super::{
    frame_len, MAX_CONSECUTIVE_VIOLATIONS, MAX_PENDING_INPUT, RESET_ALARMS, RESET_SETTLE_MS,
    RX_BUFFER_SIZE,
};
use crate::communication::{
    ConnectionParams, RealtimeWriter, SerialTransport, SimulatedTransport, SimulationParams,
    Transport,
};
use crate::firmware::link::{ControllerLink, FrameTag, LinkEvent, RealtimeCommand};
use millkit_core::{ConnectionKind, Position, ProtocolError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads drained per poll before yielding back to the caller
const MAX_READS_PER_POLL: usize = 16;

/// GRBL line protocol over a transport
pub struct GrblLink<T: Transport> {
    transport: T,
    realtime: Arc<dyn RealtimeWriter>,
    counter: CharacterCounter<FrameTag>,
    parser: GrblResponseParser,
    rx_buffer: String,
    violations: u32,
    reset_deadline: Option<Instant>,
    /// Last `WCO` the controller reported
    work_offset: Position,
}

impl GrblLink<SerialTransport> {
    /// Open a serial port and wrap it
    ///
    /// Opening the port resets most boards, so lines are held back until the
    /// banner arrives or the settle time passes.
    pub fn open(params: &ConnectionParams, capacity: usize) -> Result<Self> {
        Ok(Self::new(SerialTransport::open(params)?, capacity).awaiting_banner())
    }
}

impl GrblLink<SimulatedTransport> {
    /// Start a simulated controller and wrap it
    pub fn simulated(params: SimulationParams) -> Self {
        let capacity = params.rx_buffer_size;
        Self::new(SimulatedTransport::new(params), capacity).awaiting_banner()
    }
}

impl<T: Transport> GrblLink<T> {
    /// Wrap an already opened transport
    pub fn new(transport: T, capacity: usize) -> Self {
        let realtime = transport.realtime_writer();
        tracing::info!(
            "GRBL link on {} ({} byte RX buffer)",
            transport.description(),
            capacity
        );
        Self {
            transport,
            realtime,
            counter: CharacterCounter::new(capacity),
            parser: GrblResponseParser::new(),
            rx_buffer: String::new(),
            violations: 0,
            reset_deadline: None,
            work_offset: Position::default(),
        }
    }

    /// Hold lines back until the controller's startup banner is seen
    pub fn awaiting_banner(mut self) -> Self {
        self.reset_deadline = Some(Instant::now() + Duration::from_millis(RESET_SETTLE_MS));
        self
    }

    /// Wrap a transport with the stock 128 byte buffer
    pub fn with_default_buffer(transport: T) -> Self {
        Self::new(transport, RX_BUFFER_SIZE)
    }

    fn settling(&self) -> bool {
        self.reset_deadline
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    fn violation(&mut self, reason: String, events: &mut Vec<LinkEvent>) {
        self.violations += 1;
        tracing::warn!(
            "Protocol violation ({}/{}): {}",
            self.violations,
            MAX_CONSECUTIVE_VIOLATIONS,
            reason
        );
        if self.violations >= MAX_CONSECUTIVE_VIOLATIONS {
            self.violations = 0;
            events.push(LinkEvent::ProtocolFault(reason));
        }
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<LinkEvent>) {
        let response = match self.parser.parse_with_offset(line, self.work_offset) {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(ProtocolError::ProtocolViolation { reason }) => {
                self.violation(reason, events);
                return;
            }
            Err(other) => {
                self.violation(other.to_string(), events);
                return;
            }
        };

        match response {
            GrblResponse::Ok => match self.counter.pop() {
                Some((tag, _)) => {
                    self.violations = 0;
                    tracing::debug!("ok <- {}", tag);
                    events.push(LinkEvent::Acknowledged(tag));
                }
                None => self.violation("ok with nothing in flight".to_string(), events),
            },
            GrblResponse::Error(code) => match self.counter.pop() {
                Some((tag, _)) => {
                    self.violations = 0;
                    tracing::warn!("{} <- {}", super::format_error(code), tag);
                    events.push(LinkEvent::Rejected { tag, code });
                }
                None => self.violation(format!("error:{} with nothing in flight", code), events),
            },
            GrblResponse::Alarm(code) if RESET_ALARMS.contains(&code) && self.settling() => {
                self.violations = 0;
                tracing::info!("{} after soft reset", super::format_alarm(code));
            }
            GrblResponse::Alarm(code) => {
                self.violations = 0;
                tracing::error!("{}", super::format_alarm(code));
                events.push(LinkEvent::Alarm(code));
            }
            GrblResponse::Status(report) => {
                self.violations = 0;
                if let Some(offset) = report.work_offset {
                    self.work_offset = offset;
                }
                events.push(LinkEvent::Status(report));
            }
            GrblResponse::Welcome(banner) => {
                if !self.counter.is_empty() {
                    tracing::warn!(
                        "Controller reset with {} frames in flight",
                        self.counter.len()
                    );
                }
                tracing::info!("{}", banner);
                self.counter.clear();
                self.violations = 0;
                self.reset_deadline = None;
                events.push(LinkEvent::Reset);
            }
            GrblResponse::Feedback(msg) | GrblResponse::Message(msg) => {
                tracing::debug!("GRBL Message: {}", msg);
                events.push(LinkEvent::Message(msg));
            }
        }
    }
}

impl<T: Transport> ControllerLink for GrblLink<T> {
    fn kind(&self) -> ConnectionKind {
        self.transport.kind()
    }

    fn capacity(&self) -> usize {
        self.counter.capacity()
    }

    fn in_flight(&self) -> usize {
        self.counter.in_flight()
    }

    fn pending_frames(&self) -> usize {
        self.counter.len()
    }

    fn can_send(&self, line: &str) -> bool {
        !self.settling() && self.counter.has_room(frame_len(line))
    }

    fn send_line(&mut self, line: &str, tag: FrameTag) -> Result<()> {
        let frame = format!("{}\n", line.trim());
        if self.settling() || !self.counter.has_room(frame.len()) {
            return Err(ProtocolError::BufferFull {
                needed: frame.len(),
                available: if self.settling() {
                    0
                } else {
                    self.counter.available()
                },
            }
            .into());
        }

        self.transport.send(frame.as_bytes())?;
        self.counter.push(tag, frame.len())?;
        tracing::debug!("{} -> {}", tag, frame.trim_end());
        Ok(())
    }

    fn send_realtime(&self, command: RealtimeCommand) -> Result<()> {
        self.realtime.write_byte(command.byte())
    }

    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter> {
        self.realtime.clone()
    }

    fn poll(&mut self) -> Result<Vec<LinkEvent>> {
        for _ in 0..MAX_READS_PER_POLL {
            match self.transport.try_receive()? {
                Some(bytes) => self.rx_buffer.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }

        let mut events = Vec::new();
        while let Some(pos) = self.rx_buffer.find('\n') {
            let line: String = self.rx_buffer.drain(..=pos).collect();
            self.handle_line(&line, &mut events);
        }
        if self.rx_buffer.len() > MAX_PENDING_INPUT {
            let dropped = self.rx_buffer.len();
            self.rx_buffer.clear();
            self.violation(format!("{} bytes without a line terminator", dropped), &mut events);
        }
        Ok(events)
    }

    fn reset_issued(&mut self) {
        self.counter.clear();
        self.rx_buffer.clear();
        self.violations = 0;
        self.reset_deadline = Some(Instant::now() + Duration::from_millis(RESET_SETTLE_MS));
        tracing::info!("Soft reset sent, in-flight queue cleared");
    }
}
