//! Hand-driven controller link for streamer tests

#![allow(dead_code)]

use millkit_communication::{
    ControllerLink, FrameTag, LinkEvent, RealtimeCommand, RealtimeWriter, StatusReport,
};
use millkit_core::{
    ConnectionKind, Error, MachineEvent, MachineStatus, Position, ProtocolError, Result,
};
use millkit_machine::{ActuationShim, JobStreamer, StateStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Default)]
struct Shared {
    sent: Vec<(String, FrameTag)>,
    realtime: Vec<RealtimeCommand>,
    in_flight: VecDeque<(FrameTag, usize)>,
    events: VecDeque<LinkEvent>,
    resets: usize,
    unplugged: bool,
}

/// Link whose replies are produced by the test
#[derive(Clone)]
pub struct MockLink {
    shared: Arc<Mutex<Shared>>,
    capacity: usize,
}

impl MockLink {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::default(),
            capacity,
        }
    }

    /// Answer the oldest frame with `ok`
    pub fn ack(&self) -> Option<FrameTag> {
        let mut shared = self.shared.lock();
        let (tag, _) = shared.in_flight.pop_front()?;
        shared.events.push_back(LinkEvent::Acknowledged(tag));
        Some(tag)
    }

    /// Answer every frame in flight with `ok`
    pub fn ack_all(&self) -> usize {
        let mut count = 0;
        while self.ack().is_some() {
            count += 1;
        }
        count
    }

    /// Answer the oldest frame with `error:<code>`
    pub fn reject(&self, code: u8) -> Option<FrameTag> {
        let mut shared = self.shared.lock();
        let (tag, _) = shared.in_flight.pop_front()?;
        shared.events.push_back(LinkEvent::Rejected { tag, code });
        Some(tag)
    }

    pub fn push(&self, event: LinkEvent) {
        self.shared.lock().events.push_back(event);
    }

    pub fn report(&self, status: MachineStatus, position: Position) {
        self.push(LinkEvent::Status(StatusReport {
            status,
            machine_position: position,
            work_offset: None,
            feed_rate: Some(0.0),
            spindle_speed: None,
        }));
    }

    pub fn unplug(&self) {
        self.shared.lock().unplugged = true;
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.shared.lock().sent.iter().map(|(line, _)| line.clone()).collect()
    }

    /// Program line numbers in the order they were framed
    pub fn program_lines(&self) -> Vec<usize> {
        self.shared
            .lock()
            .sent
            .iter()
            .filter_map(|(_, tag)| match tag {
                FrameTag::Program(line) => Some(*line),
                FrameTag::Command(_) => None,
            })
            .collect()
    }

    pub fn realtime(&self) -> Vec<RealtimeCommand> {
        self.shared.lock().realtime.clone()
    }

    pub fn resets(&self) -> usize {
        self.shared.lock().resets
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.shared.lock().in_flight.iter().map(|(_, len)| len).sum()
    }

    fn frame_len(&self, line: &str) -> usize {
        line.trim().len() + 1
    }
}

/// Writer handed to the facade; records what it writes like `send_realtime`
struct MockWriter(Arc<Mutex<Shared>>);

impl RealtimeWriter for MockWriter {
    fn write_byte(&self, byte: u8) -> Result<()> {
        let command = [
            RealtimeCommand::StatusQuery,
            RealtimeCommand::FeedHold,
            RealtimeCommand::CycleStart,
            RealtimeCommand::SoftReset,
        ]
        .into_iter()
        .find(|command| command.byte() == byte);
        let mut shared = self.0.lock();
        if shared.unplugged {
            return Err(Error::link_lost("unplugged"));
        }
        match command {
            Some(RealtimeCommand::StatusQuery) | None => {}
            Some(command) => shared.realtime.push(command),
        }
        Ok(())
    }
}

impl ControllerLink for MockLink {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Real
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn in_flight(&self) -> usize {
        self.bytes_in_flight()
    }

    fn pending_frames(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    fn can_send(&self, line: &str) -> bool {
        let unplugged = self.shared.lock().unplugged;
        !unplugged && self.in_flight() + self.frame_len(line) <= self.capacity
    }

    fn send_line(&mut self, line: &str, tag: FrameTag) -> Result<()> {
        if self.shared.lock().unplugged {
            return Err(Error::link_lost("unplugged"));
        }
        let needed = self.frame_len(line);
        let available = self.capacity - self.in_flight();
        if needed > available {
            return Err(ProtocolError::BufferFull { needed, available }.into());
        }
        let mut shared = self.shared.lock();
        shared.sent.push((line.trim().to_string(), tag));
        shared.in_flight.push_back((tag, needed));
        Ok(())
    }

    fn send_realtime(&self, command: RealtimeCommand) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.unplugged {
            return Err(Error::link_lost("unplugged"));
        }
        shared.realtime.push(command);
        Ok(())
    }

    fn realtime_writer(&self) -> Arc<dyn RealtimeWriter> {
        Arc::new(MockWriter(self.shared.clone()))
    }

    fn poll(&mut self) -> Result<Vec<LinkEvent>> {
        let mut shared = self.shared.lock();
        if shared.unplugged {
            return Err(Error::link_lost("device unplugged"));
        }
        Ok(shared.events.drain(..).collect())
    }

    fn reset_issued(&mut self) {
        let mut shared = self.shared.lock();
        shared.resets += 1;
        shared.in_flight.clear();
    }
}

/// Streamer with a mock link attached
pub fn streamer(capacity: usize) -> (JobStreamer, MockLink) {
    let link = MockLink::new(capacity);
    let mut streamer = JobStreamer::new(ActuationShim::noop(), StateStore::new(), capacity);
    streamer.attach(Box::new(link.clone())).unwrap();
    (streamer, link)
}

/// Everything currently queued for a subscriber
pub fn drain(rx: &mut broadcast::Receiver<MachineEvent>) -> Vec<MachineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
