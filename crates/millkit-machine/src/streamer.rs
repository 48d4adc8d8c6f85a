//! Job streaming state machine
//!
//! [`JobStreamer`] owns the controller link, the actuation shim and the job.
//! It is driven in two ways: command entry points (`load`, `start`, `pause`,
//! ...) called by the facade, and [`JobStreamer::service`], called on every
//! dispatch tick to drain link events and push more lines into the
//! controller's receive buffer.
//!
//! The streamer never blocks. Homing is bounded by a deadline checked in
//! `service`, and a stop takes effect on the next call because every loop
//! re-reads the job state.

use crate::actuation::ActuationShim;
use crate::store::StateStore;
use millkit_communication::firmware::grbl::{decode_alarm, decode_error, frame_len, RESET_ALARMS};
use millkit_communication::{
    CommandKind, ControllerLink, FrameTag, LinkEvent, RealtimeCommand, RealtimeWriter,
};
use millkit_core::gcode::{extract_actions, strip_comments};
use millkit_core::{
    Axis, ConnectionError, ConnectionKind, Error, FaultReport, JobError, JobState,
    MachineEvent, MachineStatus, Position, Result, SpindleDirection, ToolDefaults, ToolLookup,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A G-code program as handed over by file storage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    /// Identifier shown as `job_file`
    pub name: Option<String>,
    /// Source lines, 1-indexed by position
    pub lines: Vec<String>,
    /// Tool whose defaults pre-seed the spindle at start
    pub tool: Option<ToolDefaults>,
    /// Tool to resolve through the tool table at start
    pub tool_id: Option<u32>,
}

impl Program {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: Some(name.into()),
            lines,
            ..Default::default()
        }
    }

    /// Split program text into lines
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, text.lines().map(str::to_string).collect())
    }

    pub fn with_tool(mut self, tool: ToolDefaults) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_tool_id(mut self, id: u32) -> Self {
        self.tool_id = Some(id);
        self
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// A loaded program and its dispatch cursor
#[derive(Debug)]
struct Job {
    id: Uuid,
    /// Comment-stripped frames; `None` for lines with nothing to send
    frames: Vec<Option<String>>,
    tool: Option<ToolDefaults>,
    tool_id: Option<u32>,
    /// Index of the next frame to dispatch
    cursor: usize,
    /// Program frames sent so far
    sent: usize,
    /// Program frames sent and not yet answered
    in_flight: usize,
}

impl Job {
    fn exhausted(&self) -> bool {
        self.cursor >= self.frames.len()
    }
}

/// A manual command waiting for buffer room
#[derive(Debug, Clone)]
struct Command {
    line: String,
    kind: CommandKind,
    offset: Option<Position>,
}

#[derive(Debug, Clone, Copy)]
struct Homing {
    deadline: Instant,
    sent: bool,
    saw_home: bool,
}

/// Streams one job at a time through a controller link
pub struct JobStreamer {
    link: Option<Box<dyn ControllerLink>>,
    shim: ActuationShim,
    store: StateStore,
    tools: Option<Arc<dyn ToolLookup>>,
    capacity: usize,
    homing_timeout: Duration,
    job: Option<Job>,
    commands: VecDeque<Command>,
    /// Offsets whose `G10` frame is in flight, oldest first
    pending_offsets: VecDeque<Position>,
    homing: Option<Homing>,
    /// `$X` is queued or in flight after a soft reset
    unlock_pending: bool,
}

impl JobStreamer {
    /// Create a streamer with no link attached
    ///
    /// `capacity` is the receive buffer size used to validate programs while
    /// disconnected.
    pub fn new(shim: ActuationShim, store: StateStore, capacity: usize) -> Self {
        Self {
            link: None,
            shim,
            store,
            tools: None,
            capacity,
            homing_timeout: Duration::from_secs(60),
            job: None,
            commands: VecDeque::new(),
            pending_offsets: VecDeque::new(),
            homing: None,
            unlock_pending: false,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolLookup>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn set_tools(&mut self, tools: Arc<dyn ToolLookup>) {
        self.tools = Some(tools);
    }

    pub fn with_homing_timeout(mut self, timeout: Duration) -> Self {
        self.homing_timeout = timeout;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn shim(&self) -> &ActuationShim {
        &self.shim
    }

    pub fn job_state(&self) -> JobState {
        self.store.job_state()
    }

    /// Id of the loaded job, if any
    pub fn job_id(&self) -> Option<Uuid> {
        self.job.as_ref().map(|job| job.id)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        self.link
            .as_ref()
            .map(|link| link.kind())
            .unwrap_or(ConnectionKind::None)
    }

    /// Direct writer for realtime bytes, usable without the streamer
    pub fn realtime_writer(&self) -> Option<Arc<dyn RealtimeWriter>> {
        self.link.as_ref().map(|link| link.realtime_writer())
    }

    /// Attach a controller link
    ///
    /// Replacing a link mid-job is refused; the job's in-flight frames would
    /// be lost with the old link.
    pub fn attach(&mut self, link: Box<dyn ControllerLink>) -> Result<()> {
        let state = self.job_state();
        if state.is_streaming() || state == JobState::Homing {
            return Err(Error::invalid_transition("attach a link", state));
        }
        tracing::info!("Attached {} link ({} byte buffer)", link.kind(), link.capacity());
        self.capacity = link.capacity();
        let kind = link.kind();
        self.link = Some(link);
        self.commands.clear();
        self.pending_offsets.clear();
        self.unlock_pending = false;
        self.store.set_connection(kind);
        Ok(())
    }

    /// Detach the link; an active job or homing cycle is stopped first
    pub fn detach(&mut self) -> Result<()> {
        let state = self.job_state();
        if state.is_streaming() || state == JobState::Homing {
            self.stop()?;
        }
        if self.link.take().is_some() {
            tracing::info!("Link detached");
        }
        self.commands.clear();
        self.pending_offsets.clear();
        self.unlock_pending = false;
        self.store.set_connection(ConnectionKind::None);
        Ok(())
    }

    /// Load a program
    pub fn load(&mut self, program: Program) -> Result<()> {
        let state = self.job_state();
        if !state.can_load() {
            return Err(Error::invalid_transition("load", state));
        }

        let frames: Vec<Option<String>> = program
            .lines
            .iter()
            .map(|line| {
                let stripped = strip_comments(line);
                (!stripped.is_empty()).then_some(stripped)
            })
            .collect();
        if frames.iter().all(Option::is_none) {
            return Err(JobError::EmptyJob.into());
        }

        let capacity = self
            .link
            .as_ref()
            .map(|link| link.capacity())
            .unwrap_or(self.capacity);
        for (index, frame) in frames.iter().enumerate() {
            if let Some(frame) = frame {
                let length = frame_len(frame);
                if length > capacity {
                    return Err(JobError::LineTooLong {
                        line: index + 1,
                        length,
                        capacity,
                    }
                    .into());
                }
            }
        }

        let job = Job {
            id: Uuid::new_v4(),
            frames,
            tool: program.tool,
            tool_id: program.tool_id,
            cursor: 0,
            sent: 0,
            in_flight: 0,
        };
        tracing::info!(
            "Loaded job {} ({} lines) from {}",
            job.id,
            job.frames.len(),
            program.name.as_deref().unwrap_or("<unnamed>")
        );
        self.store.set_job(program.name, job.frames.len());
        self.job = Some(job);
        self.store.set_job_state(JobState::Loaded);
        Ok(())
    }

    /// Start streaming the loaded program
    pub fn start(&mut self) -> Result<()> {
        let state = self.job_state();
        if state != JobState::Loaded {
            return Err(Error::invalid_transition("start", state));
        }
        if self.link.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }

        if let Some(job) = &self.job {
            let tool = job.tool.clone().or_else(|| {
                let id = job.tool_id?;
                let found = self.tools.as_ref().and_then(|tools| tools.tool(id));
                if found.is_none() {
                    tracing::warn!("Tool T{} not found, spindle not pre-seeded", id);
                }
                found
            });
            if let Some(tool) = tool {
                tracing::info!(
                    "Pre-seeding spindle for T{} {}: {} rpm {}",
                    tool.id,
                    tool.name,
                    tool.rpm,
                    tool.direction
                );
                self.shim.set_spindle(tool.rpm, tool.direction);
            }
        }
        self.shim.set_vacuum(true);
        self.sync_actuation();

        self.store.set_job_state(JobState::Running);
        self.pump()
    }

    /// Feed hold; nothing new is dispatched until `resume`
    pub fn pause(&mut self) -> Result<()> {
        self.expect_state("pause", JobState::Running)?;
        self.realtime(RealtimeCommand::FeedHold)?;
        self.hold_issued()
    }

    /// Enter `Holding` after `!` went out through the realtime writer
    pub fn hold_issued(&mut self) -> Result<()> {
        self.expect_state("pause", JobState::Running)?;
        self.store.set_job_state(JobState::Holding);
        Ok(())
    }

    /// Cycle start; dispatch continues from the held cursor
    pub fn resume(&mut self) -> Result<()> {
        self.expect_state("resume", JobState::Holding)?;
        self.realtime(RealtimeCommand::CycleStart)?;
        self.resume_issued()
    }

    /// Return to `Running` after `~` went out through the realtime writer
    pub fn resume_issued(&mut self) -> Result<()> {
        self.expect_state("resume", JobState::Holding)?;
        self.store.set_job_state(JobState::Running);
        self.pump()
    }

    /// Operator abort, accepted in every state
    ///
    /// Soft-resets the controller, drops the job and every queued command,
    /// and silences the actuators. `$X` is queued to clear the alarm a reset
    /// during motion leaves behind.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.reset() {
                if e.is_link_lost() {
                    self.lose_link(&e);
                } else {
                    tracing::warn!("Soft reset failed: {}", e);
                }
            }
        }
        self.finish_stop();
        Ok(())
    }

    /// [`JobStreamer::stop`] for a reset byte already written through the
    /// realtime writer
    pub fn stop_issued(&mut self) -> Result<()> {
        if let Some(link) = self.link.as_mut() {
            link.reset_issued();
        }
        self.finish_stop();
        Ok(())
    }

    fn finish_stop(&mut self) {
        if let Some(job) = self.job.take() {
            tracing::info!("Stopped job {} at line {}", job.id, job.cursor);
        }
        self.homing = None;
        self.commands.clear();
        self.pending_offsets.clear();
        self.unlock_pending = self.link.is_some();
        if self.unlock_pending {
            self.commands.push_back(Command {
                line: "$X".to_string(),
                kind: CommandKind::Unlock,
                offset: None,
            });
        }
        self.shim.silence();
        self.sync_actuation();
        self.store.set_job_state(JobState::Stopped);
    }

    /// Begin a homing cycle
    ///
    /// `$H` is sent once the controller's buffer is empty. The cycle ends in
    /// `Idle` when the controller acknowledges it, or in `Alarm` on an alarm,
    /// a rejection or the deadline.
    pub fn home(&mut self) -> Result<()> {
        let state = self.job_state();
        if !state.can_home() {
            return Err(Error::invalid_transition("home", state));
        }
        if self.link.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        self.job = None;
        self.store.set_job(None, 0);
        self.homing = Some(Homing {
            deadline: Instant::now() + self.homing_timeout,
            sent: false,
            saw_home: false,
        });
        tracing::info!("Homing requested");
        self.store.set_job_state(JobState::Homing);
        self.pump()
    }

    /// Relative jog of one axis
    pub fn jog(&mut self, axis: Axis, delta: f64, feed: f64) -> Result<()> {
        let state = self.job_state();
        if state.is_streaming() || state == JobState::Homing {
            return Err(Error::invalid_transition("jog", state));
        }
        if !delta.is_finite() {
            return Err(invalid_argument(format!("jog distance {}", delta)));
        }
        if !(feed.is_finite() && feed > 0.0) {
            return Err(invalid_argument(format!("jog feed {}", feed)));
        }

        if self.link.is_none() {
            self.store.update(|state| {
                let value = state.machine_position.get(axis) + delta;
                state.machine_position.set(axis, value);
            });
            return Ok(());
        }
        self.commands.push_back(Command {
            line: format!("$J=G91 {}{:.3} F{:.0}", axis.letter(), delta, feed),
            kind: CommandKind::Jog,
            offset: None,
        });
        self.pump()
    }

    /// Set the work offset, valid in any state
    pub fn set_work_offset(&mut self, offset: Position) -> Result<()> {
        if !(offset.x.is_finite() && offset.y.is_finite() && offset.z.is_finite()) {
            return Err(invalid_argument(format!("work offset {}", offset)));
        }
        if self.link.is_none() {
            self.store.set_work_offset(offset);
            return Ok(());
        }
        self.commands.push_back(Command {
            line: format!(
                "G10 L2 P1 X{:.3} Y{:.3} Z{:.3}",
                offset.x, offset.y, offset.z
            ),
            kind: CommandKind::WorkOffset,
            offset: Some(offset),
        });
        self.pump()
    }

    /// Manual spindle command
    pub fn set_spindle(&mut self, rpm: f64, direction: SpindleDirection) -> Result<()> {
        if !(rpm.is_finite() && rpm >= 0.0) {
            return Err(invalid_argument(format!("spindle speed {}", rpm)));
        }
        self.shim.set_spindle(rpm, direction);
        self.sync_actuation();
        Ok(())
    }

    /// Manual vacuum command
    pub fn set_vacuum(&mut self, on: bool) {
        self.shim.set_vacuum(on);
        self.sync_actuation();
    }

    /// One dispatch tick: drain link events, dispatch, check deadlines
    pub fn service(&mut self) -> Result<()> {
        self.service_at(Instant::now())
    }

    /// [`JobStreamer::service`] with an explicit clock
    pub fn service_at(&mut self, now: Instant) -> Result<()> {
        let polled = match self.link.as_mut() {
            Some(link) => link.poll(),
            None => return Ok(()),
        };
        match polled {
            Ok(events) => {
                for event in events {
                    self.on_event(event);
                }
            }
            Err(e) if e.is_link_lost() => {
                self.lose_link(&e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.pump()?;

        if let Some(homing) = self.homing {
            if now >= homing.deadline {
                let waited = self.homing_timeout.as_millis();
                self.fail_homing(format!("no completion within {} ms", waited));
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Acknowledged(FrameTag::Program(line)) => {
                if let Some(job) = self.job.as_mut() {
                    job.in_flight = job.in_flight.saturating_sub(1);
                    self.store.set_progress(line);
                    self.store.publish(MachineEvent::LineAcknowledged(line));
                }
            }
            LinkEvent::Acknowledged(FrameTag::Command(kind)) => self.command_acknowledged(kind),
            LinkEvent::Rejected { tag, code } => self.rejected(tag, code),
            LinkEvent::Status(report) => {
                self.store.apply_report(&report);
                match report.status {
                    // still locked from the reset; `$X` is on its way
                    MachineStatus::Alarm if self.unlock_pending => {}
                    MachineStatus::Alarm => {
                        if self.job_state().is_streaming() {
                            self.abort(FaultReport::message("Controller entered alarm state"));
                        } else if self.homing.is_some_and(|h| h.saw_home) {
                            self.fail_homing("controller entered alarm state".to_string());
                        }
                    }
                    MachineStatus::Home => {
                        if let Some(homing) = self.homing.as_mut() {
                            if homing.sent {
                                homing.saw_home = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
            LinkEvent::Alarm(code) if self.unlock_pending && RESET_ALARMS.contains(&code) => {
                tracing::info!("ALARM:{} from the stop reset", code);
            }
            LinkEvent::Alarm(code) => {
                let message = decode_alarm(code);
                tracing::error!("ALARM:{} {}", code, message);
                let fault = FaultReport {
                    line: None,
                    code: Some(code),
                    message,
                };
                if self.job_state().is_streaming() {
                    self.abort(fault);
                } else if self.homing.is_some() {
                    self.fail_homing(fault.message);
                } else {
                    self.store.record_fault(fault);
                }
            }
            LinkEvent::Reset => {
                self.pending_offsets.clear();
                // A banner before the first program line is the power-up reset.
                let lost_lines = self.job.as_ref().is_some_and(|job| job.sent > 0);
                if self.job_state().is_streaming() && lost_lines {
                    self.abort(FaultReport::message("Controller reset during job"));
                } else if self.homing.is_some_and(|h| h.sent) {
                    self.fail_homing("controller reset".to_string());
                }
            }
            LinkEvent::Message(message) => tracing::info!("Controller: {}", message),
            LinkEvent::ProtocolFault(reason) => {
                if self.job_state().is_streaming() {
                    self.abort(FaultReport::message(reason));
                } else if self.homing.is_some() {
                    self.fail_homing(reason);
                } else {
                    tracing::warn!("Protocol fault while idle: {}", reason);
                }
            }
        }
    }

    fn command_acknowledged(&mut self, kind: CommandKind) {
        match kind {
            CommandKind::Home => {
                if self.homing.take().is_some() {
                    tracing::info!("Homing complete");
                    self.store.set_job_state(JobState::Idle);
                }
            }
            CommandKind::WorkOffset => {
                if let Some(offset) = self.pending_offsets.pop_front() {
                    tracing::info!("Work offset set to {}", offset);
                    self.store.set_work_offset(offset);
                }
            }
            CommandKind::Unlock => {
                self.unlock_pending = false;
                tracing::info!("Controller unlocked");
            }
            other => tracing::debug!("{:?} acknowledged", other),
        }
    }

    fn rejected(&mut self, tag: FrameTag, code: u8) {
        let message = decode_error(code);
        match tag {
            FrameTag::Program(line) => {
                if self.job_state().is_streaming() {
                    self.abort(FaultReport::rejected(line, code, message));
                }
            }
            FrameTag::Command(CommandKind::Home) => {
                self.fail_homing(format!("$H rejected with error:{} ({})", code, message));
            }
            FrameTag::Command(CommandKind::WorkOffset) => {
                self.pending_offsets.pop_front();
                tracing::warn!("Work offset rejected with error:{} ({})", code, message);
            }
            FrameTag::Command(CommandKind::Unlock) => {
                self.unlock_pending = false;
                tracing::warn!("$X rejected with error:{} ({})", code, message);
            }
            FrameTag::Command(kind) => {
                tracing::warn!("{:?} rejected with error:{} ({})", kind, code, message);
            }
        }
    }

    /// Push manual commands and program lines while the buffer has room
    fn pump(&mut self) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };

        // Once $H is out, nothing else may reach the controller until it ends.
        let homing_sent = self.homing.is_some_and(|h| h.sent);
        while !homing_sent {
            match self.commands.front() {
                Some(command) if link.can_send(&command.line) => {}
                _ => break,
            }
            let Some(command) = self.commands.pop_front() else {
                break;
            };
            if let Err(e) = link.send_line(&command.line, FrameTag::Command(command.kind)) {
                return self.send_failed(e);
            }
            tracing::debug!("Sent {:?}: {}", command.kind, command.line);
            if let Some(offset) = command.offset {
                self.pending_offsets.push_back(offset);
            }
        }

        if let Some(homing) = self.homing.as_mut() {
            if !homing.sent
                && self.commands.is_empty()
                && link.pending_frames() == 0
                && link.can_send("$H")
            {
                if let Err(e) = link.send_line("$H", FrameTag::Command(CommandKind::Home)) {
                    return self.send_failed(e);
                }
                homing.sent = true;
                tracing::info!("Homing cycle started");
            }
            return Ok(());
        }

        if self.store.job_state() != JobState::Running {
            return Ok(());
        }
        let Some(job) = self.job.as_mut() else {
            return Ok(());
        };

        while let Some(slot) = job.frames.get(job.cursor) {
            let Some(frame) = slot else {
                job.cursor += 1;
                continue;
            };
            if !link.can_send(frame) {
                break;
            }
            let actions = extract_actions(frame);
            if actions.has_actuation() {
                self.shim.apply(&actions);
                self.store.set_actuation(self.shim.intent());
            }
            let line = job.cursor + 1;
            if let Err(e) = link.send_line(frame, FrameTag::Program(line)) {
                return self.send_failed(e);
            }
            job.cursor += 1;
            job.sent += 1;
            job.in_flight += 1;
            tracing::debug!("Dispatched line {}: {}", line, frame);
            self.store.publish(MachineEvent::LineDispatched(line));
        }

        if job.exhausted() && job.in_flight == 0 {
            self.complete();
        }
        Ok(())
    }

    fn complete(&mut self) {
        if let Some(job) = self.job.take() {
            tracing::info!("Job {} completed", job.id);
            self.store.set_progress(job.frames.len());
        }
        self.shim.set_vacuum(false);
        self.sync_actuation();
        self.store.set_job_state(JobState::Completed);
    }

    fn send_failed(&mut self, e: Error) -> Result<()> {
        if e.is_link_lost() {
            self.lose_link(&e);
        }
        Err(e)
    }

    /// Abort the job into `Alarm` after a controller-side failure
    fn abort(&mut self, fault: FaultReport) {
        tracing::error!("Aborting job: {}", fault);
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.reset() {
                if e.is_link_lost() {
                    self.lose_link(&e);
                }
            }
        }
        self.job = None;
        self.homing = None;
        self.commands.clear();
        self.pending_offsets.clear();
        self.unlock_pending = false;
        self.shim.silence();
        self.sync_actuation();
        self.store.record_fault(fault);
        self.store.set_job_state(JobState::Alarm);
    }

    fn fail_homing(&mut self, reason: String) {
        if self.homing.is_none() {
            return;
        }
        let error = JobError::HomingFailed { reason };
        self.abort(FaultReport::message(error.to_string()));
    }

    /// The link failed mid-session: detach it and fail whatever was active
    fn lose_link(&mut self, error: &Error) {
        tracing::error!("Link lost: {}", error);
        self.link = None;
        self.commands.clear();
        self.pending_offsets.clear();
        self.unlock_pending = false;
        self.shim.silence();
        self.sync_actuation();
        self.store.set_connection(ConnectionKind::None);
        self.store.record_fault(FaultReport::message(error.to_string()));

        let state = self.job_state();
        if state.is_streaming() || state == JobState::Homing {
            self.job = None;
            self.homing = None;
            self.store.set_job_state(JobState::Alarm);
        }
    }

    fn expect_state(&self, operation: &str, expected: JobState) -> Result<()> {
        let state = self.job_state();
        if state != expected {
            return Err(Error::invalid_transition(operation, state));
        }
        Ok(())
    }

    fn realtime(&mut self, command: RealtimeCommand) -> Result<()> {
        let result = match self.link.as_ref() {
            Some(link) => link.send_realtime(command),
            None => return Err(ConnectionError::NotConnected.into()),
        };
        if let Err(e) = result {
            return self.send_failed(e);
        }
        Ok(())
    }

    fn sync_actuation(&self) {
        self.store.set_actuation(self.shim.intent());
    }
}

impl std::fmt::Debug for JobStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStreamer")
            .field("connection", &self.connection_kind())
            .field("job", &self.job)
            .field("commands", &self.commands.len())
            .field("homing", &self.homing)
            .field("unlock_pending", &self.unlock_pending)
            .finish()
    }
}

fn invalid_argument(reason: String) -> Error {
    JobError::InvalidArgument { reason }.into()
}
