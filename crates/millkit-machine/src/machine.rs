//! The `Machine` facade and its background loops
//!
//! Three tokio tasks run once [`Machine::start_loops`] is called:
//! - dispatch: drains link events and streams lines every `dispatch_tick_ms`
//! - status poll: writes `?` every `status_poll_ms`
//! - broadcast: publishes a snapshot every `broadcast_ms`
//!
//! Lock order is streamer, then store. The realtime writer slot and the store
//! are leaves: nothing else is locked while they are held. The status poll
//! and the `!`, `~` and reset bytes of pause, resume and stop only touch the
//! writer slot, so they are never queued behind a dispatch tick.

use crate::actuation::ActuationShim;
use crate::store::StateStore;
use crate::streamer::{JobStreamer, Program};
use millkit_communication::{
    ConnectionParams, ControllerLink, GrblLink, RealtimeCommand, RealtimeWriter,
    SimulationParams,
};
use millkit_core::{
    Axis, ConnectionError, ConnectionKind, Error, FaultReport, JobError, JobState,
    MachineEvent, MachineSnapshot, Position, Result, SpindleDirection, ToolLookup,
};
use millkit_settings::Config;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type WriterSlot = Arc<Mutex<Option<Arc<dyn RealtimeWriter>>>>;

/// Machine control entry points
pub struct Machine {
    config: Config,
    streamer: Arc<Mutex<JobStreamer>>,
    store: StateStore,
    realtime: WriterSlot,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Machine {
    /// Build a machine from startup configuration
    ///
    /// Opens the actuation hardware when it is enabled; no link is attached
    /// until [`Machine::connect`].
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let shim = ActuationShim::from_settings(&config.actuation)?;
        let store = StateStore::new();
        let streamer = JobStreamer::new(shim, store.clone(), config.connection.rx_buffer_size)
            .with_homing_timeout(Duration::from_millis(config.timing.homing_timeout_ms));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            streamer: Arc::new(Mutex::new(streamer)),
            store,
            realtime: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Tool table used to pre-seed the spindle at job start
    pub fn set_tools(&self, tools: Arc<dyn ToolLookup>) {
        self.streamer.lock().set_tools(tools);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect as configured
    ///
    /// Uses the simulator when `connection.simulation` is set. Otherwise opens
    /// the serial port, falling back to the simulator when the port is
    /// unavailable and `fallback_to_simulation` allows it.
    pub fn connect(&self) -> Result<ConnectionKind> {
        let link: Box<dyn ControllerLink> = if self.config.connection.simulation {
            Box::new(GrblLink::simulated(self.simulation_params()))
        } else {
            let params = ConnectionParams {
                port: self.config.connection.port.clone(),
                baud_rate: self.config.connection.baud_rate,
                ..Default::default()
            };
            match GrblLink::open(&params, self.config.connection.rx_buffer_size) {
                Ok(link) => Box::new(link),
                Err(Error::Connection(ConnectionError::LinkUnavailable { port, reason }))
                    if self.config.connection.fallback_to_simulation =>
                {
                    tracing::warn!(
                        "Serial port {} unavailable ({}), falling back to simulation",
                        port,
                        reason
                    );
                    Box::new(GrblLink::simulated(self.simulation_params()))
                }
                Err(e) => return Err(e),
            }
        };
        let kind = link.kind();
        self.attach(link)?;
        Ok(kind)
    }

    /// Attach an already opened link
    pub fn attach(&self, link: Box<dyn ControllerLink>) -> Result<()> {
        let writer = link.realtime_writer();
        self.streamer.lock().attach(link)?;
        *self.realtime.lock() = Some(writer);
        Ok(())
    }

    /// Detach the link, stopping any active job first
    pub fn disconnect(&self) -> Result<()> {
        self.streamer.lock().detach()?;
        *self.realtime.lock() = None;
        Ok(())
    }

    /// Spawn the dispatch, status poll and broadcast loops
    ///
    /// Must be called from within a tokio runtime. Calling it again while the
    /// loops run is a no-op.
    pub fn start_loops(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);
        let timing = &self.config.timing;

        let streamer = self.streamer.clone();
        tasks.push(spawn_periodic(
            "dispatch",
            timing.dispatch_tick_ms,
            self.shutdown.subscribe(),
            move || {
                if let Err(e) = streamer.lock().service() {
                    tracing::warn!("Dispatch tick failed: {}", e);
                }
            },
        ));

        let realtime = self.realtime.clone();
        let store = self.store.clone();
        tasks.push(spawn_periodic(
            "status-poll",
            timing.status_poll_ms,
            self.shutdown.subscribe(),
            move || poll_status(&realtime, &store),
        ));

        let store = self.store.clone();
        tasks.push(spawn_periodic(
            "broadcast",
            timing.broadcast_ms,
            self.shutdown.subscribe(),
            move || {
                store.publish(MachineEvent::Snapshot(store.snapshot()));
            },
        ));
        tracing::info!("Machine loops started");
    }

    /// Stop the background loops; the link stays attached
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Machine loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Machine loops stopped");
    }

    pub fn loops_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub fn load(&self, program: Program) -> Result<()> {
        self.streamer.lock().load(program)
    }

    pub fn start(&self) -> Result<()> {
        self.streamer.lock().start()
    }

    /// Feed hold
    pub fn pause(&self) -> Result<()> {
        self.expect_state("pause", JobState::Running)?;
        self.write_realtime(RealtimeCommand::FeedHold)?;
        self.streamer.lock().hold_issued()
    }

    /// Cycle start
    pub fn resume(&self) -> Result<()> {
        self.expect_state("resume", JobState::Holding)?;
        self.write_realtime(RealtimeCommand::CycleStart)?;
        self.streamer.lock().resume_issued()
    }

    /// Operator abort, accepted in every state
    ///
    /// The reset byte goes out before the streamer lock is taken. If it
    /// cannot be written the streamer retries it through the link.
    pub fn stop(&self) -> Result<()> {
        let written = match self.write_realtime(RealtimeCommand::SoftReset) {
            Ok(()) => true,
            Err(Error::Connection(ConnectionError::NotConnected)) => false,
            Err(e) => {
                tracing::warn!("Soft reset write failed: {}", e);
                false
            }
        };
        let mut streamer = self.streamer.lock();
        if written {
            streamer.stop_issued()
        } else {
            streamer.stop()
        }
    }

    /// Run a homing cycle and wait for its outcome
    pub async fn home(&self) -> Result<()> {
        self.streamer.lock().home()?;
        match self.wait_while(|state| state == JobState::Homing).await {
            JobState::Idle => Ok(()),
            _ => {
                let reason = self
                    .store
                    .read(|state| state.last_fault.as_ref().map(|f| f.message.clone()))
                    .unwrap_or_else(|| "homing interrupted".to_string());
                Err(JobError::HomingFailed { reason }.into())
            }
        }
    }

    /// Wait until the current job reaches a state other than Loaded, Running
    /// or Holding
    ///
    /// A job that ended in `Alarm` is returned as the error behind it: the
    /// rejected line when there is one, otherwise [`JobError::Aborted`].
    pub async fn wait_for_job(&self) -> Result<JobState> {
        let state = self
            .wait_while(|state| state.is_streaming() || state == JobState::Loaded)
            .await;
        if state != JobState::Alarm {
            return Ok(state);
        }
        let error = match self.store.read(|state| state.last_fault.clone()) {
            Some(FaultReport {
                line: Some(line),
                code: Some(code),
                message,
            }) => JobError::LineRejected {
                line,
                code,
                message,
            },
            Some(fault) => JobError::Aborted {
                reason: fault.message,
            },
            None => JobError::Aborted {
                reason: "controller alarm".to_string(),
            },
        };
        Err(error.into())
    }

    pub fn set_work_offset(&self, offset: Position) -> Result<()> {
        self.streamer.lock().set_work_offset(offset)
    }

    pub fn jog(&self, axis: Axis, delta: f64, feed: f64) -> Result<()> {
        self.streamer.lock().jog(axis, delta, feed)
    }

    pub fn set_spindle(&self, rpm: f64, direction: SpindleDirection) -> Result<()> {
        self.streamer.lock().set_spindle(rpm, direction)
    }

    pub fn set_vacuum(&self, on: bool) {
        self.streamer.lock().set_vacuum(on)
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        self.store.read(|state| state.connection)
    }

    /// Sleep in dispatch ticks while `waiting` holds
    ///
    /// Without the background loops the facade services the streamer itself,
    /// so deadlines are still enforced.
    async fn wait_while(&self, waiting: impl Fn(JobState) -> bool) -> JobState {
        let tick = Duration::from_millis(self.config.timing.dispatch_tick_ms.max(1));
        loop {
            let state = self.store.job_state();
            if !waiting(state) {
                return state;
            }
            tokio::time::sleep(tick).await;
            if !self.loops_running() {
                if let Err(e) = self.streamer.lock().service() {
                    tracing::warn!("Dispatch tick failed: {}", e);
                }
            }
        }
    }

    fn expect_state(&self, operation: &str, expected: JobState) -> Result<()> {
        let state = self.store.job_state();
        if state != expected {
            return Err(Error::invalid_transition(operation, state));
        }
        Ok(())
    }

    fn write_realtime(&self, command: RealtimeCommand) -> Result<()> {
        let writer = self.realtime.lock().clone();
        match writer {
            Some(writer) => writer.write_byte(command.byte()),
            None => Err(ConnectionError::NotConnected.into()),
        }
    }

    fn simulation_params(&self) -> SimulationParams {
        SimulationParams {
            speedup: self.config.simulation.speedup,
            rapid_rate: self.config.simulation.rapid_rate,
            min_line_ms: self.config.simulation.min_line_ms,
            homing_ms: self.config.simulation.homing_ms,
            rx_buffer_size: self.config.connection.rx_buffer_size,
            ..Default::default()
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("connection", &self.connection_kind())
            .field("loops_running", &self.loops_running())
            .finish()
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period_ms: u64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("{} loop exited", name);
    })
}

fn poll_status(realtime: &WriterSlot, store: &StateStore) {
    if store.read(|state| state.connection) == ConnectionKind::None {
        return;
    }
    let writer = realtime.lock().clone();
    if let Some(writer) = writer {
        if let Err(e) = writer.write_byte(b'?') {
            tracing::debug!("Status query failed: {}", e);
        }
    }
}
