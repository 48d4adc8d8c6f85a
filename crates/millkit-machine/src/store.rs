//! The single authoritative machine state
//!
//! Every writer goes through [`StateStore`], which holds the lock only for the
//! duration of one mutation and publishes the matching event after releasing
//! it. Readers get copies, never references into the live state.

use crate::actuation::ActuationIntent;
use millkit_communication::StatusReport;
use millkit_core::{
    ConnectionKind, EventDispatcher, FaultReport, JobState, MachineEvent, MachineSnapshot,
    MachineState, MachineStatus, Position,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared handle to the machine state and its event fan-out
#[derive(Clone, Default)]
pub struct StateStore {
    state: Arc<RwLock<MachineState>>,
    events: EventDispatcher,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamped copy of the current state
    pub fn snapshot(&self) -> MachineSnapshot {
        self.state.read().snapshot()
    }

    /// Read a projection of the state under the lock
    pub fn read<R>(&self, f: impl FnOnce(&MachineState) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutate the state; no event is published
    pub fn update<R>(&self, f: impl FnOnce(&mut MachineState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn job_state(&self) -> JobState {
        self.state.read().job_state
    }

    /// Fold a controller status report into the state
    ///
    /// Spindle fields are left alone: they mirror the actuation intent, not
    /// the controller.
    pub fn apply_report(&self, report: &StatusReport) {
        let changed = {
            let mut state = self.state.write();
            let previous = state.status;
            state.status = report.status;
            state.machine_position = report.machine_position;
            if let Some(offset) = report.work_offset {
                state.work_offset = offset;
            }
            if let Some(feed) = report.feed_rate {
                state.feed_rate = feed;
            }
            (previous != report.status).then_some(report.status)
        };
        if let Some(status) = changed {
            self.events.publish(MachineEvent::StatusChanged(status));
        }
    }

    /// Transition the job state, publishing when it actually changes
    pub fn set_job_state(&self, to: JobState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.job_state, to)
        };
        if from != to {
            tracing::info!("Job state {} -> {}", from, to);
            self.events.publish(MachineEvent::JobStateChanged { from, to });
        }
    }

    /// Record the attached link kind
    ///
    /// Detaching forces `Disconnected`; attaching replaces `Disconnected` with
    /// `Idle` until the first status report arrives.
    pub fn set_connection(&self, kind: ConnectionKind) {
        let (changed, status_changed) = {
            let mut state = self.state.write();
            let changed = state.connection != kind;
            state.connection = kind;
            let previous = state.status;
            if kind == ConnectionKind::None {
                state.status = MachineStatus::Disconnected;
            } else if state.status == MachineStatus::Disconnected {
                state.status = MachineStatus::Idle;
            }
            (changed, (previous != state.status).then_some(state.status))
        };
        if changed {
            self.events.publish(MachineEvent::ConnectionChanged(kind));
        }
        if let Some(status) = status_changed {
            self.events.publish(MachineEvent::StatusChanged(status));
        }
    }

    /// Record a fault and publish it
    pub fn record_fault(&self, fault: FaultReport) {
        tracing::error!("Fault: {}", fault);
        self.state.write().last_fault = Some(fault.clone());
        self.events.publish(MachineEvent::Fault(fault));
    }

    /// Mirror actuation intent into the spindle and vacuum fields
    pub fn set_actuation(&self, intent: ActuationIntent) {
        let mut state = self.state.write();
        state.spindle_rpm = intent.rpm;
        state.spindle_direction = intent.direction;
        state.vacuum = intent.vacuum;
    }

    pub fn set_work_offset(&self, offset: Position) {
        self.state.write().work_offset = offset;
    }

    pub fn set_progress(&self, current_line: usize) {
        self.state.write().current_line = current_line;
    }

    /// Install a freshly loaded program
    pub fn set_job(&self, job_file: Option<String>, total_lines: usize) {
        let mut state = self.state.write();
        state.job_file = job_file;
        state.total_lines = total_lines;
        state.current_line = 0;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: MachineEvent) -> usize {
        self.events.publish(event)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state", &*self.state.read())
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millkit_core::SpindleDirection;

    fn report(status: MachineStatus) -> StatusReport {
        StatusReport {
            status,
            machine_position: Position::new(1.0, 2.0, 3.0),
            work_offset: None,
            feed_rate: Some(400.0),
            spindle_speed: Some(9999.0),
        }
    }

    #[test]
    fn test_report_keeps_offset_and_spindle() {
        let store = StateStore::new();
        store.set_work_offset(Position::new(1.0, 1.0, 1.0));
        store.set_actuation(ActuationIntent {
            rpm: 12000.0,
            direction: SpindleDirection::Cw,
            vacuum: true,
        });
        store.apply_report(&report(MachineStatus::Run));

        let snap = store.snapshot();
        assert_eq!(snap.work_offset, Position::new(1.0, 1.0, 1.0));
        assert_eq!(snap.work_position, Position::new(0.0, 1.0, 2.0));
        assert_eq!(snap.spindle_rpm, 12000.0);
        assert_eq!(snap.feed_rate, 400.0);
    }

    #[test]
    fn test_status_event_only_on_change() {
        let store = StateStore::new();
        let mut rx = store.subscribe();
        store.apply_report(&report(MachineStatus::Idle));
        store.apply_report(&report(MachineStatus::Idle));
        assert_eq!(
            rx.try_recv().unwrap(),
            MachineEvent::StatusChanged(MachineStatus::Idle)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connection_and_status_stay_consistent() {
        let store = StateStore::new();
        store.set_connection(ConnectionKind::Simulated);
        assert_eq!(store.snapshot().status, MachineStatus::Idle);
        store.apply_report(&report(MachineStatus::Run));
        store.set_connection(ConnectionKind::None);
        let snap = store.snapshot();
        assert_eq!(snap.status, MachineStatus::Disconnected);
        assert_eq!(snap.connection, ConnectionKind::None);
    }

    #[test]
    fn test_job_state_events() {
        let store = StateStore::new();
        let mut rx = store.subscribe();
        store.set_job_state(JobState::Loaded);
        store.set_job_state(JobState::Loaded);
        assert_eq!(
            rx.try_recv().unwrap(),
            MachineEvent::JobStateChanged {
                from: JobState::Idle,
                to: JobState::Loaded
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
