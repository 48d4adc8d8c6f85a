//! Event system for machine state fan-out
//!
//! Provides:
//! - Event types for job, connection and machine state changes
//! - Event dispatcher for publishing events to subscribers
//!
//! Each subscriber owns its own receive queue; a subscriber that falls behind
//! skips the oldest events instead of holding back the publisher.

use crate::data::{ConnectionKind, FaultReport, JobState, MachineSnapshot, MachineStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Machine event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MachineEvent {
    /// Periodic full state sample
    Snapshot(MachineSnapshot),
    /// Job streaming state changed
    JobStateChanged {
        /// Previous state
        from: JobState,
        /// New state
        to: JobState,
    },
    /// Controller status changed
    StatusChanged(MachineStatus),
    /// A program line was framed and sent
    LineDispatched(usize),
    /// A program line was acknowledged with `ok`
    LineAcknowledged(usize),
    /// A job or connection fault
    Fault(FaultReport),
    /// Link attached, replaced or detached
    ConnectionChanged(ConnectionKind),
}

impl std::fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineEvent::Snapshot(s) => write!(f, "Snapshot {} {}", s.status, s.machine_position),
            MachineEvent::JobStateChanged { from, to } => write!(f, "Job: {} -> {}", from, to),
            MachineEvent::StatusChanged(status) => write!(f, "Status: {}", status),
            MachineEvent::LineDispatched(line) => write!(f, "Dispatched line {}", line),
            MachineEvent::LineAcknowledged(line) => write!(f, "Acknowledged line {}", line),
            MachineEvent::Fault(fault) => write!(f, "Fault: {}", fault),
            MachineEvent::ConnectionChanged(kind) => write!(f, "Connection: {}", kind),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for machine events.
    tx: broadcast::Sender<MachineEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Per-subscriber backlog before the oldest events are skipped
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    /// Create a new event dispatcher with default buffer size
    pub fn default_with_buffer() -> Self {
        Self::new(256)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: MachineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::default_with_buffer()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = EventDispatcher::new(4);
        assert_eq!(dispatcher.publish(MachineEvent::LineDispatched(1)), 0);
    }

    #[test]
    fn test_each_subscriber_receives() {
        let dispatcher = EventDispatcher::new(4);
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();
        assert_eq!(dispatcher.publish(MachineEvent::LineAcknowledged(2)), 2);
        assert_eq!(a.try_recv().unwrap(), MachineEvent::LineAcknowledged(2));
        assert_eq!(b.try_recv().unwrap(), MachineEvent::LineAcknowledged(2));
    }

    #[test]
    fn test_slow_subscriber_lags_without_blocking() {
        let dispatcher = EventDispatcher::new(2);
        let mut slow = dispatcher.subscribe();
        for line in 1..=5 {
            dispatcher.publish(MachineEvent::LineDispatched(line));
        }
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(slow.try_recv().unwrap(), MachineEvent::LineDispatched(4));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_string(&MachineEvent::JobStateChanged {
            from: JobState::Loaded,
            to: JobState::Running,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"job_state_changed","data":{"from":"Loaded","to":"Running"}}"#
        );
    }
}
