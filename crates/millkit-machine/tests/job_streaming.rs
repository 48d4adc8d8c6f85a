mod support;

use millkit_communication::{LinkEvent, RealtimeCommand};
use millkit_core::{
    Axis, ConnectionKind, Error, JobError, JobState, MachineEvent, MachineStatus, Position,
    SpindleDirection, ToolDefaults, ToolTable,
};
use millkit_machine::{ActuationShim, JobStreamer, Program, StateStore};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{drain, streamer, MockLink};

const SIX_LINES: &str = "G21\nG90\nG0 Z5\nG1 X10 F500\nG1 Y10\nG0 Z5";

fn numbered(count: usize) -> Program {
    Program::new("numbered.nc", (1..=count).map(|i| format!("G1 X{}", i)).collect())
}

fn job_transitions(events: &[MachineEvent]) -> Vec<(JobState, JobState)> {
    events
        .iter()
        .filter_map(|event| match event {
            MachineEvent::JobStateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

fn assert_silenced(streamer: &JobStreamer) {
    let snap = streamer.store().snapshot();
    assert_eq!(snap.spindle_direction, SpindleDirection::Off);
    assert_eq!(snap.spindle_rpm, 0.0);
    assert!(!snap.vacuum);
}

#[test]
fn test_six_line_program_completes_after_last_ack() {
    let (mut streamer, link) = streamer(128);
    let mut rx = streamer.store().subscribe();

    streamer.load(Program::from_text("six.nc", SIX_LINES)).unwrap();
    streamer.start().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2, 3, 4, 5, 6]);
    assert!(streamer.store().snapshot().vacuum);

    for line in 1..=5 {
        link.ack();
        streamer.service().unwrap();
        let snap = streamer.store().snapshot();
        assert_eq!(snap.job_state, JobState::Running, "after ack {}", line);
        assert_eq!(snap.current_line, line);
    }
    link.ack();
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Completed);
    assert_eq!(snap.current_line, 6);
    assert_eq!(snap.total_lines, 6);
    assert!(!snap.vacuum);

    let events = drain(&mut rx);
    assert_eq!(
        job_transitions(&events),
        vec![
            (JobState::Idle, JobState::Loaded),
            (JobState::Loaded, JobState::Running),
            (JobState::Running, JobState::Completed),
        ]
    );
    let dispatched: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            MachineEvent::LineDispatched(line) => Some(*line),
            _ => None,
        })
        .collect();
    assert_eq!(dispatched, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_error_on_line_three_aborts_to_alarm() {
    let (mut streamer, link) = streamer(128);
    let program = Program::from_text(
        "fail.nc",
        "M3 S10000\nG0 Z5\nG1 X10 F500\nG1 Y10\nG0 Z5\nM5",
    );
    streamer.load(program).unwrap();
    streamer.start().unwrap();
    assert_eq!(streamer.store().snapshot().spindle_rpm, 10000.0);

    link.ack();
    link.ack();
    link.reject(9);
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Alarm);
    let fault = snap.last_fault.unwrap();
    assert_eq!(fault.line, Some(3));
    assert_eq!(fault.code, Some(9));
    assert!(fault.message.contains("alarm"));
    assert_eq!(link.resets(), 1);
    assert!(streamer.job_id().is_none());
    assert_silenced(&streamer);
}

#[test]
fn test_pause_resume_continues_at_cursor() {
    // room for exactly two 6-byte frames
    let (mut streamer, link) = streamer(12);
    streamer.load(numbered(8)).unwrap();
    streamer.start().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2]);

    streamer.pause().unwrap();
    assert_eq!(streamer.job_state(), JobState::Holding);
    link.ack();
    streamer.service().unwrap();
    link.ack();
    streamer.service().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2]);

    streamer.resume().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2, 3, 4]);
    assert_eq!(
        link.realtime(),
        vec![RealtimeCommand::FeedHold, RealtimeCommand::CycleStart]
    );

    while streamer.job_state() == JobState::Running {
        assert!(link.bytes_in_flight() <= 12);
        link.ack();
        streamer.service().unwrap();
    }
    assert_eq!(streamer.job_state(), JobState::Completed);
    assert_eq!(link.program_lines(), (1..=8).collect::<Vec<_>>());
}

#[test]
fn test_pause_then_stop_ends_stopped() {
    let (mut streamer, link) = streamer(128);
    streamer.load(Program::from_text("p.nc", "M3 S9000\nG1 X5 F100")).unwrap();
    streamer.start().unwrap();
    streamer.pause().unwrap();
    streamer.stop().unwrap();

    assert_eq!(streamer.job_state(), JobState::Stopped);
    assert_eq!(
        link.realtime(),
        vec![RealtimeCommand::FeedHold, RealtimeCommand::SoftReset]
    );
    assert_eq!(link.bytes_in_flight(), 0);
    assert_silenced(&streamer);
    assert!(streamer.resume().unwrap_err().is_caller_error());
}

#[test]
fn test_stop_unlocks_before_the_next_job() {
    let (mut streamer, link) = streamer(128);
    streamer.load(numbered(4)).unwrap();
    streamer.start().unwrap();
    streamer.stop().unwrap();
    assert_eq!(link.bytes_in_flight(), 0);

    streamer.service().unwrap();
    assert_eq!(link.sent_lines().last().map(String::as_str), Some("$X"));

    // the controller still reports Alarm until `$X` is answered
    streamer.load(numbered(2)).unwrap();
    streamer.start().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2, 3, 4, 1, 2]);
    link.push(LinkEvent::Alarm(3));
    link.report(MachineStatus::Alarm, Position::default());
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Running);

    link.ack();
    link.report(MachineStatus::Alarm, Position::default());
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Alarm);
}

#[test]
fn test_homing_clears_the_finished_job() {
    let (mut streamer, link) = streamer(128);
    streamer.load(numbered(2)).unwrap();
    streamer.start().unwrap();
    link.ack_all();
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Completed);
    assert_eq!(
        streamer.store().snapshot().job_file.as_deref(),
        Some("numbered.nc")
    );

    streamer.home().unwrap();
    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_file, None);
    assert_eq!(snap.total_lines, 0);
    assert_eq!(snap.current_line, 0);
}

#[test]
fn test_home_while_running_is_rejected() {
    let (mut streamer, link) = streamer(128);
    streamer.load(Program::from_text("six.nc", SIX_LINES)).unwrap();
    streamer.start().unwrap();

    let err = streamer.home().unwrap_err();
    assert!(matches!(err, Error::Job(JobError::InvalidTransition { .. })));
    assert_eq!(streamer.job_state(), JobState::Running);
    assert!(!link.sent_lines().iter().any(|line| line == "$H"));
}

fn into_state(target: JobState) -> (JobStreamer, MockLink) {
    let (mut streamer, link) = streamer(12);
    match target {
        JobState::Idle => {}
        JobState::Loaded => streamer.load(numbered(4)).unwrap(),
        JobState::Running | JobState::Holding => {
            streamer.load(numbered(4)).unwrap();
            streamer.start().unwrap();
            if target == JobState::Holding {
                streamer.pause().unwrap();
            }
        }
        JobState::Homing => streamer.home().unwrap(),
        JobState::Completed => {
            streamer.load(numbered(2)).unwrap();
            streamer.start().unwrap();
            link.ack_all();
            streamer.service().unwrap();
        }
        JobState::Stopped => streamer.stop().unwrap(),
        JobState::Alarm => {
            streamer.load(numbered(2)).unwrap();
            streamer.start().unwrap();
            link.reject(20);
            streamer.service().unwrap();
        }
    }
    assert_eq!(streamer.job_state(), target);
    (streamer, link)
}

#[test]
fn test_stop_from_every_state() {
    for state in [
        JobState::Idle,
        JobState::Loaded,
        JobState::Running,
        JobState::Holding,
        JobState::Homing,
        JobState::Completed,
        JobState::Stopped,
        JobState::Alarm,
    ] {
        let (mut streamer, link) = into_state(state);
        streamer.set_spindle(12000.0, SpindleDirection::Ccw).unwrap();
        streamer.set_vacuum(true);

        streamer.stop().unwrap();
        assert_eq!(streamer.job_state(), JobState::Stopped, "from {}", state);
        assert_silenced(&streamer);
        assert_eq!(link.bytes_in_flight(), 0);
        assert!(streamer.job_id().is_none());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Load,
    Start,
    Pause,
    Resume,
    Home,
    Ack,
    Reject,
    Alarm,
    Spindle(f64),
    Vacuum(bool),
    Service,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Load),
        1 => Just(Op::Start),
        1 => Just(Op::Pause),
        1 => Just(Op::Resume),
        1 => Just(Op::Home),
        3 => Just(Op::Ack),
        1 => Just(Op::Reject),
        1 => Just(Op::Alarm),
        1 => (0.0f64..30000.0).prop_map(Op::Spindle),
        1 => any::<bool>().prop_map(Op::Vacuum),
        3 => Just(Op::Service),
    ]
}

proptest! {
    #[test]
    fn stop_always_ends_stopped_and_silent(ops in prop::collection::vec(op(), 0..40)) {
        let (mut streamer, link) = streamer(24);
        for op in ops {
            let _ = match op {
                Op::Load => streamer.load(numbered(6)),
                Op::Start => streamer.start(),
                Op::Pause => streamer.pause(),
                Op::Resume => streamer.resume(),
                Op::Home => streamer.home(),
                Op::Ack => {
                    link.ack();
                    Ok(())
                }
                Op::Reject => {
                    link.reject(33);
                    Ok(())
                }
                Op::Alarm => {
                    link.push(LinkEvent::Alarm(1));
                    Ok(())
                }
                Op::Spindle(rpm) => streamer.set_spindle(rpm, SpindleDirection::Cw),
                Op::Vacuum(on) => {
                    streamer.set_vacuum(on);
                    Ok(())
                }
                Op::Service => streamer.service(),
            };
            prop_assert!(link.bytes_in_flight() <= 24);
        }

        streamer.stop().unwrap();
        let snap = streamer.store().snapshot();
        prop_assert_eq!(snap.job_state, JobState::Stopped);
        prop_assert_eq!(snap.spindle_direction, SpindleDirection::Off);
        prop_assert_eq!(snap.spindle_rpm, 0.0);
        prop_assert!(!snap.vacuum);
    }
}

#[test]
fn test_work_offset_through_link() {
    let (mut streamer, link) = streamer(128);
    streamer.set_work_offset(Position::new(10.0, 5.0, 0.0)).unwrap();
    assert_eq!(
        link.sent_lines(),
        vec!["G10 L2 P1 X10.000 Y5.000 Z0.000".to_string()]
    );
    assert_eq!(streamer.store().snapshot().work_offset, Position::default());

    link.ack();
    link.report(MachineStatus::Idle, Position::new(10.0, 5.0, 2.0));
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.work_offset, Position::new(10.0, 5.0, 0.0));
    assert_eq!(snap.machine_position, Position::new(10.0, 5.0, 2.0));
    assert_eq!(snap.work_position, Position::new(0.0, 0.0, 2.0));
}

#[test]
fn test_rejected_offset_leaves_offset_unchanged() {
    let (mut streamer, link) = streamer(128);
    streamer.set_work_offset(Position::new(1.0, 1.0, 1.0)).unwrap();
    link.reject(3);
    streamer.service().unwrap();
    assert_eq!(streamer.store().snapshot().work_offset, Position::default());
    assert_eq!(streamer.job_state(), JobState::Idle);
}

#[test]
fn test_jog_frames_and_guards() {
    let (mut streamer, link) = streamer(128);
    streamer.jog(Axis::X, -2.5, 300.0).unwrap();
    assert_eq!(link.sent_lines(), vec!["$J=G91 X-2.500 F300".to_string()]);

    streamer.load(Program::from_text("six.nc", SIX_LINES)).unwrap();
    link.ack();
    streamer.start().unwrap();
    let err = streamer.jog(Axis::Y, 1.0, 300.0).unwrap_err();
    assert!(err.is_caller_error());
}

#[test]
fn test_homing_completes_on_ack() {
    let (mut streamer, link) = streamer(128);
    streamer.home().unwrap();
    assert_eq!(streamer.job_state(), JobState::Homing);
    assert_eq!(link.sent_lines(), vec!["$H".to_string()]);

    link.report(MachineStatus::Home, Position::default());
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Homing);

    link.ack();
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Idle);
}

#[test]
fn test_homing_waits_for_empty_buffer() {
    let (mut streamer, link) = streamer(128);
    streamer.jog(Axis::Z, 5.0, 500.0).unwrap();
    streamer.home().unwrap();
    assert_eq!(link.sent_lines().len(), 1);

    streamer.set_work_offset(Position::new(1.0, 2.0, 3.0)).unwrap();
    link.ack();
    streamer.service().unwrap();
    // the offset was queued ahead of $H and goes first
    assert_eq!(link.sent_lines().len(), 2);

    link.ack();
    streamer.service().unwrap();
    assert_eq!(link.sent_lines().last().map(String::as_str), Some("$H"));
}

#[test]
fn test_homing_timeout_moves_to_alarm() {
    let link = MockLink::new(128);
    let mut streamer = JobStreamer::new(ActuationShim::noop(), StateStore::new(), 128)
        .with_homing_timeout(Duration::from_millis(50));
    streamer.attach(Box::new(link.clone())).unwrap();

    streamer.home().unwrap();
    streamer.service_at(Instant::now()).unwrap();
    assert_eq!(streamer.job_state(), JobState::Homing);

    streamer
        .service_at(Instant::now() + Duration::from_secs(1))
        .unwrap();
    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Alarm);
    assert!(snap.last_fault.unwrap().message.starts_with("Homing failed"));
    assert_eq!(link.resets(), 1);
}

#[test]
fn test_alarm_during_homing_fails_it() {
    let (mut streamer, link) = streamer(128);
    streamer.home().unwrap();
    link.report(MachineStatus::Home, Position::default());
    streamer.service().unwrap();
    link.push(LinkEvent::Alarm(9));
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Alarm);
    assert!(snap.last_fault.unwrap().message.contains("Homing failed"));
}

#[test]
fn test_rejected_homing_fails_it() {
    let (mut streamer, link) = streamer(128);
    streamer.home().unwrap();
    link.reject(5);
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Alarm);
}

#[test]
fn test_unsolicited_alarm_aborts_running_job() {
    let (mut streamer, link) = streamer(128);
    streamer.load(Program::from_text("six.nc", SIX_LINES)).unwrap();
    streamer.start().unwrap();
    link.ack();
    link.report(MachineStatus::Alarm, Position::default());
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Alarm);
    assert_eq!(snap.status, MachineStatus::Alarm);
    assert_eq!(snap.current_line, 1);
    assert_silenced(&streamer);
}

#[test]
fn test_link_lost_mid_job() {
    let (mut streamer, link) = streamer(128);
    streamer
        .load(Program::from_text("cut.nc", "M3 S15000 M8\nG1 X10 F300"))
        .unwrap();
    streamer.start().unwrap();
    link.unplug();
    streamer.service().unwrap();

    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Alarm);
    assert_eq!(snap.status, MachineStatus::Disconnected);
    assert_eq!(snap.connection, ConnectionKind::None);
    assert!(snap.last_fault.is_some());
    assert!(!streamer.is_connected());
    assert_silenced(&streamer);
}

#[test]
fn test_reset_after_dispatch_aborts() {
    let (mut streamer, link) = streamer(128);
    streamer.load(Program::from_text("six.nc", SIX_LINES)).unwrap();
    streamer.start().unwrap();
    link.push(LinkEvent::Reset);
    streamer.service().unwrap();
    assert_eq!(streamer.job_state(), JobState::Alarm);
}

#[test]
fn test_tool_preseed_and_vacuum_lifecycle() {
    let (mut streamer, link) = streamer(128);
    let mut table = ToolTable::new();
    table.insert(ToolDefaults {
        id: 3,
        name: "3mm flat".into(),
        diameter_mm: 3.0,
        feed_mm_min: 800.0,
        rpm: 18000.0,
        direction: SpindleDirection::Cw,
    });
    streamer.set_tools(Arc::new(table));

    let program = Program::from_text("t3.nc", "G0 Z5\nG1 X10 F800").with_tool_id(3);
    streamer.load(program).unwrap();
    streamer.start().unwrap();
    let snap = streamer.store().snapshot();
    assert_eq!(snap.spindle_rpm, 18000.0);
    assert_eq!(snap.spindle_direction, SpindleDirection::Cw);
    assert!(snap.vacuum);

    link.ack_all();
    streamer.service().unwrap();
    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Completed);
    assert!(!snap.vacuum);
    assert_eq!(snap.spindle_rpm, 18000.0);
}

#[test]
fn test_spindle_applied_before_line_is_sent() {
    // only the first frame fits at start
    let (mut streamer, link) = streamer(12);
    let program = Program::from_text("m3.nc", "M3 S12000\nG1 X1 F100\nM5");
    streamer.load(program).unwrap();
    streamer.start().unwrap();
    assert_eq!(link.program_lines(), vec![1]);
    assert_eq!(streamer.shim().intent().rpm, 12000.0);

    link.ack();
    streamer.service().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2]);
    assert_eq!(streamer.shim().intent().direction, SpindleDirection::Cw);

    link.ack();
    streamer.service().unwrap();
    assert_eq!(link.program_lines(), vec![1, 2, 3]);
    assert_eq!(streamer.shim().intent().direction, SpindleDirection::Off);
}

#[test]
fn test_blank_and_comment_lines_are_skipped() {
    let (mut streamer, link) = streamer(128);
    let program = Program::from_text("c.nc", "G21\n\n; setup done\nG0 X1 (rapid)");
    streamer.load(program).unwrap();
    streamer.start().unwrap();
    assert_eq!(link.sent_lines(), vec!["G21".to_string(), "G0 X1".to_string()]);
    assert_eq!(link.program_lines(), vec![1, 4]);

    link.ack_all();
    streamer.service().unwrap();
    let snap = streamer.store().snapshot();
    assert_eq!(snap.job_state, JobState::Completed);
    assert_eq!(snap.current_line, 4);
}
