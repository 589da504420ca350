mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use gcs_link::{AckStatus, CommandError, ConnectionManager};
use mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_ACK_DATA};

const ARM: [f32; 7] = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

fn manager_with(policy: AckPolicy) -> (Arc<ConnectionManager>, SimFc) {
    let (transport, sim) = SimFc::start(&[], policy);
    let manager = Arc::new(ConnectionManager::new(fast_config()));
    manager.connect_transport(Arc::new(transport)).unwrap();
    (manager, sim)
}

#[test]
fn arm_is_accepted_promptly() {
    let (manager, sim) = manager_with(accept_all());
    let started = Instant::now();
    let status = manager.send_command("MAV_CMD_COMPONENT_ARM_DISARM", ARM, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(status, AckStatus::Accepted);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sim.commands_seen(), 1);
}

#[test]
fn denied_arm_reports_reason() {
    let (manager, _sim) = manager_with(Box::new(|cmd| {
        (cmd == MavCmd::MAV_CMD_COMPONENT_ARM_DISARM).then_some(MavResult::MAV_RESULT_DENIED)
    }));
    match manager.send_command("component_arm_disarm", ARM, None) {
        Err(CommandError::Rejected(reason)) => assert_eq!(reason, "DENIED"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn in_progress_is_not_a_failure() {
    let (manager, _sim) = manager_with(Box::new(|_| Some(MavResult::MAV_RESULT_IN_PROGRESS)));
    let status = manager.send_command("PREFLIGHT_CALIBRATION", [0.0; 7], None).unwrap();
    assert_eq!(status, AckStatus::InProgress);
}

#[test]
fn silent_vehicle_times_out_near_deadline() {
    let (manager, _sim) = manager_with(Box::new(|_| None));
    let started = Instant::now();
    let err = manager.send_command("NAV_TAKEOFF", [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 10.0], Some(Duration::from_millis(300)));
    let waited = started.elapsed();
    assert!(matches!(err, Err(CommandError::TimedOut)));
    assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(1_300), "{waited:?}");
}

#[test]
fn unknown_command_fails_before_any_io() {
    let (manager, sim) = manager_with(accept_all());
    let err = manager.send_command("MAV_CMD_DO_BARREL_ROLL", [0.0; 7], None).unwrap_err();
    assert!(matches!(err, CommandError::UnknownCommand(ref n) if n == "MAV_CMD_DO_BARREL_ROLL"));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.commands_seen(), 0);

    let offline = ConnectionManager::new(fast_config());
    assert!(matches!(offline.send_command("NOPE", [0.0; 7], None), Err(CommandError::UnknownCommand(_))));
}

#[test]
fn concurrent_callers_on_one_id_share_the_outcome() {
    let (manager, sim) = manager_with(Box::new(|_| None));

    for round in 0..100usize {
        let callers: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.send_command("COMPONENT_ARM_DISARM", ARM, Some(Duration::from_secs(5))))
            })
            .collect();
        assert!(eventually(Duration::from_secs(2), || sim.commands_seen() == 2 * (round + 1)), "round {round}");

        let result = if round % 2 == 0 { MavResult::MAV_RESULT_ACCEPTED } else { MavResult::MAV_RESULT_DENIED };
        sim.send(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            result,
            ..Default::default()
        }));

        let outcomes: Vec<_> = callers.into_iter().map(|h| h.join().unwrap()).collect();
        for outcome in &outcomes {
            match (round % 2, outcome) {
                (0, Ok(AckStatus::Accepted)) => {}
                (1, Err(CommandError::Rejected(r))) if r == "DENIED" => {}
                _ => panic!("round {round}: unexpected {outcome:?}"),
            }
        }
    }
}

#[test]
fn different_commands_resolve_independently() {
    let (manager, sim) = manager_with(Box::new(|_| None));
    let arm = {
        let manager = manager.clone();
        std::thread::spawn(move || manager.send_command("COMPONENT_ARM_DISARM", ARM, Some(Duration::from_secs(3))))
    };
    let land = {
        let manager = manager.clone();
        std::thread::spawn(move || manager.send_command("NAV_LAND", [0.0; 7], Some(Duration::from_millis(400))))
    };
    assert!(eventually(Duration::from_secs(2), || sim.commands_seen() == 2));

    sim.send(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
        command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
        result: MavResult::MAV_RESULT_ACCEPTED,
        ..Default::default()
    }));
    assert_eq!(arm.join().unwrap().unwrap(), AckStatus::Accepted);
    assert!(matches!(land.join().unwrap(), Err(CommandError::TimedOut)));
}
