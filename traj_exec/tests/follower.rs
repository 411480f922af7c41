//! Trajectory follower tests against the in-memory controller.

mod common;

use std::{sync::Arc, thread, time::Duration};

use comms_if::rt::SetpointKind;
use traj_lib::{
    follower::{FollowerError, FollowerParams, StreamOutcome, TrajectoryFollower},
    robot_state::RobotStateStore,
    trajectory::{Trajectory, TrajectoryPoint},
    NUM_JOINTS,
};

use common::{started_follower, wait_until, FakeArm, FakeListener};

fn ramp(q: f64, duration_s: f64) -> Trajectory {
    Trajectory::new(vec![
        TrajectoryPoint::new([0.0; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs(0)),
        TrajectoryPoint::new(
            [q; NUM_JOINTS],
            [0.0; NUM_JOINTS],
            Duration::from_secs_f64(duration_s),
        ),
    ])
    .unwrap()
}

#[test]
fn test_idle_records_while_not_streaming() {
    let arm = FakeArm::new([0.0; NUM_JOINTS]);
    let _follower = started_follower(&arm);

    let before = arm.count(SetpointKind::Idle);
    thread::sleep(Duration::from_millis(100));

    // Roughly one record per control period
    assert!(arm.count(SetpointKind::Idle) >= before + 5);
    assert_eq!(arm.count(SetpointKind::Servo), 0);
}

#[test]
fn test_timed_trajectory_reaches_end() {
    let arm = FakeArm::new([0.0; NUM_JOINTS]);
    let mut follower = started_follower(&arm);

    assert_eq!(
        follower.start_timed_trajectory(&ramp(0.05, 0.2)).unwrap(),
        StreamOutcome::Completed
    );
    assert_eq!(arm.q(), [0.05; NUM_JOINTS]);

    follower.stop();
    wait_until(Duration::from_secs(1), || {
        arm.last_record().map(|r| r.kind) == Some(SetpointKind::Idle)
    });
    assert_eq!(arm.count(SetpointKind::Stop), 1);
}

#[test]
fn test_infeasible_trajectory_not_streamed() {
    let arm = FakeArm::new([0.0; NUM_JOINTS]);
    let mut follower = started_follower(&arm);

    match follower.start_smooth_trajectory(&ramp(2.0, 0.1)) {
        Err(FollowerError::Infeasible { segment, .. }) => assert_eq!(segment, 0),
        r => panic!("Expected an infeasible trajectory, got {:?}", r),
    }
    assert_eq!(arm.count(SetpointKind::Servo), 0);
}

#[test]
fn test_reconnects_after_hang() {
    let first = FakeArm::new([0.0; NUM_JOINTS]);
    let second = FakeArm::new([0.0; NUM_JOINTS]);

    let mut follower = TrajectoryFollower::new(
        FollowerParams {
            connect_timeout_s: 1.0,
            ..Default::default()
        },
        Box::new(FakeListener::new(vec![first.clone(), second.clone()])),
        Arc::new(RobotStateStore::new()),
    );
    follower.start().unwrap();

    assert_eq!(
        follower.start_smooth_trajectory(&ramp(0.05, 0.5)).unwrap(),
        StreamOutcome::Streaming
    );
    first.set_hang(true);

    let mut failure = None;
    wait_until(Duration::from_secs(1), || {
        failure = follower.poll_failure();
        failure.is_some()
    });
    assert!(matches!(failure, Some(FollowerError::ControllerHang(_))));

    // The second controller is accepted in the background
    wait_until(Duration::from_secs(1), || follower.is_connected());

    let target = [0.02, 0.0, -0.02, 0.0, 0.01, 0.0];
    assert_eq!(follower.execute(&target).unwrap(), StreamOutcome::Completed);
    assert_eq!(second.q(), target);
}

#[test]
fn test_shutdown_and_restart() {
    let arm = FakeArm::new([0.0; NUM_JOINTS]);
    let mut follower = started_follower(&arm);

    follower.shutdown();
    assert!(matches!(
        follower.start_timed_trajectory(&ramp(0.05, 0.2)),
        Err(FollowerError::NotStarted)
    ));

    // The only controller was used up, so the restart times out
    assert!(matches!(
        follower.start(),
        Err(FollowerError::ConnectTimeout(_))
    ));
}
