//! In-memory robot controller used by the integration tests.
//!
//! The fake arm tracks every servo setpoint perfectly unless told to stall, and can be made to
//! report a protective stop or to stop acknowledging records (hang).

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{mpsc::Receiver, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use comms_if::{
    goal::{FollowJointTrajectoryGoal, GoalStatus, JointTrajectory, JointTrajectoryPoint},
    rt::{AckV3, ProtocolVersion, RobotTelemetry, SetpointKind, SetpointRecord},
};
use traj_lib::{
    coordinator::{CoordinatorParams, FatalError, GoalCoordinator, GoalHandle},
    follower::{
        channel::{ChannelError, ControllerListener, SetpointChannel},
        FollowerParams, TrajectoryFollower,
    },
    robot_state::{RobotState, RobotStateStore},
    JointArray, NUM_JOINTS,
};

// ------------------------------------------------------------------------------------------------
// FAKE CONTROLLER
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ArmState {
    q: JointArray,
    qd: JointArray,
    stall: bool,
    hang: bool,
    protective_stop: bool,
    records: Vec<SetpointRecord>,
}

/// Handle used by the test to inspect and disturb the fake arm.
#[derive(Debug, Clone, Default)]
pub struct FakeArm(Arc<Mutex<ArmState>>);

struct FakeChannel(FakeArm);

/// Hands out queued channels, one per accept.
pub struct FakeListener(VecDeque<FakeChannel>);

impl FakeArm {
    pub fn new(q: JointArray) -> Self {
        let arm = Self::default();
        arm.0.lock().unwrap().q = q;
        arm
    }

    /// Ignore servo setpoints, the arm stays where it is.
    pub fn set_stall(&self, stall: bool) {
        self.0.lock().unwrap().stall = stall;
    }

    /// Stop acknowledging records.
    pub fn set_hang(&self, hang: bool) {
        self.0.lock().unwrap().hang = hang;
    }

    pub fn set_protective_stop(&self, stop: bool) {
        self.0.lock().unwrap().protective_stop = stop;
    }

    pub fn q(&self) -> JointArray {
        self.0.lock().unwrap().q
    }

    pub fn count(&self, kind: SetpointKind) -> usize {
        self.0
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// All servo records received so far.
    pub fn servo_records(&self) -> Vec<SetpointRecord> {
        self.0
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.kind == SetpointKind::Servo)
            .copied()
            .collect()
    }

    pub fn last_record(&self) -> Option<SetpointRecord> {
        self.0.lock().unwrap().records.last().copied()
    }

    /// A listener which connects this arm once.
    pub fn listener(&self) -> FakeListener {
        FakeListener::new(vec![self.clone()])
    }
}

impl FakeListener {
    pub fn new(arms: Vec<FakeArm>) -> Self {
        Self(arms.into_iter().map(FakeChannel).collect())
    }
}

impl SetpointChannel for FakeChannel {
    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V3
    }

    fn send_setpoint(&mut self, record: &SetpointRecord) -> Result<(), ChannelError> {
        let mut arm = (self.0).0.lock().unwrap();

        match record.kind {
            SetpointKind::Servo if !arm.stall && !arm.protective_stop => {
                arm.q = record.positions;
                arm.qd = record.velocities;
            }
            _ => arm.qd = [0.0; NUM_JOINTS],
        }
        arm.records.push(*record);

        Ok(())
    }

    fn recv_ack(&mut self, timeout: Duration) -> Result<RobotTelemetry, ChannelError> {
        let (hang, ack) = {
            let arm = (self.0).0.lock().unwrap();
            (
                arm.hang,
                AckV3 {
                    robot_mode: 7,
                    safety_mode: if arm.protective_stop { 3 } else { 1 },
                    q_actual: arm.q,
                    qd_actual: arm.qd,
                    q_target: arm.q,
                },
            )
        };

        if hang {
            thread::sleep(timeout);
            return Err(ChannelError::Timeout);
        }

        Ok(RobotTelemetry::V3(ack))
    }
}

impl ControllerListener for FakeListener {
    fn accept(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn SetpointChannel>>, ChannelError> {
        match self.0.pop_front() {
            Some(c) => Ok(Some(Box::new(c))),
            None => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DRIVER SETUP
// ------------------------------------------------------------------------------------------------

pub const JOINT_NAMES: [&str; NUM_JOINTS] = [
    "shoulder_pan_joint",
    "shoulder_lift_joint",
    "elbow_joint",
    "wrist_1_joint",
    "wrist_2_joint",
    "wrist_3_joint",
];

/// A running coordinator connected to a fake arm.
pub struct Driver {
    pub coordinator: GoalCoordinator,
    pub fatal_rx: Receiver<FatalError>,
    pub store: Arc<RobotStateStore>,
    pub arm: FakeArm,
}

pub fn joint_names() -> Vec<String> {
    JOINT_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Coordinator parameters with short delays so tests run quickly.
pub fn coordinator_params() -> CoordinatorParams {
    CoordinatorParams {
        preempt_settle_s: 0.02,
        kill_grace_s: 0.01,
        ..Default::default()
    }
}

/// Start a follower on a fake arm at rest at zero.
pub fn started_follower(arm: &FakeArm) -> TrajectoryFollower {
    let params = FollowerParams {
        connect_timeout_s: 1.0,
        ..Default::default()
    };

    let mut follower = TrajectoryFollower::new(
        params,
        Box::new(arm.listener()),
        Arc::new(RobotStateStore::new()),
    );
    follower.start().unwrap();

    wait_until(Duration::from_secs(1), || {
        follower.store().robot_state() == RobotState::Running
    });

    follower
}

pub fn driver(params: CoordinatorParams) -> Driver {
    let arm = FakeArm::new([0.0; NUM_JOINTS]);
    let follower = started_follower(&arm);
    let store = follower.store();

    let mut coordinator = GoalCoordinator::new(params, joint_names(), follower).unwrap();
    let fatal_rx = coordinator.start().unwrap();

    Driver {
        coordinator,
        fatal_rx,
        store,
        arm,
    }
}

// ------------------------------------------------------------------------------------------------
// GOALS
// ------------------------------------------------------------------------------------------------

/// A goal from the given `(position of every joint, time)` waypoints, at rest at each one.
pub fn goal(points: &[(f64, f64)]) -> FollowJointTrajectoryGoal {
    FollowJointTrajectoryGoal {
        trajectory: JointTrajectory {
            joint_names: joint_names(),
            points: points
                .iter()
                .map(|&(q, t)| JointTrajectoryPoint {
                    positions: vec![q; NUM_JOINTS],
                    velocities: vec![0.0; NUM_JOINTS],
                    time_from_start_s: t,
                })
                .collect(),
        },
    }
}

/// A single move to `q` on every joint, arriving after `duration_s`.
pub fn move_goal(q: f64, duration_s: f64) -> GoalHandle {
    GoalHandle::new(goal(&[(q, duration_s)]))
}

// ------------------------------------------------------------------------------------------------
// HELPERS
// ------------------------------------------------------------------------------------------------

/// Poll `cond` until it is true, panicking after `timeout`.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            panic!("Condition not met within {:?}", timeout);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn wait_active(gh: &GoalHandle) {
    wait_until(Duration::from_secs(2), || gh.status() == GoalStatus::Active);
}

/// The terminal status' code and message.
pub fn terminal(gh: &GoalHandle, timeout: Duration) -> (GoalStatus, i32, String) {
    let status = gh
        .wait_for_terminal(timeout)
        .unwrap_or_else(|| panic!("Goal {} still {:?}", gh.id(), gh.status()));
    let result = status.result().unwrap().clone();
    (status, result.error_code, result.error_string)
}
