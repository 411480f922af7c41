//! # Robot state store
//!
//! Latest known robot safety state and joint snapshot. Written by the follower's control thread on
//! every acknowledgement, read by the goal coordinator for admission and completion checks.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Serialize;
use std::fmt;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    PoisonError, RwLock,
};

use comms_if::rt::{JointArray, NUM_JOINTS};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Actual joint positions and velocities reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointState {
    /// Units: radians
    pub q_actual: JointArray,

    /// Units: radians/second
    pub qd_actual: JointArray,
}

/// Shared snapshot of the robot, only the latest value is kept.
#[derive(Debug)]
pub struct RobotStateStore {
    joints: RwLock<JointState>,
    state: AtomicU8,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Coarse safety/mode classification of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RobotState {
    Running = 0,
    ProtectiveStopped = 1,
    EmergencyStopped = 2,
    Error = 3,
    Undefined = 4,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RobotState {
    /// Message used when rejecting a goal because of this state.
    pub fn reject_reason(&self) -> &'static str {
        match self {
            RobotState::Running => "Robot is running",
            RobotState::ProtectiveStopped => "Robot is protective stopped",
            RobotState::EmergencyStopped => "Robot is emergency stopped",
            RobotState::Error => "Robot is not ready, check robot_mode",
            RobotState::Undefined => "Undefined state",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RobotState::Running,
            1 => RobotState::ProtectiveStopped,
            2 => RobotState::EmergencyStopped,
            3 => RobotState::Error,
            _ => RobotState::Undefined,
        }
    }
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RobotState::Running => "RUNNING",
            RobotState::ProtectiveStopped => "PROTECTIVE_STOP",
            RobotState::EmergencyStopped => "EMERGENCY_STOP",
            RobotState::Error => "ERROR",
            RobotState::Undefined => "UNDEFINED",
        };
        write!(f, "{}", s)
    }
}

impl Default for JointState {
    fn default() -> Self {
        Self {
            q_actual: [0.0; NUM_JOINTS],
            qd_actual: [0.0; NUM_JOINTS],
        }
    }
}

impl JointState {
    /// True if any joint is moving faster than `threshold`.
    pub fn in_motion(&self, threshold: f64) -> bool {
        self.qd_actual.iter().any(|qd| qd.abs() > threshold)
    }

    /// Largest absolute difference between the actual and given positions.
    pub fn max_deviation(&self, positions: &JointArray) -> f64 {
        self.q_actual
            .iter()
            .zip(positions.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl RobotStateStore {
    /// Create a store in the `Error` state, the robot isn't ready until telemetry says so.
    pub fn new() -> Self {
        Self::with_joints(JointState::default())
    }

    pub fn with_joints(joints: JointState) -> Self {
        Self {
            joints: RwLock::new(joints),
            state: AtomicU8::new(RobotState::Error as u8),
        }
    }

    pub fn update_joints(&self, joints: JointState) {
        *self.joints.write().unwrap_or_else(PoisonError::into_inner) = joints;
    }

    pub fn joints(&self) -> JointState {
        *self.joints.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn robot_state(&self) -> RobotState {
        RobotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the robot state, returning the previous state if it changed.
    pub fn set_robot_state(&self, state: RobotState) -> Option<RobotState> {
        let prev = RobotState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));

        if prev != state {
            Some(prev)
        } else {
            None
        }
    }
}

impl Default for RobotStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_state_changes() {
        let store = RobotStateStore::new();
        assert_eq!(store.robot_state(), RobotState::Error);

        assert_eq!(
            store.set_robot_state(RobotState::Running),
            Some(RobotState::Error)
        );
        assert_eq!(store.set_robot_state(RobotState::Running), None);
        assert_eq!(store.robot_state(), RobotState::Running);
    }

    #[test]
    fn test_joint_snapshot() {
        let store = RobotStateStore::new();
        let mut joints = JointState::default();
        joints.q_actual[2] = 0.4;
        joints.qd_actual[5] = -0.02;

        store.update_joints(joints);

        let read = store.joints();
        assert_eq!(read, joints);
        assert!(read.in_motion(0.01));
        assert!(!read.in_motion(0.05));
        assert!((read.max_deviation(&[0.0; NUM_JOINTS]) - 0.4).abs() < 1e-12);
    }
}
