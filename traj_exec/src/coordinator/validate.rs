//! Goal validation and translation into the controller's joint order.
//!
//! Validation failures are returned as the [`GoalResult`] the goal is rejected with.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashSet;

use comms_if::{
    goal::{GoalResult, JointTrajectory},
    rt::NUM_JOINTS,
};
use util::time::secs;

use crate::{
    robot_state::RobotState,
    trajectory::{Trajectory, TrajectoryError, TrajectoryPoint},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Maps the controller's joint order onto a goal's joint order.
///
/// Joint `i` of the controller is joint `goal_index[i]` of the goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointMapping {
    goal_index: [usize; NUM_JOINTS],
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Only a running robot can accept goals.
pub fn validate_state(state: RobotState) -> Result<(), GoalResult> {
    match state {
        RobotState::Running => Ok(()),
        s => Err(GoalResult::internal(s.reject_reason())),
    }
}

/// The goal's joints must be exactly the controller's joints, in any order.
pub fn validate_joints(
    goal_joints: &[String],
    joint_names: &[String],
) -> Result<JointMapping, GoalResult> {
    let invalid = || {
        GoalResult::new(
            GoalResult::INVALID_JOINTS,
            format!(
                "Invalid joint names for goal\nExpected: {}\nFound: {}",
                joint_names.join(", "),
                goal_joints.join(", ")
            ),
        )
    };

    let goal_set: HashSet<&String> = goal_joints.iter().collect();
    let expected_set: HashSet<&String> = joint_names.iter().collect();

    if goal_set.len() != goal_joints.len()
        || goal_set != expected_set
        || joint_names.len() != NUM_JOINTS
    {
        return Err(invalid());
    }

    let mut goal_index = [0; NUM_JOINTS];
    for (i, name) in joint_names.iter().enumerate() {
        goal_index[i] = goal_joints
            .iter()
            .position(|g| g == name)
            .ok_or_else(invalid)?;
    }

    Ok(JointMapping { goal_index })
}

/// Check the content of every point of the trajectory.
///
/// Must be called after [`validate_joints`], which fixes the number of joints.
pub fn validate_trajectory(
    trajectory: &JointTrajectory,
    max_velocity_rads: f64,
) -> Result<(), GoalResult> {
    let invalid = |msg: String| Err(GoalResult::new(GoalResult::INVALID_GOAL, msg));

    if trajectory.points.is_empty() {
        return invalid("Received a goal with an empty trajectory".into());
    }

    let num_joints = trajectory.joint_names.len();
    let mut last_time_s = 0.0;

    for point in trajectory.points.iter() {
        if point.velocities.len() != num_joints {
            return invalid("Received a goal with an invalid number of velocities".into());
        }

        if point.positions.len() != num_joints {
            return invalid("Received a goal with an invalid number of positions".into());
        }

        if point.velocities.iter().any(|v| !v.is_finite()) {
            return invalid("Received a goal with infinities or NaNs in velocity".into());
        }

        if point.velocities.iter().any(|v| v.abs() > max_velocity_rads) {
            return invalid(format!(
                "Received a goal with velocities that are higher than max_velocity {}",
                max_velocity_rads
            ));
        }

        if point.positions.iter().any(|p| !p.is_finite()) {
            return invalid("Received a goal with infinities or NaNs in positions".into());
        }

        if !point.time_from_start_s.is_finite() || point.time_from_start_s < 0.0 {
            return invalid("Received a goal with an invalid time_from_start".into());
        }

        if point.time_from_start_s < last_time_s {
            return invalid("Received a goal with unsorted time_from_start".into());
        }
        last_time_s = point.time_from_start_s;
    }

    Ok(())
}

/// Translate a validated goal trajectory into the controller's joint order.
pub fn to_trajectory(
    trajectory: &JointTrajectory,
    mapping: &JointMapping,
) -> Result<Trajectory, TrajectoryError> {
    let points = trajectory
        .points
        .iter()
        .map(|p| {
            let mut positions = [0.0; NUM_JOINTS];
            let mut velocities = [0.0; NUM_JOINTS];

            for (i, &g) in mapping.goal_index.iter().enumerate() {
                positions[i] = p.positions[g];
                velocities[i] = p.velocities[g];
            }

            TrajectoryPoint::new(positions, velocities, secs(p.time_from_start_s))
        })
        .collect();

    Trajectory::new(points)
}
