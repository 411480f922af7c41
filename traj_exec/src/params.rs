//! Trajectory executable parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the trajectory executable
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrajExecParams {
    /// zmq endpoint the goal server binds to.
    pub goal_endpoint: String,

    /// Names of the robot's joints, in the order the controller uses.
    pub joint_names: Vec<String>,

    /// Period between robot state log messages.
    ///
    /// Units: seconds
    pub state_log_period_s: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for TrajExecParams {
    fn default() -> Self {
        Self {
            goal_endpoint: "tcp://*:5030".into(),
            joint_names: vec![
                "shoulder_pan_joint".into(),
                "shoulder_lift_joint".into(),
                "elbow_joint".into(),
                "wrist_1_joint".into(),
                "wrist_2_joint".into(),
                "wrist_3_joint".into(),
            ],
            state_log_period_s: 5.0,
        }
    }
}
