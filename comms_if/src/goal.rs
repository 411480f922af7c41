//! # Trajectory goal interface
//!
//! Messages exchanged between trajectory clients and the driver's goal server. A client submits a
//! [`FollowJointTrajectoryGoal`], which the driver validates and either rejects immediately or
//! accepts for execution. The goal's [`GoalStatus`] can then be polled until it reaches a terminal
//! state carrying a [`GoalResult`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use structopt::StructOpt;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Identifier assigned by the driver to every submitted goal.
pub type GoalId = u64;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A request to follow a joint trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowJointTrajectoryGoal {
    pub trajectory: JointTrajectory,
}

/// A joint trajectory as authored by the client.
///
/// The joint order is given by `joint_names` and may differ from the controller's order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTrajectory {
    pub joint_names: Vec<String>,

    pub points: Vec<JointTrajectoryPoint>,
}

/// One waypoint of a [`JointTrajectory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTrajectoryPoint {
    /// Units: radians
    pub positions: Vec<f64>,

    /// Units: radians/second
    pub velocities: Vec<f64>,

    /// Time of this point relative to the start of the trajectory.
    ///
    /// Units: seconds
    pub time_from_start_s: f64,
}

/// Outcome reported with every terminal goal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalResult {
    pub error_code: i32,

    pub error_string: String,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalStatus {
    /// Validated and waiting for the execution thread.
    Pending,

    /// Being executed.
    Active,

    Rejected(GoalResult),
    Succeeded(GoalResult),
    Aborted(GoalResult),
    Canceled(GoalResult),
}

/// Requests accepted by the goal server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GoalRequest {
    Submit(FollowJointTrajectoryGoal),
    Cancel { goal_id: GoalId },
    Status { goal_id: GoalId },
}

/// Responses sent by the goal server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GoalResponse {
    /// The goal was received and assigned an ID, `status` says whether it was rejected.
    Submitted { goal_id: GoalId, status: GoalStatus },

    Status { goal_id: GoalId, status: GoalStatus },

    /// The server isn't tracking a goal with this ID (never submitted, or evicted).
    UnknownGoal { goal_id: GoalId },

    /// The request could not be parsed.
    Invalid(String),
}

/// Commands issued from the command line goal client.
#[derive(Debug, Clone, StructOpt)]
pub enum GoalCmd {
    /// Submit the trajectory goal stored in the given TOML or JSON file.
    #[structopt(name = "submit")]
    Submit {
        #[structopt(parse(from_os_str))]
        path: PathBuf,

        /// Wait for the goal to finish, printing the result.
        #[structopt(short, long)]
        wait: bool,
    },

    /// Cancel a previously submitted goal.
    #[structopt(name = "cancel")]
    Cancel { goal_id: GoalId },

    /// Print the status of a previously submitted goal.
    #[structopt(name = "status")]
    Status { goal_id: GoalId },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl GoalResult {
    pub const SUCCESSFUL: i32 = 0;
    pub const INVALID_GOAL: i32 = -1;
    pub const INVALID_JOINTS: i32 = -2;
    pub const OLD_HEADER_TIMESTAMP: i32 = -3;
    pub const PATH_TOLERANCE_VIOLATED: i32 = -4;
    pub const GOAL_TOLERANCE_VIOLATED: i32 = -5;

    /// Robot state, hang, timeout, safety stop, cancellation and preemption failures.
    pub const INTERNAL_ERROR: i32 = -100;

    pub fn new<S: Into<String>>(error_code: i32, error_string: S) -> Self {
        Self {
            error_code,
            error_string: error_string.into(),
        }
    }

    pub fn successful() -> Self {
        Self::new(Self::SUCCESSFUL, "")
    }

    pub fn internal<S: Into<String>>(error_string: S) -> Self {
        Self::new(Self::INTERNAL_ERROR, error_string)
    }

    pub fn is_success(&self) -> bool {
        self.error_code >= Self::SUCCESSFUL
    }
}

impl GoalStatus {
    /// True if no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GoalStatus::Pending | GoalStatus::Active)
    }

    /// The result attached to a terminal status.
    pub fn result(&self) -> Option<&GoalResult> {
        match self {
            GoalStatus::Pending | GoalStatus::Active => None,
            GoalStatus::Rejected(r)
            | GoalStatus::Succeeded(r)
            | GoalStatus::Aborted(r)
            | GoalStatus::Canceled(r) => Some(r),
        }
    }
}

impl GoalRequest {
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }
}
