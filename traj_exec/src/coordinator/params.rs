//! Goal coordinator parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the goal coordinator
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorParams {
    /// Goals with any waypoint velocity above this are rejected.
    ///
    /// Units: radians/second
    pub max_velocity_rads: f64,

    /// Blend velocities across waypoints, otherwise stop at every waypoint.
    pub use_smooth_trajectory: bool,

    /// Report a controller hang as fatal so the process can be restarted.
    pub kill_on_hang: bool,

    /// Maximum distance from the final waypoint for a goal to be reached.
    ///
    /// Units: radians
    pub goal_tolerance_rad: f64,

    /// Joint speed above which the robot is considered moving.
    ///
    /// Units: radians/second
    pub in_motion_threshold_rads: f64,

    /// Goals not reached within this multiple of their duration are aborted.
    pub timeout_factor: f64,

    /// Fraction of the goal duration to wait before checking for completion.
    pub settle_delay_factor: f64,

    /// Completion polling period.
    ///
    /// Units: seconds
    pub completion_poll_period_s: f64,

    /// How long the execution thread waits for a goal before checking for shutdown.
    ///
    /// Units: seconds
    pub goal_poll_timeout_s: f64,

    /// Delay after preempting a goal before the next one is handed over.
    ///
    /// Units: seconds
    pub preempt_settle_s: f64,

    /// Delay between aborting a goal on hang and raising the fatal error.
    ///
    /// Units: seconds
    pub kill_grace_s: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for CoordinatorParams {
    fn default() -> Self {
        Self {
            max_velocity_rads: 10.0,
            use_smooth_trajectory: true,
            kill_on_hang: true,
            goal_tolerance_rad: 0.0025,
            in_motion_threshold_rads: 0.01,
            timeout_factor: 1.5,
            settle_delay_factor: 0.1,
            completion_poll_period_s: 0.001,
            goal_poll_timeout_s: 0.1,
            preempt_settle_s: 0.25,
            kill_grace_s: 0.25,
        }
    }
}
