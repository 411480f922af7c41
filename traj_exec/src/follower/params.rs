//! Trajectory follower parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters for the trajectory follower
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FollowerParams {
    /// Address the reverse (setpoint) channel listens on.
    pub reverse_ip: String,

    /// Port the reverse (setpoint) channel listens on.
    pub reverse_port: u16,

    /// Control period, one setpoint is sent each period.
    ///
    /// Units: seconds
    pub servoj_time_s: f64,

    /// Lookahead time sent to the controller with each setpoint.
    ///
    /// Units: seconds
    pub servoj_lookahead_time_s: f64,

    /// Tracking gain sent to the controller with each setpoint.
    pub servoj_gain: f64,

    /// Maximum joint velocity any segment may require.
    ///
    /// Units: radians/second
    pub max_velocity_rads: f64,

    /// Maximum joint acceleration any segment may require.
    ///
    /// Units: radians/second^2
    pub max_acceleration_rads2: f64,

    /// Time `start()` waits for the controller to connect.
    ///
    /// Units: seconds
    pub connect_timeout_s: f64,

    /// Time to wait for each acknowledgement before declaring the controller hung.
    ///
    /// Units: seconds
    pub hang_timeout_s: f64,

    /// Maximum distance between the robot and the first point of a trajectory.
    ///
    /// Units: radians
    pub max_start_deviation_rad: f64,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for FollowerParams {
    fn default() -> Self {
        Self {
            reverse_ip: "0.0.0.0".into(),
            reverse_port: 50001,
            servoj_time_s: 0.008,
            servoj_lookahead_time_s: 0.03,
            servoj_gain: 300.0,
            max_velocity_rads: 3.15,
            max_acceleration_rads2: 15.0,
            connect_timeout_s: 30.0,
            hang_timeout_s: 0.1,
            max_start_deviation_rad: 0.1,
        }
    }
}
