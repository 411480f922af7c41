//! # Trajectory execution library
//!
//! This library allows the executables and tests in the workspace to access the modules of the
//! trajectory driver.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Goal coordinator - admits goals and runs them one at a time on the follower
pub mod coordinator;

/// Trajectory follower - streams setpoints to the robot controller
pub mod follower;

/// Goal server - exposes the coordinator over the goal socket
pub mod goal_server;

/// Interpolator - setpoints between trajectory points
pub mod interp;

/// Top level parameters of the trajectory executable
pub mod params;

/// Latest robot safety state and joint snapshot
pub mod robot_state;

/// Conversion of controller acknowledgements into robot state
pub mod telemetry;

/// Time-parameterised joint trajectories
pub mod trajectory;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use comms_if::rt::{JointArray, NUM_JOINTS};
