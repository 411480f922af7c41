//! # Telemetry ingestion
//!
//! Normalises controller acknowledgements into the [`RobotStateStore`], independent of the
//! protocol version that produced them.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::rt::{AckV1, AckV3, RobotTelemetry};

use crate::robot_state::{JointState, RobotState, RobotStateStore};

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Classify an acknowledgement into a [`RobotState`].
pub fn robot_state(telemetry: &RobotTelemetry) -> RobotState {
    match telemetry {
        RobotTelemetry::V1(ack) => v1_state(ack),
        RobotTelemetry::V3(ack) => v3_state(ack),
    }
}

/// Write the acknowledgement into the store.
///
/// Returns the new robot state if it differs from the previous one.
pub fn ingest(store: &RobotStateStore, telemetry: &RobotTelemetry) -> Option<RobotState> {
    store.update_joints(JointState {
        q_actual: *telemetry.q_actual(),
        qd_actual: *telemetry.qd_actual(),
    });

    let state = robot_state(telemetry);
    store.set_robot_state(state).map(|_| state)
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn v1_state(ack: &AckV1) -> RobotState {
    match ack.robot_mode {
        0 => RobotState::Running,
        4 | 10 => RobotState::ProtectiveStopped,
        5 => RobotState::EmergencyStopped,
        1 | 2 | 3 | 6 | 7 | 8 | 9 => RobotState::Error,
        _ => RobotState::Undefined,
    }
}

fn v3_state(ack: &AckV3) -> RobotState {
    // Safety mode takes priority over the robot mode
    match ack.safety_mode {
        3 | 5 => RobotState::ProtectiveStopped,
        6 | 7 => RobotState::EmergencyStopped,
        8 | 9 => RobotState::Error,
        _ => match ack.robot_mode {
            7 => RobotState::Running,
            0..=6 => RobotState::Error,
            _ => RobotState::Undefined,
        },
    }
}
