//! # Real-time controller records
//!
//! Binary records exchanged with the robot controller over the reverse (setpoint) channel. Every
//! control tick the driver writes one [`SetpointRecord`] and the controller answers with exactly
//! one acknowledgement carrying its latest joint state. The layout of the acknowledgement depends
//! on the controller's protocol version, which is announced once in the [`Hello`] handshake.
//!
//! All values are big-endian. Setpoint values are transmitted as integers scaled by
//! [`MULT_JOINTSTATE`], acknowledgements carry raw `f64`s.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::io::{Read, Write};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Number of joints on the arm.
pub const NUM_JOINTS: usize = 6;

/// Magic number opening both handshake messages ("TRJF").
pub const HANDSHAKE_MAGIC: u32 = 0x5452_4A46;

/// Scale factor applied to every value in a setpoint record.
pub const MULT_JOINTSTATE: f64 = 1_000_000.0;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// One value per joint, in the controller's joint order.
pub type JointArray = [f64; NUM_JOINTS];

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// First message on a new connection, sent by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub major: u8,
    pub minor: u8,
}

/// Reply to [`Hello`], sent by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    pub num_joints: u8,
}

/// A single setpoint for all joints, written once per control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointRecord {
    pub kind: SetpointKind,

    /// Target joint positions.
    ///
    /// Units: radians
    pub positions: JointArray,

    /// Target joint velocities.
    ///
    /// Units: radians/second
    pub velocities: JointArray,

    /// Target joint accelerations.
    ///
    /// Units: radians/second^2
    pub accelerations: JointArray,

    /// Time the controller should take to reach this setpoint (the control period).
    ///
    /// Units: seconds
    pub servo_time_s: f64,

    /// Lookahead time used by the controller to smooth the trajectory.
    ///
    /// Units: seconds
    pub lookahead_time_s: f64,

    /// Proportional gain the controller applies when tracking the setpoint.
    pub gain: f64,
}

/// Acknowledgement layout for protocol versions below 3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckV1 {
    pub robot_mode: i32,
    pub q_actual: JointArray,
    pub qd_actual: JointArray,
}

/// Acknowledgement layout for protocol version 3 and above.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckV3 {
    pub robot_mode: i32,
    pub safety_mode: i32,
    pub q_actual: JointArray,
    pub qd_actual: JointArray,
    pub q_target: JointArray,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// What the controller should do with a setpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SetpointKind {
    /// No motion is commanded, the controller keeps its current target.
    Idle = 0,

    /// Track the setpoint.
    Servo = 1,

    /// Decelerate all joints to zero velocity.
    Stop = 2,
}

/// Acknowledgement protocol spoken by the connected controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V3,
}

/// Telemetry carried by one acknowledgement, tagged by the protocol version that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RobotTelemetry {
    V1(AckV1),
    V3(AckV3),
}

/// Errors raised while encoding or decoding records.
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("I/O error on the controller stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake magic was 0x{0:08X}, the peer is not a trajectory controller")]
    BadMagic(u32),

    #[error("Unknown setpoint kind {0}")]
    UnknownKind(i32),

    #[error("Value {0} cannot be represented in a setpoint record")]
    OutOfRange(f64),

    #[error("Expected a record of {expected} bytes, found {found}")]
    WrongLength { expected: usize, found: usize },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Hello {
    /// Encoded length in bytes.
    pub const LEN: usize = 6;

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), RtError> {
        w.write_u32::<BigEndian>(HANDSHAKE_MAGIC)?;
        w.write_u8(self.major)?;
        w.write_u8(self.minor)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, RtError> {
        check_magic(r.read_u32::<BigEndian>()?)?;
        Ok(Self {
            major: r.read_u8()?,
            minor: r.read_u8()?,
        })
    }

    /// The acknowledgement protocol selected by this controller's version.
    pub fn protocol_version(&self) -> ProtocolVersion {
        if self.major < 3 {
            ProtocolVersion::V1
        } else {
            ProtocolVersion::V3
        }
    }
}

impl HelloAck {
    /// Encoded length in bytes.
    pub const LEN: usize = 5;

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), RtError> {
        w.write_u32::<BigEndian>(HANDSHAKE_MAGIC)?;
        w.write_u8(self.num_joints)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, RtError> {
        check_magic(r.read_u32::<BigEndian>()?)?;
        Ok(Self {
            num_joints: r.read_u8()?,
        })
    }
}

impl SetpointRecord {
    /// Encoded length in bytes.
    pub const LEN: usize = 4 + 3 * 4 * NUM_JOINTS + 3 * 4;

    /// A record that commands nothing, used to keep the stream alive between motions.
    pub fn idle(positions: JointArray) -> Self {
        Self {
            kind: SetpointKind::Idle,
            positions,
            velocities: [0.0; NUM_JOINTS],
            accelerations: [0.0; NUM_JOINTS],
            servo_time_s: 0.0,
            lookahead_time_s: 0.0,
            gain: 0.0,
        }
    }

    /// Append the encoded record to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), RtError> {
        buf.reserve(Self::LEN);
        buf.write_i32::<BigEndian>(self.kind as i32)?;

        for v in self
            .positions
            .iter()
            .chain(self.velocities.iter())
            .chain(self.accelerations.iter())
            .chain([self.servo_time_s, self.lookahead_time_s, self.gain].iter())
        {
            buf.write_i32::<BigEndian>(scale(*v)?)?;
        }

        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RtError> {
        if bytes.len() != Self::LEN {
            return Err(RtError::WrongLength {
                expected: Self::LEN,
                found: bytes.len(),
            });
        }

        let mut r = bytes;
        let kind = SetpointKind::try_from(r.read_i32::<BigEndian>()?)?;

        let mut read_scaled = || -> Result<f64, RtError> {
            Ok(r.read_i32::<BigEndian>()? as f64 / MULT_JOINTSTATE)
        };

        let mut positions = [0.0; NUM_JOINTS];
        let mut velocities = [0.0; NUM_JOINTS];
        let mut accelerations = [0.0; NUM_JOINTS];
        for p in positions.iter_mut() {
            *p = read_scaled()?;
        }
        for v in velocities.iter_mut() {
            *v = read_scaled()?;
        }
        for a in accelerations.iter_mut() {
            *a = read_scaled()?;
        }

        Ok(Self {
            kind,
            positions,
            velocities,
            accelerations,
            servo_time_s: read_scaled()?,
            lookahead_time_s: read_scaled()?,
            gain: read_scaled()?,
        })
    }
}

impl TryFrom<i32> for SetpointKind {
    type Error = RtError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SetpointKind::Idle),
            1 => Ok(SetpointKind::Servo),
            2 => Ok(SetpointKind::Stop),
            k => Err(RtError::UnknownKind(k)),
        }
    }
}

impl ProtocolVersion {
    /// Length in bytes of one acknowledgement in this version.
    pub fn ack_len(&self) -> usize {
        match self {
            ProtocolVersion::V1 => 4 + 2 * 8 * NUM_JOINTS,
            ProtocolVersion::V3 => 4 + 4 + 3 * 8 * NUM_JOINTS,
        }
    }
}

impl RobotTelemetry {
    /// Decode one acknowledgement using the decoder selected at handshake.
    pub fn decode(version: ProtocolVersion, bytes: &[u8]) -> Result<Self, RtError> {
        if bytes.len() != version.ack_len() {
            return Err(RtError::WrongLength {
                expected: version.ack_len(),
                found: bytes.len(),
            });
        }

        let mut r = bytes;
        match version {
            ProtocolVersion::V1 => Ok(RobotTelemetry::V1(AckV1 {
                robot_mode: r.read_i32::<BigEndian>()?,
                q_actual: read_joints(&mut r)?,
                qd_actual: read_joints(&mut r)?,
            })),
            ProtocolVersion::V3 => Ok(RobotTelemetry::V3(AckV3 {
                robot_mode: r.read_i32::<BigEndian>()?,
                safety_mode: r.read_i32::<BigEndian>()?,
                q_actual: read_joints(&mut r)?,
                qd_actual: read_joints(&mut r)?,
                q_target: read_joints(&mut r)?,
            })),
        }
    }

    /// Append the encoded acknowledgement to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), RtError> {
        match self {
            RobotTelemetry::V1(ack) => {
                buf.write_i32::<BigEndian>(ack.robot_mode)?;
                write_joints(buf, &ack.q_actual)?;
                write_joints(buf, &ack.qd_actual)?;
            }
            RobotTelemetry::V3(ack) => {
                buf.write_i32::<BigEndian>(ack.robot_mode)?;
                buf.write_i32::<BigEndian>(ack.safety_mode)?;
                write_joints(buf, &ack.q_actual)?;
                write_joints(buf, &ack.qd_actual)?;
                write_joints(buf, &ack.q_target)?;
            }
        }
        Ok(())
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            RobotTelemetry::V1(_) => ProtocolVersion::V1,
            RobotTelemetry::V3(_) => ProtocolVersion::V3,
        }
    }

    pub fn q_actual(&self) -> &JointArray {
        match self {
            RobotTelemetry::V1(ack) => &ack.q_actual,
            RobotTelemetry::V3(ack) => &ack.q_actual,
        }
    }

    pub fn qd_actual(&self) -> &JointArray {
        match self {
            RobotTelemetry::V1(ack) => &ack.qd_actual,
            RobotTelemetry::V3(ack) => &ack.qd_actual,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn check_magic(magic: u32) -> Result<(), RtError> {
    if magic == HANDSHAKE_MAGIC {
        Ok(())
    } else {
        Err(RtError::BadMagic(magic))
    }
}

fn scale(value: f64) -> Result<i32, RtError> {
    let scaled = (value * MULT_JOINTSTATE).round();
    if scaled.is_finite() && scaled >= i32::MIN as f64 && scaled <= i32::MAX as f64 {
        Ok(scaled as i32)
    } else {
        Err(RtError::OutOfRange(value))
    }
}

fn read_joints<R: Read>(r: &mut R) -> Result<JointArray, RtError> {
    let mut joints = [0.0; NUM_JOINTS];
    for j in joints.iter_mut() {
        *j = r.read_f64::<BigEndian>()?;
    }
    Ok(joints)
}

fn write_joints<W: Write>(w: &mut W, joints: &JointArray) -> Result<(), RtError> {
    for j in joints.iter() {
        w.write_f64::<BigEndian>(*j)?;
    }
    Ok(())
}
