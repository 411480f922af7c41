//! # Simulated Robot Controller
//!
//! This binary stands in for the robot controller so the trajectory executable can be run without
//! an arm. It connects to the executable's reverse channel and answers every setpoint record with
//! an acknowledgement in which the joints have tracked the setpoint perfectly.
//!
//! Faults can be injected from the command line:
//! - `--protective-stop-after <s>` reports a protective stop after the given time.
//! - `--hang-after <s>` stops acknowledging records after the given time.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    time::Instant,
};
use structopt::StructOpt;

use comms_if::rt::{
    AckV1, AckV3, Hello, HelloAck, JointArray, ProtocolVersion, RobotTelemetry, SetpointKind,
    SetpointRecord, NUM_JOINTS,
};
use util::{
    logger::{logger_init, LevelFilter},
    session::Session,
    time::secs,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// V1 robot mode reported while running.
const V1_MODE_RUNNING: i32 = 0;

/// V1 robot mode reported while protective stopped.
const V1_MODE_PROTECTIVE_STOP: i32 = 4;

/// V3 robot mode reported while running.
const V3_MODE_RUNNING: i32 = 7;

const V3_SAFETY_NORMAL: i32 = 1;
const V3_SAFETY_PROTECTIVE_STOP: i32 = 3;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Command line arguments
#[derive(Debug, StructOpt)]
#[structopt(name = "sim_controller", about = "Simulated robot controller")]
struct Args {
    /// Report a protective stop this many seconds after connecting.
    #[structopt(long)]
    protective_stop_after: Option<f64>,

    /// Stop acknowledging setpoints this many seconds after connecting.
    #[structopt(long)]
    hang_after: Option<f64>,
}

/// Parameters for the simulated controller
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct SimControllerParams {
    /// Address of the executable's reverse channel, `ip:port`.
    reverse_endpoint: String,

    /// Major protocol version announced in the handshake, selects the acknowledgement layout.
    protocol_major: u8,

    /// Joint positions before the first setpoint.
    ///
    /// Units: radians
    initial_positions_rad: JointArray,
}

/// Simulated arm
struct SimArm {
    version: ProtocolVersion,
    q: JointArray,
    qd: JointArray,
    q_target: JointArray,
    protective_stop: bool,
}

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    // ---- EARLY INITIALISATION ----

    let args = Args::from_args();

    let session =
        Session::new("sim_controller", "sessions").wrap_err("Failed to create the session")?;
    logger_init(LevelFilter::Info, &session).wrap_err("Failed to initialise logging")?;

    info!("Simulated Robot Controller\n");

    // ---- LOAD PARAMETERS ----

    let params: SimControllerParams = util::params::load("sim_controller.toml")
        .wrap_err("Could not load the simulated controller parameters")?;

    info!("Parameters loaded");

    // ---- CONNECT ----

    let mut stream = TcpStream::connect(&params.reverse_endpoint).wrap_err_with(|| {
        format!(
            "Could not connect to the reverse channel at {}",
            params.reverse_endpoint
        )
    })?;
    stream.set_nodelay(true)?;

    let hello = Hello {
        major: params.protocol_major,
        minor: 0,
    };
    hello
        .write_to(&mut stream)
        .wrap_err("Could not send the handshake")?;
    let ack = HelloAck::read_from(&mut stream).wrap_err("Could not read the handshake reply")?;

    if ack.num_joints as usize != NUM_JOINTS {
        return Err(eyre!(
            "The driver expects {} joints, the simulated arm has {}",
            ack.num_joints,
            NUM_JOINTS
        ));
    }

    info!(
        "Connected to {} using the {:?} protocol",
        params.reverse_endpoint,
        hello.protocol_version()
    );

    // ---- MAIN LOOP ----

    let mut arm = SimArm::new(hello.protocol_version(), params.initial_positions_rad);
    let connected_at = Instant::now();
    let mut record_buf = [0u8; SetpointRecord::LEN];
    let mut ack_buf = Vec::with_capacity(hello.protocol_version().ack_len());
    let mut hung = false;

    loop {
        match stream.read_exact(&mut record_buf) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("The driver closed the connection");
                break;
            }
            Err(e) => return Err(e).wrap_err("Could not read a setpoint record"),
        }

        let record =
            SetpointRecord::decode(&record_buf).wrap_err("Received an invalid setpoint record")?;

        if let Some(t) = args.protective_stop_after {
            if !arm.protective_stop && connected_at.elapsed() >= secs(t) {
                warn!("Injecting a protective stop");
                arm.protective_stop = true;
            }
        }

        if let Some(t) = args.hang_after {
            if !hung && connected_at.elapsed() >= secs(t) {
                warn!("Injecting a hang, setpoints will no longer be acknowledged");
                hung = true;
            }
        }

        // Keep reading so the driver notices the hang rather than a closed connection
        if hung {
            continue;
        }

        arm.apply(&record);

        ack_buf.clear();
        arm.telemetry().encode(&mut ack_buf)?;
        stream
            .write_all(&ack_buf)
            .wrap_err("Could not send an acknowledgement")?;
    }

    session.exit();

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SimControllerParams {
    fn default() -> Self {
        Self {
            reverse_endpoint: "127.0.0.1:50001".into(),
            protocol_major: 3,
            initial_positions_rad: [0.0; NUM_JOINTS],
        }
    }
}

impl SimArm {
    fn new(version: ProtocolVersion, q: JointArray) -> Self {
        Self {
            version,
            q,
            qd: [0.0; NUM_JOINTS],
            q_target: q,
            protective_stop: false,
        }
    }

    /// Track the record perfectly, a stopped arm ignores servo records.
    fn apply(&mut self, record: &SetpointRecord) {
        match record.kind {
            SetpointKind::Servo if !self.protective_stop => {
                self.q = record.positions;
                self.qd = record.velocities;
                self.q_target = record.positions;
            }
            SetpointKind::Servo => self.qd = [0.0; NUM_JOINTS],
            SetpointKind::Stop => {
                debug!("Stop record received");
                self.qd = [0.0; NUM_JOINTS];
                self.q_target = self.q;
            }
            SetpointKind::Idle => self.qd = [0.0; NUM_JOINTS],
        }
    }

    fn telemetry(&self) -> RobotTelemetry {
        match self.version {
            ProtocolVersion::V1 => RobotTelemetry::V1(AckV1 {
                robot_mode: if self.protective_stop {
                    V1_MODE_PROTECTIVE_STOP
                } else {
                    V1_MODE_RUNNING
                },
                q_actual: self.q,
                qd_actual: self.qd,
            }),
            ProtocolVersion::V3 => RobotTelemetry::V3(AckV3 {
                robot_mode: V3_MODE_RUNNING,
                safety_mode: if self.protective_stop {
                    V3_SAFETY_PROTECTIVE_STOP
                } else {
                    V3_SAFETY_NORMAL
                },
                q_actual: self.q,
                qd_actual: self.qd,
                q_target: self.q_target,
            }),
        }
    }
}
