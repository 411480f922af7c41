//! # Trajectory Executable
//!
//! This executable drives the robot arm. It accepts trajectory goals on the goal socket and
//! streams them to the robot controller over the reverse setpoint channel.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use log::{info, warn};
use std::{
    sync::{mpsc::TryRecvError, Arc},
    time::Instant,
};

use comms_if::net::zmq;
use traj_lib::{
    coordinator::{CoordinatorParams, GoalCoordinator},
    follower::{channel::TcpControllerListener, FollowerParams, TrajectoryFollower},
    goal_server::GoalServer,
    params::TrajExecParams,
    robot_state::RobotStateStore,
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
    time::secs,
};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Longest time the admission loop blocks waiting for a goal request.
///
/// Units: milliseconds
const GOAL_RECV_TIMEOUT_MS: i32 = 10;

// -----------------------------------------------------------------------------------------------
// MAIN
// -----------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    // ---- EARLY INITIALISATION ----

    color_eyre::install()?;

    // Initialise session
    let session = Session::new("traj_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Trace, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Trajectory Executable\n");
    info!("Running on: {}", host::get_hostname());
    info!("Session directory: {:?}\n", session.session_root);

    info!("Initialising...");

    // ---- LOAD PARAMETERS ----

    let exec_params: TrajExecParams = util::params::load("traj_exec.toml")
        .wrap_err("Could not load the trajectory executable parameters")?;
    let follower_params: FollowerParams =
        util::params::load("follower.toml").wrap_err("Could not load the follower parameters")?;
    let coordinator_params: CoordinatorParams = util::params::load("coordinator.toml")
        .wrap_err("Could not load the coordinator parameters")?;

    session.save("params/traj_exec.json", exec_params.clone());
    session.save("params/follower.json", follower_params.clone());
    session.save("params/coordinator.json", coordinator_params.clone());

    info!("Parameters loaded");

    // ---- INIT FOLLOWER ----

    let listener =
        TcpControllerListener::bind(&follower_params.reverse_ip, follower_params.reverse_port)
            .wrap_err("Could not bind the reverse setpoint channel")?;
    info!(
        "Reverse channel listening on {}",
        listener
            .local_addr()
            .wrap_err("Could not read the reverse channel address")?
    );

    let mut follower = TrajectoryFollower::new(
        follower_params,
        Box::new(listener),
        Arc::new(RobotStateStore::new()),
    );
    let state_events = follower
        .state_events()
        .ok_or_else(|| eyre!("The follower's state events were already taken"))?;
    let store = follower.store();

    follower
        .start()
        .wrap_err("Could not start the trajectory follower")?;

    // ---- INIT COORDINATOR ----

    let mut coordinator =
        GoalCoordinator::new(coordinator_params, exec_params.joint_names.clone(), follower)
            .wrap_err("Could not create the goal coordinator")?;
    let fatal_rx = coordinator
        .start()
        .wrap_err("Could not start the goal coordinator")?;

    // ---- INIT GOAL SERVER ----

    let zmq_ctx = zmq::Context::new();
    let mut goal_server = GoalServer::new(&zmq_ctx, &exec_params.goal_endpoint, GOAL_RECV_TIMEOUT_MS)
        .wrap_err("Could not start the goal server")?;

    info!("Goal server bound to {}", exec_params.goal_endpoint);
    info!("Initialisation complete, waiting for goals\n");

    // ---- MAIN LOOP ----

    let state_log_period = secs(exec_params.state_log_period_s);
    let mut last_state_log = Instant::now();

    let exit_result = loop {
        if let Err(e) = goal_server.serve_once(&coordinator) {
            warn!("Goal server error: {}", e);
        }

        // Robot state changes are only ever handled on this thread
        loop {
            match state_events.try_recv() {
                Ok(state) => {
                    info!("Robot state is now {}", state);
                    coordinator.on_robot_state_change(state);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Robot state events have stopped");
                    break;
                }
            }
        }

        if last_state_log.elapsed() >= state_log_period {
            let joints = store.joints();
            info!(
                "Robot state: {}, q_actual: {:?}",
                store.robot_state(),
                joints.q_actual
            );
            last_state_log = Instant::now();
        }

        match fatal_rx.try_recv() {
            Ok(fatal) => break Err(fatal).wrap_err("Fatal error in the goal coordinator"),
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                break Err(eyre!("The goal coordinator stopped unexpectedly"))
            }
        }
    };

    // ---- SHUTDOWN ----

    if let Some(mut follower) = coordinator.shutdown() {
        follower.stop();
        follower.shutdown();
    }

    session.exit();

    exit_result
}
