//! # Goal Client
//!
//! Command line client for the trajectory executable's goal server.
//!
//! ```text
//! goal_client submit params/goals/example_goal.toml --wait
//! goal_client status 3
//! goal_client cancel 3
//! ```

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use std::{
    path::Path,
    thread,
    time::Duration,
};
use structopt::StructOpt;

use comms_if::{
    goal::{FollowJointTrajectoryGoal, GoalCmd, GoalId, GoalRequest, GoalResponse},
    net::{self, zmq, SocketOptions},
};
use traj_lib::params::TrajExecParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Period between status requests while waiting for a goal.
const WAIT_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Units: milliseconds
const RESPONSE_TIMEOUT_MS: i32 = 2000;

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {
    color_eyre::install()?;

    let cmd = GoalCmd::from_args();

    let exec_params: TrajExecParams = util::params::load("traj_exec.toml")
        .wrap_err("Could not load the trajectory executable parameters")?;

    // The executable binds to all interfaces, connect to the local one
    let endpoint = exec_params.goal_endpoint.replace('*', "localhost");

    let ctx = zmq::Context::new();
    let socket = net::create_socket(
        &ctx,
        zmq::REQ,
        &SocketOptions {
            linger: 0,
            recv_timeout: RESPONSE_TIMEOUT_MS,
            send_timeout: RESPONSE_TIMEOUT_MS,
            req_correlate: true,
            req_relaxed: true,
            ..Default::default()
        },
        &endpoint,
    )
    .wrap_err_with(|| format!("Could not connect to the goal server at {}", endpoint))?;

    match cmd {
        GoalCmd::Submit { path, wait } => {
            let goal = load_goal(&path)?;
            println!(
                "Submitting {} point trajectory from {:?}",
                goal.trajectory.points.len(),
                path
            );

            let response = request(&socket, &GoalRequest::Submit(goal))?;
            println!("{:#?}", response);

            if let GoalResponse::Submitted { goal_id, status } = response {
                if wait && !status.is_terminal() {
                    wait_for_goal(&socket, goal_id)?;
                }
            }
        }
        GoalCmd::Cancel { goal_id } => {
            println!("{:#?}", request(&socket, &GoalRequest::Cancel { goal_id })?);
        }
        GoalCmd::Status { goal_id } => {
            println!("{:#?}", request(&socket, &GoalRequest::Status { goal_id })?);
        }
    }

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Load a goal from a TOML or JSON file, chosen by the file's extension.
fn load_goal(path: &Path) -> Result<FollowJointTrajectoryGoal> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => util::params::load_from(path)
            .wrap_err_with(|| format!("Could not load the goal from {:?}", path)),
        Some("json") => {
            let goal_str = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Could not read {:?}", path))?;
            serde_json::from_str(&goal_str)
                .wrap_err_with(|| format!("Could not parse the goal in {:?}", path))
        }
        ext => Err(eyre!(
            "Goal files must be .toml or .json, found {:?}",
            ext.unwrap_or("")
        )),
    }
}

fn request(socket: &zmq::Socket, req: &GoalRequest) -> Result<GoalResponse> {
    net::send_json(socket, req).wrap_err("Could not send the request")?;

    net::recv_json(socket)
        .wrap_err("Could not receive the response")?
        .ok_or_else(|| eyre!("No response from the goal server"))
}

/// Poll the goal's status until it finishes, printing each change.
fn wait_for_goal(socket: &zmq::Socket, goal_id: GoalId) -> Result<()> {
    let mut last = None;

    loop {
        thread::sleep(WAIT_POLL_PERIOD);

        let status = match request(socket, &GoalRequest::Status { goal_id })? {
            GoalResponse::Status { status, .. } => status,
            r => return Err(eyre!("Unexpected response while waiting: {:?}", r)),
        };

        if last.as_ref() != Some(&status) {
            println!("Goal {}: {:?}", goal_id, status);
        }

        if status.is_terminal() {
            return Ok(());
        }

        last = Some(status);
    }
}
