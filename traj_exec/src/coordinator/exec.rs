//! Execution thread of the goal coordinator.
//!
//! The thread waits for the admission thread to hand over a goal, then executes it with the
//! follower while holding the execution lock. Holding the lock for the whole execution is what
//! lets the admission thread wait for an interrupted goal to finish.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, error, info, warn};
use std::{
    sync::{atomic::Ordering, mpsc::Sender, Arc, PoisonError},
    thread,
    time::{Duration, Instant},
};

use comms_if::goal::GoalResult;
use util::{session, time::secs};

use super::{validate, FatalError, GoalHandle, PendingGoal, Shared};
use crate::{
    follower::{FollowerError, StreamOutcome, TrajectoryFollower},
    robot_state::RobotState,
    trajectory::Trajectory,
};

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// How waiting for a smooth trajectory to complete ended.
#[derive(Debug)]
enum Completion {
    Reached,
    Interrupted,
    TimedOut,
    Failed(FollowerError),
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Run the execution thread until the coordinator stops, returning the follower.
pub(super) fn exec_thread(
    shared: Arc<Shared>,
    mut follower: TrajectoryFollower,
    fatal_tx: Sender<FatalError>,
) -> TrajectoryFollower {
    info!("Trajectory thread started");

    let poll_timeout = secs(shared.params.goal_poll_timeout_s);

    while shared.running.load(Ordering::SeqCst) {
        let slot = shared.exec.lock().unwrap_or_else(PoisonError::into_inner);

        let (mut slot, _) = shared
            .goal_available
            .wait_timeout_while(slot, poll_timeout, |s| {
                s.pending.is_none() && shared.running.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let pending = match slot.pending.take() {
            Some(p) => p,
            None => continue,
        };

        // The lock is held until execution finishes
        execute_goal(&shared, &mut follower, pending, &fatal_tx);

        shared.has_goal.store(false, Ordering::SeqCst);
        drop(slot);
    }

    info!("Trajectory thread stopped");
    follower
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn execute_goal(
    shared: &Shared,
    follower: &mut TrajectoryFollower,
    pending: PendingGoal,
    fatal_tx: &Sender<FatalError>,
) {
    let gh = pending.handle;

    if gh.is_terminal() {
        debug!("Goal {} finished before execution, skipping", gh.id());
        return;
    }

    // The robot may have stopped since the goal was admitted
    let state = shared.store.robot_state();
    if state != RobotState::Running {
        warn!("Robot is {} before goal {} could start", state, gh.id());
        gh.set_aborted(GoalResult::internal("Robot safety stop"));
        return;
    }

    info!("Trajectory received and accepted");
    gh.set_accepted();

    info!("Translating trajectory");
    let trajectory = match validate::to_trajectory(&gh.goal().trajectory, &pending.mapping) {
        Ok(t) => t,
        Err(e) => {
            warn!("Could not translate goal {}: {}", gh.id(), e);
            gh.set_aborted(GoalResult::new(GoalResult::INVALID_GOAL, e.to_string()));
            return;
        }
    };

    let joints = shared.store.joints();
    let (trajectory, inserted) = trajectory.with_start_point(joints.q_actual, joints.qd_actual);
    if inserted {
        info!("Trajectory without t0 received, inserting t0 at current position");
    }

    let duration_s = trajectory.duration().as_secs_f64();
    info!(
        "Executing trajectory with {} points and duration of {:.3} s",
        trajectory.len(),
        duration_s
    );
    session::save(format!("goals/goal_{}.json", gh.id()), trajectory.clone());

    if shared.params.use_smooth_trajectory {
        execute_smooth(shared, follower, &gh, &trajectory, fatal_tx);
    } else {
        execute_timed(shared, follower, &gh, &trajectory, fatal_tx);
    }
}

fn execute_smooth(
    shared: &Shared,
    follower: &mut TrajectoryFollower,
    gh: &GoalHandle,
    trajectory: &Trajectory,
    fatal_tx: &Sender<FatalError>,
) {
    match follower.start_smooth_trajectory(trajectory) {
        Ok(StreamOutcome::Streaming) | Ok(StreamOutcome::Completed) => {
            match wait_for_completion(shared, follower, trajectory) {
                Completion::Reached => {
                    info!("Trajectory executed successfully");
                    gh.set_succeeded(GoalResult::successful());
                }
                Completion::Interrupted => warn!("Trajectory interrupted"),
                Completion::TimedOut => {
                    error!("Trajectory timed out or failed to reach goal!");
                    gh.set_aborted(GoalResult::internal(
                        "Robot motion timed out or failed to reach goal.",
                    ));
                }
                Completion::Failed(e) => return controller_hang(shared, gh, e, fatal_tx),
            }
        }
        Ok(StreamOutcome::Interrupted) => warn!("Trajectory interrupted"),
        Err(e) if is_invalid_goal(&e) => reject_infeasible(gh, e),
        Err(e) => return controller_hang(shared, gh, e, fatal_tx),
    }

    follower.stop();
}

fn execute_timed(
    shared: &Shared,
    follower: &mut TrajectoryFollower,
    gh: &GoalHandle,
    trajectory: &Trajectory,
    fatal_tx: &Sender<FatalError>,
) {
    match follower.start_timed_trajectory(trajectory) {
        Ok(StreamOutcome::Completed) if !shared.interrupt.is_cancelled() => {
            info!("Trajectory executed successfully");
            gh.set_succeeded(GoalResult::successful());
        }
        Ok(_) => info!("Trajectory interrupted"),
        Err(e) if is_invalid_goal(&e) => reject_infeasible(gh, e),
        Err(e) => return controller_hang(shared, gh, e, fatal_tx),
    }

    follower.stop();
}

/// Wait for the robot to settle on the last point of a smooth trajectory.
fn wait_for_completion(
    shared: &Shared,
    follower: &mut TrajectoryFollower,
    trajectory: &Trajectory,
) -> Completion {
    let params = &shared.params;
    let duration_s = trajectory.duration().as_secs_f64();
    let poll_period = secs(params.completion_poll_period_s);
    let goal_point = trajectory.last();

    let start = Instant::now();
    let timeout = deadline(start, secs(duration_s * params.timeout_factor));

    // Don't check straight away in case the trajectory ends where it starts
    let settle = deadline(start, secs(duration_s * params.settle_delay_factor));
    while Instant::now() < settle {
        if let Some(e) = follower.poll_failure() {
            return Completion::Failed(e);
        }
        if shared.interrupt.is_cancelled() {
            return Completion::Interrupted;
        }
        thread::sleep(poll_period);
    }

    loop {
        if let Some(e) = follower.poll_failure() {
            return Completion::Failed(e);
        }

        let joints = shared.store.joints();
        if joints.max_deviation(&goal_point.positions) <= params.goal_tolerance_rad
            && !joints.in_motion(params.in_motion_threshold_rads)
        {
            return Completion::Reached;
        }

        if shared.interrupt.is_cancelled() {
            return Completion::Interrupted;
        }

        if Instant::now() >= timeout {
            return Completion::TimedOut;
        }

        thread::sleep(poll_period);
    }
}

/// Abort the goal after a controller failure, raising a fatal error if configured to.
fn controller_hang(
    shared: &Shared,
    gh: &GoalHandle,
    e: FollowerError,
    fatal_tx: &Sender<FatalError>,
) {
    warn!("Robot has hung: {}", e);
    gh.set_aborted(GoalResult::internal("Robot has hung."));

    if shared.params.kill_on_hang {
        error!(
            "Preparing to kill the robot driver. Note that the driver can recover if it is \
            configured to automatically respawn."
        );
        thread::sleep(secs(shared.params.kill_grace_s));

        shared.running.store(false, Ordering::SeqCst);
        if fatal_tx.send(FatalError::ControllerHang(e)).is_err() {
            error!("Nobody is listening for fatal errors");
        }
    }
}

fn reject_infeasible(gh: &GoalHandle, e: FollowerError) {
    warn!("Goal {} cannot be followed: {}", gh.id(), e);
    gh.set_aborted(GoalResult::new(GoalResult::INVALID_GOAL, e.to_string()));
}

/// Errors caused by the goal's content rather than by the controller.
fn is_invalid_goal(e: &FollowerError) -> bool {
    matches!(
        e,
        FollowerError::Infeasible { .. }
            | FollowerError::StartDeviation { .. }
            | FollowerError::InvalidTrajectory(_)
    )
}

fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64))
}
