//! # Goal coordinator
//!
//! The coordinator admits trajectory goals, executes them one at a time with the
//! [`TrajectoryFollower`] and reports each goal's outcome through its [`GoalHandle`].
//!
//! Two threads are involved:
//! - The admission thread, owned by the caller, which calls [`GoalCoordinator::on_goal`],
//!   [`GoalCoordinator::on_cancel`] and [`GoalCoordinator::on_robot_state_change`].
//! - The execution thread, spawned by [`GoalCoordinator::start`], which owns the follower.
//!
//! A single execution lock guards the goal slot and is held by the execution thread for the whole
//! of a goal's execution. The admission thread uses a try-then-force pattern on it: failing to
//! take the lock means a goal is executing, so the interrupt flag is set and the lock is then
//! waited for. The execution thread only observes the interrupt flag at control tick boundaries or
//! while polling for completion.
//!
//! Goal lifecycle:
//!
//! ```text
//! Pending -> Rejected | Active -> Succeeded | Aborted | Canceled
//! ```

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod exec;
mod goal;
mod params;
pub mod validate;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::{self, JoinHandle},
};

use comms_if::{goal::GoalResult, rt::NUM_JOINTS};
use util::time::secs;

use crate::{
    follower::{CancelToken, FollowerError, TrajectoryFollower},
    robot_state::{RobotState, RobotStateStore},
};
use validate::JointMapping;

pub use goal::GoalHandle;
pub use params::CoordinatorParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Admits goals and executes them with the follower.
pub struct GoalCoordinator {
    shared: Arc<Shared>,

    /// Held here while the execution thread isn't running.
    follower: Option<TrajectoryFollower>,

    exec_thread: Option<JoinHandle<TrajectoryFollower>>,
}

/// State shared between the admission and execution threads.
pub(crate) struct Shared {
    params: CoordinatorParams,

    /// Joint names in the controller's order.
    joint_names: Vec<String>,

    store: Arc<RobotStateStore>,
    interrupt: CancelToken,

    running: AtomicBool,

    /// A goal is pending or executing.
    has_goal: AtomicBool,

    /// The execution lock.
    exec: Mutex<ExecSlot>,
    goal_available: Condvar,

    /// The most recently admitted goal.
    current: Mutex<Option<GoalHandle>>,
}

/// Single-slot handover from the admission thread to the execution thread.
#[derive(Default)]
pub(crate) struct ExecSlot {
    pending: Option<PendingGoal>,
}

/// An admitted goal waiting for the execution thread.
pub(crate) struct PendingGoal {
    handle: GoalHandle,
    mapping: JointMapping,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("The coordinator is already running")]
    AlreadyRunning,

    #[error("Expected {expected} joint names, found {found}")]
    WrongJointCount { expected: usize, found: usize },

    #[error("Could not spawn the execution thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// Errors the hosting process should treat as unrecoverable.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("The robot controller hung: {0}")]
    ControllerHang(FollowerError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl GoalCoordinator {
    /// Create a coordinator driving the given follower.
    ///
    /// `joint_names` lists the controller's joints in the controller's order.
    pub fn new(
        params: CoordinatorParams,
        joint_names: Vec<String>,
        follower: TrajectoryFollower,
    ) -> Result<Self, CoordinatorError> {
        if joint_names.len() != NUM_JOINTS {
            return Err(CoordinatorError::WrongJointCount {
                expected: NUM_JOINTS,
                found: joint_names.len(),
            });
        }

        if params.use_smooth_trajectory {
            info!("Robot will execute smooth trajectories");
        } else {
            warn!("Robot will stop at each trajectory point");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                params,
                joint_names,
                store: follower.store(),
                interrupt: follower.interrupt_token(),
                running: AtomicBool::new(false),
                has_goal: AtomicBool::new(false),
                exec: Mutex::new(ExecSlot::default()),
                goal_available: Condvar::new(),
                current: Mutex::new(None),
            }),
            follower: Some(follower),
            exec_thread: None,
        })
    }

    /// Start the execution thread.
    ///
    /// Returns the receiver on which fatal errors are reported.
    pub fn start(&mut self) -> Result<Receiver<FatalError>, CoordinatorError> {
        let follower = self
            .follower
            .take()
            .ok_or(CoordinatorError::AlreadyRunning)?;

        let (fatal_tx, fatal_rx) = channel();

        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let exec_thread = thread::Builder::new()
            .name("traj_exec".into())
            .spawn(move || exec::exec_thread(shared, follower, fatal_tx));

        match exec_thread {
            Ok(jh) => {
                self.exec_thread = Some(jh);
                info!("Goal coordinator started");
                Ok(fatal_rx)
            }
            Err(e) => {
                // The follower was moved into the closure and is lost with it
                self.shared.running.store(false, Ordering::SeqCst);
                Err(CoordinatorError::ThreadSpawn(e))
            }
        }
    }

    /// True while the execution thread is accepting goals.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The most recently admitted goal.
    pub fn current_goal(&self) -> Option<GoalHandle> {
        self.shared.current()
    }

    /// Stop the execution thread, interrupting any goal in progress, and return the follower.
    pub fn shutdown(&mut self) -> Option<TrajectoryFollower> {
        if let Some(jh) = self.exec_thread.take() {
            info!("Stopping the goal coordinator");

            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.interrupt.cancel();
            self.shared.goal_available.notify_all();

            match jh.join() {
                Ok(follower) => self.follower = Some(follower),
                Err(_) => warn!("The execution thread panicked"),
            }

            if let Some(gh) = self.shared.current() {
                gh.set_aborted(GoalResult::internal("Driver shutting down"));
            }
            if let Some(p) = self.shared.lock_exec().pending.take() {
                p.handle
                    .set_aborted(GoalResult::internal("Driver shutting down"));
            }
        }

        self.follower.take()
    }

    /// Validate a new goal and hand it to the execution thread, preempting any current goal.
    ///
    /// Goals that fail validation are rejected before this returns.
    pub fn on_goal(&self, gh: &GoalHandle) {
        info!("Received new goal {}", gh.id());

        let result = self
            .validate(gh)
            .and_then(|mapping| self.try_execute(gh, mapping));

        if let Err(res) = result {
            warn!("Goal error: {}", res.error_string);
            gh.set_rejected(res);
        }
    }

    /// Cancel a goal, waiting for its execution to stop if it is the current goal.
    pub fn on_cancel(&self, gh: &GoalHandle) {
        if gh.is_terminal() {
            info!("Goal {} is already finished, ignoring cancel", gh.id());
            return;
        }

        let is_current = self
            .shared
            .current()
            .map_or(false, |current| current.same(gh));

        if is_current {
            self.shared.interrupt.cancel();
        }

        // Wait for the goal to be interrupted
        let mut slot = self.shared.lock_exec();
        if slot.pending.as_ref().map_or(false, |p| p.handle.same(gh)) {
            slot.pending = None;
            self.shared.has_goal.store(false, Ordering::SeqCst);
        }

        warn!(
            "Trajectory has been canceled by client. Trajectory execution may have timed out. \
            Check to make sure that the speed slider is set to 100% on the pendant."
        );
        gh.set_canceled(GoalResult::internal("Goal cancelled by client"));
    }

    /// React to a change of the robot's safety state.
    ///
    /// Leaving `Running` while a goal executes interrupts it and aborts it with a safety stop.
    pub fn on_robot_state_change(&self, state: RobotState) {
        self.shared.store.set_robot_state(state);

        if state == RobotState::Running {
            return;
        }

        // Don't retry interrupts
        if self.shared.interrupt.is_cancelled() || !self.shared.has_goal.load(Ordering::SeqCst) {
            return;
        }

        // On successful lock no goal is executing, a pending one is checked before it starts
        match self.shared.exec.try_lock() {
            Ok(_) | Err(TryLockError::Poisoned(_)) => return,
            Err(TryLockError::WouldBlock) => (),
        }

        warn!("Robot is {}, interrupting the current trajectory", state);
        self.shared.interrupt.cancel();

        let _slot = self.shared.lock_exec();
        if let Some(gh) = self.shared.current() {
            gh.set_aborted(GoalResult::internal("Robot safety stop"));
        }
    }

    fn validate(&self, gh: &GoalHandle) -> Result<JointMapping, GoalResult> {
        let trajectory = &gh.goal().trajectory;

        validate::validate_state(self.shared.store.robot_state())?;
        let mapping = validate::validate_joints(&trajectory.joint_names, &self.shared.joint_names)?;
        validate::validate_trajectory(trajectory, self.shared.params.max_velocity_rads)?;

        Ok(mapping)
    }

    fn try_execute(&self, gh: &GoalHandle, mapping: JointMapping) -> Result<(), GoalResult> {
        if !self.is_running() {
            return Err(GoalResult::internal("Internal error"));
        }

        let mut slot = match self.shared.exec.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) if self.shared.has_goal.load(Ordering::SeqCst) => {
                self.shared.interrupt.cancel();

                if let Some(current) = self.shared.current() {
                    info!("Preempting goal {} with goal {}", current.id(), gh.id());
                    current.set_aborted(GoalResult::internal("Received another trajectory"));
                }

                let slot = self.shared.lock_exec();
                thread::sleep(secs(self.shared.params.preempt_settle_s));
                slot
            }
            Err(TryLockError::WouldBlock) => self.shared.lock_exec(),
        };

        // Locked here
        if let Some(previous) = slot.pending.take() {
            previous
                .handle
                .set_aborted(GoalResult::internal("Received another trajectory"));
        }

        *self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(gh.clone());

        slot.pending = Some(PendingGoal {
            handle: gh.clone(),
            mapping,
        });
        self.shared.interrupt.reset();
        self.shared.has_goal.store(true, Ordering::SeqCst);

        drop(slot);
        self.shared.goal_available.notify_one();

        Ok(())
    }
}

impl Drop for GoalCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn current(&self) -> Option<GoalHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_exec(&self) -> MutexGuard<'_, ExecSlot> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
