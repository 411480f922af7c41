//! Goal handles shared between the goal transport, the admission thread and the execution thread.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::debug;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    time::Duration,
};

use comms_if::goal::{FollowJointTrajectoryGoal, GoalId, GoalResult, GoalStatus};

// ------------------------------------------------------------------------------------------------
// STATICS
// ------------------------------------------------------------------------------------------------

static NEXT_GOAL_ID: AtomicU64 = AtomicU64::new(1);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A submitted goal and its status.
///
/// Clones refer to the same goal. The status only moves forward, and the first terminal status
/// wins.
#[derive(Clone)]
pub struct GoalHandle {
    inner: Arc<GoalInner>,
}

struct GoalInner {
    id: GoalId,
    goal: FollowJointTrajectoryGoal,
    status: Mutex<GoalStatus>,
    status_changed: Condvar,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl GoalHandle {
    pub fn new(goal: FollowJointTrajectoryGoal) -> Self {
        Self {
            inner: Arc::new(GoalInner {
                id: NEXT_GOAL_ID.fetch_add(1, Ordering::Relaxed),
                goal,
                status: Mutex::new(GoalStatus::Pending),
                status_changed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> GoalId {
        self.inner.id
    }

    pub fn goal(&self) -> &FollowJointTrajectoryGoal {
        &self.inner.goal
    }

    pub fn status(&self) -> GoalStatus {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// True if both handles refer to the same goal.
    pub fn same(&self, other: &GoalHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block until the goal reaches a terminal status or `timeout` elapses.
    ///
    /// Returns the terminal status, or `None` on timeout.
    pub fn wait_for_terminal(&self, timeout: Duration) -> Option<GoalStatus> {
        let status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (status, _) = self
            .inner
            .status_changed
            .wait_timeout_while(status, timeout, |s| !s.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);

        if status.is_terminal() {
            Some(status.clone())
        } else {
            None
        }
    }

    pub(crate) fn set_accepted(&self) -> bool {
        self.transition(GoalStatus::Active)
    }

    pub(crate) fn set_rejected(&self, result: GoalResult) -> bool {
        self.transition(GoalStatus::Rejected(result))
    }

    pub(crate) fn set_succeeded(&self, result: GoalResult) -> bool {
        self.transition(GoalStatus::Succeeded(result))
    }

    pub(crate) fn set_aborted(&self, result: GoalResult) -> bool {
        self.transition(GoalStatus::Aborted(result))
    }

    pub(crate) fn set_canceled(&self, result: GoalResult) -> bool {
        self.transition(GoalStatus::Canceled(result))
    }

    /// Move to `next` if allowed from the current status, returning whether it happened.
    fn transition(&self, next: GoalStatus) -> bool {
        let mut status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let allowed = match (&*status, &next) {
            (GoalStatus::Pending, GoalStatus::Succeeded(_)) => false,
            (GoalStatus::Pending, _) => true,
            (GoalStatus::Active, GoalStatus::Succeeded(_))
            | (GoalStatus::Active, GoalStatus::Aborted(_))
            | (GoalStatus::Active, GoalStatus::Canceled(_)) => true,
            _ => false,
        };

        if allowed {
            *status = next;
            self.inner.status_changed.notify_all();
        } else {
            debug!(
                "Goal {}: ignoring transition from {:?} to {:?}",
                self.inner.id, *status, next
            );
        }

        allowed
    }
}

impl fmt::Debug for GoalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::goal::JointTrajectory;
    use std::thread;

    fn handle() -> GoalHandle {
        GoalHandle::new(FollowJointTrajectoryGoal {
            trajectory: JointTrajectory {
                joint_names: vec![],
                points: vec![],
            },
        })
    }

    #[test]
    fn test_unique_ids() {
        let a = handle();
        let b = handle();
        assert_ne!(a.id(), b.id());
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_transitions() {
        let gh = handle();
        assert!(!gh.set_succeeded(GoalResult::successful()));
        assert!(gh.set_accepted());
        assert!(!gh.set_accepted());
        assert!(gh.set_aborted(GoalResult::internal("Robot safety stop")));

        // First terminal status wins
        assert!(!gh.set_canceled(GoalResult::internal("Goal cancelled by client")));
        assert_eq!(
            gh.status(),
            GoalStatus::Aborted(GoalResult::internal("Robot safety stop"))
        );

        let rejected = handle();
        assert!(rejected.set_rejected(GoalResult::new(GoalResult::INVALID_GOAL, "bad")));
        assert!(!rejected.set_accepted());
    }

    #[test]
    fn test_wait_for_terminal() {
        let gh = handle();
        assert!(gh.wait_for_terminal(Duration::from_millis(10)).is_none());

        let other = gh.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.set_accepted();
            other.set_succeeded(GoalResult::successful());
        });

        assert_eq!(
            gh.wait_for_terminal(Duration::from_secs(5)),
            Some(GoalStatus::Succeeded(GoalResult::successful()))
        );
        t.join().unwrap();
    }
}
