//! # Trajectory follower
//!
//! The follower converts a [`Trajectory`] into a fixed-rate stream of setpoints sent to the robot
//! controller over the [`SetpointChannel`](channel::SetpointChannel).
//!
//! The stream itself runs on a dedicated control thread spawned by
//! [`TrajectoryFollower::start`]. The follower talks to that thread through command and event
//! channels, each stream being tagged with a session id so events from an old stream are never
//! mistaken for those of the current one. The only state shared with the control thread is the
//! interrupt [`CancelToken`], the connected flag and the [`RobotStateStore`].
//!
//! Two streaming modes are provided:
//! - [`TrajectoryFollower::start_smooth_trajectory`] blends velocities across waypoints and returns
//!   as soon as the stream is running, completion being detected by the caller.
//! - [`TrajectoryFollower::start_timed_trajectory`] moves straight between waypoints, stopping at
//!   each one, and returns once the last one is reached.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod channel;
mod control;
mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel as mpsc_channel, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use comms_if::rt::{JointArray, NUM_JOINTS};
use util::time::secs;

use crate::{
    interp::{self, Infeasible},
    robot_state::{RobotState, RobotStateStore},
    trajectory::{Trajectory, TrajectoryError, TrajectoryPoint},
};
use channel::{ChannelError, ControllerListener};
use control::{ControlCmd, ControlEvent, ControlLoop};

pub use params::FollowerParams;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Slack applied to the minimum duration of a single-shot move.
const EXECUTE_DURATION_MARGIN: f64 = 1.1;

/// Shortest time `start_smooth_trajectory` waits for the first acknowledgement.
const MIN_START_TIMEOUT: Duration = Duration::from_secs(1);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Cooperative cancellation flag, checked by the control thread once per tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

/// Streams trajectories to the robot controller.
pub struct TrajectoryFollower {
    params: FollowerParams,
    store: Arc<RobotStateStore>,
    interrupt: CancelToken,
    connected: Arc<AtomicBool>,

    /// Held here while the control thread isn't running.
    listener: Option<Box<dyn ControllerListener>>,

    control: Option<ControlHandle>,

    state_tx: Sender<RobotState>,
    state_rx: Option<Receiver<RobotState>>,

    /// Id of the most recently started stream.
    session: u64,
}

/// Channels to the running control thread.
struct ControlHandle {
    cmd_tx: Sender<ControlCmd>,
    event_rx: Receiver<ControlEvent>,
    join_handle: JoinHandle<Box<dyn ControllerListener>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// How a stream request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The stream is running (smooth mode).
    Streaming,

    /// The last waypoint was reached and is being held (timed mode).
    Completed,

    /// The stream was abandoned because the interrupt token was set.
    Interrupted,
}

#[derive(Debug, thiserror::Error)]
pub enum FollowerError {
    #[error("The follower has not been started")]
    NotStarted,

    #[error("The follower is already started")]
    AlreadyStarted,

    #[error("No robot controller is connected")]
    NotConnected,

    #[error("No robot controller connected within {0:?}")]
    ConnectTimeout(Duration),

    #[error("The robot controller hung: {0}")]
    ControllerHang(ChannelError),

    #[error(
        "Segment {segment} of the trajectory moves joint {joint} by {displacement_rad:.4} rad in \
        {duration_s:.4} s, which exceeds the velocity or acceleration limits"
    )]
    Infeasible {
        segment: usize,
        joint: usize,
        displacement_rad: f64,
        duration_s: f64,
    },

    #[error(
        "The trajectory starts {deviation_rad:.4} rad from the robot's actual position, more than \
        the allowed {max_rad:.4} rad"
    )]
    StartDeviation { deviation_rad: f64, max_rad: f64 },

    #[error("Invalid trajectory: {0}")]
    InvalidTrajectory(#[from] TrajectoryError),

    #[error("The control thread has exited")]
    ThreadExited,

    #[error("Could not spawn the control thread: {0}")]
    ThreadSpawn(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl From<Infeasible> for FollowerError {
    fn from(i: Infeasible) -> Self {
        FollowerError::Infeasible {
            segment: i.segment,
            joint: i.joint,
            displacement_rad: i.displacement_rad,
            duration_s: i.duration_s,
        }
    }
}

impl TrajectoryFollower {
    /// Create a new follower, nothing is started until [`TrajectoryFollower::start`].
    pub fn new(
        params: FollowerParams,
        listener: Box<dyn ControllerListener>,
        store: Arc<RobotStateStore>,
    ) -> Self {
        let (state_tx, state_rx) = mpsc_channel();

        Self {
            params,
            store,
            interrupt: CancelToken::new(),
            connected: Arc::new(AtomicBool::new(false)),
            listener: Some(listener),
            control: None,
            state_tx,
            state_rx: Some(state_rx),
            session: 0,
        }
    }

    pub fn params(&self) -> &FollowerParams {
        &self.params
    }

    /// The store the control thread writes telemetry into.
    pub fn store(&self) -> Arc<RobotStateStore> {
        self.store.clone()
    }

    /// Take the receiver of robot state changes.
    ///
    /// Only the first call returns `Some`.
    pub fn state_events(&mut self) -> Option<Receiver<RobotState>> {
        self.state_rx.take()
    }

    /// A handle to the follower's interrupt flag.
    pub fn interrupt_token(&self) -> CancelToken {
        self.interrupt.clone()
    }

    /// Request that the current stream is abandoned at the next control tick.
    ///
    /// This doesn't stop the robot, [`TrajectoryFollower::stop`] must also be called.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Start the control thread and wait for the controller to connect.
    pub fn start(&mut self) -> Result<(), FollowerError> {
        if self.control.is_some() {
            return Err(FollowerError::AlreadyStarted);
        }

        let listener = self.listener.take().ok_or(FollowerError::AlreadyStarted)?;

        let (cmd_tx, cmd_rx) = mpsc_channel();
        let (event_tx, event_rx) = mpsc_channel();

        let ctrl = ControlLoop {
            params: self.params.clone(),
            listener,
            store: self.store.clone(),
            interrupt: self.interrupt.clone(),
            connected: self.connected.clone(),
            cmd_rx,
            event_tx,
            state_tx: self.state_tx.clone(),
        };

        let join_handle = thread::Builder::new()
            .name("follower_control".into())
            .spawn(move || control::run(ctrl))
            .map_err(FollowerError::ThreadSpawn)?;

        self.control = Some(ControlHandle {
            cmd_tx,
            event_rx,
            join_handle,
        });

        info!("Waiting for the robot controller to connect");

        let timeout = secs(self.params.connect_timeout_s);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = remaining_until(deadline, timeout);
            match self.next_event(remaining) {
                Ok(Some(ControlEvent::Connected)) => break,
                Ok(Some(e)) => debug!("Ignoring {:?} while connecting", e),
                Ok(None) => {
                    self.shutdown();
                    return Err(FollowerError::ConnectTimeout(timeout));
                }
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }

        info!("Trajectory follower started");
        Ok(())
    }

    /// Stream the trajectory with velocity blending across waypoints.
    ///
    /// Returns once the first setpoint has been acknowledged. Later failures are reported by
    /// [`TrajectoryFollower::poll_failure`].
    pub fn start_smooth_trajectory(
        &mut self,
        trajectory: &Trajectory,
    ) -> Result<StreamOutcome, FollowerError> {
        let id = self.begin_stream(trajectory, true)?;

        let timeout = secs(10.0 * (self.params.servoj_time_s + self.params.hang_timeout_s))
            .max(MIN_START_TIMEOUT);
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let remaining = remaining_until(deadline, timeout);
            match self.next_event(remaining)? {
                Some(ControlEvent::Started(i)) if i == id => return Ok(StreamOutcome::Streaming),
                Some(ControlEvent::Interrupted(i)) | Some(ControlEvent::Stopped(i)) if i == id => {
                    return Ok(StreamOutcome::Interrupted)
                }
                Some(ControlEvent::Failed(i, e)) if i == id => {
                    return Err(FollowerError::ControllerHang(e))
                }
                Some(e) => debug!("Ignoring stale event {:?}", e),
                None => return Err(FollowerError::ControllerHang(ChannelError::Timeout)),
            }
        }
    }

    /// Stream the trajectory as rest-to-rest moves between consecutive waypoints.
    ///
    /// Blocks until the last waypoint is reached or the stream is interrupted.
    pub fn start_timed_trajectory(
        &mut self,
        trajectory: &Trajectory,
    ) -> Result<StreamOutcome, FollowerError> {
        let id = self.begin_stream(trajectory, false)?;

        let control = self.control.as_ref().ok_or(FollowerError::NotStarted)?;
        loop {
            match control.event_rx.recv() {
                Ok(ControlEvent::Reached(i)) if i == id => return Ok(StreamOutcome::Completed),
                Ok(ControlEvent::Interrupted(i)) | Ok(ControlEvent::Stopped(i)) if i == id => {
                    return Ok(StreamOutcome::Interrupted)
                }
                Ok(ControlEvent::Failed(i, e)) if i == id => {
                    return Err(FollowerError::ControllerHang(e))
                }
                Ok(e) => debug!("Ignoring stale event {:?}", e),
                Err(_) => return Err(FollowerError::ThreadExited),
            }
        }
    }

    /// Move to a single target without velocity blending.
    ///
    /// The move starts at the actual position and takes the shortest time the velocity and
    /// acceleration limits allow, with some margin.
    pub fn execute(&mut self, positions: &JointArray) -> Result<StreamOutcome, FollowerError> {
        let joints = self.store.joints();

        let duration_s = (0..NUM_JOINTS)
            .map(|j| {
                interp::min_move_duration(
                    positions[j] - joints.q_actual[j],
                    self.params.max_velocity_rads,
                    self.params.max_acceleration_rads2,
                )
            })
            .fold(0.0, f64::max)
            * EXECUTE_DURATION_MARGIN;

        let trajectory = if duration_s > 0.0 {
            Trajectory::new(vec![
                TrajectoryPoint::new(joints.q_actual, [0.0; NUM_JOINTS], Duration::from_secs(0)),
                TrajectoryPoint::new(*positions, [0.0; NUM_JOINTS], secs(duration_s)),
            ])?
        } else {
            Trajectory::hold(*positions)
        };

        self.start_timed_trajectory(&trajectory)
    }

    /// End the current stream and command the robot to decelerate to rest.
    ///
    /// Calling this when nothing is streaming just sends another stop.
    pub fn stop(&self) {
        if let Some(ref control) = self.control {
            if control.cmd_tx.send(ControlCmd::Stop).is_err() {
                warn!("Could not send stop, the control thread has exited");
            }
        }
    }

    /// Check for a failure of the current stream since it started.
    pub fn poll_failure(&mut self) -> Option<FollowerError> {
        let control = self.control.as_ref()?;

        loop {
            match control.event_rx.try_recv() {
                Ok(ControlEvent::Failed(i, e)) if i == self.session => {
                    return Some(FollowerError::ControllerHang(e))
                }
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(FollowerError::ThreadExited),
            }
        }
    }

    /// Stop the control thread, the follower can be started again afterwards.
    pub fn shutdown(&mut self) {
        if let Some(control) = self.control.take() {
            control.cmd_tx.send(ControlCmd::Shutdown).ok();

            match control.join_handle.join() {
                Ok(listener) => self.listener = Some(listener),
                Err(_) => warn!("The control thread panicked, the listener is lost"),
            }
        }
    }

    /// Checks common to both streaming modes, then hands the trajectory to the control thread.
    fn begin_stream(&mut self, trajectory: &Trajectory, smooth: bool) -> Result<u64, FollowerError> {
        if self.control.is_none() {
            return Err(FollowerError::NotStarted);
        }
        if !self.is_connected() {
            return Err(FollowerError::NotConnected);
        }

        interp::check_feasible(
            trajectory,
            smooth,
            self.params.max_velocity_rads,
            self.params.max_acceleration_rads2,
        )?;

        let deviation_rad = self
            .store
            .joints()
            .max_deviation(&trajectory.first().positions);
        if deviation_rad > self.params.max_start_deviation_rad {
            return Err(FollowerError::StartDeviation {
                deviation_rad,
                max_rad: self.params.max_start_deviation_rad,
            });
        }

        let control = self.control.as_ref().ok_or(FollowerError::NotStarted)?;

        // Anything left over belongs to earlier streams
        while let Ok(e) = control.event_rx.try_recv() {
            debug!("Discarding stale event {:?}", e);
        }

        self.session += 1;
        control
            .cmd_tx
            .send(ControlCmd::Stream {
                id: self.session,
                trajectory: trajectory.clone(),
                smooth,
            })
            .map_err(|_| FollowerError::ThreadExited)?;

        Ok(self.session)
    }

    /// Wait up to `timeout` for the next event from the control thread.
    fn next_event(&self, timeout: Duration) -> Result<Option<ControlEvent>, FollowerError> {
        let control = self.control.as_ref().ok_or(FollowerError::NotStarted)?;

        match control.event_rx.recv_timeout(timeout) {
            Ok(e) => Ok(Some(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FollowerError::ThreadExited),
        }
    }
}

impl Drop for TrajectoryFollower {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Time left before `deadline`, a deadline that overflowed waits for the full `timeout`.
fn remaining_until(deadline: Option<Instant>, timeout: Duration) -> Duration {
    match deadline {
        Some(d) => d.saturating_duration_since(Instant::now()),
        None => timeout,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use channel::SetpointChannel;
    use comms_if::rt::{AckV3, ProtocolVersion, RobotTelemetry, SetpointKind, SetpointRecord};
    use std::sync::Mutex;

    /// A controller which tracks perfectly and records every setpoint it gets.
    struct EchoController {
        q: JointArray,
        records: Arc<Mutex<Vec<SetpointRecord>>>,
    }

    struct OnceListener(Option<Box<dyn SetpointChannel>>);

    impl SetpointChannel for EchoController {
        fn protocol_version(&self) -> ProtocolVersion {
            ProtocolVersion::V3
        }

        fn send_setpoint(&mut self, record: &SetpointRecord) -> Result<(), ChannelError> {
            if record.kind == SetpointKind::Servo {
                self.q = record.positions;
            }
            self.records.lock().unwrap().push(*record);
            Ok(())
        }

        fn recv_ack(&mut self, _timeout: Duration) -> Result<RobotTelemetry, ChannelError> {
            Ok(RobotTelemetry::V3(AckV3 {
                robot_mode: 7,
                safety_mode: 1,
                q_actual: self.q,
                qd_actual: [0.0; NUM_JOINTS],
                q_target: self.q,
            }))
        }
    }

    impl ControllerListener for OnceListener {
        fn accept(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Box<dyn SetpointChannel>>, ChannelError> {
            match self.0.take() {
                Some(c) => Ok(Some(c)),
                None => {
                    thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    fn follower(connect: bool) -> (TrajectoryFollower, Arc<Mutex<Vec<SetpointRecord>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let channel: Option<Box<dyn SetpointChannel>> = if connect {
            Some(Box::new(EchoController {
                q: [0.0; NUM_JOINTS],
                records: records.clone(),
            }))
        } else {
            None
        };

        let params = FollowerParams {
            connect_timeout_s: 0.2,
            ..Default::default()
        };

        (
            TrajectoryFollower::new(
                params,
                Box::new(OnceListener(channel)),
                Arc::new(RobotStateStore::new()),
            ),
            records,
        )
    }

    #[test]
    fn test_not_started() {
        let (mut f, _) = follower(true);
        assert!(matches!(
            f.start_smooth_trajectory(&Trajectory::hold([0.0; NUM_JOINTS])),
            Err(FollowerError::NotStarted)
        ));
    }

    #[test]
    fn test_connect_timeout_and_restart() {
        let (mut f, _) = follower(false);
        assert!(matches!(f.start(), Err(FollowerError::ConnectTimeout(_))));

        // The listener is recovered so start can be tried again
        assert!(matches!(f.start(), Err(FollowerError::ConnectTimeout(_))));
    }

    #[test]
    fn test_state_events() {
        let (mut f, _) = follower(true);
        let states = f.state_events().unwrap();
        assert!(f.state_events().is_none());

        f.start().unwrap();

        assert_eq!(
            states.recv_timeout(Duration::from_secs(1)).unwrap(),
            RobotState::Running
        );
    }

    #[test]
    fn test_execute_reaches_target() {
        let (mut f, records) = follower(true);
        f.start().unwrap();

        let target = [0.01, 0.02, 0.0, -0.01, 0.0, 0.0];
        assert_eq!(f.execute(&target).unwrap(), StreamOutcome::Completed);
        f.stop();
        f.shutdown();

        let records = records.lock().unwrap();
        let last_servo = records
            .iter()
            .rev()
            .find(|r| r.kind == SetpointKind::Servo)
            .unwrap();
        assert_eq!(last_servo.positions, target);
        assert_eq!(records.last().unwrap().kind, SetpointKind::Stop);
    }

    #[test]
    fn test_start_deviation_rejected() {
        let (mut f, _) = follower(true);
        f.start().unwrap();

        let far = Trajectory::new(vec![
            TrajectoryPoint::new([1.0; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs(0)),
            TrajectoryPoint::new([1.0; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs(1)),
        ])
        .unwrap();

        assert!(matches!(
            f.start_smooth_trajectory(&far),
            Err(FollowerError::StartDeviation { .. })
        ));
    }

    #[test]
    fn test_interrupt_ends_stream() {
        let (mut f, _) = follower(true);
        f.start().unwrap();

        let slow = Trajectory::new(vec![
            TrajectoryPoint::new([0.0; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs(0)),
            TrajectoryPoint::new([0.5; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs(10)),
        ])
        .unwrap();

        assert_eq!(
            f.start_smooth_trajectory(&slow).unwrap(),
            StreamOutcome::Streaming
        );

        let token = f.interrupt_token();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let start = Instant::now();
        assert_eq!(
            f.start_timed_trajectory(&slow).unwrap(),
            StreamOutcome::Interrupted
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        interrupter.join().unwrap();
    }
}
