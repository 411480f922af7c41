//! Control thread of the trajectory follower.
//!
//! The thread owns the listener and the connected controller. While a controller is connected one
//! record is sent every control tick: `Servo` records while a stream is active, `Idle` records
//! otherwise, and a single `Stop` record when a stop is requested. Every record must be answered
//! by one acknowledgement within the hang timeout, otherwise the connection is dropped and the
//! thread goes back to accepting.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, error, info, trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use comms_if::rt::{JointArray, SetpointKind, SetpointRecord, NUM_JOINTS};
use util::time::secs;

use super::{
    channel::{ChannelError, ControllerListener, SetpointChannel},
    CancelToken, FollowerParams,
};
use crate::{
    interp::{self, Setpoint},
    robot_state::{RobotState, RobotStateStore},
    telemetry,
    trajectory::{Bracket, SegmentCursor, Trajectory},
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// How long each accept attempt waits before commands are checked again.
const ACCEPT_POLL_PERIOD: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Everything the control thread owns.
pub(super) struct ControlLoop {
    pub params: FollowerParams,
    pub listener: Box<dyn ControllerListener>,
    pub store: Arc<RobotStateStore>,
    pub interrupt: CancelToken,
    pub connected: Arc<AtomicBool>,
    pub cmd_rx: Receiver<ControlCmd>,
    pub event_tx: Sender<ControlEvent>,
    pub state_tx: Sender<RobotState>,
}

/// A stream in progress.
struct Stream {
    id: u64,
    trajectory: Trajectory,
    smooth: bool,
    cursor: SegmentCursor,
    start: Instant,
    started: bool,
    reached: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Commands sent to the control thread.
#[derive(Debug)]
pub(super) enum ControlCmd {
    /// Start streaming the trajectory as stream `id`, replacing any current stream.
    Stream {
        id: u64,
        trajectory: Trajectory,
        smooth: bool,
    },

    /// End any current stream and command the robot to stop.
    Stop,

    /// Exit the thread, returning the listener.
    Shutdown,
}

/// Events sent by the control thread.
#[derive(Debug)]
pub(super) enum ControlEvent {
    /// A controller connected and completed the handshake.
    Connected,

    /// The first setpoint of the stream was acknowledged.
    Started(u64),

    /// The stream reached its last point and is now holding it.
    Reached(u64),

    /// The stream was abandoned because the interrupt token was set.
    Interrupted(u64),

    /// The stream was ended by a stop command.
    Stopped(u64),

    /// The controller failed while the stream was active.
    Failed(u64, ChannelError),

    /// The controller failed while no stream was active.
    Disconnected(ChannelError),
}

/// Why a connection ended.
enum ConnectionEnd {
    Lost,
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Run the control thread until shutdown, returning the listener.
pub(super) fn run(mut ctrl: ControlLoop) -> Box<dyn ControllerListener> {
    loop {
        let channel = match accept(&mut ctrl) {
            Some(c) => c,
            None => break,
        };

        match connected(&mut ctrl, channel) {
            ConnectionEnd::Lost => continue,
            ConnectionEnd::Shutdown => break,
        }
    }

    info!("Control thread stopped");
    ctrl.listener
}

/// Wait for a controller to connect. Returns `None` on shutdown.
fn accept(ctrl: &mut ControlLoop) -> Option<Box<dyn SetpointChannel>> {
    loop {
        // Nothing can be streamed while disconnected
        loop {
            match ctrl.cmd_rx.try_recv() {
                Ok(ControlCmd::Stream { id, .. }) => {
                    warn!("Cannot stream trajectory {}, no controller is connected", id);
                    ctrl.event_tx
                        .send(ControlEvent::Failed(id, ChannelError::Closed))
                        .ok();
                }
                Ok(ControlCmd::Stop) => (),
                Ok(ControlCmd::Shutdown) | Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => break,
            }
        }

        match ctrl.listener.accept(ACCEPT_POLL_PERIOD) {
            Ok(Some(channel)) => {
                info!(
                    "Controller connected ({:?} telemetry)",
                    channel.protocol_version()
                );
                ctrl.connected.store(true, Ordering::Release);
                ctrl.event_tx.send(ControlEvent::Connected).ok();
                return Some(channel);
            }
            Ok(None) => (),
            Err(e) => {
                warn!("Failed to accept a controller connection: {}", e);
                thread::sleep(ACCEPT_POLL_PERIOD);
            }
        }
    }
}

/// Stream to a connected controller until the connection is lost or shutdown is requested.
fn connected(ctrl: &mut ControlLoop, mut channel: Box<dyn SetpointChannel>) -> ConnectionEnd {
    let period = secs(ctrl.params.servoj_time_s);
    let hang_timeout = secs(ctrl.params.hang_timeout_s);

    let mut stream: Option<Stream> = None;
    let mut stop_requested = false;
    let mut shutdown = false;
    let mut next_tick = Instant::now();

    loop {
        // Handle commands
        loop {
            match ctrl.cmd_rx.try_recv() {
                Ok(ControlCmd::Stream {
                    id,
                    trajectory,
                    smooth,
                }) => {
                    if let Some(old) = stream.take() {
                        debug!("Stream {} replaced by stream {}", old.id, id);
                        ctrl.event_tx.send(ControlEvent::Interrupted(old.id)).ok();
                    }
                    debug!(
                        "Starting stream {} ({} points, {:.3} s, {})",
                        id,
                        trajectory.len(),
                        trajectory.duration().as_secs_f64(),
                        if smooth { "smooth" } else { "timed" }
                    );
                    stream = Some(Stream {
                        id,
                        trajectory,
                        smooth,
                        cursor: SegmentCursor::new(),
                        start: Instant::now(),
                        started: false,
                        reached: false,
                    });
                    stop_requested = false;
                }
                Ok(ControlCmd::Stop) => {
                    if let Some(s) = stream.take() {
                        ctrl.event_tx.send(ControlEvent::Stopped(s.id)).ok();
                    }
                    stop_requested = true;
                }
                Ok(ControlCmd::Shutdown) | Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if shutdown {
            if stream.is_some() {
                warn!("Control thread shutting down with a stream in progress");
            }

            // A stop queued just before shutdown still reaches the robot
            if stop_requested {
                let record = stop_record(&ctrl.params, ctrl.store.joints().q_actual);
                if let Err(e) = channel
                    .send_setpoint(&record)
                    .and_then(|_| channel.recv_ack(hang_timeout))
                {
                    warn!("Could not send the final stop: {}", e);
                }
            }

            ctrl.connected.store(false, Ordering::Release);
            return ConnectionEnd::Shutdown;
        }

        // Abandon the stream if interrupted, the controller keeps its last target until stopped
        if ctrl.interrupt.is_cancelled() {
            if let Some(s) = stream.take() {
                info!("Stream {} interrupted", s.id);
                ctrl.event_tx.send(ControlEvent::Interrupted(s.id)).ok();
            }
        }

        // Build this tick's record
        let q_actual = ctrl.store.joints().q_actual;
        let mut reached_now = false;
        let record = match stream.as_mut() {
            Some(s) => {
                let elapsed = s.start.elapsed();
                let bracket = s.cursor.locate(&s.trajectory, elapsed);
                if let Bracket::Hold(_) = bracket {
                    reached_now = !s.reached;
                }
                let sp = interp::bracket_setpoint(
                    bracket,
                    elapsed.as_secs_f64(),
                    s.smooth,
                    ctrl.params.max_velocity_rads,
                );
                servo_record(&ctrl.params, &sp)
            }
            None if stop_requested => {
                stop_requested = false;
                stop_record(&ctrl.params, q_actual)
            }
            None => SetpointRecord::idle(q_actual),
        };

        // Exchange with the controller
        let result = channel
            .send_setpoint(&record)
            .and_then(|_| channel.recv_ack(hang_timeout));

        match result {
            Ok(ack) => {
                trace!("Ack: {:?}", ack);
                if let Some(state) = telemetry::ingest(&ctrl.store, &ack) {
                    info!("Robot state is now {}", state);
                    ctrl.state_tx.send(state).ok();
                }

                if let Some(s) = stream.as_mut() {
                    if !s.started {
                        s.started = true;
                        ctrl.event_tx.send(ControlEvent::Started(s.id)).ok();
                    }
                    if reached_now {
                        s.reached = true;
                        debug!("Stream {} reached its last point", s.id);
                        ctrl.event_tx.send(ControlEvent::Reached(s.id)).ok();
                    }
                }
            }
            Err(e) => {
                ctrl.connected.store(false, Ordering::Release);
                match stream.take() {
                    Some(s) => {
                        error!("Controller hang during stream {}: {}", s.id, e);
                        ctrl.event_tx.send(ControlEvent::Failed(s.id, e)).ok();
                    }
                    None => {
                        warn!("Controller connection lost: {}", e);
                        ctrl.event_tx.send(ControlEvent::Disconnected(e)).ok();
                    }
                }
                return ConnectionEnd::Lost;
            }
        }

        // Keep to the control period
        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            debug!(
                "Control tick overran by {:.3} ms",
                (now - next_tick).as_secs_f64() * 1000.0
            );
            next_tick = now;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn servo_record(params: &FollowerParams, sp: &Setpoint) -> SetpointRecord {
    SetpointRecord {
        kind: SetpointKind::Servo,
        positions: sp.positions,
        velocities: sp.velocities,
        accelerations: sp.accelerations,
        servo_time_s: params.servoj_time_s,
        lookahead_time_s: params.servoj_lookahead_time_s,
        gain: params.servoj_gain,
    }
}

fn stop_record(params: &FollowerParams, q_actual: JointArray) -> SetpointRecord {
    SetpointRecord {
        kind: SetpointKind::Stop,
        positions: q_actual,
        velocities: [0.0; NUM_JOINTS],
        accelerations: [params.max_acceleration_rads2; NUM_JOINTS],
        servo_time_s: params.servoj_time_s,
        lookahead_time_s: params.servoj_lookahead_time_s,
        gain: params.servoj_gain,
    }
}
