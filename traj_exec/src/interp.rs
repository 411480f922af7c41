//! # Interpolator
//!
//! Pure functions converting a pair of trajectory points into a setpoint at a query time.
//!
//! Two policies are provided:
//! - Smooth: cubic Hermite interpolation of position using the boundary positions and velocities,
//!   giving a path with continuous velocity across waypoints.
//! - Timed: each segment is a straight rest-to-rest move between waypoints, accelerating and
//!   decelerating with the triangular or trapezoidal profile of [`compute_velocity_and_accel`], so
//!   every via-point is reached at zero velocity.
//!
//! Both policies return the boundary values exactly at the segment ends and clamp (hold) rather
//! than extrapolate outside the segment.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Serialize;

use crate::trajectory::{Bracket, Trajectory, TrajectoryPoint};
use comms_if::rt::{JointArray, NUM_JOINTS};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Segments shorter than this are treated as instantaneous.
///
/// Units: seconds
pub const MIN_SEGMENT_DURATION_S: f64 = 1e-6;

/// Displacements smaller than this are treated as no motion.
///
/// Units: radians
const MIN_DISPLACEMENT_RAD: f64 = 1e-9;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Interpolated state of all joints at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setpoint {
    pub positions: JointArray,
    pub velocities: JointArray,
    pub accelerations: JointArray,
}

/// A segment failed the velocity/acceleration feasibility check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Infeasible {
    /// Index of the segment (the segment between point `segment` and `segment + 1`).
    pub segment: usize,

    pub joint: usize,

    /// Units: radians
    pub displacement_rad: f64,

    /// Units: seconds
    pub duration_s: f64,
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Cubic Hermite interpolation of a single joint over a segment of duration `dt`.
///
/// Returns `(position, velocity, acceleration)` at time `t` after the start of the segment. `t` is
/// clamped to `[0, dt]`, and a segment with `dt` below [`MIN_SEGMENT_DURATION_S`] jumps straight
/// to the end point.
pub fn hermite(p0: f64, v0: f64, p1: f64, v1: f64, dt: f64, t: f64) -> (f64, f64, f64) {
    if dt <= MIN_SEGMENT_DURATION_S || t >= dt {
        let acc = if dt <= MIN_SEGMENT_DURATION_S {
            0.0
        } else {
            let (a2, a3) = hermite_coeffs(p0, v0, p1, v1, dt);
            2.0 * a2 + 6.0 * a3 * dt
        };
        return (p1, v1, acc);
    }

    let (a2, a3) = hermite_coeffs(p0, v0, p1, v1, dt);

    if t <= 0.0 {
        return (p0, v0, 2.0 * a2);
    }

    let pos = p0 + v0 * t + a2 * t * t + a3 * t * t * t;
    let vel = v0 + 2.0 * a2 * t + 3.0 * a3 * t * t;
    let acc = 2.0 * a2 + 6.0 * a3 * t;

    (pos, vel, acc)
}

/// Rest-to-rest move of a single joint over a segment of duration `dt`.
///
/// Returns `(position, velocity, acceleration)` at time `t` after the start of the segment. The
/// profile is triangular if its peak stays within `max_vel`, otherwise trapezoidal cruising at
/// `max_vel`. Velocity is zero at both ends and clamping follows [`hermite`].
pub fn rest_to_rest(p0: f64, p1: f64, dt: f64, t: f64, max_vel: f64) -> (f64, f64, f64) {
    if dt <= MIN_SEGMENT_DURATION_S || t >= dt {
        return (p1, 0.0, 0.0);
    }

    let dphi = p1 - p0;

    // A segment too fast for the cap is rejected before streaming, shape it triangular anyway
    let (vel, acc) = match compute_velocity_and_accel(dphi, dt, max_vel, f64::INFINITY) {
        Some(va) => va,
        None => match compute_velocity_and_accel(dphi, dt, f64::INFINITY, f64::INFINITY) {
            Some(va) => va,
            None => (0.0, 0.0),
        },
    };

    if acc == 0.0 {
        return (p0, 0.0, 0.0);
    }

    if t <= 0.0 {
        return (p0, 0.0, acc);
    }

    let t_acc = vel / acc;
    if t < t_acc {
        (p0 + 0.5 * acc * t * t, acc * t, acc)
    } else if t <= dt - t_acc {
        (p0 + 0.5 * acc * t_acc * t_acc + vel * (t - t_acc), vel, 0.0)
    } else {
        let r = dt - t;
        (p1 - 0.5 * acc * r * r, acc * r, -acc)
    }
}

/// Peak absolute velocity and acceleration of the Hermite cubic over the whole segment.
pub fn hermite_peaks(p0: f64, v0: f64, p1: f64, v1: f64, dt: f64) -> (f64, f64) {
    let (a2, a3) = hermite_coeffs(p0, v0, p1, v1, dt);

    // Acceleration is linear in time, velocity is quadratic
    let acc = (2.0 * a2).abs().max((2.0 * a2 + 6.0 * a3 * dt).abs());

    let mut vel = v0.abs().max(v1.abs());
    if a3 != 0.0 {
        let t_ext = -a2 / (3.0 * a3);
        if t_ext > 0.0 && t_ext < dt {
            vel = vel.max((v0 + 2.0 * a2 * t_ext + 3.0 * a3 * t_ext * t_ext).abs());
        }
    }

    (vel, acc)
}

/// Smooth-mode setpoint between two points, `t` being the stream time.
pub fn smooth_setpoint(from: &TrajectoryPoint, to: &TrajectoryPoint, t: f64) -> Setpoint {
    let dt = to.time_s() - from.time_s();
    let ts = t - from.time_s();

    let mut sp = Setpoint::zero();
    for j in 0..NUM_JOINTS {
        let (p, v, a) = hermite(
            from.positions[j],
            from.velocities[j],
            to.positions[j],
            to.velocities[j],
            dt,
            ts,
        );
        sp.positions[j] = p;
        sp.velocities[j] = v;
        sp.accelerations[j] = a;
    }

    sp
}

/// Timed-mode setpoint between two points, `t` being the stream time.
pub fn timed_setpoint(
    from: &TrajectoryPoint,
    to: &TrajectoryPoint,
    t: f64,
    max_vel: f64,
) -> Setpoint {
    let dt = to.time_s() - from.time_s();
    let ts = t - from.time_s();

    let mut sp = Setpoint::zero();
    for j in 0..NUM_JOINTS {
        let (p, v, a) = rest_to_rest(from.positions[j], to.positions[j], dt, ts, max_vel);
        sp.positions[j] = p;
        sp.velocities[j] = v;
        sp.accelerations[j] = a;
    }

    sp
}

/// Setpoint holding the given point at rest.
pub fn hold_setpoint(point: &TrajectoryPoint) -> Setpoint {
    Setpoint {
        positions: point.positions,
        ..Setpoint::zero()
    }
}

/// Setpoint for a located bracket in the given mode.
///
/// `max_vel` only shapes timed segments.
pub fn bracket_setpoint(bracket: Bracket, t: f64, smooth: bool, max_vel: f64) -> Setpoint {
    match bracket {
        Bracket::Segment { from, to } if smooth => smooth_setpoint(from, to, t),
        Bracket::Segment { from, to } => timed_setpoint(from, to, t, max_vel),
        Bracket::Hold(p) => hold_setpoint(p),
    }
}

/// Compute the peak velocity and acceleration of a rest-to-rest move of `dphi` in `dt`.
///
/// A triangular velocity profile is used if its peak is within `max_vel`, otherwise a trapezoidal
/// profile cruising at `max_vel`. Returns `None` if no such profile satisfies both `max_vel` and
/// `max_accel`. The returned values carry the sign of `dphi`.
pub fn compute_velocity_and_accel(
    dphi: f64,
    dt: f64,
    max_vel: f64,
    max_accel: f64,
) -> Option<(f64, f64)> {
    let dist = dphi.abs();

    if !dist.is_finite() || !dt.is_finite() {
        return None;
    }

    if dist <= MIN_DISPLACEMENT_RAD {
        return Some((0.0, 0.0));
    }

    if dt <= MIN_SEGMENT_DURATION_S {
        return None;
    }

    // Even an infinite acceleration can't make the average speed exceed the cap
    if dist / dt > max_vel {
        return None;
    }

    let tri_vel = 2.0 * dist / dt;
    let (vel, acc) = if tri_vel <= max_vel {
        (tri_vel, 2.0 * tri_vel / dt)
    } else {
        let t_acc = dt - dist / max_vel;
        if t_acc <= 0.0 {
            return None;
        }
        (max_vel, max_vel / t_acc)
    };

    if !acc.is_finite() || acc > max_accel {
        return None;
    }

    Some((vel.copysign(dphi), acc.copysign(dphi)))
}

/// Shortest duration in which a rest-to-rest move of `dphi` satisfies both limits.
///
/// This is the inverse of [`compute_velocity_and_accel`]: a triangular profile if its peak stays
/// within `max_vel`, otherwise a trapezoidal profile accelerating at `max_accel`.
pub fn min_move_duration(dphi: f64, max_vel: f64, max_accel: f64) -> f64 {
    let dist = dphi.abs();
    if dist <= MIN_DISPLACEMENT_RAD {
        return 0.0;
    }

    let t_tri = 2.0 * (dist / max_accel).sqrt();
    if 2.0 * dist / t_tri <= max_vel {
        t_tri
    } else {
        dist / max_vel + max_vel / max_accel
    }
}

/// Check every segment and joint of the trajectory against the limits.
///
/// Smooth segments are checked with the peaks of the Hermite cubic actually followed, timed
/// segments with the rest-to-rest profile of [`compute_velocity_and_accel`].
pub fn check_feasible(
    trajectory: &Trajectory,
    smooth: bool,
    max_vel: f64,
    max_accel: f64,
) -> Result<(), Infeasible> {
    for (segment, pair) in trajectory.points().windows(2).enumerate() {
        let dt = pair[1].time_s() - pair[0].time_s();

        for joint in 0..NUM_JOINTS {
            let dphi = pair[1].positions[joint] - pair[0].positions[joint];

            let feasible = if smooth {
                smooth_feasible(
                    pair[0].positions[joint],
                    pair[0].velocities[joint],
                    pair[1].positions[joint],
                    pair[1].velocities[joint],
                    dt,
                    max_vel,
                    max_accel,
                )
            } else {
                compute_velocity_and_accel(dphi, dt, max_vel, max_accel).is_some()
            };

            if !feasible {
                return Err(Infeasible {
                    segment,
                    joint,
                    displacement_rad: dphi,
                    duration_s: dt,
                });
            }
        }
    }

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Setpoint {
    pub fn zero() -> Self {
        Self {
            positions: [0.0; NUM_JOINTS],
            velocities: [0.0; NUM_JOINTS],
            accelerations: [0.0; NUM_JOINTS],
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Quadratic and cubic coefficients of the Hermite polynomial.
fn hermite_coeffs(p0: f64, v0: f64, p1: f64, v1: f64, dt: f64) -> (f64, f64) {
    let a2 = (3.0 * (p1 - p0) - (2.0 * v0 + v1) * dt) / (dt * dt);
    let a3 = (2.0 * (p0 - p1) + (v0 + v1) * dt) / (dt * dt * dt);
    (a2, a3)
}

fn smooth_feasible(
    p0: f64,
    v0: f64,
    p1: f64,
    v1: f64,
    dt: f64,
    max_vel: f64,
    max_accel: f64,
) -> bool {
    if ![p0, v0, p1, v1, dt].iter().all(|x| x.is_finite()) {
        return false;
    }

    // A zero duration segment jumps to its end point
    if dt <= MIN_SEGMENT_DURATION_S {
        return (p1 - p0).abs() <= MIN_DISPLACEMENT_RAD;
    }

    let (vel, acc) = hermite_peaks(p0, v0, p1, v1, dt);
    vel <= max_vel && acc <= max_accel
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn point(q: f64, v: f64, t_s: f64) -> TrajectoryPoint {
        TrajectoryPoint::new([q; NUM_JOINTS], [v; NUM_JOINTS], Duration::from_secs_f64(t_s))
    }

    #[test]
    fn test_hermite_boundaries() {
        let (p, v, _) = hermite(0.3, 0.1, 1.7, -0.2, 2.0, 0.0);
        assert_eq!(p, 0.3);
        assert_eq!(v, 0.1);

        let (p, v, _) = hermite(0.3, 0.1, 1.7, -0.2, 2.0, 2.0);
        assert_eq!(p, 1.7);
        assert_eq!(v, -0.2);

        // Outside the segment the boundary is held
        assert_eq!(hermite(0.3, 0.1, 1.7, -0.2, 2.0, -1.0).0, 0.3);
        assert_eq!(hermite(0.3, 0.1, 1.7, -0.2, 2.0, 5.0).0, 1.7);
    }

    #[test]
    fn test_hermite_midpoint() {
        // Rest to rest is symmetric, so halfway in time is halfway in position at peak speed
        let (p, v, a) = hermite(0.0, 0.0, 1.0, 0.0, 2.0, 1.0);
        assert!((p - 0.5).abs() < 1e-12);
        assert!((v - 0.75).abs() < 1e-12);
        assert!(a.abs() < 1e-12);
    }

    #[test]
    fn test_zero_duration_segment() {
        assert_eq!(hermite(0.0, 0.0, 1.0, 0.5, 0.0, 0.0), (1.0, 0.5, 0.0));
        assert_eq!(rest_to_rest(0.0, 1.0, 0.0, 0.0, 3.0), (1.0, 0.0, 0.0));
    }

    #[test]
    fn test_rest_to_rest_triangular() {
        // 2 rad in 2 s peaks at 2 rad/s halfway, accelerating at 2 rad/s^2
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 0.0, 10.0), (1.0, 0.0, 2.0));
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 0.5, 10.0), (1.25, 1.0, 2.0));
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 1.0, 10.0), (2.0, 2.0, 0.0));
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 1.5, 10.0), (2.75, 1.0, -2.0));
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 2.0, 10.0), (3.0, 0.0, 0.0));
        assert_eq!(rest_to_rest(1.0, 3.0, 2.0, 3.0, 10.0), (3.0, 0.0, 0.0));

        // Moving backwards mirrors it
        assert_eq!(rest_to_rest(3.0, 1.0, 2.0, 0.5, 10.0), (2.75, -1.0, -2.0));
    }

    #[test]
    fn test_rest_to_rest_trapezoidal() {
        let (p, v, a) = rest_to_rest(0.0, 2.0, 2.0, 1.0, 1.5);
        assert!((p - 1.0).abs() < 1e-9);
        assert_eq!(v, 1.5);
        assert_eq!(a, 0.0);

        // Continuous and within the cap over the whole segment
        let mut last = rest_to_rest(0.0, 2.0, 2.0, 0.0, 1.5);
        for i in 1..=2000 {
            let sample = rest_to_rest(0.0, 2.0, 2.0, i as f64 * 0.001, 1.5);
            assert!(sample.1.abs() <= 1.5 + 1e-9);
            assert!((sample.0 - last.0).abs() < 2e-3);
            assert!((sample.1 - last.1).abs() < 5e-3);
            last = sample;
        }
        assert!((last.0 - 2.0).abs() < 1e-9 && last.1.abs() < 1e-9);
    }

    #[test]
    fn test_timed_via_point_at_rest() {
        let a = point(0.0, 0.0, 0.0);
        let b = point(0.05, 0.0, 0.4);
        let c = point(0.1, 0.0, 0.8);

        // Either side of the via-point the commanded velocity goes to zero
        let before = timed_setpoint(&a, &b, 0.399, 3.15);
        let after = timed_setpoint(&b, &c, 0.401, 3.15);
        assert!(before.velocities.iter().all(|v| v.abs() < 0.002));
        assert!(after.velocities.iter().all(|v| v.abs() < 0.002));
        assert!(timed_setpoint(&a, &b, 0.2, 3.15).velocities[0] > 0.2);
    }

    #[test]
    fn test_setpoints_use_stream_time() {
        let from = point(1.0, 0.0, 2.0);
        let to = point(2.0, 0.0, 4.0);

        assert_eq!(smooth_setpoint(&from, &to, 2.0).positions, [1.0; NUM_JOINTS]);
        assert_eq!(smooth_setpoint(&from, &to, 4.0).positions, [2.0; NUM_JOINTS]);
        assert_eq!(timed_setpoint(&from, &to, 3.0, 3.15).positions, [1.5; NUM_JOINTS]);

        let hold = bracket_setpoint(Bracket::Hold(&to), 100.0, true, 3.15);
        assert_eq!(hold.positions, [2.0; NUM_JOINTS]);
        assert_eq!(hold.velocities, [0.0; NUM_JOINTS]);
    }

    #[test]
    fn test_velocity_and_accel_triangular() {
        // 1 rad in 2 s peaks at 1 rad/s, accelerating at 1 rad/s^2
        let (v, a) = compute_velocity_and_accel(1.0, 2.0, 3.0, 10.0).unwrap();
        assert!((v - 1.0).abs() < 1e-12);
        assert!((a - 1.0).abs() < 1e-12);

        let (v, a) = compute_velocity_and_accel(-1.0, 2.0, 3.0, 10.0).unwrap();
        assert!(v < 0.0 && a < 0.0);
    }

    #[test]
    fn test_velocity_and_accel_trapezoidal() {
        // Triangular would peak at 2 rad/s, so cruise at 1.5 rad/s instead
        let (v, a) = compute_velocity_and_accel(2.0, 2.0, 1.5, 10.0).unwrap();
        assert_eq!(v, 1.5);
        let t_acc = 2.0 - 2.0 / 1.5;
        assert!((a - 1.5 / t_acc).abs() < 1e-12);
    }

    #[test]
    fn test_velocity_and_accel_infeasible() {
        // Average speed too high
        assert!(compute_velocity_and_accel(3.0, 1.0, 2.0, 100.0).is_none());

        // Acceleration too high
        assert!(compute_velocity_and_accel(1.0, 2.0, 3.0, 0.5).is_none());

        // Any motion in no time at all
        assert!(compute_velocity_and_accel(0.1, 0.0, 3.0, 100.0).is_none());

        // No motion is always fine
        assert_eq!(
            compute_velocity_and_accel(0.0, 0.0, 3.0, 100.0),
            Some((0.0, 0.0))
        );
    }

    #[test]
    fn test_min_move_duration() {
        // Short move, triangular: 2 * sqrt(0.5 / 2) = 1 s
        assert!((min_move_duration(0.5, 3.0, 2.0) - 1.0).abs() < 1e-12);

        // Long move, trapezoidal: 4 / 1 + 1 / 2 = 4.5 s
        assert!((min_move_duration(-4.0, 1.0, 2.0) - 4.5).abs() < 1e-12);

        // A little slack on the minimum is always feasible
        for d in [0.01, 0.5, 4.0].iter() {
            let dt = 1.01 * min_move_duration(*d, 1.0, 2.0);
            assert!(compute_velocity_and_accel(*d, dt, 1.0, 2.0).is_some());
        }
    }

    #[test]
    fn test_hermite_peaks() {
        // Rest to rest, 1 rad in 2 s
        let (v, a) = hermite_peaks(0.0, 0.0, 1.0, 0.0, 2.0);
        assert!((v - 0.75).abs() < 1e-12);
        assert!((a - 1.5).abs() < 1e-12);

        // Constant velocity needs no acceleration at all
        let (v, a) = hermite_peaks(0.0, 0.5, 0.05, 0.5, 0.1);
        assert!((v - 0.5).abs() < 1e-12);
        assert!(a < 1e-9);
    }

    #[test]
    fn test_check_feasible() {
        let ok = Trajectory::new(vec![point(0.0, 0.0, 0.0), point(0.5, 0.0, 2.0)]).unwrap();
        assert!(check_feasible(&ok, true, 3.15, 10.0).is_ok());
        assert!(check_feasible(&ok, false, 3.15, 10.0).is_ok());

        let mut fast = point(0.0, 0.0, 1.0);
        fast.positions[4] = 5.0;
        let bad = Trajectory::new(vec![point(0.0, 0.0, 0.0), point(0.0, 0.0, 0.5), fast]).unwrap();
        for smooth in [true, false].iter() {
            let err = check_feasible(&bad, *smooth, 3.15, 10.0).unwrap_err();
            assert_eq!(err.segment, 1);
            assert_eq!(err.joint, 4);
        }
    }

    #[test]
    fn test_blended_cruise_feasible_when_smooth() {
        // Dense points passed through at 0.5 rad/s
        let cruise = Trajectory::new(vec![
            point(0.0, 0.5, 0.0),
            point(0.05, 0.5, 0.1),
            point(0.1, 0.5, 0.2),
        ])
        .unwrap();
        assert!(check_feasible(&cruise, true, 3.15, 15.0).is_ok());

        // Stopping at every point needs 20 rad/s^2
        assert_eq!(
            check_feasible(&cruise, false, 3.15, 15.0).unwrap_err().segment,
            0
        );
    }
}
