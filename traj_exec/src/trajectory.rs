//! # Trajectory
//!
//! Time-parameterised joint trajectories in the controller's joint order, as executed by the
//! [`TrajectoryFollower`](crate::follower::TrajectoryFollower).

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Serialize;
use std::time::Duration;

use comms_if::rt::{JointArray, NUM_JOINTS};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A timestamped target position and velocity for all joints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrajectoryPoint {
    /// Units: radians
    pub positions: JointArray,

    /// Units: radians/second
    pub velocities: JointArray,

    /// Time of this point relative to the start of the trajectory.
    pub time_from_start: Duration,
}

/// An ordered, non-empty sequence of points sorted by time.
///
/// A single-point trajectory holds the robot at that point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

/// Tracks the segment of a trajectory containing the current stream time.
///
/// Stream time only moves forwards so the cursor never needs to search backwards.
#[derive(Debug, Default, Clone)]
pub struct SegmentCursor {
    index: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TrajectoryError {
    #[error("A trajectory must contain at least one point")]
    Empty,

    #[error("Point {0} of the trajectory is earlier than the point before it")]
    Unsorted(usize),
}

/// Location of a query time within a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bracket<'a> {
    /// The time lies in `[from.time_from_start, to.time_from_start)`.
    Segment {
        from: &'a TrajectoryPoint,
        to: &'a TrajectoryPoint,
    },

    /// The time is at or past the last point, which should be held.
    Hold(&'a TrajectoryPoint),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TrajectoryPoint {
    pub fn new(positions: JointArray, velocities: JointArray, time_from_start: Duration) -> Self {
        Self {
            positions,
            velocities,
            time_from_start,
        }
    }

    /// Time from start in seconds.
    pub fn time_s(&self) -> f64 {
        self.time_from_start.as_secs_f64()
    }
}

impl Trajectory {
    /// Build a trajectory, checking it is non-empty and sorted by time.
    pub fn new(points: Vec<TrajectoryPoint>) -> Result<Self, TrajectoryError> {
        if points.is_empty() {
            return Err(TrajectoryError::Empty);
        }

        for (i, pair) in points.windows(2).enumerate() {
            if pair[1].time_from_start < pair[0].time_from_start {
                return Err(TrajectoryError::Unsorted(i + 1));
            }
        }

        Ok(Self { points })
    }

    /// A trajectory which holds the given position from t = 0.
    pub fn hold(positions: JointArray) -> Self {
        Self {
            points: vec![TrajectoryPoint::new(
                positions,
                [0.0; NUM_JOINTS],
                Duration::from_secs(0),
            )],
        }
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn first(&self) -> &TrajectoryPoint {
        &self.points[0]
    }

    pub fn last(&self) -> &TrajectoryPoint {
        &self.points[self.points.len() - 1]
    }

    /// Time from start of the last point.
    pub fn duration(&self) -> Duration {
        self.last().time_from_start
    }

    /// Make sure the trajectory starts at t = 0.
    ///
    /// If the first point is later than t = 0 a point at the given actual position and velocity is
    /// prepended. Returns the trajectory and whether a point was inserted.
    pub fn with_start_point(mut self, q_actual: JointArray, qd_actual: JointArray) -> (Self, bool) {
        if self.first().time_from_start > Duration::from_secs(0) {
            self.points.insert(
                0,
                TrajectoryPoint::new(q_actual, qd_actual, Duration::from_secs(0)),
            );
            (self, true)
        } else {
            (self, false)
        }
    }
}

impl SegmentCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the bracket containing `t`, advancing the cursor past any elapsed points.
    ///
    /// Zero-duration segments are stepped over, so the later point of the pair takes effect
    /// immediately.
    pub fn locate<'a>(&mut self, trajectory: &'a Trajectory, t: Duration) -> Bracket<'a> {
        let points = trajectory.points();

        while self.index + 1 < points.len() && points[self.index + 1].time_from_start <= t {
            self.index += 1;
        }

        if self.index + 1 >= points.len() {
            Bracket::Hold(&points[points.len() - 1])
        } else {
            Bracket::Segment {
                from: &points[self.index],
                to: &points[self.index + 1],
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn point(q: f64, t_s: f64) -> TrajectoryPoint {
        TrajectoryPoint::new([q; NUM_JOINTS], [0.0; NUM_JOINTS], Duration::from_secs_f64(t_s))
    }

    #[test]
    fn test_new_checks() {
        assert_eq!(Trajectory::new(vec![]), Err(TrajectoryError::Empty));
        assert_eq!(
            Trajectory::new(vec![point(0.0, 0.0), point(1.0, 2.0), point(2.0, 1.0)]),
            Err(TrajectoryError::Unsorted(2))
        );

        // Repeated times are allowed
        let traj = Trajectory::new(vec![point(0.0, 0.0), point(1.0, 1.0), point(2.0, 1.0)]).unwrap();
        assert_eq!(traj.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_no_start_point_needed() {
        let traj =
            Trajectory::new(vec![point(0.0, 0.0), point(1.0, 2.0), point(2.0, 4.0)]).unwrap();

        let (traj, inserted) = traj.with_start_point([0.3; NUM_JOINTS], [0.0; NUM_JOINTS]);

        assert!(!inserted);
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.first().positions, [0.0; NUM_JOINTS]);
    }

    #[test]
    fn test_start_point_inserted() {
        let traj = Trajectory::new(vec![point(1.0, 2.0), point(2.0, 4.0)]).unwrap();

        let (traj, inserted) = traj.with_start_point([0.3; NUM_JOINTS], [0.01; NUM_JOINTS]);

        assert!(inserted);
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.first().positions, [0.3; NUM_JOINTS]);
        assert_eq!(traj.first().velocities, [0.01; NUM_JOINTS]);
        assert_eq!(traj.first().time_from_start, Duration::from_secs(0));
        assert_eq!(traj.points()[1].positions, [1.0; NUM_JOINTS]);
    }

    #[test]
    fn test_cursor() {
        let traj =
            Trajectory::new(vec![point(0.0, 0.0), point(1.0, 2.0), point(2.0, 4.0)]).unwrap();
        let mut cursor = SegmentCursor::new();

        match cursor.locate(&traj, Duration::from_millis(500)) {
            Bracket::Segment { from, to } => {
                assert_eq!(from.positions[0], 0.0);
                assert_eq!(to.positions[0], 1.0);
            }
            b => panic!("Expected a segment, got {:?}", b),
        }

        // Exactly on a waypoint moves into the next segment
        match cursor.locate(&traj, Duration::from_secs(2)) {
            Bracket::Segment { from, .. } => assert_eq!(from.positions[0], 1.0),
            b => panic!("Expected a segment, got {:?}", b),
        }

        match cursor.locate(&traj, Duration::from_secs(4)) {
            Bracket::Hold(p) => assert_eq!(p.positions[0], 2.0),
            b => panic!("Expected a hold, got {:?}", b),
        }
        match cursor.locate(&traj, Duration::from_secs(10)) {
            Bracket::Hold(p) => assert_eq!(p.positions[0], 2.0),
            b => panic!("Expected a hold, got {:?}", b),
        }
    }

    #[test]
    fn test_cursor_zero_duration_segment() {
        let traj = Trajectory::new(vec![
            point(0.0, 0.0),
            point(1.0, 1.0),
            point(5.0, 1.0),
            point(6.0, 2.0),
        ])
        .unwrap();
        let mut cursor = SegmentCursor::new();

        match cursor.locate(&traj, Duration::from_secs(1)) {
            Bracket::Segment { from, to } => {
                assert_eq!(from.positions[0], 5.0);
                assert_eq!(to.positions[0], 6.0);
            }
            b => panic!("Expected a segment, got {:?}", b),
        }
    }

    #[test]
    fn test_single_point_holds() {
        let traj = Trajectory::hold([0.7; NUM_JOINTS]);
        let mut cursor = SegmentCursor::new();

        assert_eq!(
            cursor.locate(&traj, Duration::from_secs(0)),
            Bracket::Hold(traj.first())
        );
    }
}
