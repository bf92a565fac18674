//! The spatial path the speed profile is planned along.

use crate::math::{lerp, slerp_angle, Point2d};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A point along a path.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PathPoint {
    /// The world space coordinates of the point.
    pub pos: Point2d,
    /// The heading in radians.
    pub theta: f64,
    /// The curvature in m<sup>-1</sup>.
    pub kappa: f64,
    /// The derivative of curvature with respect to `s`.
    pub dkappa: f64,
    /// The second derivative of curvature with respect to `s`.
    pub ddkappa: f64,
    /// The arc length from the start of the path in m.
    pub s: f64,
}

impl PathPoint {
    /// Creates a point with the given arc length and curvature, lying on the x-axis.
    pub fn on_axis(s: f64, kappa: f64) -> Self {
        Self {
            pos: Point2d::new(s, 0.0),
            theta: 0.0,
            kappa,
            dkappa: 0.0,
            ddkappa: 0.0,
            s,
        }
    }

    /// Linearly interpolates between two path points at the arc length `s`.
    pub fn interpolate(p0: &PathPoint, p1: &PathPoint, s: f64) -> PathPoint {
        let width = p1.s - p0.s;
        let t = if width.abs() < 1e-10 { 0.0 } else { (s - p0.s) / width };
        PathPoint {
            pos: p0.pos + (p1.pos - p0.pos) * t,
            theta: slerp_angle(p0.theta, p1.theta, t),
            kappa: lerp(p0.kappa, p1.kappa, t),
            dkappa: lerp(p0.dkappa, p1.dkappa, t),
            ddkappa: lerp(p0.ddkappa, p1.ddkappa, t),
            s,
        }
    }
}

/// A path approximated by an ordered sequence of points of increasing `s`.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscretizedPath {
    points: Vec<PathPoint>,
}

impl DiscretizedPath {
    /// Creates a path from points ordered by arc length.
    pub fn new(points: Vec<PathPoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn front(&self) -> Option<&PathPoint> {
        self.points.first()
    }

    pub fn back(&self) -> Option<&PathPoint> {
        self.points.last()
    }

    /// The arc length spanned by the path in m.
    pub fn length(&self) -> f64 {
        match (self.front(), self.back()) {
            (Some(front), Some(back)) => back.s - front.s,
            _ => 0.0,
        }
    }

    /// The arc length of the last point.
    pub fn max_s(&self) -> f64 {
        self.back().map(|p| p.s).unwrap_or(0.0)
    }

    /// Evaluates the path at `s`, using the first point at or beyond `s`.
    /// Clamps to the first or last point outside of the path.
    pub fn evaluate(&self, s: f64) -> Option<PathPoint> {
        let idx = self.points.partition_point(|p| p.s < s);
        self.interpolate_at(idx, s)
    }

    /// Evaluates the path at `s`, using the first point strictly beyond `s`.
    /// Clamps to the first or last point outside of the path.
    pub fn evaluate_reverse(&self, s: f64) -> Option<PathPoint> {
        let idx = self.points.partition_point(|p| p.s <= s);
        self.interpolate_at(idx, s)
    }

    fn interpolate_at(&self, idx: usize, s: f64) -> Option<PathPoint> {
        if idx == 0 {
            return self.front().copied();
        }
        if idx == self.points.len() {
            return self.back().copied();
        }
        Some(PathPoint::interpolate(
            &self.points[idx - 1],
            &self.points[idx],
            s,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn path() -> DiscretizedPath {
        DiscretizedPath::new(vec![
            PathPoint::on_axis(0.0, 0.0),
            PathPoint::on_axis(10.0, 0.1),
            PathPoint::on_axis(20.0, 0.0),
        ])
    }

    #[test]
    fn evaluate_interpolates() {
        let path = path();
        let p = path.evaluate(5.0).unwrap();
        assert_approx_eq!(p.kappa, 0.05);
        assert_approx_eq!(p.pos.x, 5.0);
        assert_approx_eq!(path.evaluate(15.0).unwrap().kappa, 0.05);
        assert_approx_eq!(path.length(), 20.0);
    }

    #[test]
    fn evaluate_clamps() {
        let path = path();
        assert_eq!(path.evaluate(-1.0).unwrap().s, 0.0);
        assert_eq!(path.evaluate(25.0).unwrap().s, 20.0);
        assert_eq!(path.evaluate_reverse(20.0).unwrap().s, 20.0);
        assert!(DiscretizedPath::default().evaluate(1.0).is_none());
    }

    #[test]
    fn evaluate_at_knot() {
        let path = path();
        assert_approx_eq!(path.evaluate(10.0).unwrap().kappa, 0.1);
        assert_approx_eq!(path.evaluate_reverse(10.0).unwrap().kappa, 0.1);
    }
}
