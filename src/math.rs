//! Mathematical structs and functions.

use cgmath::Point2;
pub use curve::{Curve1d, PiecewiseJerkCurve};
pub use segment::ConstantJerkSegment;

mod curve;
mod segment;

/// A 2D point
pub type Point2d = Point2<f64>;

/// Linearly interpolates between `a` and `b`.
#[inline(always)]
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + t * (b - a)
}

/// Wraps an angle into `[-pi, pi)`.
pub fn normalize_angle(angle: f64) -> f64 {
    use std::f64::consts::PI;
    let a = (angle + PI).rem_euclid(2.0 * PI);
    a - PI
}

/// Interpolates between two headings through the shortest arc.
pub fn slerp_angle(a0: f64, a1: f64, t: f64) -> f64 {
    let delta = normalize_angle(a1 - a0);
    normalize_angle(a0 + t * delta)
}
