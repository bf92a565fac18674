//! Time-indexed speed profiles and arc-length-indexed speed limits.

use crate::math::lerp;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Profiles shorter than this are padded with stopped points, in s.
pub const MIN_PROFILE_TIME: f64 = 3.0;

/// The time step of padding points, in s.
pub const PADDING_TIME_STEP: f64 = 0.1;

/// A sample of a speed profile.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpeedPoint {
    /// Distance travelled along the path in m.
    pub s: f64,
    /// Time since the start of the profile in s.
    pub t: f64,
    /// Velocity in m/s.
    pub v: f64,
    /// Acceleration in m/s<sup>2</sup>.
    pub a: f64,
    /// Jerk in m/s<sup>3</sup>.
    pub da: f64,
}

impl SpeedPoint {
    pub const fn new(s: f64, t: f64, v: f64, a: f64, da: f64) -> Self {
        Self { s, t, v, a, da }
    }
}

/// A speed profile, as a sequence of [SpeedPoint]s ordered by time.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpeedData {
    points: Vec<SpeedPoint>,
}

impl SpeedData {
    /// Creates a profile from points ordered by time.
    pub fn new(mut points: Vec<SpeedPoint>) -> Self {
        points.sort_by(|a, b| a.t.total_cmp(&b.t));
        Self { points }
    }

    /// Creates a profile of constant acceleration starting at `s = 0`,
    /// sampled every `dt` seconds up to `total_time`. The velocity never drops below zero.
    pub fn constant_acceleration(v0: f64, acc: f64, total_time: f64, dt: f64) -> Self {
        let mut points = vec![];
        let (mut s, mut v) = (0.0, v0);
        let steps = (total_time / dt + 1e-9).floor() as usize;
        for i in 0..=steps {
            let a = if v <= 0.0 && acc < 0.0 { 0.0 } else { acc };
            points.push(SpeedPoint::new(s, i as f64 * dt, v, a, 0.0));
            let next_v = f64::max(v + a * dt, 0.0);
            s += 0.5 * (v + next_v) * dt;
            v = next_v;
        }
        Self { points }
    }

    pub fn points(&self) -> &[SpeedPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Appends a point at the end of the profile.
    pub fn append_speed_point(&mut self, s: f64, t: f64, v: f64, a: f64, da: f64) {
        debug_assert!(
            self.points.last().map(|p| p.t <= t).unwrap_or(true),
            "speed points must be appended in time order"
        );
        self.points.push(SpeedPoint::new(s, t, v, a, da));
    }

    /// The time spanned by the profile.
    pub fn total_time(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => last.t - first.t,
            _ => 0.0,
        }
    }

    /// The distance spanned by the profile.
    pub fn total_length(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => last.s - first.s,
            _ => 0.0,
        }
    }

    /// Samples the profile at time `t` by linear interpolation.
    ///
    /// Returns `None` if the profile has fewer than two points,
    /// or if `t` lies outside of it by more than a microsecond.
    pub fn evaluate_by_time(&self, t: f64) -> Option<SpeedPoint> {
        let (first, last) = match self.points.as_slice() {
            [first, .., last] => (first, last),
            _ => return None,
        };
        if !(first.t < t + 1e-6 && t - 1e-6 < last.t) {
            return None;
        }

        let idx = self.points.partition_point(|p| p.t < t);
        if idx == 0 {
            return Some(*first);
        }
        if idx == self.points.len() {
            return Some(*last);
        }

        let (p0, p1) = (&self.points[idx - 1], &self.points[idx]);
        let width = p1.t - p0.t;
        let f = if width.abs() < 1e-10 { 0.0 } else { (t - p0.t) / width };
        Some(SpeedPoint {
            s: lerp(p0.s, p1.s, f),
            t,
            v: lerp(p0.v, p1.v, f),
            a: lerp(p0.a, p1.a, f),
            da: lerp(p0.da, p1.da, f),
        })
    }

    /// Pads a short profile with stopped points at its final position,
    /// so that it spans at least [MIN_PROFILE_TIME].
    pub fn fill_enough_points(&mut self) {
        let last = match self.points.last() {
            Some(last) => *last,
            None => return,
        };
        if last.t >= MIN_PROFILE_TIME {
            return;
        }
        let padding = (1..)
            .map(|k| last.t + k as f64 * PADDING_TIME_STEP)
            .take_while(|t| *t < MIN_PROFILE_TIME - 1e-6)
            .map(|t| SpeedPoint::new(last.s, t, 0.0, 0.0, 0.0));
        self.points.extend(padding);
    }
}

/// A speed limit which varies along the path, as a step function of arc length.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpeedLimit {
    /// `(s, v)` pairs ordered by `s`.
    points: Vec<(f64, f64)>,
}

impl SpeedLimit {
    /// Creates a speed limit from `(s, v)` pairs.
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    /// Creates a speed limit of `v` between `0` and `length`, sampled every `step` metres.
    pub fn uniform(v: f64, length: f64, step: f64) -> Self {
        let count = (length / step).ceil() as usize;
        let points = (0..=count).map(|i| (i as f64 * step, v)).collect();
        Self { points }
    }

    pub fn append_speed_limit(&mut self, s: f64, v: f64) {
        self.points.push((s, v));
    }

    pub fn speed_limit_points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Gets the speed limit in effect at `s`: the limit of the first point at or
    /// beyond `s`, or of the last point if `s` is beyond the end.
    pub fn speed_limit_by_s(&self, s: f64) -> Option<f64> {
        let idx = self.points.partition_point(|(ps, _)| *ps < s);
        self.points
            .get(idx)
            .or_else(|| self.points.last())
            .map(|(_, v)| *v)
    }

    /// The lowest limit anywhere along the path.
    pub fn min_speed_limit(&self) -> Option<f64> {
        self.points.iter().map(|(_, v)| *v).reduce(f64::min)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn evaluate_by_time() {
        let data = SpeedData::new(vec![
            SpeedPoint::new(0.0, 0.0, 10.0, 0.0, 0.0),
            SpeedPoint::new(10.0, 1.0, 10.0, 0.0, 0.0),
            SpeedPoint::new(18.0, 2.0, 6.0, -4.0, 0.0),
        ]);
        let p = data.evaluate_by_time(1.5).unwrap();
        assert_approx_eq!(p.s, 14.0);
        assert_approx_eq!(p.v, 8.0);
        assert_approx_eq!(p.a, -2.0);
        assert!(data.evaluate_by_time(2.0 + 1e-7).is_some());
        assert!(data.evaluate_by_time(2.1).is_none());
        assert!(data.evaluate_by_time(-0.1).is_none());
        assert!(SpeedData::default().evaluate_by_time(0.0).is_none());
    }

    #[test]
    fn fill_enough_points() {
        let mut data = SpeedData::default();
        data.append_speed_point(0.0, 0.0, 1.0, 0.0, 0.0);
        data.append_speed_point(0.5, 1.0, 0.0, 0.0, 0.0);
        data.fill_enough_points();
        assert_eq!(data.len(), 21);
        assert!(data.points().iter().skip(1).all(|p| p.s == 0.5));
        assert!(data.points().last().unwrap().t < MIN_PROFILE_TIME);
    }

    #[test]
    fn speed_limit_is_a_step_function() {
        let limit = SpeedLimit::new(vec![(0.0, 10.0), (20.0, 15.0), (40.0, 5.0)]);
        assert_eq!(limit.speed_limit_by_s(0.0), Some(10.0));
        assert_eq!(limit.speed_limit_by_s(10.0), Some(15.0));
        assert_eq!(limit.speed_limit_by_s(20.0), Some(15.0));
        assert_eq!(limit.speed_limit_by_s(41.0), Some(5.0));
        assert_eq!(limit.min_speed_limit(), Some(5.0));
        assert_eq!(SpeedLimit::default().speed_limit_by_s(1.0), None);
    }

    #[test]
    fn constant_acceleration_stops_at_zero() {
        let data = SpeedData::constant_acceleration(10.0, -2.0, 7.0, 0.1);
        assert_eq!(data.len(), 71);
        let last = data.points().last().unwrap();
        assert_approx_eq!(last.v, 0.0);
        assert_approx_eq!(last.s, 25.0, 1e-6);
    }
}
