use super::ConstantJerkSegment;
use crate::util::Interval;

/// A scalar function of one variable with continuous derivatives.
pub trait Curve1d {
    /// Evaluates the `order`-th derivative of the curve at `x`.
    fn evaluate(&self, order: u32, x: f64) -> f64;

    /// Returns the minimum and maximum values of `x` that define the domain of the curve.
    fn bounds(&self) -> Interval<f64>;

    /// Samples the curve.
    fn value(&self, x: f64) -> f64 {
        self.evaluate(0, x)
    }

    /// Samples the first derivative of the curve.
    fn slope(&self, x: f64) -> f64 {
        self.evaluate(1, x)
    }
}

impl<T: Curve1d + ?Sized> Curve1d for &T {
    fn evaluate(&self, order: u32, x: f64) -> f64 {
        (**self).evaluate(order, x)
    }

    fn bounds(&self) -> Interval<f64> {
        (**self).bounds()
    }
}

/// A curve made of consecutive constant-jerk segments, each integrated in closed form
/// from the end state of the previous one.
///
/// Outside its domain the curve is held at the value of the nearest end,
/// with all derivatives equal to zero.
#[derive(Clone, Debug)]
pub struct PiecewiseJerkCurve {
    start: f64,
    init: [f64; 3],
    segments: Vec<ConstantJerkSegment>,
    /// Cumulative end parameter of each segment, relative to `start`.
    knots: Vec<f64>,
}

impl PiecewiseJerkCurve {
    /// Creates an empty curve at `start` with the given value, slope and curvature.
    pub fn new(start: f64, x: f64, dx: f64, ddx: f64) -> Self {
        Self {
            start,
            init: [x, dx, ddx],
            segments: vec![],
            knots: vec![],
        }
    }

    /// Extends the curve by `length` with a constant third derivative `jerk`.
    pub fn append_segment(&mut self, jerk: f64, length: f64) {
        let [p, v, a] = self.end_state();
        let segment = ConstantJerkSegment::new(p, v, a, jerk, length);
        let end = self.knots.last().copied().unwrap_or(0.0) + length;
        self.segments.push(segment);
        self.knots.push(end);
    }

    /// The value, slope and curvature at the end of the curve.
    pub fn end_state(&self) -> [f64; 3] {
        self.segments
            .last()
            .map(|s| s.end_state())
            .unwrap_or(self.init)
    }

    /// The total length of the domain.
    pub fn param_length(&self) -> f64 {
        self.knots.last().copied().unwrap_or(0.0)
    }

    /// Finds the segment containing the relative parameter `x`, and `x` relative to it.
    fn locate(&self, x: f64) -> (usize, f64) {
        let idx = self.knots.partition_point(|end| *end < x);
        let idx = usize::min(idx, self.segments.len() - 1);
        let seg_start = if idx == 0 { 0.0 } else { self.knots[idx - 1] };
        (idx, x - seg_start)
    }
}

impl Curve1d for PiecewiseJerkCurve {
    fn evaluate(&self, order: u32, x: f64) -> f64 {
        let x = x - self.start;
        if self.segments.is_empty() || x <= 0.0 {
            return match order {
                0 => self.init[0],
                _ if x < 0.0 || self.segments.is_empty() => 0.0,
                1 | 2 => self.init[order as usize],
                3 => self.segments[0].jerk(),
                _ => 0.0,
            };
        }
        if x >= self.param_length() {
            return match order {
                0 => self.end_state()[0],
                _ => 0.0,
            };
        }
        let (idx, local) = self.locate(x);
        self.segments[idx].evaluate(order, local)
    }

    fn bounds(&self) -> Interval<f64> {
        Interval::new(self.start, self.start + self.param_length())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn segments_are_continuous() {
        let mut curve = PiecewiseJerkCurve::new(0.0, 0.0, 1.0, 0.0);
        curve.append_segment(0.5, 2.0);
        curve.append_segment(-1.0, 1.0);
        curve.append_segment(0.0, 3.0);

        for knot in [2.0, 3.0] {
            for order in 0..3 {
                let before = curve.evaluate(order, knot - 1e-9);
                let after = curve.evaluate(order, knot + 1e-9);
                assert_approx_eq!(before, after, 1e-6);
            }
        }
        assert_approx_eq!(curve.param_length(), 6.0);
        assert_eq!(curve.bounds(), Interval::new(0.0, 6.0));
    }

    #[test]
    fn constant_acceleration_integrates_exactly() {
        let mut curve = PiecewiseJerkCurve::new(10.0, 5.0, 2.0, 1.0);
        for _ in 0..10 {
            curve.append_segment(0.0, 0.5);
        }
        assert_approx_eq!(curve.value(12.5), 5.0 + 2.0 * 2.5 + 0.5 * 2.5 * 2.5);
        assert_approx_eq!(curve.slope(12.5), 2.0 + 2.5);
        assert_approx_eq!(curve.evaluate(2, 12.5), 1.0);
    }

    #[test]
    fn held_constant_outside_domain() {
        let mut curve = PiecewiseJerkCurve::new(0.0, 3.0, 1.0, 0.0);
        curve.append_segment(0.0, 2.0);
        assert_approx_eq!(curve.value(-4.0), 3.0);
        assert_eq!(curve.slope(-4.0), 0.0);
        assert_approx_eq!(curve.value(100.0), 5.0);
        assert_eq!(curve.slope(100.0), 0.0);
    }
}
