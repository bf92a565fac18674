//! Tunable parameters of the speed optimizer.

use crate::util::Interval;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The kinematic limits of the ego vehicle.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VehicleLimits {
    /// The maximum acceleration in m/s<sup>2</sup>.
    pub max_acceleration: f64,
    /// The maximum deceleration in m/s<sup>2</sup>. The sign is ignored.
    pub max_deceleration: f64,
}

impl Default for VehicleLimits {
    fn default() -> Self {
        Self {
            max_acceleration: 2.0,
            max_deceleration: -6.0,
        }
    }
}

impl VehicleLimits {
    /// The permitted range of accelerations.
    pub fn acceleration_range(&self) -> Interval<f64> {
        Interval::new(-self.max_deceleration.abs(), self.max_acceleration)
    }
}

/// Parameters of a jerk-bounded 1-D curve fit.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SmootherConfig {
    /// The spacing of the samples along the independent variable.
    pub delta: f64,
    /// Bounds on the fitted value.
    pub x_bounds: Interval<f64>,
    /// Bounds on the first derivative.
    pub dx_bounds: Interval<f64>,
    /// Bounds on the second derivative.
    pub ddx_bounds: Interval<f64>,
    /// Bounds on the third derivative.
    pub dddx_bounds: Interval<f64>,
    /// Weights on the value and its first three derivatives.
    pub weights: [f64; 4],
    /// Weight on the deviation of the fitted value from the samples.
    pub x_ref_weight: f64,
    /// The iteration budget of the underlying solver.
    pub max_iter: usize,
}

impl SmootherConfig {
    /// The preset used to fit the speed limit along the path.
    pub fn speed_limit() -> Self {
        Self {
            delta: 2.0,
            x_bounds: Interval::new(0.0, 50.0),
            dx_bounds: Interval::new(-10.0, 10.0),
            ddx_bounds: Interval::new(-10.0, 10.0),
            dddx_bounds: Interval::new(-10.0, 10.0),
            weights: [0.0, 10.0, 10.0, 10.0],
            x_ref_weight: 10.0,
            max_iter: 4000,
        }
    }

    /// The preset used to fit the curvature along the path.
    pub fn curvature() -> Self {
        Self {
            delta: 0.5,
            x_bounds: Interval::new(-1.0, 1.0),
            max_iter: 1000,
            ..Self::speed_limit()
        }
    }
}

/// Configuration of a [SpeedOptimizer](crate::SpeedOptimizer).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpeedOptimizerConfig {
    /// The time between knots in s.
    pub delta_t: f64,
    pub acc_weight: f64,
    pub jerk_weight: f64,
    pub lat_acc_weight: f64,
    pub ref_s_weight: f64,
    pub ref_v_weight: f64,
    /// Weight pulling the refined profile towards the end of the path.
    pub s_potential_weight: f64,
    pub soft_s_bound_weight: f64,
    pub speed_limit_weight: f64,
    /// The lower jerk bound in m/s<sup>3</sup>. The sign is ignored.
    pub jerk_lower_bound: f64,
    /// The upper jerk bound in m/s<sup>3</sup>.
    pub jerk_upper_bound: f64,
    /// The minimum preferred following distance in m.
    pub follow_min_distance: f64,
    /// The preferred following time gap in s.
    pub follow_time_buffer: f64,
    /// The most the speed dependent part of the following distance may add, in m.
    pub follow_distance_cap: f64,
    /// The deceleration in m/s<sup>2</sup> a profile must be able to stop with, after the
    /// horizon, before an obstacle still blocking the path. Otherwise it is planned to a
    /// standstill within the horizon.
    pub stop_deceleration: f64,
    /// Whether to compute soft bounds and refine them in the nonlinear stage.
    pub use_soft_bound: bool,
    /// Whether to seed the nonlinear stage with the convex stage's profile.
    pub use_warm_start: bool,
    /// Whether the nonlinear stage tracks the convex stage's positions,
    /// rather than being pulled towards the end of the path.
    pub use_smoothed_dp_guide_line: bool,
    pub speed_limit_smoother: SmootherConfig,
    pub curvature_smoother: SmootherConfig,
    /// The iteration budget of the convex stage.
    pub qp_max_iter: usize,
    /// The outer iteration budget of the nonlinear stage.
    pub nlp_max_iter: usize,
}

impl Default for SpeedOptimizerConfig {
    fn default() -> Self {
        Self {
            delta_t: 0.1,
            acc_weight: 2.0,
            jerk_weight: 3.0,
            lat_acc_weight: 1000.0,
            ref_s_weight: 100.0,
            ref_v_weight: 5.0,
            s_potential_weight: 0.05,
            soft_s_bound_weight: 1000.0,
            speed_limit_weight: 1000.0,
            jerk_lower_bound: -4.0,
            jerk_upper_bound: 2.0,
            follow_min_distance: 3.0,
            follow_time_buffer: 2.5,
            follow_distance_cap: 7.0,
            stop_deceleration: 2.0,
            use_soft_bound: true,
            use_warm_start: true,
            use_smoothed_dp_guide_line: false,
            speed_limit_smoother: SmootherConfig::speed_limit(),
            curvature_smoother: SmootherConfig::curvature(),
            qp_max_iter: 4000,
            nlp_max_iter: 50,
        }
    }
}

impl SpeedOptimizerConfig {
    /// Parses a configuration from JSON. Missing fields take their default values.
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The permitted range of jerks.
    pub fn jerk_range(&self) -> Interval<f64> {
        Interval::new(-self.jerk_lower_bound.abs(), self.jerk_upper_bound)
    }

    /// The preferred distance to keep behind a followed obstacle at velocity `v`.
    pub fn follow_distance(&self, v: f64) -> f64 {
        self.follow_min_distance + f64::min(self.follow_distance_cap, self.follow_time_buffer * v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn follow_distance_is_capped() {
        let config = SpeedOptimizerConfig::default();
        assert_approx_eq!(config.follow_distance(0.0), 3.0);
        assert_approx_eq!(config.follow_distance(2.0), 8.0);
        assert_approx_eq!(config.follow_distance(20.0), 10.0);
    }

    #[test]
    fn ranges_ignore_sign() {
        let config = SpeedOptimizerConfig {
            jerk_lower_bound: 4.0,
            ..Default::default()
        };
        assert_eq!(config.jerk_range(), Interval::new(-4.0, 2.0));
        let limits = VehicleLimits {
            max_acceleration: 3.0,
            max_deceleration: 5.0,
        };
        assert_eq!(limits.acceleration_range(), Interval::new(-5.0, 3.0));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn from_json_fills_defaults() {
        let config = SpeedOptimizerConfig::from_json(r#"{ "acc_weight": 7.5 }"#).unwrap();
        assert_eq!(config.acc_weight, 7.5);
        assert_eq!(config.jerk_weight, 3.0);
        assert_eq!(config.curvature_smoother, SmootherConfig::curvature());
    }
}
