//! Jerk-bounded fits of 1-D signals, used as references by the nonlinear stage.

use crate::config::SmootherConfig;
use crate::math::PiecewiseJerkCurve;
use crate::path::DiscretizedPath;
use crate::solver::{PiecewiseJerkProblem, QpError, QpSettings};
use crate::speed::SpeedLimit;

/// The number of speed limit samples fitted.
pub const SPEED_LIMIT_SAMPLES: usize = 100;

/// Fits a [PiecewiseJerkCurve] to evenly spaced samples of a signal.
#[derive(Clone, Debug)]
pub struct ProfileSmoother {
    config: SmootherConfig,
}

impl ProfileSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    /// Fits a curve to `samples`, spaced `delta` apart starting from `start`.
    ///
    /// # Parameters
    /// * `start` - The independent variable at the first sample.
    /// * `samples` - The raw signal.
    /// * `init` - The value and its first two derivatives at `start`, which the fit must match.
    pub fn smooth(
        &self,
        start: f64,
        samples: &[f64],
        init: [f64; 3],
    ) -> Result<PiecewiseJerkCurve, QpError> {
        let config = &self.config;
        let mut problem = PiecewiseJerkProblem::new(samples.len(), config.delta, init);
        problem.set_x_bounds(vec![config.x_bounds; samples.len()]);
        problem.set_dx_bounds(config.dx_bounds);
        problem.set_ddx_bounds(config.ddx_bounds);
        problem.set_dddx_bound(config.dddx_bounds);
        problem.set_weights(config.weights);
        problem.set_x_ref(config.x_ref_weight, samples.to_vec());

        let settings = QpSettings {
            max_iter: config.max_iter,
            ..Default::default()
        };
        let solution = problem.optimize(&settings, None)?;

        let mut curve = PiecewiseJerkCurve::new(start, solution.x[0], solution.dx[0], solution.ddx[0]);
        for w in solution.ddx.windows(2) {
            curve.append_segment((w[1] - w[0]) / config.delta, config.delta);
        }
        Ok(curve)
    }

    /// Fits the speed limit from `s = 0`, sampling [SPEED_LIMIT_SAMPLES] points.
    pub fn smooth_speed_limit(&self, speed_limit: &SpeedLimit) -> Result<PiecewiseJerkCurve, QpError> {
        let samples: Vec<f64> = (0..SPEED_LIMIT_SAMPLES)
            .map(|i| speed_limit.speed_limit_by_s(i as f64 * self.config.delta))
            .collect::<Option<_>>()
            .ok_or(QpError::InvalidProblem("empty speed limit"))?;
        self.smooth(0.0, &samples, [samples[0], 0.0, 0.0])
    }

    /// Fits the curvature of a path, as a function of the distance from its first point.
    pub fn smooth_curvature(&self, path: &DiscretizedPath) -> Result<PiecewiseJerkCurve, QpError> {
        let (front, back) = match (path.front(), path.back()) {
            (Some(front), Some(back)) => (front, back),
            _ => return Err(QpError::InvalidProblem("empty path")),
        };
        let delta = self.config.delta;
        let samples: Vec<f64> = (0..)
            .map(|i| front.s + i as f64 * delta)
            .take_while(|s| *s < back.s + delta)
            .filter_map(|s| path.evaluate(s))
            .map(|p| p.kappa)
            .collect();
        self.smooth(0.0, &samples, [front.kappa, front.dkappa, front.ddkappa])
    }
}
