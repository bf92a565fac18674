//! Nonlinear refinement of a speed profile by sequential convex programming.
//!
//! Each outer iteration linearises the centripetal acceleration and speed limit terms
//! about the current iterate, activates the soft bound penalties the iterate violates,
//! and solves the resulting convex problem, warm started from the previous one.

use super::piecewise_jerk::PiecewiseJerkProblem;
use super::qp::{QpError, QpSettings, WarmStart};
use super::KnotProfile;
use crate::math::{Curve1d, PiecewiseJerkCurve};
use crate::util::Interval;
use log::debug;

/// The iteration has converged once no variable moves by more than this.
const STEP_TOLERANCE: f64 = 1e-3;

/// At the iteration limit, a step below this is still accepted.
const ACCEPTABLE_STEP_TOLERANCE: f64 = 1e-2;

/// Weight damping changes in velocity between outer iterations.
const PROXIMAL_WEIGHT: f64 = 0.1;

/// Iterates larger than this are treated as diverging.
const DIVERGENCE_LIMIT: f64 = 1e20;

/// Status codes of the nonlinear solver. The numbering follows Ipopt's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum NlpStatus {
    SolveSucceeded = 0,
    SolvedToAcceptableLevel = 1,
    InfeasibleProblemDetected = 2,
    SearchDirectionBecomesTooSmall = 3,
    DivergingIterates = 4,
    UserRequestedStop = 5,
    FeasiblePointFound = 6,
    MaximumIterationsExceeded = -1,
    RestorationFailed = -2,
    ErrorInStepComputation = -3,
    MaximumCpuTimeExceeded = -4,
    NotEnoughDegreesOfFreedom = -10,
    InvalidProblemDefinition = -11,
    InvalidOption = -12,
    InvalidNumberDetected = -13,
    UnrecoverableException = -100,
    NonSolverExceptionThrown = -101,
    InsufficientMemory = -102,
    InternalError = -199,
}

impl NlpStatus {
    /// Translates a native status code, if it is known.
    pub fn from_code(code: i32) -> Option<Self> {
        use NlpStatus::*;
        Some(match code {
            0 => SolveSucceeded,
            1 => SolvedToAcceptableLevel,
            2 => InfeasibleProblemDetected,
            3 => SearchDirectionBecomesTooSmall,
            4 => DivergingIterates,
            5 => UserRequestedStop,
            6 => FeasiblePointFound,
            -1 => MaximumIterationsExceeded,
            -2 => RestorationFailed,
            -3 => ErrorInStepComputation,
            -4 => MaximumCpuTimeExceeded,
            -10 => NotEnoughDegreesOfFreedom,
            -11 => InvalidProblemDefinition,
            -12 => InvalidOption,
            -13 => InvalidNumberDetected,
            -100 => UnrecoverableException,
            -101 => NonSolverExceptionThrown,
            -102 => InsufficientMemory,
            -199 => InternalError,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the status means a usable solution was found.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            NlpStatus::SolveSucceeded | NlpStatus::SolvedToAcceptableLevel
        )
    }

    pub fn reason(self) -> &'static str {
        match self {
            NlpStatus::SolveSucceeded => "solve succeeded",
            NlpStatus::SolvedToAcceptableLevel => "solved to acceptable level",
            NlpStatus::InfeasibleProblemDetected => "infeasible problem detected",
            NlpStatus::SearchDirectionBecomesTooSmall => "search direction becomes too small",
            NlpStatus::DivergingIterates => "diverging iterates",
            NlpStatus::UserRequestedStop => "user requested stop",
            NlpStatus::FeasiblePointFound => "feasible point found",
            NlpStatus::MaximumIterationsExceeded => "maximum iterations exceeded",
            NlpStatus::RestorationFailed => "restoration failed",
            NlpStatus::ErrorInStepComputation => "error in step computation",
            NlpStatus::MaximumCpuTimeExceeded => "maximum CPU time exceeded",
            NlpStatus::NotEnoughDegreesOfFreedom => "not enough degrees of freedom",
            NlpStatus::InvalidProblemDefinition => "invalid problem definition",
            NlpStatus::InvalidOption => "invalid option",
            NlpStatus::InvalidNumberDetected => "invalid number detected",
            NlpStatus::UnrecoverableException => "unrecoverable exception",
            NlpStatus::NonSolverExceptionThrown => "non-solver exception thrown",
            NlpStatus::InsufficientMemory => "insufficient memory",
            NlpStatus::InternalError => "internal error",
        }
    }
}

/// A failed nonlinear solve, carrying the solver's native status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NlpFailure {
    pub code: i32,
}

impl NlpFailure {
    pub fn new(status: NlpStatus) -> Self {
        Self {
            code: status.code(),
        }
    }

    /// The named reason for the failure, or "unknown failure" for unrecognised codes.
    pub fn reason(&self) -> &'static str {
        NlpStatus::from_code(self.code)
            .map(NlpStatus::reason)
            .unwrap_or("unknown failure")
    }
}

impl std::fmt::Display for NlpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.reason(), self.code)
    }
}

impl std::error::Error for NlpFailure {}

impl From<QpError> for NlpFailure {
    fn from(err: QpError) -> Self {
        NlpFailure::new(match err {
            QpError::InvalidProblem(_) => NlpStatus::InvalidProblemDefinition,
            QpError::NotPositiveDefinite => NlpStatus::ErrorInStepComputation,
            QpError::NonFinite => NlpStatus::InvalidNumberDetected,
            QpError::MaxIterations { .. } => NlpStatus::RestorationFailed,
        })
    }
}

/// A successful nonlinear solve.
#[derive(Clone, Debug)]
pub struct NlpSolution {
    pub profile: KnotProfile,
    pub status: NlpStatus,
    pub iterations: usize,
}

/// The nonlinear speed optimization problem.
///
/// Minimises tracking of a cruise speed and a reference distance, acceleration, jerk,
/// centripetal acceleration `v^2 * kappa(s)`, soft bound violation and speed limit excess,
/// subject to the same bounds and integration rules as the convex stage.
#[derive(Clone, Debug)]
pub struct SpeedNlp<'a> {
    pub num_knots: usize,
    pub delta_t: f64,
    /// The initial velocity and acceleration. The initial distance is zero.
    pub init: [f64; 2],
    pub hard_bounds: &'a [Interval<f64>],
    pub soft_bounds: Option<&'a [Interval<f64>]>,
    pub velocity_bounds: Interval<f64>,
    pub acceleration_bounds: Interval<f64>,
    pub jerk_bounds: Interval<f64>,
    /// The velocity the profile must end at, if fixed.
    pub end_velocity: Option<f64>,
    /// Curvature as a function of distance.
    pub curvature: &'a PiecewiseJerkCurve,
    /// Speed limit as a function of distance.
    pub speed_limit: &'a PiecewiseJerkCurve,
    pub cruise_speed: f64,
    /// The distance to track at each knot, and the weight of doing so.
    pub s_ref: (f64, Vec<f64>),
    pub ref_v_weight: f64,
    pub acc_weight: f64,
    pub jerk_weight: f64,
    pub lat_acc_weight: f64,
    pub soft_s_bound_weight: f64,
    pub speed_limit_weight: f64,
    pub max_iter: usize,
    pub qp_settings: QpSettings,
}

impl<'a> SpeedNlp<'a> {
    /// Solves the problem, starting from `warm_start` if given.
    pub fn solve(&self, warm_start: Option<&KnotProfile>) -> Result<NlpSolution, NlpFailure> {
        self.validate()?;

        let mut iterate = match warm_start {
            Some(profile) if profile.len() == self.num_knots => profile.clone(),
            Some(_) => return Err(NlpFailure::new(NlpStatus::InvalidProblemDefinition)),
            None => self.cold_start(),
        };
        let mut inner_warm_start = WarmStart {
            x: PiecewiseJerkProblem::interleave(&iterate),
            y: None,
        };

        let mut step = f64::INFINITY;
        for iteration in 1..=self.max_iter {
            let solution = self
                .subproblem(&iterate)
                .optimize(&self.qp_settings, Some(&inner_warm_start))?;
            inner_warm_start = solution.qp.warm_start();
            let next = solution.into_profile();

            step = next.max_difference(&iterate);
            debug!("NLP iteration {iteration}: step {step:.2e}");
            if !step.is_finite() {
                return Err(NlpFailure::new(NlpStatus::InvalidNumberDetected));
            }
            if next.distance.iter().any(|s| s.abs() > DIVERGENCE_LIMIT) {
                return Err(NlpFailure::new(NlpStatus::DivergingIterates));
            }
            iterate = next;

            if step < STEP_TOLERANCE {
                return Ok(NlpSolution {
                    profile: iterate,
                    status: NlpStatus::SolveSucceeded,
                    iterations: iteration,
                });
            }
        }

        if step < ACCEPTABLE_STEP_TOLERANCE {
            Ok(NlpSolution {
                profile: iterate,
                status: NlpStatus::SolvedToAcceptableLevel,
                iterations: self.max_iter,
            })
        } else {
            Err(NlpFailure::new(NlpStatus::MaximumIterationsExceeded))
        }
    }

    fn validate(&self) -> Result<(), NlpFailure> {
        let n = self.num_knots;
        let lengths_match = n > 0
            && self.hard_bounds.len() == n
            && self.soft_bounds.map_or(true, |b| b.len() == n)
            && self.s_ref.1.len() == n;
        if !lengths_match || self.max_iter == 0 {
            return Err(NlpFailure::new(NlpStatus::InvalidProblemDefinition));
        }
        let ranges = [
            self.velocity_bounds,
            self.acceleration_bounds,
            self.jerk_bounds,
        ];
        if self.hard_bounds.iter().chain(&ranges).any(|b| !b.is_valid()) {
            return Err(NlpFailure::new(NlpStatus::InfeasibleProblemDetected));
        }
        Ok(())
    }

    /// Travels at the initial velocity, kept within the bounds.
    fn cold_start(&self) -> KnotProfile {
        let v = self.velocity_bounds.clamp(self.init[0]);
        let distance = (0..self.num_knots)
            .map(|i| self.hard_bounds[i].clamp(v * i as f64 * self.delta_t))
            .collect();
        KnotProfile {
            distance,
            velocity: vec![v; self.num_knots],
            acceleration: vec![0.0; self.num_knots],
        }
    }

    /// The convex approximation of the problem about `iterate`.
    fn subproblem(&self, iterate: &KnotProfile) -> PiecewiseJerkProblem {
        let n = self.num_knots;
        let mut problem =
            PiecewiseJerkProblem::new(n, self.delta_t, [0.0, self.init[0], self.init[1]]);
        problem.set_x_bounds(self.hard_bounds.to_vec());
        problem.set_dx_bounds(self.velocity_bounds);
        problem.set_ddx_bounds(self.acceleration_bounds);
        problem.set_dddx_bound(self.jerk_bounds);
        if let Some(v) = self.end_velocity {
            problem.set_terminal_dx(v);
        }
        problem.set_weights([0.0, 0.0, self.acc_weight, self.jerk_weight]);
        problem.set_x_ref(self.s_ref.0, self.s_ref.1.clone());
        problem.set_dx_ref(self.ref_v_weight, vec![self.cruise_speed; n]);

        for i in 0..n {
            let (s, v) = (iterate.distance[i], iterate.velocity[i]);

            // v^2 kappa(s), linearised
            let kappa = self.curvature.value(s);
            let dkappa = self.curvature.slope(s);
            let coeffs = [v * v * dkappa, 2.0 * v * kappa, 0.0];
            let target = coeffs[0] * s + coeffs[1] * v - v * v * kappa;
            problem.add_residual(i, coeffs, target, self.lat_acc_weight);

            let limit = self.speed_limit.value(s);
            if v > limit {
                let coeffs = [-self.speed_limit.slope(s), 1.0, 0.0];
                let target = coeffs[0] * s + limit;
                problem.add_residual(i, coeffs, target, self.speed_limit_weight);
            }

            if let Some(soft) = self.soft_bounds.map(|b| b[i]) {
                if s > soft.max {
                    problem.add_residual(i, [1.0, 0.0, 0.0], soft.max, self.soft_s_bound_weight);
                } else if s < soft.min {
                    problem.add_residual(i, [1.0, 0.0, 0.0], soft.min, self.soft_s_bound_weight);
                }
            }

            problem.add_residual(i, [0.0, 1.0, 0.0], v, PROXIMAL_WEIGHT);
        }
        problem
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn flat(value: f64, length: f64) -> PiecewiseJerkCurve {
        let mut curve = PiecewiseJerkCurve::new(0.0, value, 0.0, 0.0);
        curve.append_segment(0.0, length);
        curve
    }

    fn nlp<'a>(
        bounds: &'a [Interval<f64>],
        curvature: &'a PiecewiseJerkCurve,
        speed_limit: &'a PiecewiseJerkCurve,
    ) -> SpeedNlp<'a> {
        let n = bounds.len();
        SpeedNlp {
            num_knots: n,
            delta_t: 0.1,
            init: [5.0, 0.0],
            hard_bounds: bounds,
            soft_bounds: None,
            velocity_bounds: Interval::new(0.0, 15.0),
            acceleration_bounds: Interval::new(-6.0, 2.0),
            jerk_bounds: Interval::new(-4.0, 2.0),
            end_velocity: None,
            curvature,
            speed_limit,
            cruise_speed: 10.0,
            s_ref: (0.05, vec![100.0; n]),
            ref_v_weight: 5.0,
            acc_weight: 2.0,
            jerk_weight: 3.0,
            lat_acc_weight: 1000.0,
            soft_s_bound_weight: 1000.0,
            speed_limit_weight: 1000.0,
            max_iter: 50,
            qp_settings: QpSettings::default(),
        }
    }

    #[test]
    fn status_codes() {
        for code in [0, 1, 2, 3, 4, 5, 6, -1, -2, -3, -4, -10, -11, -12, -13, -100, -101, -102, -199] {
            assert_eq!(NlpStatus::from_code(code).unwrap().code(), code);
        }
        assert_eq!(NlpFailure { code: 7 }.reason(), "unknown failure");
        assert_eq!(
            NlpFailure::new(NlpStatus::MaximumIterationsExceeded).to_string(),
            "maximum iterations exceeded (status -1)"
        );
        assert!(NlpStatus::SolvedToAcceptableLevel.is_success());
        assert!(!NlpStatus::FeasiblePointFound.is_success());
    }

    #[test]
    fn accelerates_towards_cruise_speed() {
        let bounds = vec![Interval::new(0.0, 100.0); 41];
        let (curvature, speed_limit) = (flat(0.0, 200.0), flat(20.0, 200.0));
        let solution = nlp(&bounds, &curvature, &speed_limit).solve(None).unwrap();
        assert!(solution.status.is_success());
        let profile = &solution.profile;
        assert_approx_eq!(profile.velocity[0], 5.0, 1e-3);
        assert!(profile.velocity[40] > 5.5);
        assert!(profile.acceleration.iter().all(|a| *a <= 2.0 + 1e-2));
    }

    #[test]
    fn curvature_slows_the_profile() {
        let bounds = vec![Interval::new(0.0, 100.0); 41];
        let speed_limit = flat(20.0, 200.0);
        let (straight, bend) = (flat(0.0, 200.0), flat(0.2, 200.0));
        let fast = nlp(&bounds, &straight, &speed_limit).solve(None).unwrap();
        let slow = nlp(&bounds, &bend, &speed_limit).solve(None).unwrap();
        assert!(slow.profile.velocity[40] < fast.profile.velocity[40]);
    }

    #[test]
    fn fixed_end_velocity_comes_to_rest() {
        let bounds = vec![Interval::new(0.0, 15.0); 51];
        let (curvature, speed_limit) = (flat(0.0, 200.0), flat(20.0, 200.0));
        let mut problem = nlp(&bounds, &curvature, &speed_limit);
        problem.end_velocity = Some(0.0);
        let solution = problem.solve(None).unwrap();
        let v = &solution.profile.velocity;
        assert_eq!(v[50], 0.0);
        assert!(v[40..].windows(2).all(|w| w[1] <= w[0] + 1e-2));
        assert!(solution.profile.distance.iter().all(|s| *s <= 15.0 + 1e-6));
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let bounds = vec![Interval::new(0.0, 100.0); 41];
        let curve = flat(0.0, 200.0);
        let mut problem = nlp(&bounds, &curve, &curve);
        problem.s_ref.1.pop();
        assert_eq!(
            problem.solve(None).unwrap_err().code,
            NlpStatus::InvalidProblemDefinition.code()
        );
    }
}
