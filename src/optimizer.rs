//! The public entry point: sequences bound compilation, the convex stage and the
//! nonlinear refinement, keeping the best result so far as a checkpoint.

use crate::boundary::StGraphData;
use crate::bounds::{compile_bounds, KnotBounds};
use crate::config::{SpeedOptimizerConfig, VehicleLimits};
use crate::debug::DiagnosticSink;
use crate::error::SpeedOptError;
use crate::math::Curve1d;
use crate::path::DiscretizedPath;
use crate::smoother::ProfileSmoother;
use crate::solver::{
    KnotProfile, NlpStatus, PiecewiseJerkProblem, QpSettings, SolveLock, SpeedNlp,
};
use crate::speed::SpeedData;
use crate::util::Interval;
use itertools::{izip, Itertools};
use log::{error, info, warn};
use std::time::Instant;
use thiserror::Error;

/// The convex stage's velocity bound always admits the initial velocity plus this margin, in m/s.
const QP_SPEED_MARGIN: f64 = 0.1;

/// The nonlinear stage's velocity bound always admits the initial velocity plus this margin, in m/s.
const NLP_SPEED_MARGIN: f64 = 1.0;

/// Tolerance of the initial speed limit check, in m/s.
const SPEED_LIMIT_EPSILON: f64 = 1e-6;

/// Weight of tracking the convex stage's distances in guide line mode.
const GUIDE_LINE_WEIGHT: f64 = 0.05;

/// Slack in the squared final velocity when checking that a profile can stop.
const STOP_VELOCITY_TOLERANCE: f64 = 1e-3;

/// The stages of a planning cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerState {
    Init,
    BoundsBuilt,
    QpSolved,
    NlpAttempted,
    NlpSkipped,
    Done,
    Failed,
}

/// The best profile found so far, and whether the nonlinear stage produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub profile: KnotProfile,
    pub upgraded: bool,
}

impl Checkpoint {
    fn new(profile: KnotProfile) -> Self {
        Self {
            profile,
            upgraded: false,
        }
    }

    fn upgrade(&mut self, profile: KnotProfile) {
        self.profile = profile;
        self.upgraded = true;
    }
}

/// A summary of a successful planning cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanReport {
    /// Every state the cycle passed through, in order.
    pub trace: Vec<OptimizerState>,
    /// Whether the output came from the nonlinear stage.
    pub refined: bool,
    /// The status of the nonlinear solve, if it succeeded.
    pub nlp_status: Option<NlpStatus>,
    /// The recoverable error that kept the convex stage's result, if any.
    pub degradation: Option<SpeedOptError>,
}

impl PlanReport {
    fn new() -> Self {
        Self {
            trace: vec![OptimizerState::Init],
            refined: false,
            nlp_status: None,
            degradation: None,
        }
    }

    fn enter(&mut self, state: OptimizerState) {
        self.trace.push(state);
    }

    /// The state the cycle finished in.
    pub fn state(&self) -> OptimizerState {
        self.trace.last().copied().unwrap_or(OptimizerState::Init)
    }

    fn fail(mut self, error: SpeedOptError) -> PlanFailure {
        self.enter(OptimizerState::Failed);
        PlanFailure {
            error,
            trace: self.trace,
        }
    }
}

/// A failed planning cycle.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{error}")]
pub struct PlanFailure {
    pub error: SpeedOptError,
    /// Every state the cycle passed through, ending with [OptimizerState::Failed].
    pub trace: Vec<OptimizerState>,
}

/// Everything a planning cycle reads.
#[derive(Clone, Copy, Debug)]
pub struct SpeedPlanningInput<'a> {
    pub path: &'a DiscretizedPath,
    pub st_graph: &'a StGraphData,
    /// The prior speed profile.
    pub rough_speed: &'a SpeedData,
    /// A braking profile the upper position bounds must always admit.
    pub emergency_brake: &'a SpeedData,
    /// The legal speed limit in m/s.
    pub max_speed: f64,
    /// The speed the nonlinear stage tracks, in m/s.
    pub cruise_speed: f64,
    pub reached_destination: bool,
}

/// Plans a longitudinal speed profile along a fixed path.
#[derive(Clone, Debug)]
pub struct SpeedOptimizer {
    config: SpeedOptimizerConfig,
    vehicle: VehicleLimits,
    lock: SolveLock,
}

impl SpeedOptimizer {
    /// Creates an optimizer which serializes nonlinear solves process-wide.
    pub fn new(config: SpeedOptimizerConfig, vehicle: VehicleLimits) -> Self {
        Self {
            config,
            vehicle,
            lock: SolveLock::process_wide(),
        }
    }

    /// Replaces the lock serializing nonlinear solves.
    pub fn with_lock(mut self, lock: SolveLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn config(&self) -> &SpeedOptimizerConfig {
        &self.config
    }

    /// Runs one planning cycle.
    ///
    /// # Parameters
    /// * `input` - The path, ST graph, reference profiles and speed targets.
    /// * `output` - Receives the planned profile. Cleared on failure, except for an empty
    ///   path, which leaves it untouched.
    /// * `diagnostics` - Receives intermediate results.
    ///
    /// On failure, the returned [PlanFailure] carries the states passed through.
    pub fn process(
        &self,
        input: &SpeedPlanningInput,
        output: &mut SpeedData,
        diagnostics: &mut dyn DiagnosticSink,
    ) -> Result<PlanReport, PlanFailure> {
        let mut report = PlanReport::new();
        if input.path.is_empty() {
            error!("{}", SpeedOptError::EmptyPath);
            return Err(report.fail(SpeedOptError::EmptyPath));
        }
        if input.reached_destination {
            report.enter(OptimizerState::Done);
            return Ok(report);
        }

        match self.plan(input, output, diagnostics, &mut report) {
            Ok(()) => {
                report.enter(OptimizerState::Done);
                Ok(report)
            }
            Err(err) => {
                error!("{err}");
                output.clear();
                Err(report.fail(err))
            }
        }
    }

    fn plan(
        &self,
        input: &SpeedPlanningInput,
        output: &mut SpeedData,
        diagnostics: &mut dyn DiagnosticSink,
        report: &mut PlanReport,
    ) -> Result<(), SpeedOptError> {
        let init = [input.st_graph.init_v(), input.st_graph.init_a()];

        if !input.emergency_brake.is_empty() {
            diagnostics
                .record_speed_profile("minimum_jerk_speed_profile", input.emergency_brake.points());
        }

        let bounds = compile_bounds(
            input.st_graph,
            input.rough_speed,
            input.emergency_brake,
            &self.config,
        )?;
        report.enter(OptimizerState::BoundsBuilt);
        diagnostics.record_drivable_boundary(
            "ST_drive_Boundary",
            &bounds.drivable_polygon(self.config.delta_t),
        );

        let started = Instant::now();
        let mut qp = self.optimize_by_qp(input, &bounds, init, false)?;
        let mut stop_at_end = false;
        if self.overruns_stop(input, &bounds, &qp) {
            info!("convex profile cannot stop before the blocked path, planning a standstill");
            match self.optimize_by_qp(input, &bounds, init, true) {
                Ok(profile) => {
                    qp = profile;
                    stop_at_end = true;
                }
                Err(err) => warn!("no standstill within the horizon: {err}"),
            }
        }
        info!("convex stage took {:.1} ms", started.elapsed().as_secs_f64() * 1e3);
        report.enter(OptimizerState::QpSolved);

        let qp_speed = self.assemble(&qp, init);
        diagnostics.record_speed_profile("qp_speed", qp_speed.points());
        let mut checkpoint = Checkpoint::new(qp);

        let init_limit = input.st_graph.speed_limit().speed_limit_by_s(0.0);
        if !init_limit.map_or(false, |limit| limit + SPEED_LIMIT_EPSILON >= init[0]) {
            warn!(
                "initial velocity {:.2} exceeds the speed limit {:?}, skipping nonlinear refinement",
                init[0], init_limit
            );
            report.enter(OptimizerState::NlpSkipped);
            *output = qp_speed;
            return Ok(());
        }

        report.enter(OptimizerState::NlpAttempted);
        let nlp = self.optimize_by_nlp(
            input,
            &bounds,
            init,
            &checkpoint.profile,
            stop_at_end,
            diagnostics,
        );
        match nlp {
            Ok((profile, status)) => {
                checkpoint.upgrade(profile);
                report.nlp_status = Some(status);
            }
            Err(err) => {
                warn!("keeping the convex stage's profile: {err}");
                report.degradation = Some(err);
            }
        }
        report.refined = checkpoint.upgraded;

        *output = if checkpoint.upgraded {
            self.assemble(&checkpoint.profile, init)
        } else {
            qp_speed
        };
        Ok(())
    }

    /// Whether the profile ends too fast to stop, at the configured deceleration,
    /// before an obstacle still blocking the path at the end of the horizon.
    fn overruns_stop(
        &self,
        input: &SpeedPlanningInput,
        bounds: &KnotBounds,
        profile: &KnotProfile,
    ) -> bool {
        let stop_s = match bounds.terminal_stop(input.st_graph.path_length(), self.config.delta_t)
        {
            Some(stop_s) => stop_s,
            None => return false,
        };
        let (s, v) = match (profile.distance.last(), profile.velocity.last()) {
            (Some(s), Some(v)) => (*s, *v),
            _ => return false,
        };
        let braking = 2.0 * self.config.stop_deceleration.abs() * f64::max(stop_s - s, 0.0);
        v * v > braking + STOP_VELOCITY_TOLERANCE
    }

    fn optimize_by_qp(
        &self,
        input: &SpeedPlanningInput,
        bounds: &KnotBounds,
        init: [f64; 2],
        stop_at_end: bool,
    ) -> Result<KnotProfile, SpeedOptError> {
        let config = &self.config;
        let n = bounds.len();
        let mut problem = PiecewiseJerkProblem::new(n, config.delta_t, [0.0, init[0], init[1]]);
        problem.set_x_bounds(bounds.hard.clone());
        problem.set_dx_bounds(Interval::new(
            0.0,
            f64::max(input.max_speed, init[0] + QP_SPEED_MARGIN),
        ));
        problem.set_ddx_bounds(self.vehicle.acceleration_range());
        problem.set_dddx_bound(config.jerk_range());
        problem.set_weights([0.0, 0.0, config.acc_weight, config.jerk_weight]);
        if stop_at_end {
            problem.set_terminal_dx(0.0);
        }

        let rough = input.rough_speed;
        let x_ref: Option<Vec<f64>> = (0..n)
            .map(|i| {
                rough
                    .evaluate_by_time(i as f64 * config.delta_t)
                    .or_else(|| rough.points().last().copied())
                    .map(|p| p.s)
            })
            .collect();
        match x_ref {
            Some(x_ref) => problem.set_x_ref(config.ref_s_weight, x_ref),
            None => warn!("no rough speed profile to track"),
        }

        let settings = QpSettings {
            max_iter: config.qp_max_iter,
            ..Default::default()
        };
        let solution = problem
            .optimize(&settings, None)
            .map_err(SpeedOptError::QpFailed)?;
        Ok(solution.into_profile())
    }

    /// Smooths the curvature and speed limit, then refines the convex stage's profile.
    fn optimize_by_nlp(
        &self,
        input: &SpeedPlanningInput,
        bounds: &KnotBounds,
        init: [f64; 2],
        qp: &KnotProfile,
        stop_at_end: bool,
        diagnostics: &mut dyn DiagnosticSink,
    ) -> Result<(KnotProfile, NlpStatus), SpeedOptError> {
        let config = &self.config;

        let started = Instant::now();
        let curvature = ProfileSmoother::new(config.curvature_smoother.clone())
            .smooth_curvature(input.path)
            .map_err(|source| SpeedOptError::SmoothingFailed {
                profile: "path curvature",
                source,
            })?;
        info!("curvature smoothing took {:.1} ms", started.elapsed().as_secs_f64() * 1e3);

        let started = Instant::now();
        let speed_limit = input.st_graph.speed_limit();
        let smoothed_limit = ProfileSmoother::new(config.speed_limit_smoother.clone())
            .smooth_speed_limit(speed_limit)
            .map_err(|source| SpeedOptError::SmoothingFailed {
                profile: "speed limit",
                source,
            })?;
        info!("speed limit smoothing took {:.1} ms", started.elapsed().as_secs_f64() * 1e3);
        let smoothed_points: Vec<_> = speed_limit
            .speed_limit_points()
            .iter()
            .map(|(s, _)| (*s, smoothed_limit.value(*s)))
            .collect();
        diagnostics.record_speed_limit(&smoothed_points);

        let warm_start = if config.use_warm_start {
            if !qp.is_consistent() {
                return Err(SpeedOptError::WarmStartInvalid);
            }
            Some(qp)
        } else {
            None
        };

        let n = bounds.len();
        let s_ref = if config.use_smoothed_dp_guide_line {
            (GUIDE_LINE_WEIGHT, qp.distance.clone())
        } else {
            (config.s_potential_weight, vec![input.st_graph.path_length(); n])
        };

        let mut nlp = SpeedNlp {
            num_knots: n,
            delta_t: config.delta_t,
            init,
            hard_bounds: &bounds.hard,
            soft_bounds: bounds.soft.as_deref(),
            velocity_bounds: Interval::new(0.0, f64::max(input.max_speed, init[0] + NLP_SPEED_MARGIN)),
            acceleration_bounds: self.vehicle.acceleration_range(),
            jerk_bounds: config.jerk_range(),
            end_velocity: stop_at_end.then_some(0.0),
            curvature: &curvature,
            speed_limit: &smoothed_limit,
            cruise_speed: input.cruise_speed,
            s_ref,
            ref_v_weight: config.ref_v_weight,
            acc_weight: config.acc_weight,
            jerk_weight: config.jerk_weight,
            lat_acc_weight: config.lat_acc_weight,
            soft_s_bound_weight: config.soft_s_bound_weight,
            speed_limit_weight: config.speed_limit_weight,
            max_iter: config.nlp_max_iter,
            qp_settings: QpSettings {
                max_iter: config.qp_max_iter,
                ..Default::default()
            },
        };

        let started = Instant::now();
        let mut solution = self
            .lock
            .run(|| nlp.solve(warm_start))
            .map_err(SpeedOptError::NlpFailed)?;
        if nlp.end_velocity.is_none() && self.overruns_stop(input, bounds, &solution.profile) {
            info!("refined profile cannot stop before the blocked path, planning a standstill");
            nlp.end_velocity = Some(0.0);
            match self.lock.run(|| nlp.solve(warm_start)) {
                Ok(stopped) => solution = stopped,
                Err(err) => warn!("no standstill within the horizon: {err}"),
            }
        }
        info!(
            "nonlinear stage took {:.1} ms, {} iterations, {}",
            started.elapsed().as_secs_f64() * 1e3,
            solution.iterations,
            solution.status.reason()
        );
        Ok((solution.profile, solution.status))
    }

    /// Converts a knot profile into speed points, stopping at the first negative velocity
    /// and padding to the minimum profile length.
    fn assemble(&self, profile: &KnotProfile, init: [f64; 2]) -> SpeedData {
        let dt = self.config.delta_t;
        let mut speed = SpeedData::default();
        speed.append_speed_point(0.0, 0.0, init[0], init[1], 0.0);
        let knots = izip!(
            profile.distance.iter().skip(1),
            profile.velocity.iter().skip(1),
            profile.acceleration.iter().tuple_windows::<(_, _)>(),
        );
        for (i, (s, v, (a_prev, a))) in knots.enumerate() {
            if *v < 0.0 {
                break;
            }
            speed.append_speed_point(*s, (i + 1) as f64 * dt, *v, *a, (a - a_prev) / dt);
        }
        speed.fill_enough_points();
        speed
    }
}
