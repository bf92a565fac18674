//! Compiles the boundaries of an ST graph into per-knot position bounds.

use crate::boundary::{BoundaryKind, StGraphData};
use crate::config::SpeedOptimizerConfig;
use crate::error::SpeedOptError;
use crate::math::Point2d;
use crate::speed::SpeedData;
use crate::util::Interval;
use log::debug;

/// Degenerate bound pairs are widened to this width, in m.
const S_BOUND_EPSILON: f64 = 0.1;

/// How far past an overtaken obstacle the soft lower bound lies, in m.
const OVERTAKE_SAFE_DISTANCE: f64 = 10.0;

/// The upper bound always admits the emergency braking profile plus this margin, in m.
const EMERGENCY_BRAKE_MARGIN: f64 = 0.2;

/// The following distance used when soft bounds are disabled, in m.
const FALLBACK_FOLLOW_DISTANCE: f64 = 8.0;

/// The number of knots spanning `total_time` at a spacing of `delta_t`.
pub fn knot_count(total_time: f64, delta_t: f64) -> usize {
    (total_time / delta_t + 1e-9).floor().max(0.0) as usize + 1
}

/// The position bounds at each knot.
#[derive(Clone, Debug, PartialEq)]
pub struct KnotBounds {
    /// The positions the vehicle must stay within.
    pub hard: Vec<Interval<f64>>,
    /// The positions the vehicle should prefer, if soft bounds are enabled.
    pub soft: Option<Vec<Interval<f64>>>,
}

impl KnotBounds {
    pub fn len(&self) -> usize {
        self.hard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hard.is_empty()
    }

    /// The hard bounds as a closed `(t, s)` polygon:
    /// the lower edge forwards in time, then the upper edge backwards.
    pub fn drivable_polygon(&self, delta_t: f64) -> Vec<Point2d> {
        let t = |i: usize| i as f64 * delta_t;
        let lower = self
            .hard
            .iter()
            .enumerate()
            .map(|(i, b)| Point2d::new(t(i), b.min));
        let upper = self
            .hard
            .iter()
            .enumerate()
            .rev()
            .map(|(i, b)| Point2d::new(t(i), b.max));
        lower.chain(upper).collect()
    }

    /// The position of an obstacle still blocking the path at the end of the horizon.
    ///
    /// Returns the final upper bound if it lies short of `total_length` and has not moved
    /// over the last second, otherwise `None`.
    pub fn terminal_stop(&self, total_length: f64, delta_t: f64) -> Option<f64> {
        let last = self.hard.last()?.max;
        let window = ((1.0 / delta_t).round() as usize).max(1);
        let stationary = self
            .hard
            .iter()
            .rev()
            .take(window + 1)
            .all(|b| (b.max - last).abs() < 1e-6);
        (stationary && last < total_length - 1e-6).then_some(last)
    }
}

/// The tightest caps and raises applied to one bound pair at one knot.
#[derive(Clone, Copy, Debug)]
struct Tightening {
    cap: f64,
    raise: f64,
}

impl Tightening {
    fn new(total_length: f64) -> Self {
        Self {
            cap: total_length,
            raise: 0.0,
        }
    }

    // NaN is sticky so that it surfaces when the pair is validated.
    fn cap(&mut self, value: f64) {
        if value.is_nan() || value < self.cap {
            self.cap = value;
        }
    }

    fn raise(&mut self, value: f64) {
        if value.is_nan() || value > self.raise {
            self.raise = value;
        }
    }

    /// Resolves the caps and raises into a bound pair. Caps are applied first, so a raise
    /// which would empty the pair is clamped to just below the upper bound.
    fn resolve(self) -> Interval<f64> {
        let mut upper = self.cap;
        if upper <= 0.0 {
            upper = S_BOUND_EPSILON;
        }
        let mut lower = self.raise;
        if upper <= lower {
            lower = upper - S_BOUND_EPSILON;
        }
        Interval::new(lower, upper)
    }
}

/// Computes the hard and soft position bounds at each knot.
///
/// # Parameters
/// * `st_graph` - The boundaries, path length and planning horizon.
/// * `rough_speed` - The prior speed profile, used for speed dependent following distances.
/// * `emergency_brake` - A braking profile the upper bound must always admit.
/// * `config` - The knot spacing, following distances and soft bound toggle.
pub fn compile_bounds(
    st_graph: &StGraphData,
    rough_speed: &SpeedData,
    emergency_brake: &SpeedData,
    config: &SpeedOptimizerConfig,
) -> Result<KnotBounds, SpeedOptError> {
    let num_knots = knot_count(st_graph.total_time(), config.delta_t);
    if config.use_soft_bound {
        soft_bounds(st_graph, rough_speed, emergency_brake, config, num_knots)
    } else {
        fallback_bounds(st_graph, config, num_knots)
    }
}

fn soft_bounds(
    st_graph: &StGraphData,
    rough_speed: &SpeedData,
    emergency_brake: &SpeedData,
    config: &SpeedOptimizerConfig,
    num_knots: usize,
) -> Result<KnotBounds, SpeedOptError> {
    let total_length = st_graph.path_length();
    let mut hard_bounds = Vec::with_capacity(num_knots);
    let mut soft_bounds = Vec::with_capacity(num_knots);

    for i in 0..num_knots {
        let t = i as f64 * config.delta_t;
        let mut hard = Tightening::new(total_length);
        let mut soft = Tightening::new(total_length);

        let rough_v = if st_graph.is_boundaries_empty() {
            0.0
        } else {
            rough_speed
                .evaluate_by_time(t)
                .ok_or(SpeedOptError::RoughSpeedUnavailable { t })?
                .v
        };

        for (id, boundary) in st_graph.iter_boundaries() {
            let drive = match boundary.unblocked_range(t) {
                Some(drive) => drive,
                None => continue,
            };
            let kind = boundary.kind();
            match kind {
                BoundaryKind::Stop => {
                    hard.cap(drive.max);
                    soft.cap(drive.max);
                }
                BoundaryKind::Yield { .. } => {
                    hard.cap(drive.max - kind.gap_at(t));
                    soft.cap(drive.max);
                }
                BoundaryKind::Follow { .. } => {
                    let follow_upper = drive.max - kind.gap_at(t);
                    hard.cap(follow_upper);
                    soft.cap(f64::min(
                        drive.max - config.follow_distance(rough_v),
                        follow_upper,
                    ));
                }
                BoundaryKind::Overtake => {
                    hard.raise(drive.min);
                    soft.raise(drive.min + OVERTAKE_SAFE_DISTANCE);
                }
            }
            debug!("t = {t:.1}: {} boundary {id:?} {drive:?}", kind.name());
        }

        let mut hard = hard.resolve();
        let soft = soft.resolve();

        // Only a boundary may push the upper bound below the braking profile
        if !st_graph.is_boundaries_empty() {
            if let Some(brake) = emergency_brake.evaluate_by_time(t) {
                let relaxed = brake.s + EMERGENCY_BRAKE_MARGIN;
                if hard.max < relaxed {
                    hard.max = relaxed;
                }
            }
        }

        if !hard.is_valid() || !soft.is_valid() {
            return Err(SpeedOptError::InfeasibleBounds { t });
        }
        debug!("t = {t:.1}: hard {hard:?}, soft {soft:?}");
        hard_bounds.push(hard);
        soft_bounds.push(soft);
    }

    Ok(KnotBounds {
        hard: hard_bounds,
        soft: Some(soft_bounds),
    })
}

fn fallback_bounds(
    st_graph: &StGraphData,
    config: &SpeedOptimizerConfig,
    num_knots: usize,
) -> Result<KnotBounds, SpeedOptError> {
    let total_length = st_graph.path_length();
    let hard = (0..num_knots)
        .map(|i| {
            let t = i as f64 * config.delta_t;
            let mut hard = Tightening::new(total_length);
            for (_, boundary) in st_graph.iter_boundaries() {
                let drive = match boundary.unblocked_range(t) {
                    Some(drive) => drive,
                    None => continue,
                };
                match boundary.kind() {
                    BoundaryKind::Stop | BoundaryKind::Yield { .. } => hard.cap(drive.max),
                    BoundaryKind::Follow { .. } => hard.cap(drive.max - FALLBACK_FOLLOW_DISTANCE),
                    BoundaryKind::Overtake => hard.raise(drive.min),
                }
            }
            let hard = hard.resolve();
            if hard.is_valid() {
                Ok(hard)
            } else {
                Err(SpeedOptError::InfeasibleBounds { t })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(KnotBounds { hard, soft: None })
}
