//! Obstacle interaction regions on the ST (time vs. distance) graph.

use crate::math::{lerp, Point2d};
use crate::speed::SpeedLimit;
use crate::util::Interval;
use crate::BoundaryId;
use slotmap::SlotMap;

/// Knots within this many seconds of an end interaction point use its gap.
const END_INTERACTION_TIME_WINDOW: f64 = 0.05; // s

/// Times this close outside a boundary's time range still count as within it.
const TIME_EPSILON: f64 = 1e-6; // s

/// How the ego vehicle must interact with the obstacle behind a boundary.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoundaryKind {
    /// Stop before the boundary; it may never be passed.
    Stop,
    /// Let the obstacle pass first, staying `gap` metres behind the boundary.
    Yield {
        gap: f64,
        end_interaction: Option<EndInteraction>,
    },
    /// Follow the obstacle, staying `gap` metres behind the boundary.
    Follow {
        gap: f64,
        end_interaction: Option<EndInteraction>,
    },
    /// Pass the obstacle, staying ahead of the boundary.
    Overtake,
}

/// A precise point at which an interaction ends, and the gap required there.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EndInteraction {
    /// The time of the end of the interaction in s.
    pub t: f64,
    /// The gap required at that time in m.
    pub s_gap: f64,
}

impl BoundaryKind {
    /// The gap to keep behind a yield or follow boundary at time `t`.
    /// Near the end interaction point, the larger of the two gaps is used.
    pub fn gap_at(&self, t: f64) -> f64 {
        match *self {
            BoundaryKind::Yield {
                gap,
                end_interaction,
            }
            | BoundaryKind::Follow {
                gap,
                end_interaction,
            } => match end_interaction {
                Some(poi) if (poi.t - t).abs() < END_INTERACTION_TIME_WINDOW => {
                    f64::max(gap, poi.s_gap)
                }
                _ => gap,
            },
            BoundaryKind::Stop | BoundaryKind::Overtake => 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BoundaryKind::Stop => "STOP",
            BoundaryKind::Yield { .. } => "YIELD",
            BoundaryKind::Follow { .. } => "FOLLOW",
            BoundaryKind::Overtake => "OVERTAKE",
        }
    }
}

/// The region of the ST graph occupied by an obstacle, bounded by a lower and
/// an upper polyline of `(t, s)` points sharing the same times.
#[derive(Clone, Debug)]
pub struct StBoundary {
    kind: BoundaryKind,
    lower: Vec<Point2d>,
    upper: Vec<Point2d>,
}

impl StBoundary {
    /// Creates a boundary from `(t, s_lower, s_upper)` samples ordered by time.
    /// Returns `None` if there are fewer than two samples or the times are not increasing.
    pub fn new(kind: BoundaryKind, samples: &[(f64, f64, f64)]) -> Option<Self> {
        if samples.len() < 2 || samples.windows(2).any(|w| !(w[0].0 < w[1].0)) {
            return None;
        }
        let lower = samples.iter().map(|(t, s, _)| Point2d::new(*t, *s)).collect();
        let upper = samples.iter().map(|(t, _, s)| Point2d::new(*t, *s)).collect();
        Some(Self { kind, lower, upper })
    }

    /// Creates a boundary occupying the `s` range over the time range `t`.
    pub fn rectangle(kind: BoundaryKind, t: Interval<f64>, s: Interval<f64>) -> Option<Self> {
        Self::new(kind, &[(t.min, s.min, s.max), (t.max, s.min, s.max)])
    }

    pub fn kind(&self) -> &BoundaryKind {
        &self.kind
    }

    /// The time range over which the boundary exists.
    pub fn time_range(&self) -> Interval<f64> {
        Interval::new(self.lower[0].x, self.lower[self.lower.len() - 1].x)
    }

    /// The range of positions the ego vehicle may occupy at time `t` given this boundary,
    /// or `None` if the boundary does not constrain that time.
    ///
    /// Boundaries to stay behind give `[0, lower edge]`; overtaken boundaries give
    /// `[upper edge, inf)`.
    pub fn unblocked_range(&self, t: f64) -> Option<Interval<f64>> {
        let range = self.time_range();
        if !(range.min - TIME_EPSILON <= t && t <= range.max + TIME_EPSILON) {
            return None;
        }
        match self.kind {
            BoundaryKind::Stop | BoundaryKind::Yield { .. } | BoundaryKind::Follow { .. } => {
                Some(Interval::new(0.0, sample_polyline(&self.lower, t)))
            }
            BoundaryKind::Overtake => {
                Some(Interval::new(sample_polyline(&self.upper, t), f64::INFINITY))
            }
        }
    }
}

/// Linearly interpolates `s` at time `t` along a polyline of `(t, s)` points.
fn sample_polyline(points: &[Point2d], t: f64) -> f64 {
    let idx = points.partition_point(|p| p.x < t);
    if idx == 0 {
        return points[0].y;
    }
    if idx == points.len() {
        return points[idx - 1].y;
    }
    let (p0, p1) = (points[idx - 1], points[idx]);
    lerp(p0.y, p1.y, (t - p0.x) / (p1.x - p0.x))
}

/// Everything the speed optimizer needs to know about the ST graph.
#[derive(Clone, Debug)]
pub struct StGraphData {
    boundaries: SlotMap<BoundaryId, StBoundary>,
    speed_limit: SpeedLimit,
    path_length: f64,
    total_time: f64,
    init_v: f64,
    init_a: f64,
}

impl StGraphData {
    /// Creates an ST graph with no boundaries.
    ///
    /// # Parameters
    /// * `path_length` - The length of the path in m.
    /// * `total_time` - The planning horizon in s.
    /// * `init_v` - The ego vehicle's initial velocity in m/s.
    /// * `init_a` - The ego vehicle's initial acceleration in m/s<sup>2</sup>.
    pub fn new(
        path_length: f64,
        total_time: f64,
        init_v: f64,
        init_a: f64,
        speed_limit: SpeedLimit,
    ) -> Self {
        Self {
            boundaries: SlotMap::with_key(),
            speed_limit,
            path_length,
            total_time,
            init_v,
            init_a,
        }
    }

    /// Adds a boundary to the graph.
    pub fn add_boundary(&mut self, boundary: StBoundary) -> BoundaryId {
        self.boundaries.insert(boundary)
    }

    /// Removes a boundary from the graph.
    pub fn remove_boundary(&mut self, id: BoundaryId) -> Option<StBoundary> {
        self.boundaries.remove(id)
    }

    /// Returns an iterator over all the boundaries in the graph.
    pub fn iter_boundaries(&self) -> impl Iterator<Item = (BoundaryId, &StBoundary)> {
        self.boundaries.iter()
    }

    pub fn is_boundaries_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    pub fn speed_limit(&self) -> &SpeedLimit {
        &self.speed_limit
    }

    pub fn path_length(&self) -> f64 {
        self.path_length
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    pub fn init_v(&self) -> f64 {
        self.init_v
    }

    pub fn init_a(&self) -> f64 {
        self.init_a
    }
}
