use super::qp::{QpError, QpProblem, QpSettings, QpSolution, WarmStart};
use super::KnotProfile;
use crate::util::Interval;
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};

/// The variables at each knot: value, first and second derivative.
const VARS_PER_KNOT: usize = 3;

/// A weighted squared residual `weight * (coeffs . [x, dx, ddx] - target)^2` at one knot.
#[derive(Clone, Copy, Debug)]
struct KnotResidual {
    knot: usize,
    coeffs: [f64; 3],
    target: f64,
    weight: f64,
}

/// A convex fit of a curve of piecewise constant third derivative,
/// sampled at evenly spaced knots.
///
/// The cost is a weighted sum of the squares of the value and its derivatives,
/// the deviations from reference values and derivatives, and any added residuals.
/// Consecutive knots are tied together by constant-jerk integration,
/// and the state at the first knot is fixed.
#[derive(Clone, Debug)]
pub struct PiecewiseJerkProblem {
    num_knots: usize,
    delta: f64,
    init: [f64; 3],
    x_bounds: Vec<Interval<f64>>,
    dx_bounds: Vec<Interval<f64>>,
    ddx_bounds: Vec<Interval<f64>>,
    dddx_bound: Interval<f64>,
    terminal_dx: Option<f64>,
    weights: [f64; 4],
    x_ref: Option<(f64, Vec<f64>)>,
    dx_ref: Option<(f64, Vec<f64>)>,
    residuals: Vec<KnotResidual>,
}

/// The fitted values and derivatives at each knot.
#[derive(Clone, Debug)]
pub struct PiecewiseJerkSolution {
    pub x: Vec<f64>,
    pub dx: Vec<f64>,
    pub ddx: Vec<f64>,
    pub qp: QpSolution,
}

impl PiecewiseJerkSolution {
    pub fn into_profile(self) -> KnotProfile {
        KnotProfile {
            distance: self.x,
            velocity: self.dx,
            acceleration: self.ddx,
        }
    }
}

#[inline(always)]
fn var(knot: usize, order: usize) -> usize {
    VARS_PER_KNOT * knot + order
}

impl PiecewiseJerkProblem {
    /// Creates an unbounded, zero-cost problem.
    ///
    /// # Parameters
    /// * `num_knots` - The number of knots, at least one.
    /// * `delta` - The spacing of the knots.
    /// * `init` - The value and its first two derivatives at the first knot.
    pub fn new(num_knots: usize, delta: f64, init: [f64; 3]) -> Self {
        let unbounded = vec![Interval::unbounded(); num_knots];
        Self {
            num_knots,
            delta,
            init,
            x_bounds: unbounded.clone(),
            dx_bounds: unbounded.clone(),
            ddx_bounds: unbounded,
            dddx_bound: Interval::unbounded(),
            terminal_dx: None,
            weights: [0.0; 4],
            x_ref: None,
            dx_ref: None,
            residuals: vec![],
        }
    }

    /// Sets the bounds on the value, one per knot.
    pub fn set_x_bounds(&mut self, bounds: Vec<Interval<f64>>) {
        self.x_bounds = bounds;
    }

    pub fn set_dx_bounds(&mut self, bounds: Interval<f64>) {
        self.dx_bounds = vec![bounds; self.num_knots];
    }

    pub fn set_ddx_bounds(&mut self, bounds: Interval<f64>) {
        self.ddx_bounds = vec![bounds; self.num_knots];
    }

    pub fn set_dddx_bound(&mut self, bound: Interval<f64>) {
        self.dddx_bound = bound;
    }

    /// Fixes the first derivative at the last knot, overriding its bounds.
    pub fn set_terminal_dx(&mut self, value: f64) {
        self.terminal_dx = Some(value);
    }

    fn dx_bound(&self, knot: usize) -> Interval<f64> {
        match self.terminal_dx {
            Some(value) if knot + 1 == self.num_knots => Interval::new(value, value),
            _ => self.dx_bounds[knot],
        }
    }

    /// Sets the weights on the squares of the value, its first and second derivatives and jerk.
    pub fn set_weights(&mut self, weights: [f64; 4]) {
        self.weights = weights;
    }

    /// Penalises deviation of the value from `reference`, one per knot.
    pub fn set_x_ref(&mut self, weight: f64, reference: Vec<f64>) {
        self.x_ref = Some((weight, reference));
    }

    /// Penalises deviation of the first derivative from `reference`, one per knot.
    pub fn set_dx_ref(&mut self, weight: f64, reference: Vec<f64>) {
        self.dx_ref = Some((weight, reference));
    }

    /// Adds the cost `weight * (coeffs . [x, dx, ddx] - target)^2` at a knot.
    pub fn add_residual(&mut self, knot: usize, coeffs: [f64; 3], target: f64, weight: f64) {
        self.residuals.push(KnotResidual {
            knot,
            coeffs,
            target,
            weight,
        });
    }

    /// Interleaves a profile into the solver's variable layout.
    pub fn interleave(profile: &KnotProfile) -> DVector<f64> {
        let n = profile.len();
        DVector::from_fn(VARS_PER_KNOT * n, |idx, _| {
            let (knot, order) = (idx / VARS_PER_KNOT, idx % VARS_PER_KNOT);
            match order {
                0 => profile.distance[knot],
                1 => profile.velocity[knot],
                _ => profile.acceleration[knot],
            }
        })
    }

    fn cost(&self) -> (CscMatrix<f64>, DVector<f64>) {
        let n = self.num_knots;
        let mut coo = CooMatrix::new(VARS_PER_KNOT * n, VARS_PER_KNOT * n);
        let mut q = DVector::zeros(VARS_PER_KNOT * n);

        // Adds to both (i, j) and (j, i); duplicates are summed on conversion
        let mut add = |i: usize, j: usize, value: f64| {
            coo.push(i, j, value);
            if i != j {
                coo.push(j, i, value);
            }
        };

        for i in 0..n {
            for order in 0..3 {
                add(var(i, order), var(i, order), 2.0 * self.weights[order]);
            }
        }

        let jerk = self.weights[3] / (self.delta * self.delta);
        for i in 0..n.saturating_sub(1) {
            let (a0, a1) = (var(i, 2), var(i + 1, 2));
            add(a0, a0, 2.0 * jerk);
            add(a1, a1, 2.0 * jerk);
            add(a1, a0, -2.0 * jerk);
        }

        for (order, reference) in [(0, &self.x_ref), (1, &self.dx_ref)] {
            if let Some((weight, values)) = reference {
                for (i, value) in values.iter().enumerate() {
                    add(var(i, order), var(i, order), 2.0 * weight);
                    q[var(i, order)] -= 2.0 * weight * value;
                }
            }
        }

        for r in &self.residuals {
            for j in 0..3 {
                q[var(r.knot, j)] -= 2.0 * r.weight * r.target * r.coeffs[j];
                for k in 0..=j {
                    add(
                        var(r.knot, j),
                        var(r.knot, k),
                        2.0 * r.weight * r.coeffs[j] * r.coeffs[k],
                    );
                }
            }
        }

        (CscMatrix::from(&coo), q)
    }

    fn constraints(&self) -> (CscMatrix<f64>, DVector<f64>, DVector<f64>) {
        let n = self.num_knots;
        let dt = self.delta;
        // Box rows, then three rows per step, then the initial state
        let rows = VARS_PER_KNOT * n + 3 * n.saturating_sub(1) + 3;
        let mut a = CooMatrix::new(rows, VARS_PER_KNOT * n);
        let (mut lower, mut upper) = (vec![], vec![]);
        let mut push = |a: &mut CooMatrix<f64>, row: Vec<(usize, f64)>, bounds: Interval<f64>| {
            let index = lower.len();
            for (col, value) in row {
                a.push(index, col, value);
            }
            lower.push(bounds.min);
            upper.push(bounds.max);
        };

        for i in 0..n {
            push(&mut a, vec![(var(i, 0), 1.0)], self.x_bounds[i]);
            push(&mut a, vec![(var(i, 1), 1.0)], self.dx_bound(i));
            push(&mut a, vec![(var(i, 2), 1.0)], self.ddx_bounds[i]);
        }

        let zero = Interval::new(0.0, 0.0);
        for i in 0..n.saturating_sub(1) {
            push(
                &mut a,
                vec![(var(i, 2), -1.0), (var(i + 1, 2), 1.0)],
                Interval::new(self.dddx_bound.min * dt, self.dddx_bound.max * dt),
            );
            push(
                &mut a,
                vec![
                    (var(i, 1), -1.0),
                    (var(i, 2), -0.5 * dt),
                    (var(i + 1, 1), 1.0),
                    (var(i + 1, 2), -0.5 * dt),
                ],
                zero,
            );
            push(
                &mut a,
                vec![
                    (var(i, 0), -1.0),
                    (var(i, 1), -dt),
                    (var(i, 2), -dt * dt / 3.0),
                    (var(i + 1, 0), 1.0),
                    (var(i + 1, 2), -dt * dt / 6.0),
                ],
                zero,
            );
        }

        for order in 0..3 {
            let value = self.init[order];
            push(&mut a, vec![(var(0, order), 1.0)], Interval::new(value, value));
        }

        (
            CscMatrix::from(&a),
            DVector::from_vec(lower),
            DVector::from_vec(upper),
        )
    }

    /// Builds the quadratic program.
    ///
    /// Fails with [QpError::InvalidProblem] if any per-knot input does not have one entry
    /// per knot, or a residual refers to a knot past the end.
    pub fn build(&self) -> Result<QpProblem, QpError> {
        let n = self.num_knots;
        if n == 0 {
            return Err(QpError::InvalidProblem("no knots"));
        }
        if !(self.delta > 0.0) {
            return Err(QpError::InvalidProblem("knot spacing must be positive"));
        }
        if [&self.x_bounds, &self.dx_bounds, &self.ddx_bounds]
            .iter()
            .any(|bounds| bounds.len() != n)
        {
            return Err(QpError::InvalidProblem("bounds must have one entry per knot"));
        }
        if [&self.x_ref, &self.dx_ref]
            .iter()
            .any(|reference| matches!(reference, Some((_, values)) if values.len() != n))
        {
            return Err(QpError::InvalidProblem("references must have one entry per knot"));
        }
        if self.residuals.iter().any(|r| r.knot >= n) {
            return Err(QpError::InvalidProblem("residual knot out of range"));
        }
        let (p, q) = self.cost();
        let (a, l, u) = self.constraints();
        QpProblem::new(p, q, a, l, u)
    }

    /// Builds and solves the problem.
    pub fn optimize(
        &self,
        settings: &QpSettings,
        warm_start: Option<&WarmStart>,
    ) -> Result<PiecewiseJerkSolution, QpError> {
        let qp = self.build()?.solve(settings, warm_start)?;
        // The solver only meets the box constraints to within its tolerance
        let column = |order: usize, bound: &dyn Fn(usize) -> Interval<f64>| -> Vec<f64> {
            (0..self.num_knots)
                .map(|i| bound(i).clamp(qp.x[var(i, order)]))
                .collect()
        };
        Ok(PiecewiseJerkSolution {
            x: column(0, &|i| self.x_bounds[i]),
            dx: column(1, &|i| self.dx_bound(i)),
            ddx: column(2, &|i| self.ddx_bounds[i]),
            qp,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn settings() -> QpSettings {
        QpSettings {
            eps_abs: 1e-6,
            eps_rel: 1e-6,
            max_iter: 20000,
            ..Default::default()
        }
    }

    #[test]
    fn integrates_constant_jerk() {
        let dt = 0.5;
        let mut problem = PiecewiseJerkProblem::new(9, dt, [0.0, 2.0, 0.0]);
        problem.set_dddx_bound(Interval::new(1.0, 1.0));
        problem.set_weights([0.0, 0.0, 1.0, 0.0]);
        let solution = problem.optimize(&settings(), None).unwrap();
        for i in 0..9 {
            let t = i as f64 * dt;
            assert_approx_eq!(solution.ddx[i], t, 1e-3);
            assert_approx_eq!(solution.dx[i], 2.0 + t * t / 2.0, 1e-3);
            assert_approx_eq!(solution.x[i], 2.0 * t + t.powi(3) / 6.0, 1e-3);
        }
    }

    #[test]
    fn respects_bounds() {
        let dt = 0.1;
        let n = 41;
        let mut problem = PiecewiseJerkProblem::new(n, dt, [0.0, 10.0, 0.0]);
        let mut bounds = vec![Interval::new(0.0, 100.0); n];
        bounds[n - 1] = Interval::new(0.0, 15.0);
        problem.set_x_bounds(bounds);
        problem.set_dx_bounds(Interval::new(0.0, 12.0));
        problem.set_ddx_bounds(Interval::new(-8.0, 2.0));
        problem.set_dddx_bound(Interval::new(-20.0, 20.0));
        problem.set_weights([0.0, 0.0, 1.0, 1.0]);
        problem.set_dx_ref(1.0, vec![12.0; n]);

        let solution = problem.optimize(&settings(), None).unwrap();
        assert!(solution.x[n - 1] <= 15.0 + 1e-3);
        for i in 0..n {
            assert!(solution.dx[i] >= -1e-3 && solution.dx[i] <= 12.0 + 1e-3);
            assert!(solution.ddx[i] >= -8.0 - 1e-3 && solution.ddx[i] <= 2.0 + 1e-3);
        }
        assert_approx_eq!(solution.dx[0], 10.0, 1e-3);
    }

    #[test]
    fn terminal_dx_comes_to_rest() {
        let n = 51;
        let mut problem = PiecewiseJerkProblem::new(n, 0.1, [0.0, 5.0, 0.0]);
        problem.set_dx_bounds(Interval::new(0.0, 10.0));
        problem.set_ddx_bounds(Interval::new(-6.0, 2.0));
        problem.set_dddx_bound(Interval::new(-4.0, 2.0));
        problem.set_weights([0.0, 0.0, 1.0, 1.0]);
        problem.set_dx_ref(1.0, vec![5.0; n]);
        problem.set_terminal_dx(0.0);

        let solution = problem.optimize(&settings(), None).unwrap();
        assert_eq!(solution.dx[n - 1], 0.0);
        assert!(solution.dx[n - 11..].windows(2).all(|w| w[1] <= w[0] + 1e-2));
        assert_approx_eq!(solution.dx[0], 5.0, 1e-3);
    }

    #[test]
    fn residuals_pull_towards_target() {
        let mut problem = PiecewiseJerkProblem::new(11, 0.1, [0.0, 0.0, 0.0]);
        problem.set_weights([0.0, 0.0, 0.0, 1e-4]);
        problem.add_residual(10, [1.0, 0.0, 0.0], 1.0, 100.0);
        let solution = problem.optimize(&settings(), None).unwrap();
        assert_approx_eq!(solution.x[10], 1.0, 1e-2);
    }

    #[test]
    fn rejects_inputs_of_the_wrong_length() {
        let mut problem = PiecewiseJerkProblem::new(5, 0.1, [0.0, 0.0, 0.0]);
        problem.set_x_bounds(vec![Interval::new(0.0, 1.0); 4]);
        assert!(matches!(problem.build(), Err(QpError::InvalidProblem(_))));
        assert!(matches!(
            problem.optimize(&settings(), None),
            Err(QpError::InvalidProblem(_))
        ));

        let mut problem = PiecewiseJerkProblem::new(5, 0.1, [0.0, 0.0, 0.0]);
        problem.set_x_ref(1.0, vec![0.0; 6]);
        assert!(matches!(problem.build(), Err(QpError::InvalidProblem(_))));

        let mut problem = PiecewiseJerkProblem::new(5, 0.1, [0.0, 0.0, 0.0]);
        problem.set_dx_ref(1.0, vec![0.0; 5]);
        problem.add_residual(5, [1.0, 0.0, 0.0], 0.0, 1.0);
        assert!(matches!(problem.build(), Err(QpError::InvalidProblem(_))));

        let mut problem = PiecewiseJerkProblem::new(5, 0.1, [0.0, 0.0, 0.0]);
        problem.set_x_bounds(vec![Interval::new(0.0, 1.0); 5]);
        problem.set_dx_ref(1.0, vec![0.0; 5]);
        assert!(problem.build().is_ok());
    }

    #[test]
    fn interleaving() {
        let profile = KnotProfile {
            distance: vec![1.0, 2.0],
            velocity: vec![3.0, 4.0],
            acceleration: vec![5.0, 6.0],
        };
        let x = PiecewiseJerkProblem::interleave(&profile);
        assert_eq!(x.as_slice(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }
}
