//! An ADMM solver for convex quadratic programs of the form
//!
//! ```text
//! minimise    0.5 x'Px + q'x
//! subject to  l <= Ax <= u
//! ```
//!
//! with `P` and `A` held in compressed sparse column form. The reduced KKT matrix is
//! factorised once by a sparse Cholesky and reused until the penalty changes.

use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use thiserror::Error;

/// Rows whose bounds are closer than this are treated as equalities.
const EQUALITY_TOLERANCE: f64 = 1e-4;

/// Equality rows use a penalty this many times larger than inequality rows.
const EQUALITY_RHO_SCALE: f64 = 1e3;

const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;

/// The penalty is only updated if it changes by more than this factor.
const RHO_UPDATE_FACTOR: f64 = 5.0;

/// Reasons a quadratic program could not be solved.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum QpError {
    #[error("invalid problem: {0}")]
    InvalidProblem(&'static str),
    #[error("KKT matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("iterate contains a non-finite value")]
    NonFinite,
    #[error("did not converge within {iterations} iterations")]
    MaxIterations { iterations: usize },
}

/// The quality of an accepted solution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpStatus {
    /// The residuals are within tolerance.
    Solved,
    /// The iteration budget ran out with residuals within ten times the tolerance.
    SolvedInaccurate,
}

/// Parameters of the ADMM iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct QpSettings {
    pub rho: f64,
    pub sigma: f64,
    /// The over-relaxation parameter, in `(0, 2)`.
    pub alpha: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    pub max_iter: usize,
    /// How often, in iterations, the residuals are checked.
    pub check_interval: usize,
    /// How often, in iterations, the penalty is adapted. Zero disables adaptation.
    pub adaptive_rho_interval: usize,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            rho: 0.1,
            sigma: 1e-6,
            alpha: 1.6,
            eps_abs: 1e-4,
            eps_rel: 1e-4,
            max_iter: 4000,
            check_interval: 5,
            adaptive_rho_interval: 25,
        }
    }
}

/// A starting point for the solver.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmStart {
    /// The primal variables.
    pub x: DVector<f64>,
    /// The dual variables, if known.
    pub y: Option<DVector<f64>>,
}

/// An accepted solution.
#[derive(Clone, Debug)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub y: DVector<f64>,
    pub status: QpStatus,
    pub iterations: usize,
}

impl QpSolution {
    /// A warm start for solving a similar problem.
    pub fn warm_start(&self) -> WarmStart {
        WarmStart {
            x: self.x.clone(),
            y: Some(self.y.clone()),
        }
    }
}

/// A convex quadratic program.
#[derive(Clone, Debug)]
pub struct QpProblem {
    p: CscMatrix<f64>,
    q: DVector<f64>,
    a: CscMatrix<f64>,
    at: CscMatrix<f64>,
    l: DVector<f64>,
    u: DVector<f64>,
}

/// Residuals of an iterate and their tolerances.
struct Residuals {
    prim: f64,
    dual: f64,
    prim_scale: f64,
    dual_scale: f64,
}

impl Residuals {
    fn within(&self, settings: &QpSettings, factor: f64) -> bool {
        let eps_prim = settings.eps_abs + settings.eps_rel * self.prim_scale;
        let eps_dual = settings.eps_abs + settings.eps_rel * self.dual_scale;
        self.prim <= factor * eps_prim && self.dual <= factor * eps_dual
    }

    fn is_finite(&self) -> bool {
        self.prim.is_finite() && self.dual.is_finite()
    }
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter()
        .fold(0.0, |max, x| if x.is_nan() { *x } else { f64::max(max, x.abs()) })
}

/// A square sparse matrix with `values` on its diagonal.
fn diagonal(values: &[f64]) -> CscMatrix<f64> {
    let mut coo = CooMatrix::new(values.len(), values.len());
    for (i, value) in values.iter().enumerate() {
        coo.push(i, i, *value);
    }
    CscMatrix::from(&coo)
}

impl QpProblem {
    /// Creates a problem, checking that the dimensions agree and that `l <= u`.
    ///
    /// # Parameters
    /// * `p` - The symmetric, positive semi-definite cost matrix, with both triangles stored.
    /// * `q` - The linear cost vector.
    /// * `a` - The constraint matrix.
    /// * `l`, `u` - The constraint bounds, which may be infinite.
    pub fn new(
        p: CscMatrix<f64>,
        q: DVector<f64>,
        a: CscMatrix<f64>,
        l: DVector<f64>,
        u: DVector<f64>,
    ) -> Result<Self, QpError> {
        let n = q.len();
        if p.nrows() != n || p.ncols() != n || a.ncols() != n {
            return Err(QpError::InvalidProblem("dimension mismatch in the cost"));
        }
        if l.len() != a.nrows() || u.len() != a.nrows() {
            return Err(QpError::InvalidProblem("dimension mismatch in the constraints"));
        }
        if l.iter().zip(u.iter()).any(|(l, u)| !(l <= u)) {
            return Err(QpError::InvalidProblem("lower bound exceeds upper bound"));
        }
        let finite = |values: &[f64]| values.iter().all(|v| v.is_finite());
        if !finite(q.as_slice()) || !finite(p.values()) || !finite(a.values()) {
            return Err(QpError::NonFinite);
        }
        let at = a.transpose();
        Ok(Self { p, q, a, at, l, u })
    }

    pub fn num_variables(&self) -> usize {
        self.q.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.l.len()
    }

    /// The value of the cost at `x`.
    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.p * x)) + self.q.dot(x)
    }

    fn rho_vector(&self, rho: f64) -> DVector<f64> {
        DVector::from_fn(self.l.len(), |i, _| {
            let (l, u) = (self.l[i], self.u[i]);
            if l == f64::NEG_INFINITY && u == f64::INFINITY {
                RHO_MIN
            } else if u - l < EQUALITY_TOLERANCE {
                EQUALITY_RHO_SCALE * rho
            } else {
                rho
            }
        })
    }

    /// Factorises `P + sigma I + A' diag(rho) A`.
    fn factorize(&self, sigma: f64, rho: &DVector<f64>) -> Result<CscCholesky<f64>, QpError> {
        let gram = &self.at * &(&diagonal(rho.as_slice()) * &self.a);
        let regularised = &self.p + &diagonal(&vec![sigma; self.num_variables()]);
        CscCholesky::factor(&(&regularised + &gram)).map_err(|_| QpError::NotPositiveDefinite)
    }

    fn residuals(&self, x: &DVector<f64>, y: &DVector<f64>, z: &DVector<f64>) -> Residuals {
        let ax = &self.a * x;
        let px = &self.p * x;
        let aty = &self.at * y;
        let prim = inf_norm(&(&ax - z));
        let dual = inf_norm(&(&px + &self.q + &aty));
        Residuals {
            prim,
            dual,
            prim_scale: f64::max(inf_norm(&ax), inf_norm(z)),
            dual_scale: inf_norm(&px).max(inf_norm(&aty)).max(inf_norm(&self.q)),
        }
    }

    fn project(&self, v: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(v.len(), |i, _| v[i].max(self.l[i]).min(self.u[i]))
    }

    /// Solves the problem.
    ///
    /// A warm start whose dimensions do not match the problem is ignored.
    pub fn solve(
        &self,
        settings: &QpSettings,
        warm_start: Option<&WarmStart>,
    ) -> Result<QpSolution, QpError> {
        let (n, m) = (self.num_variables(), self.num_constraints());
        let warm_start = warm_start.filter(|w| w.x.len() == n);
        let mut x = warm_start.map(|w| w.x.clone()).unwrap_or_else(|| DVector::zeros(n));
        let mut y = warm_start
            .and_then(|w| w.y.clone())
            .filter(|y| y.len() == m)
            .unwrap_or_else(|| DVector::zeros(m));
        let mut z = self.project(&(&self.a * &x));

        let mut rho = settings.rho;
        let mut rho_vec = self.rho_vector(rho);
        let mut factor = self.factorize(settings.sigma, &rho_vec)?;
        let alpha = settings.alpha;

        for iteration in 1..=settings.max_iter {
            let rhs =
                &x * settings.sigma - &self.q + &self.at * &(rho_vec.component_mul(&z) - &y);
            let x_tilde = DVector::from_column_slice(factor.solve(&rhs).as_slice());
            let z_tilde = &self.a * &x_tilde;

            x = &x_tilde * alpha + &x * (1.0 - alpha);
            let z_relaxed = &z_tilde * alpha + &z * (1.0 - alpha);
            let z_next = self.project(&(&z_relaxed + y.component_div(&rho_vec)));
            y += rho_vec.component_mul(&(&z_relaxed - &z_next));
            z = z_next;

            let last = iteration == settings.max_iter;
            if iteration % settings.check_interval.max(1) != 0 && !last {
                continue;
            }

            let residuals = self.residuals(&x, &y, &z);
            if !residuals.is_finite() || x.iter().any(|v| !v.is_finite()) {
                return Err(QpError::NonFinite);
            }
            if residuals.within(settings, 1.0) {
                debug!(
                    "QP solved in {iteration} iterations, residuals {:.1e}/{:.1e}",
                    residuals.prim, residuals.dual
                );
                return Ok(QpSolution {
                    x,
                    y,
                    status: QpStatus::Solved,
                    iterations: iteration,
                });
            }
            if last {
                if residuals.within(settings, 10.0) {
                    debug!(
                        "QP solved inaccurately, residuals {:.1e}/{:.1e}",
                        residuals.prim, residuals.dual
                    );
                    return Ok(QpSolution {
                        x,
                        y,
                        status: QpStatus::SolvedInaccurate,
                        iterations: iteration,
                    });
                }
                break;
            }

            let interval = settings.adaptive_rho_interval;
            if interval > 0 && iteration % interval == 0 {
                let prim = residuals.prim / (residuals.prim_scale + 1e-10);
                let dual = residuals.dual / (residuals.dual_scale + 1e-10);
                let new_rho = (rho * (prim / (dual + 1e-10)).sqrt()).clamp(RHO_MIN, RHO_MAX);
                if new_rho > rho * RHO_UPDATE_FACTOR || new_rho < rho / RHO_UPDATE_FACTOR {
                    rho = new_rho;
                    rho_vec = self.rho_vector(rho);
                    factor = self.factorize(settings.sigma, &rho_vec)?;
                }
            }
        }

        Err(QpError::MaxIterations {
            iterations: settings.max_iter,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn vector(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    fn matrix(rows: usize, cols: usize, entries: &[(usize, usize, f64)]) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(rows, cols);
        for &(i, j, v) in entries {
            coo.push(i, j, v);
        }
        CscMatrix::from(&coo)
    }

    /// min 0.5 (x0^2 + x1^2) - x0 - x1, s.t. x0 + x1 = 1, 0 <= x1 <= 0.2
    fn problem() -> QpProblem {
        let p = diagonal(&[1.0, 1.0]);
        let a = matrix(2, 2, &[(0, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0)]);
        QpProblem::new(p, vector(&[-1.0, -1.0]), a, vector(&[1.0, 0.0]), vector(&[1.0, 0.2]))
            .unwrap()
    }

    #[test]
    fn equality_and_box() {
        let solution = problem().solve(&QpSettings::default(), None).unwrap();
        assert_eq!(solution.status, QpStatus::Solved);
        assert_approx_eq!(solution.x[0], 0.8, 1e-3);
        assert_approx_eq!(solution.x[1], 0.2, 1e-3);
    }

    #[test]
    fn unconstrained_rows() {
        let problem = QpProblem::new(
            diagonal(&[2.0]),
            vector(&[-6.0]),
            diagonal(&[1.0]),
            vector(&[f64::NEG_INFINITY]),
            vector(&[f64::INFINITY]),
        )
        .unwrap();
        let solution = problem.solve(&QpSettings::default(), None).unwrap();
        assert_approx_eq!(solution.x[0], 3.0, 1e-3);
        assert_approx_eq!(problem.objective(&solution.x), -9.0, 1e-3);
    }

    #[test]
    fn warm_start_converges_sooner() {
        let problem = problem();
        let settings = QpSettings::default();
        let cold = problem.solve(&settings, None).unwrap();
        let warm = problem.solve(&settings, Some(&cold.warm_start())).unwrap();
        assert!(warm.iterations <= cold.iterations);
        assert_approx_eq!(warm.x[0], 0.8, 1e-3);
    }

    #[test]
    fn iteration_limit() {
        let settings = QpSettings {
            max_iter: 1,
            ..Default::default()
        };
        assert_eq!(
            problem().solve(&settings, None).unwrap_err(),
            QpError::MaxIterations { iterations: 1 }
        );
    }

    #[test]
    fn rejects_bad_problems() {
        let result = QpProblem::new(
            diagonal(&[0.0, 0.0]),
            vector(&[0.0]),
            matrix(0, 1, &[]),
            vector(&[]),
            vector(&[]),
        );
        assert!(matches!(result, Err(QpError::InvalidProblem(_))));

        let a = diagonal(&[1.0]);
        let result = QpProblem::new(
            diagonal(&[0.0]),
            vector(&[0.0]),
            a.clone(),
            vector(&[1.0]),
            vector(&[0.0]),
        );
        assert!(matches!(result, Err(QpError::InvalidProblem(_))));

        let result = QpProblem::new(
            diagonal(&[f64::NAN]),
            vector(&[0.0]),
            a.clone(),
            vector(&[0.0]),
            vector(&[1.0]),
        );
        assert!(matches!(result, Err(QpError::NonFinite)));

        let problem =
            QpProblem::new(diagonal(&[-1.0]), vector(&[0.0]), a, vector(&[0.0]), vector(&[1.0]))
                .unwrap();
        assert_eq!(
            problem.solve(&QpSettings::default(), None).unwrap_err(),
            QpError::NotPositiveDefinite
        );
    }

    #[test]
    fn coupled_cost_matches_dense_solution() {
        // P couples both variables, so the factorisation sees off-diagonal entries
        let p = matrix(2, 2, &[(0, 0, 4.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 3.0)]);
        let q = vector(&[-1.0, -2.0]);
        let problem = QpProblem::new(
            p,
            q.clone(),
            diagonal(&[1.0, 1.0]),
            vector(&[f64::NEG_INFINITY; 2]),
            vector(&[f64::INFINITY; 2]),
        )
        .unwrap();
        let solution = problem.solve(&QpSettings::default(), None).unwrap();

        let dense = nalgebra::DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let expected = dense.cholesky().unwrap().solve(&(-q));
        assert_approx_eq!(solution.x[0], expected[0], 1e-3);
        assert_approx_eq!(solution.x[1], expected[1], 1e-3);
    }
}
