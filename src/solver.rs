//! Convex and nonlinear solvers for piecewise-jerk profiles.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

pub use nlp::{NlpFailure, NlpSolution, NlpStatus, SpeedNlp};
pub use piecewise_jerk::{PiecewiseJerkProblem, PiecewiseJerkSolution};
pub use qp::{QpError, QpProblem, QpSettings, QpSolution, QpStatus, WarmStart};

mod nlp;
mod piecewise_jerk;
mod qp;

/// Distance, velocity and acceleration at each knot of a profile.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KnotProfile {
    pub distance: Vec<f64>,
    pub velocity: Vec<f64>,
    pub acceleration: Vec<f64>,
}

impl KnotProfile {
    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    /// Whether the profile is non-empty and its three arrays are of equal length.
    pub fn is_consistent(&self) -> bool {
        !self.distance.is_empty()
            && self.distance.len() == self.velocity.len()
            && self.distance.len() == self.acceleration.len()
    }

    /// The largest absolute difference between two profiles of the same length.
    pub fn max_difference(&self, other: &KnotProfile) -> f64 {
        let pairs = [
            (&self.distance, &other.distance),
            (&self.velocity, &other.velocity),
            (&self.acceleration, &other.acceleration),
        ];
        pairs
            .iter()
            .flat_map(|(a, b)| a.iter().zip(b.iter()).map(|(a, b)| (a - b).abs()))
            .fold(0.0, |max, d| if d.is_nan() { d } else { f64::max(max, d) })
    }
}

static PROCESS_WIDE_LOCK: Lazy<Arc<Mutex<()>>> = Lazy::new(Default::default);

/// Serializes nonlinear solves. Cloned handles share the same lock.
#[derive(Clone)]
pub struct SolveLock {
    mutex: Option<Arc<Mutex<()>>>,
}

impl SolveLock {
    /// A lock shared by every handle created by this function, across the whole process.
    pub fn process_wide() -> Self {
        Self {
            mutex: Some(PROCESS_WIDE_LOCK.clone()),
        }
    }

    /// A new lock, shared only by clones of the returned handle.
    pub fn new() -> Self {
        Self {
            mutex: Some(Default::default()),
        }
    }

    /// A lock which never blocks, for single threaded use.
    pub fn noop() -> Self {
        Self { mutex: None }
    }

    /// Runs `f` while holding the lock.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.mutex.as_ref().map(|mutex| mutex.lock());
        f()
    }
}

impl Default for SolveLock {
    fn default() -> Self {
        Self::process_wide()
    }
}

impl std::fmt::Debug for SolveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.mutex {
            Some(mutex) => write!(f, "SolveLock({:p})", Arc::as_ptr(mutex)),
            None => write!(f, "SolveLock(noop)"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn lock_serializes_across_threads() {
        let lock = SolveLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (lock, active, overlaps) = (lock.clone(), active.clone(), overlaps.clone());
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        lock.run(|| {
                            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::yield_now();
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn noop_lock_is_reentrant() {
        let lock = SolveLock::noop();
        assert_eq!(lock.run(|| lock.run(|| 42)), 42);
    }

    #[test]
    fn warm_start_consistency() {
        let mut profile = KnotProfile {
            distance: vec![0.0, 1.0],
            velocity: vec![10.0, 10.0],
            acceleration: vec![0.0, 0.0],
        };
        assert!(profile.is_consistent());
        profile.acceleration.pop();
        assert!(!profile.is_consistent());
        assert!(!KnotProfile::default().is_consistent());
    }
}
