use crate::solver::{NlpFailure, QpError};
use thiserror::Error;

/// The reasons a speed optimization cycle can fail.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SpeedOptError {
    #[error("Speed Optimizer receives empty path data")]
    EmptyPath,
    #[error("Fail to get rough speed at t = {t}")]
    RoughSpeedUnavailable { t: f64 },
    #[error("Infeasible position bounds at t = {t}")]
    InfeasibleBounds { t: f64 },
    #[error("Speed Optimization by Quadratic Programming failed: {0}")]
    QpFailed(#[source] QpError),
    #[error("Smoothing of the {profile} profile failed: {source}")]
    SmoothingFailed {
        profile: &'static str,
        #[source]
        source: QpError,
    },
    #[error("Warm start arrays are empty or of unequal length")]
    WarmStartInvalid,
    #[error("Speed Optimization by nonlinear programming failed: {0}")]
    NlpFailed(#[source] NlpFailure),
}

impl SpeedOptError {
    /// Whether the cycle can continue with the convex stage's result.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SpeedOptError::SmoothingFailed { .. }
                | SpeedOptError::WarmStartInvalid
                | SpeedOptError::NlpFailed(_)
        )
    }
}
