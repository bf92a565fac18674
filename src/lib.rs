pub use boundary::{BoundaryKind, EndInteraction, StBoundary, StGraphData};
pub use bounds::{compile_bounds, knot_count, KnotBounds};
pub use cgmath;
pub use config::{SmootherConfig, SpeedOptimizerConfig, VehicleLimits};
pub use debug::{DebugRecord, DiagnosticRecorder, DiagnosticSink, NoDiagnostics};
pub use error::SpeedOptError;
pub use optimizer::{
    Checkpoint, OptimizerState, PlanFailure, PlanReport, SpeedOptimizer, SpeedPlanningInput,
};
pub use path::{DiscretizedPath, PathPoint};
pub use slotmap::{Key, KeyData};
pub use smoother::ProfileSmoother;
pub use speed::{SpeedData, SpeedLimit, SpeedPoint};
pub use util::Interval;
use slotmap::new_key_type;

mod boundary;
mod bounds;
mod config;
mod debug;
mod error;
pub mod math;
mod optimizer;
mod path;
mod smoother;
pub mod solver;
mod speed;
mod util;

new_key_type! {
    /// Unique ID of a [StBoundary].
    pub struct BoundaryId;
}
