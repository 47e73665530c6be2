pub mod autodiff;
pub mod equation_engine;
pub mod error;
pub mod experiment;
pub mod planner;
pub mod ply;
pub mod problems;
pub mod projection;
pub mod space;
/// The `tether_core` crate is the engine behind the Tether CLI: motion planning
/// on configuration spaces confined to a constraint manifold `F(x) = 0`.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `ScalarMap` and `Constraint`.
/// - **Equation Engine**: bytecode VM compiling constraint expressions, evaluated on `f64` or duals.
/// - **Autodiff**: Dual numbers giving exact constraint Jacobians.
/// - **Projection**: Newton projection, chart lifts and tangent bases.
/// - **Space**: `ManifoldSpace` with atlas and projected representations and manifold traversal.
/// - **Planner**: RRT and RRTConnect over a `ManifoldSpace`.
/// - **Experiment**: the driver that plans, densifies the path and reports.
pub mod traits;

pub use error::{ExperimentError, SpaceError};
pub use experiment::{Experiment, ExperimentReport, ExperimentStage};
pub use space::{Configuration, ManifoldSpace, SpaceVariant};
