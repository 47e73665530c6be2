use thiserror::Error;

use crate::experiment::ExperimentStage;
use crate::space::ChartId;

/// Errors raised by the manifold state spaces.
#[derive(Debug, Error)]
pub enum SpaceError {
    /// A chart or configuration was anchored at a point off the manifold.
    #[error("cannot anchor at a point off the manifold (‖F(x)‖ = {residual:e}, tolerance {tolerance:e})")]
    InvalidAnchor { residual: f64, tolerance: f64 },

    /// A configuration was bound to a chart that does not cover it.
    #[error("chart {chart} does not cover the given point")]
    ChartMismatch { chart: ChartId },

    /// Traversal did not reach its target.
    #[error("manifold traversal diverged after {steps} steps: {reason}")]
    TraversalDiverged { steps: usize, reason: String },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Sampling gave up after its attempt budget.
    #[error("no valid sample after {0} attempts")]
    SamplingFailed(usize),

    /// Numerical failure (projection, tangent space) outside a traversal.
    #[error("projection failed: {0}")]
    Projection(#[source] anyhow::Error),
}

/// Errors raised while running an experiment.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("time limit must be positive, got {0}")]
    InvalidTimeLimit(f64),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error("operation requires stage {expected:?}, experiment is at {actual:?}")]
    Stage {
        expected: ExperimentStage,
        actual: ExperimentStage,
    },

    #[error("unknown planner {0}")]
    UnknownPlanner(String),

    #[error("planner {name} failed: {source}")]
    Planner {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SpaceError> = std::result::Result<T, E>;
