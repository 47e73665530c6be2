//! Sampling-based planners over a `ManifoldSpace`.
//!
//! Planners only see the space through sampling, distance and traversal, so
//! the same planner runs on either representation.

pub mod rrt;
pub mod rrt_connect;
mod tree;

pub use rrt::Rrt;
pub use rrt_connect::RrtConnect;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::space::{Configuration, ManifoldSpace, TraversalSettings};

/// Names accepted by `parse_planner`.
pub const PLANNERS: &[&str] = &["RRT", "RRTConnect"];

/// Property set by planners that return an approximate solution.
pub const APPROX_GOAL_DISTANCE: &str = "approx goal distance REAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    ExactSolution,
    /// Best effort when the budget ran out; the path ends short of the goal.
    ApproximateSolution,
    Timeout,
}

impl PlannerStatus {
    pub fn has_solution(&self) -> bool {
        !matches!(self, PlannerStatus::Timeout)
    }
}

/// Start and goal handed to a planner at setup.
#[derive(Debug, Clone)]
pub struct PlanningQuery {
    pub start: Configuration,
    pub goal: Configuration,
}

/// Exploration graph and named statistics collected after `solve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerDiagnostics {
    pub properties: BTreeMap<String, String>,
    pub vertices: Vec<Vec<f64>>,
    pub edges: Vec<(usize, usize)>,
}

pub trait Planner {
    fn name(&self) -> &str;

    /// Resets internal state and roots the search at the query.
    fn setup(&mut self, space: &ManifoldSpace, query: PlanningQuery) -> Result<()>;

    /// Searches until a solution is found or `budget` wall-clock time elapses.
    /// The budget is checked between iterations.
    fn solve(&mut self, space: &mut ManifoldSpace, budget: Duration) -> Result<PlannerStatus>;

    /// Waypoints of the last solution, start first.
    fn solution_path(&self) -> Option<&[Configuration]>;

    fn diagnostics(&self) -> PlannerDiagnostics;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlannerKind {
    Rrt,
    RrtConnect,
}

impl PlannerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RRT" => Some(PlannerKind::Rrt),
            "RRTConnect" => Some(PlannerKind::RrtConnect),
            _ => None,
        }
    }

    /// `range` bounds the length of one extension.
    pub fn build(self, range: f64) -> Box<dyn Planner> {
        match self {
            PlannerKind::Rrt => Box::new(Rrt::new(range)),
            PlannerKind::RrtConnect => Box::new(RrtConnect::new(range)),
        }
    }
}

/// Builds a planner by name.
pub fn parse_planner(name: &str, range: f64) -> Option<Box<dyn Planner>> {
    PlannerKind::from_name(name).map(|kind| kind.build(range))
}

/// Result of growing a tree node toward a target.
pub(crate) enum Extension {
    /// The target itself was reached.
    Reached(Configuration),
    /// Progress was made, ending at this state.
    Advanced(Configuration),
    Trapped,
}

/// Traverses from `from` toward `to` and keeps the prefix no longer than
/// `range`. Partial traversals still count as progress.
pub(crate) fn extend(
    space: &mut ManifoldSpace,
    from: &Configuration,
    to: &Configuration,
    range: f64,
) -> Extension {
    let traversal = match space.traverse(from, to, TraversalSettings::default()) {
        Ok(traversal) => traversal,
        Err(err) => {
            trace!(%err, "extension failed");
            return Extension::Trapped;
        }
    };

    let mut travelled = 0.0;
    let mut last = 0;
    for (i, pair) in traversal.states.windows(2).enumerate() {
        travelled += space.distance(&pair[0], &pair[1]);
        if travelled > range {
            break;
        }
        last = i + 1;
    }

    if last == 0 {
        return Extension::Trapped;
    }
    let reached = traversal.is_complete() && last == traversal.states.len() - 1;
    let mut states = traversal.states;
    states.truncate(last + 1);
    let end = states.swap_remove(last);
    if reached {
        Extension::Reached(end)
    } else {
        Extension::Advanced(end)
    }
}

pub(crate) fn to_vertex(values: &DVector<f64>) -> Vec<f64> {
    values.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_planner_parses() {
        for name in PLANNERS {
            let planner = parse_planner(name, 0.5).expect("listed planner");
            assert_eq!(planner.name(), *name);
        }
        assert!(parse_planner("PRM", 0.5).is_none());
    }
}
