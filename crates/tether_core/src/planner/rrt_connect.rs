use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, trace};

use super::tree::Tree;
use super::{extend, Extension, Planner, PlannerDiagnostics, PlannerStatus, PlanningQuery};
use crate::space::{Configuration, ManifoldSpace};

/// Bidirectional RRT: grows one tree toward a sample, then greedily connects
/// the other tree to the new node. The trees swap roles every iteration.
pub struct RrtConnect {
    range: f64,
    start_tree: Tree,
    goal_tree: Tree,
    solution: Option<Vec<Configuration>>,
    iterations: usize,
}

enum Connect {
    Joined(usize),
    Stuck,
}

impl RrtConnect {
    pub fn new(range: f64) -> Self {
        Self {
            range,
            start_tree: Tree::default(),
            goal_tree: Tree::default(),
            solution: None,
            iterations: 0,
        }
    }

    /// Extends `tree` toward `target` until it reaches it or stops advancing.
    fn connect(
        space: &mut ManifoldSpace,
        tree: &mut Tree,
        target: &Configuration,
        range: f64,
    ) -> Connect {
        let mut from = tree.nearest(target);
        loop {
            match extend(space, tree.state(from), target, range) {
                Extension::Reached(state) => return Connect::Joined(tree.add(state, from)),
                Extension::Advanced(state) => from = tree.add(state, from),
                Extension::Trapped => return Connect::Stuck,
            }
        }
    }
}

impl Planner for RrtConnect {
    fn name(&self) -> &str {
        "RRTConnect"
    }

    fn setup(&mut self, _space: &ManifoldSpace, query: PlanningQuery) -> Result<()> {
        if !(self.range > 0.0) {
            bail!("RRTConnect range must be positive, got {}", self.range);
        }
        self.start_tree = Tree::rooted(query.start);
        self.goal_tree = Tree::rooted(query.goal);
        self.solution = None;
        self.iterations = 0;
        Ok(())
    }

    fn solve(&mut self, space: &mut ManifoldSpace, budget: Duration) -> Result<PlannerStatus> {
        if self.start_tree.is_empty() || self.goal_tree.is_empty() {
            bail!("RRTConnect::solve called before setup");
        }
        let deadline = Instant::now() + budget;
        let mut grow_start = true;

        while Instant::now() < deadline {
            self.iterations += 1;
            let sample = match space.sample_uniform() {
                Ok(sample) => sample,
                Err(err) => {
                    trace!(%err, "sampling failed");
                    continue;
                }
            };

            let (grown, other) = if grow_start {
                (&mut self.start_tree, &mut self.goal_tree)
            } else {
                (&mut self.goal_tree, &mut self.start_tree)
            };
            grow_start = !grow_start;

            let nearest = grown.nearest(&sample);
            let state = match extend(space, grown.state(nearest), &sample, self.range) {
                Extension::Reached(state) | Extension::Advanced(state) => state,
                Extension::Trapped => continue,
            };
            let added = grown.add(state, nearest);
            let target = grown.state(added).clone();

            if let Connect::Joined(joined) = Self::connect(space, other, &target, self.range) {
                // `grow_start` was already flipped: true means `grown` was the goal tree.
                let (start_end, goal_end) = if grow_start {
                    (joined, added)
                } else {
                    (added, joined)
                };
                let mut path = self.start_tree.path_to(start_end);
                let mut tail = self.goal_tree.path_to(goal_end);
                tail.reverse();
                // Both halves end at the meeting state.
                path.extend(tail.into_iter().skip(1));
                debug!(
                    iterations = self.iterations,
                    vertices = self.start_tree.len() + self.goal_tree.len(),
                    "RRTConnect joined the trees"
                );
                self.solution = Some(path);
                return Ok(PlannerStatus::ExactSolution);
            }
        }
        Ok(PlannerStatus::Timeout)
    }

    fn solution_path(&self) -> Option<&[Configuration]> {
        self.solution.as_deref()
    }

    fn diagnostics(&self) -> PlannerDiagnostics {
        let mut diagnostics = PlannerDiagnostics::default();
        self.start_tree
            .export(&mut diagnostics.vertices, &mut diagnostics.edges);
        self.goal_tree
            .export(&mut diagnostics.vertices, &mut diagnostics.edges);
        diagnostics
            .properties
            .insert("iterations INTEGER".into(), self.iterations.to_string());
        diagnostics
    }
}
