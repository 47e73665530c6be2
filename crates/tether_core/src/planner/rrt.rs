use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use super::tree::Tree;
use super::{
    extend, Extension, Planner, PlannerDiagnostics, PlannerStatus, PlanningQuery,
    APPROX_GOAL_DISTANCE,
};
use crate::space::{Configuration, ManifoldSpace};

/// Probability of steering toward the goal instead of a uniform sample.
const GOAL_BIAS: f64 = 0.05;

/// Goal-biased rapidly-exploring random tree.
pub struct Rrt {
    range: f64,
    rng: ChaCha8Rng,
    tree: Tree,
    goal: Option<Configuration>,
    solution: Option<Vec<Configuration>>,
    approx_goal_distance: Option<f64>,
    iterations: usize,
}

impl Rrt {
    pub fn new(range: f64) -> Self {
        Self {
            range,
            rng: ChaCha8Rng::seed_from_u64(0),
            tree: Tree::default(),
            goal: None,
            solution: None,
            approx_goal_distance: None,
            iterations: 0,
        }
    }
}

impl Planner for Rrt {
    fn name(&self) -> &str {
        "RRT"
    }

    fn setup(&mut self, _space: &ManifoldSpace, query: PlanningQuery) -> Result<()> {
        if !(self.range > 0.0) {
            bail!("RRT range must be positive, got {}", self.range);
        }
        self.tree = Tree::rooted(query.start);
        self.goal = Some(query.goal);
        self.solution = None;
        self.approx_goal_distance = None;
        self.iterations = 0;
        Ok(())
    }

    fn solve(&mut self, space: &mut ManifoldSpace, budget: Duration) -> Result<PlannerStatus> {
        let Some(goal) = self.goal.clone() else {
            bail!("RRT::solve called before setup");
        };
        if self.tree.is_empty() {
            bail!("RRT::solve called before setup");
        }
        let deadline = Instant::now() + budget;
        let mut best = (0usize, space.distance(self.tree.state(0), &goal));

        while Instant::now() < deadline {
            self.iterations += 1;
            let target = if self.rng.random::<f64>() < GOAL_BIAS {
                goal.clone()
            } else {
                match space.sample_uniform() {
                    Ok(sample) => sample,
                    Err(err) => {
                        trace!(%err, "sampling failed");
                        continue;
                    }
                }
            };

            let nearest = self.tree.nearest(&target);
            let state = match extend(space, self.tree.state(nearest), &target, self.range) {
                Extension::Reached(state) | Extension::Advanced(state) => state,
                Extension::Trapped => continue,
            };
            let index = self.tree.add(state, nearest);

            let gap = space.distance(self.tree.state(index), &goal);
            if gap < best.1 {
                best = (index, gap);
            }
            if space.equal_states(self.tree.state(index), &goal) {
                debug!(
                    iterations = self.iterations,
                    vertices = self.tree.len(),
                    "RRT found an exact solution"
                );
                self.solution = Some(self.tree.path_to(index));
                return Ok(PlannerStatus::ExactSolution);
            }
        }

        if self.tree.len() > 1 {
            debug!(gap = best.1, "RRT returning an approximate solution");
            self.solution = Some(self.tree.path_to(best.0));
            self.approx_goal_distance = Some(best.1);
            return Ok(PlannerStatus::ApproximateSolution);
        }
        Ok(PlannerStatus::Timeout)
    }

    fn solution_path(&self) -> Option<&[Configuration]> {
        self.solution.as_deref()
    }

    fn diagnostics(&self) -> PlannerDiagnostics {
        let mut diagnostics = PlannerDiagnostics::default();
        self.tree
            .export(&mut diagnostics.vertices, &mut diagnostics.edges);
        diagnostics
            .properties
            .insert("iterations INTEGER".into(), self.iterations.to_string());
        if let Some(gap) = self.approx_goal_distance {
            diagnostics
                .properties
                .insert(APPROX_GOAL_DISTANCE.into(), gap.to_string());
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::ExpressionConstraint;
    use crate::space::{ProjectedSettings, ProjectedSpace};
    use nalgebra::DVector;
    use std::rc::Rc;

    fn circle() -> ManifoldSpace {
        let constraint =
            ExpressionConstraint::new(&["x", "y"], &[], &["x^2 + y^2 - 1"]).unwrap();
        ProjectedSpace::new(Rc::new(constraint), ProjectedSettings::default())
            .unwrap()
            .into()
    }

    #[test]
    fn solves_the_circle() {
        let mut space = circle();
        let start = space
            .configuration_at(DVector::from_vec(vec![1.0, 0.0]))
            .unwrap();
        let goal = space
            .configuration_at(DVector::from_vec(vec![0.0, 1.0]))
            .unwrap();
        let mut planner = Rrt::new(0.7);
        planner
            .setup(&space, PlanningQuery { start: start.clone(), goal: goal.clone() })
            .unwrap();
        let status = planner.solve(&mut space, Duration::from_secs(5)).unwrap();
        assert_eq!(status, PlannerStatus::ExactSolution);

        let path = planner.solution_path().unwrap();
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&goal));
        let diagnostics = planner.diagnostics();
        assert!(diagnostics.vertices.len() >= 2);
        assert_eq!(diagnostics.edges.len(), diagnostics.vertices.len() - 1);
    }

    #[test]
    fn solve_before_setup_fails() {
        let mut space = circle();
        let mut planner = Rrt::new(0.7);
        assert!(planner.solve(&mut space, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn blocked_goal_gives_an_approximate_solution() {
        let mut space = circle();
        space.set_validity_checker(Rc::new(|x: &[f64]| x[0] > 0.0 || x[1] < 0.0));
        let start = space
            .configuration_at(DVector::from_vec(vec![1.0, 0.0]))
            .unwrap();
        let goal = space
            .configuration_at(DVector::from_vec(vec![-0.6, 0.8]))
            .unwrap();
        let mut planner = Rrt::new(0.7);
        planner.setup(&space, PlanningQuery { start, goal }).unwrap();
        let status = planner
            .solve(&mut space, Duration::from_millis(200))
            .unwrap();
        assert_eq!(status, PlannerStatus::ApproximateSolution);
        assert!(planner
            .diagnostics()
            .properties
            .contains_key(APPROX_GOAL_DISTANCE));
    }
}
