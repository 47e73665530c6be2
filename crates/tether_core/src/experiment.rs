//! Experiment driver: configure a space for a problem, plan, densify the
//! solution along the manifold, and report.
//!
//! The driver is a small state machine; each operation checks the stage it
//! expects and moves to the next one.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ExperimentError, SpaceError};
use crate::planner::{
    Planner, PlannerDiagnostics, PlannerKind, PlannerStatus, PlanningQuery, APPROX_GOAL_DISTANCE,
};
use crate::problems::Problem;
use crate::space::{
    AtlasSettings, AtlasSpace, Bounds, Configuration, ManifoldSpace, ProjectedSettings,
    ProjectedSpace, SpaceVariant, TraversalSettings,
};

/// Extension range used by planners on the projected representation.
pub const PROJECTED_PLANNER_RANGE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStage {
    Init,
    ConstraintParsed,
    SpaceConfigured,
    Planned,
    Succeeded,
    Failed,
    ReportEmitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub atlas: AtlasSettings,
    pub projected: ProjectedSettings,
    /// Every ambient coordinate is bounded to `[low, high]`.
    pub bounds_low: f64,
    pub bounds_high: f64,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            atlas: AtlasSettings::default(),
            projected: ProjectedSettings::default(),
            bounds_low: -10.0,
            bounds_high: 10.0,
        }
    }
}

pub struct Experiment {
    problem: Problem,
    settings: ExperimentSettings,
    stage: ExperimentStage,
    space: Option<ManifoldSpace>,
    planner: Option<Box<dyn Planner>>,
    status: Option<PlannerStatus>,
    elapsed: Duration,
    dense_path: Vec<Configuration>,
    length: f64,
    diagnostics: PlannerDiagnostics,
}

impl Experiment {
    pub fn new(problem: Problem) -> Self {
        Self::with_settings(problem, ExperimentSettings::default())
    }

    pub fn with_settings(problem: Problem, settings: ExperimentSettings) -> Self {
        debug!(problem = problem.name, "constraint parsed");
        Self {
            problem,
            settings,
            stage: ExperimentStage::ConstraintParsed,
            space: None,
            planner: None,
            status: None,
            elapsed: Duration::ZERO,
            dense_path: Vec::new(),
            length: 0.0,
            diagnostics: PlannerDiagnostics::default(),
        }
    }

    pub fn stage(&self) -> ExperimentStage {
        self.stage
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn space(&self) -> Option<&ManifoldSpace> {
        self.space.as_ref()
    }

    pub fn status(&self) -> Option<PlannerStatus> {
        self.status
    }

    pub fn dense_path(&self) -> &[Configuration] {
        &self.dense_path
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Planner graph and properties, available once planning ran.
    pub fn diagnostics(&self) -> &PlannerDiagnostics {
        &self.diagnostics
    }

    fn expect_stage(&self, expected: ExperimentStage) -> Result<(), ExperimentError> {
        if self.stage != expected {
            return Err(ExperimentError::Stage {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    /// Builds the space, anchors start and goal, and binds the named planner.
    pub fn configure(
        &mut self,
        variant: SpaceVariant,
        planner: &str,
    ) -> Result<(), ExperimentError> {
        self.expect_stage(ExperimentStage::ConstraintParsed)?;
        let kind = PlannerKind::from_name(planner)
            .ok_or_else(|| ExperimentError::UnknownPlanner(planner.to_string()))?;
        self.configure_with(variant, |range| kind.build(range))
    }

    /// Like `configure`, with the planner built by `make_planner` from the
    /// extension range (`rho_s` for atlases, 0.7 for projection).
    pub fn configure_with<F>(
        &mut self,
        variant: SpaceVariant,
        make_planner: F,
    ) -> Result<(), ExperimentError>
    where
        F: FnOnce(f64) -> Box<dyn Planner>,
    {
        self.expect_stage(ExperimentStage::ConstraintParsed)?;
        let problem = &self.problem;
        let constraint = problem.constraint.clone();

        let (mut space, range, start, goal): (ManifoldSpace, f64, Configuration, Configuration) =
            match variant {
                SpaceVariant::Atlas => {
                    let mut atlas = AtlasSpace::new(constraint, self.settings.atlas)?;
                    let start_chart = atlas.anchor_chart(&problem.start)?;
                    let goal_chart = atlas.anchor_chart(&problem.goal)?;
                    let start = atlas.set_real_state(problem.start.clone(), start_chart)?;
                    let goal = atlas.set_real_state(problem.goal.clone(), goal_chart)?;
                    let range = atlas.rho_s();
                    (atlas.into(), range, start, goal)
                }
                SpaceVariant::Projected => {
                    let projected = ProjectedSpace::new(constraint, self.settings.projected)?;
                    let start = projected.set_real_state(problem.start.clone())?;
                    let goal = projected.set_real_state(problem.goal.clone())?;
                    (projected.into(), PROJECTED_PLANNER_RANGE, start, goal)
                }
            };

        space.set_bounds(Bounds::uniform(
            space.ambient_dimension(),
            self.settings.bounds_low,
            self.settings.bounds_high,
        ))?;
        space.set_validity_checker(problem.validity_checker());

        let mut planner = make_planner(range);
        planner
            .setup(&space, PlanningQuery { start, goal })
            .map_err(|source| ExperimentError::Planner {
                name: planner.name().to_string(),
                source,
            })?;

        info!(
            problem = problem.name,
            planner = planner.name(),
            ?variant,
            range,
            "space configured"
        );
        self.space = Some(space);
        self.planner = Some(planner);
        transition(&mut self.stage, ExperimentStage::SpaceConfigured);
        Ok(())
    }

    /// Runs the planner for at most `time_limit` seconds and, on success,
    /// reconstructs the dense path. Returns the planner status.
    pub fn plan(&mut self, time_limit: f64) -> Result<PlannerStatus, ExperimentError> {
        self.expect_stage(ExperimentStage::SpaceConfigured)?;
        if !(time_limit.is_finite() && time_limit > 0.0) {
            return Err(ExperimentError::InvalidTimeLimit(time_limit));
        }
        let budget = Duration::try_from_secs_f64(time_limit)
            .map_err(|_| ExperimentError::InvalidTimeLimit(time_limit))?;
        let (Some(space), Some(planner)) = (self.space.as_mut(), self.planner.as_mut()) else {
            return Err(ExperimentError::Stage {
                expected: ExperimentStage::SpaceConfigured,
                actual: self.stage,
            });
        };

        let started = Instant::now();
        let solved = planner.solve(space, budget);
        self.elapsed = started.elapsed();
        let status = solved.map_err(|source| ExperimentError::Planner {
            name: planner.name().to_string(),
            source,
        })?;
        self.diagnostics = planner.diagnostics();
        self.status = Some(status);
        let waypoints = planner
            .solution_path()
            .map(<[Configuration]>::to_vec)
            .unwrap_or_default();
        transition(&mut self.stage, ExperimentStage::Planned);

        info!(?status, elapsed = self.elapsed.as_secs_f64(), "planning finished");
        if !status.has_solution() {
            transition(&mut self.stage, ExperimentStage::Failed);
            return Ok(status);
        }

        match reconstruct_path(space, &waypoints) {
            Ok((dense, length)) => {
                self.dense_path = dense;
                self.length = length;
                transition(&mut self.stage, ExperimentStage::Succeeded);
                Ok(status)
            }
            Err(err) => {
                warn!(%err, "path reconstruction failed");
                transition(&mut self.stage, ExperimentStage::Failed);
                Err(err.into())
            }
        }
    }

    /// Summarizes a finished experiment.
    pub fn report(&mut self) -> Result<ExperimentReport, ExperimentError> {
        let outcome = match self.stage {
            ExperimentStage::Succeeded | ExperimentStage::Failed => self.stage,
            ExperimentStage::ReportEmitted if self.status.is_some() => {
                if self.dense_path.is_empty() {
                    ExperimentStage::Failed
                } else {
                    ExperimentStage::Succeeded
                }
            }
            actual => {
                return Err(ExperimentError::Stage {
                    expected: ExperimentStage::Succeeded,
                    actual,
                })
            }
        };

        let space = self.space.as_ref();
        let variant = space.map_or(SpaceVariant::Projected, ManifoldSpace::variant);
        let atlas = space.and_then(ManifoldSpace::as_atlas);
        let frontier_percent = atlas
            .filter(|_| self.problem.ambient_dimension() == 3)
            .map(AtlasSpace::estimate_frontier_percent);

        let report = ExperimentReport {
            problem: self.problem.name.to_string(),
            planner: self
                .planner
                .as_ref()
                .map(|p| p.name().to_string())
                .unwrap_or_default(),
            variant,
            outcome,
            status: self.status,
            approximate: self.status == Some(PlannerStatus::ApproximateSolution),
            length: self.length,
            elapsed_secs: self.elapsed.as_secs_f64(),
            chart_count: space.map_or(0, ManifoldSpace::chart_count),
            frontier_percent,
            approx_goal_distance: self
                .diagnostics
                .properties
                .get(APPROX_GOAL_DISTANCE)
                .and_then(|v| v.parse().ok()),
            dense_path: self
                .dense_path
                .iter()
                .map(|c| c.values.iter().copied().collect())
                .collect(),
        };
        transition(&mut self.stage, ExperimentStage::ReportEmitted);
        Ok(report)
    }
}

fn transition(stage: &mut ExperimentStage, next: ExperimentStage) {
    debug!(from = ?*stage, to = ?next, "experiment stage");
    *stage = next;
}

/// Densifies `waypoints` by traversing between consecutive pairs. The result
/// starts with the first waypoint; segments whose traversal starts and ends at
/// the same state add nothing. Returns the dense path and its length.
pub fn reconstruct_path(
    space: &mut ManifoldSpace,
    waypoints: &[Configuration],
) -> Result<(Vec<Configuration>, f64), SpaceError> {
    let Some(first) = waypoints.first() else {
        return Ok((Vec::new(), 0.0));
    };
    let mut dense = vec![first.clone()];
    let mut length = 0.0;

    for pair in waypoints.windows(2) {
        let traversal = space.traverse(&pair[0], &pair[1], TraversalSettings::default())?;
        if !traversal.is_complete() {
            return Err(SpaceError::TraversalDiverged {
                steps: traversal.states.len() - 1,
                reason: format!("segment stopped early: {:?}", traversal.stop),
            });
        }
        if space.equal_states(traversal.first(), traversal.last()) {
            continue;
        }
        length += traversal.length();
        dense.extend(traversal.states.into_iter().skip(1));
    }
    Ok((dense, length))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub problem: String,
    pub planner: String,
    pub variant: SpaceVariant,
    /// `Succeeded` or `Failed`.
    pub outcome: ExperimentStage,
    pub status: Option<PlannerStatus>,
    pub approximate: bool,
    pub length: f64,
    pub elapsed_secs: f64,
    pub chart_count: usize,
    /// Share of frontier charts, for atlases of 3D problems.
    pub frontier_percent: Option<f64>,
    pub approx_goal_distance: Option<f64>,
    pub dense_path: Vec<Vec<f64>>,
}

impl ExperimentReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ExperimentStage::Succeeded
    }

    pub fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if self.succeeded() {
            if self.approximate {
                writeln!(out, "Solution is approximate.")?;
            }
            writeln!(out, "Length: {}", self.length)?;
            writeln!(out, "Took {} seconds.", self.elapsed_secs)?;
        } else if self.status.is_some_and(|status| status.has_solution()) {
            writeln!(out, "Path reconstruction failed.")?;
        } else {
            writeln!(out, "No solution found.")?;
        }
        if let Some(gap) = self.approx_goal_distance {
            writeln!(out, "Approx goal distance: {gap}")?;
        }
        if self.variant == SpaceVariant::Atlas {
            writeln!(out, "Atlas created {} charts.", self.chart_count)?;
        }
        if let Some(open) = self.frontier_percent {
            writeln!(out, "{open}% open.")?;
        }
        Ok(())
    }

    /// One pose per line, components separated by spaces.
    pub fn write_dense_path<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for pose in &self.dense_path {
            let line: Vec<String> = pose.iter().map(f64::to_string).collect();
            writeln!(out, "{}", line.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problems::parse_problem;
    use nalgebra::DVector;

    fn report(outcome: ExperimentStage, approximate: bool) -> ExperimentReport {
        let status = match outcome {
            ExperimentStage::Succeeded => PlannerStatus::ApproximateSolution,
            _ => PlannerStatus::Timeout,
        };
        ExperimentReport {
            problem: "sphere".into(),
            planner: "RRT".into(),
            variant: SpaceVariant::Atlas,
            outcome,
            status: Some(status),
            approximate,
            length: 1.5,
            elapsed_secs: 0.25,
            chart_count: 12,
            frontier_percent: Some(50.0),
            approx_goal_distance: Some(0.125),
            dense_path: vec![vec![0.0, 0.0, -1.0], vec![0.5, 0.0, 1.0]],
        }
    }

    #[test]
    fn summary_lines_for_success() {
        let mut out = Vec::new();
        report(ExperimentStage::Succeeded, true)
            .write_summary(&mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Solution is approximate.\nLength: 1.5\nTook 0.25 seconds.\n\
             Approx goal distance: 0.125\nAtlas created 12 charts.\n50% open.\n"
        );
    }

    #[test]
    fn summary_lines_for_failure() {
        let mut out = Vec::new();
        report(ExperimentStage::Failed, false)
            .write_summary(&mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("No solution found.\n"));
        assert!(!text.contains("Length"));
    }

    /// Hands back the query endpoints as its solution without searching.
    struct DirectPlanner {
        path: Vec<Configuration>,
    }

    impl Planner for DirectPlanner {
        fn name(&self) -> &str {
            "Direct"
        }

        fn setup(&mut self, _space: &ManifoldSpace, query: PlanningQuery) -> anyhow::Result<()> {
            self.path = vec![query.start, query.goal];
            Ok(())
        }

        fn solve(
            &mut self,
            _space: &mut ManifoldSpace,
            _budget: Duration,
        ) -> anyhow::Result<PlannerStatus> {
            Ok(PlannerStatus::ExactSolution)
        }

        fn solution_path(&self) -> Option<&[Configuration]> {
            Some(&self.path)
        }

        fn diagnostics(&self) -> PlannerDiagnostics {
            PlannerDiagnostics::default()
        }
    }

    #[test]
    fn reconstruction_failure_is_not_reported_as_missing_solution() {
        // Circle start and goal are antipodal, so the direct segment cannot be walked.
        let mut experiment = Experiment::new(parse_problem("circle").unwrap());
        experiment
            .configure_with(SpaceVariant::Projected, |_| {
                Box::new(DirectPlanner { path: Vec::new() }) as Box<dyn Planner>
            })
            .unwrap();
        let err = experiment.plan(1.0).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::Space(SpaceError::TraversalDiverged { .. })
        ));
        assert_eq!(experiment.stage(), ExperimentStage::Failed);

        let report = experiment.report().unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.status, Some(PlannerStatus::ExactSolution));
        let mut out = Vec::new();
        report.write_summary(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Path reconstruction failed.\n");
    }

    #[test]
    fn dense_path_is_one_pose_per_line() {
        let mut out = Vec::new();
        report(ExperimentStage::Succeeded, false)
            .write_dense_path(&mut out)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0 0 -1\n0.5 0 1\n");
    }

    #[test]
    fn operations_out_of_order_are_rejected() {
        let mut experiment = Experiment::new(parse_problem("circle").unwrap());
        assert!(matches!(
            experiment.plan(1.0),
            Err(ExperimentError::Stage {
                expected: ExperimentStage::SpaceConfigured,
                actual: ExperimentStage::ConstraintParsed,
            })
        ));
        assert!(experiment.report().is_err());
    }

    #[test]
    fn unknown_planner_is_rejected() {
        let mut experiment = Experiment::new(parse_problem("circle").unwrap());
        let err = experiment
            .configure(SpaceVariant::Projected, "PRM*")
            .unwrap_err();
        assert!(matches!(err, ExperimentError::UnknownPlanner(name) if name == "PRM*"));
        assert_eq!(experiment.stage(), ExperimentStage::ConstraintParsed);
    }

    #[test]
    fn reconstruction_skips_degenerate_segments() {
        let mut experiment = Experiment::new(parse_problem("circle").unwrap());
        experiment.configure(SpaceVariant::Projected, "RRT").unwrap();
        let space = experiment.space.as_mut().unwrap();
        let a = space.configuration_at(DVector::from_vec(vec![1.0, 0.0])).unwrap();
        let b = space.configuration_at(DVector::from_vec(vec![0.0, 1.0])).unwrap();

        let (dense, length) =
            reconstruct_path(space, &[a.clone(), a.clone(), b.clone()]).unwrap();
        assert_eq!(dense.first(), Some(&a));
        assert_eq!(dense.last(), Some(&b));
        assert!((length - std::f64::consts::FRAC_PI_2).abs() < 0.01);
        // The repeated waypoint contributes no state.
        assert!(!space.equal_states(&dense[0], &dense[1]));

        let (dense, length) = reconstruct_path(space, &[a.clone(), a.clone()]).unwrap();
        assert_eq!(dense.len(), 1);
        assert_eq!(length, 0.0);
    }
}
