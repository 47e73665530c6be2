use std::cell::Cell;
use std::f64::consts::PI;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use nalgebra::DVector;

use tether_core::equation_engine::ExpressionConstraint;
use tether_core::planner::{Planner, PlannerDiagnostics, PlannerStatus, PlanningQuery};
use tether_core::ply::write_atlas_ply;
use tether_core::problems::{parse_problem, Problem};
use tether_core::space::{
    AtlasSettings, AtlasSpace, ProjectedSettings, ProjectedSpace, TraversalSettings,
};
use tether_core::{
    Configuration, Experiment, ExperimentError, ExperimentStage, ManifoldSpace, SpaceError,
    SpaceVariant,
};

fn circle_constraint() -> ExpressionConstraint {
    ExpressionConstraint::new(&["x", "y"], &[], &["x^2 + y^2 - 1"]).unwrap()
}

fn point(values: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(values)
}

/// Records how often `solve` runs and never finds anything.
struct CountingPlanner {
    solves: Rc<Cell<usize>>,
}

impl Planner for CountingPlanner {
    fn name(&self) -> &str {
        "Counting"
    }

    fn setup(&mut self, _space: &ManifoldSpace, _query: PlanningQuery) -> Result<()> {
        Ok(())
    }

    fn solve(&mut self, _space: &mut ManifoldSpace, _budget: Duration) -> Result<PlannerStatus> {
        self.solves.set(self.solves.get() + 1);
        Ok(PlannerStatus::Timeout)
    }

    fn solution_path(&self) -> Option<&[Configuration]> {
        None
    }

    fn diagnostics(&self) -> PlannerDiagnostics {
        PlannerDiagnostics::default()
    }
}

#[test]
fn circle_projection_finds_half_circle() {
    let mut experiment = Experiment::new(parse_problem("circle").unwrap());
    experiment
        .configure(SpaceVariant::Projected, "RRT")
        .expect("configure");
    let status = experiment.plan(5.0).expect("plan");
    assert_eq!(status, PlannerStatus::ExactSolution);
    assert_eq!(experiment.stage(), ExperimentStage::Succeeded);

    let dense = experiment.dense_path();
    assert_eq!(dense.first().unwrap().values, point(&[1.0, 0.0]));
    assert_eq!(dense.last().unwrap().values, point(&[-1.0, 0.0]));
    let constraint = circle_constraint();
    for state in dense {
        assert!(tether_core::traits::Constraint::residual_norm(&constraint, state.as_slice()) < 1e-6);
    }
    for pair in dense.windows(2) {
        assert!((&pair[0].values - &pair[1].values).norm() <= 0.02 + 1e-9);
    }

    let report = experiment.report().expect("report");
    assert!(report.succeeded());
    assert!(!report.approximate);
    assert!(
        (report.length - PI).abs() / PI < 0.05,
        "length {} is not close to pi",
        report.length
    );
    assert_eq!(report.chart_count, 0);
    assert_eq!(experiment.stage(), ExperimentStage::ReportEmitted);

    let mut summary = Vec::new();
    report.write_summary(&mut summary).unwrap();
    let summary = String::from_utf8(summary).unwrap();
    assert!(summary.starts_with("Length: "));
    assert!(summary.contains(" seconds.\n"));
}

#[test]
fn non_positive_time_limit_never_reaches_the_planner() {
    for limit in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        let solves = Rc::new(Cell::new(0));
        let mut experiment = Experiment::new(parse_problem("circle").unwrap());
        let counter = solves.clone();
        experiment
            .configure_with(SpaceVariant::Atlas, move |_| {
                Box::new(CountingPlanner { solves: counter }) as Box<dyn Planner>
            })
            .expect("configure");

        let err = experiment.plan(limit).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidTimeLimit(_)));
        assert_eq!(solves.get(), 0);
        assert_eq!(experiment.stage(), ExperimentStage::SpaceConfigured);
    }
}

#[test]
fn planner_timeout_is_reported_as_failure() {
    let solves = Rc::new(Cell::new(0));
    let counter = solves.clone();
    let mut experiment = Experiment::new(parse_problem("circle").unwrap());
    experiment
        .configure_with(SpaceVariant::Projected, move |_| {
            Box::new(CountingPlanner { solves: counter }) as Box<dyn Planner>
        })
        .unwrap();
    assert_eq!(experiment.plan(0.01).unwrap(), PlannerStatus::Timeout);
    assert_eq!(solves.get(), 1);
    assert_eq!(experiment.stage(), ExperimentStage::Failed);

    let report = experiment.report().unwrap();
    assert!(!report.succeeded());
    assert!(report.dense_path.is_empty());
    let mut summary = Vec::new();
    report.write_summary(&mut summary).unwrap();
    assert_eq!(String::from_utf8(summary).unwrap(), "No solution found.\n");
}

#[test]
fn anchoring_off_the_circle_is_rejected() {
    let mut atlas =
        AtlasSpace::new(Rc::new(circle_constraint()), AtlasSettings::default()).unwrap();
    let err = atlas.anchor_chart(&point(&[2.0, 2.0])).unwrap_err();
    assert!(matches!(err, SpaceError::InvalidAnchor { .. }));

    let mut problem: Problem = parse_problem("circle").unwrap();
    problem.start = point(&[2.0, 2.0]);
    let mut experiment = Experiment::new(problem);
    let err = experiment.configure(SpaceVariant::Atlas, "RRT").unwrap_err();
    assert!(matches!(
        err,
        ExperimentError::Space(SpaceError::InvalidAnchor { .. })
    ));
    assert_eq!(experiment.stage(), ExperimentStage::ConstraintParsed);
}

#[test]
fn single_step_budget_diverges_between_distant_states() {
    let spaces: Vec<ManifoldSpace> = vec![
        ProjectedSpace::new(Rc::new(circle_constraint()), ProjectedSettings::default())
            .unwrap()
            .into(),
        AtlasSpace::new(Rc::new(circle_constraint()), AtlasSettings::default())
            .unwrap()
            .into(),
    ];
    for mut space in spaces {
        let from = space.configuration_at(point(&[1.0, 0.0])).unwrap();
        let to = space.configuration_at(point(&[0.0, 1.0])).unwrap();
        let err = space
            .traverse(&from, &to, TraversalSettings::with_max_steps(1))
            .unwrap_err();
        assert!(
            matches!(err, SpaceError::TraversalDiverged { .. }),
            "{:?} returned {err:?}",
            space.variant()
        );
    }
}

#[test]
fn traversal_is_repeatable_and_self_traversal_is_degenerate() {
    let mut space: ManifoldSpace =
        ProjectedSpace::new(Rc::new(circle_constraint()), ProjectedSettings::default())
            .unwrap()
            .into();
    let angle: f64 = 1.0;
    let from = space.configuration_at(point(&[1.0, 0.0])).unwrap();
    let to = space
        .configuration_at(point(&[angle.cos(), angle.sin()]))
        .unwrap();

    let first = space.traverse(&from, &to, TraversalSettings::default()).unwrap();
    let second = space.traverse(&from, &to, TraversalSettings::default()).unwrap();
    assert!(first.is_complete());
    assert_eq!(first.states, second.states);

    let itself = space.traverse(&from, &from, TraversalSettings::default()).unwrap();
    assert!(space.equal_states(itself.first(), itself.last()));
    assert_eq!(itself.length(), 0.0);
}

#[test]
fn identical_atlases_traverse_identically() {
    let sphere = || -> ManifoldSpace {
        let constraint =
            ExpressionConstraint::new(&["x", "y", "z"], &[], &["x^2 + y^2 + z^2 - 1"]).unwrap();
        AtlasSpace::new(Rc::new(constraint), AtlasSettings::default())
            .unwrap()
            .into()
    };
    let walk = |space: &mut ManifoldSpace| {
        let from = space.configuration_at(point(&[0.0, 0.0, -1.0])).unwrap();
        let to = space.configuration_at(point(&[1.0, 0.0, 0.0])).unwrap();
        space.traverse(&from, &to, TraversalSettings::default()).unwrap()
    };

    let (mut first_space, mut second_space) = (sphere(), sphere());
    let first = walk(&mut first_space);
    let second = walk(&mut second_space);
    assert!(first.is_complete());
    assert_eq!(first.states, second.states);
    assert_eq!(first_space.chart_count(), second_space.chart_count());
}

#[test]
fn configured_space_carries_driver_bounds_and_tuning() {
    let mut experiment = Experiment::new(parse_problem("torus").unwrap());
    experiment.configure(SpaceVariant::Atlas, "RRT").unwrap();
    let space = experiment.space().unwrap();
    assert_eq!(space.variant(), SpaceVariant::Atlas);
    assert_eq!(space.bounds().low, vec![-10.0; 3]);
    assert_eq!(space.bounds().high, vec![10.0; 3]);
    assert_eq!(space.delta(), 0.02);
    assert_eq!(space.lambda(), 2.0);
    assert_eq!(space.manifold_dimension(), 2);
}

#[test]
fn short_chart_traversal_is_dense() {
    let mut space: ManifoldSpace =
        AtlasSpace::new(Rc::new(circle_constraint()), AtlasSettings::default())
            .unwrap()
            .into();
    let angle: f64 = 0.3;
    let from = space.configuration_at(point(&[1.0, 0.0])).unwrap();
    let to = space
        .configuration_at(point(&[angle.cos(), angle.sin()]))
        .unwrap();
    let traversal = space.traverse(&from, &to, TraversalSettings::default()).unwrap();
    assert!(traversal.is_complete());
    assert!(traversal.states.len() >= 2);
    for pair in traversal.states.windows(2) {
        assert!(space.distance(&pair[0], &pair[1]) <= space.delta() + 1e-9);
    }
}

#[test]
fn sphere_atlas_run_reports_charts_and_dumps_mesh() {
    let mut experiment = Experiment::new(parse_problem("sphere").unwrap());
    experiment
        .configure(SpaceVariant::Atlas, "RRTConnect")
        .expect("configure");
    let charts_before = experiment.space().unwrap().chart_count();
    assert_eq!(charts_before, 2);

    experiment.plan(20.0).expect("plan");
    let report = experiment.report().expect("report");
    assert!(report.succeeded());
    assert!(report.chart_count >= charts_before);
    assert!(report.frontier_percent.is_some());

    let problem = parse_problem("sphere").unwrap();
    let valid = problem.validity_checker();
    for pose in &report.dense_path {
        assert!(valid(pose));
    }

    let mut summary = Vec::new();
    report.write_summary(&mut summary).unwrap();
    let summary = String::from_utf8(summary).unwrap();
    assert!(summary.contains(&format!("Atlas created {} charts.", report.chart_count)));
    assert!(summary.contains("% open."));

    let atlas = experiment.space().and_then(ManifoldSpace::as_atlas).unwrap();
    let mut ply = Vec::new();
    write_atlas_ply(&mut ply, atlas).unwrap();
    let ply = String::from_utf8(ply).unwrap();
    assert!(ply.starts_with("ply\nformat ascii 1.0\n"));
    assert!(ply.contains("element face"));
}
