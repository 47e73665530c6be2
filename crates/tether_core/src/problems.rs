//! Built-in planning problems: a constraint, start/goal, and obstacles.

use std::rc::Rc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use nalgebra::DVector;
use tracing::warn;

use crate::equation_engine::ExpressionConstraint;
use crate::space::ValidityFn;
use crate::traits::Constraint;

/// Names accepted by `parse_problem`.
pub const PROBLEMS: &[&str] = &["circle", "sphere", "torus", "paraboloid"];

/// Half-height of the sphere's equatorial wall.
const WALL_HALF_HEIGHT: f64 = 0.1;
/// Half-width of the two gaps in the wall, measured along y.
const GAP_HALF_WIDTH: f64 = 0.1;

pub struct Problem {
    pub name: &'static str,
    pub constraint: Rc<dyn Constraint>,
    pub start: DVector<f64>,
    pub goal: DVector<f64>,
    pub validity: ValidityFn,
    /// Added to every validity check to emulate an expensive collision checker.
    pub artificial_delay: Duration,
}

impl Problem {
    pub fn ambient_dimension(&self) -> usize {
        self.constraint.ambient_dimension()
    }

    /// Returns the problem with every validity check slowed down by `delay`.
    pub fn with_artificial_delay(mut self, delay: Duration) -> Self {
        self.artificial_delay = delay;
        self
    }

    /// The predicate to install in a space, including the artificial delay.
    pub fn validity_checker(&self) -> ValidityFn {
        if self.artificial_delay.is_zero() {
            return self.validity.clone();
        }
        let inner = self.validity.clone();
        let delay = self.artificial_delay;
        Rc::new(move |x: &[f64]| {
            thread::sleep(delay);
            inner(x)
        })
    }
}

/// Looks up a built-in problem by name.
pub fn parse_problem(name: &str) -> Option<Problem> {
    let built = match name {
        "circle" => circle(),
        "sphere" => sphere(),
        "torus" => torus(),
        "paraboloid" => paraboloid(),
        _ => return None,
    };
    match built {
        Ok(problem) => Some(problem),
        Err(err) => {
            warn!(problem = name, error = %err, "failed to build problem");
            None
        }
    }
}

fn free_space() -> ValidityFn {
    Rc::new(|_: &[f64]| true)
}

fn problem(
    name: &'static str,
    constraint: ExpressionConstraint,
    start: &[f64],
    goal: &[f64],
    validity: ValidityFn,
) -> Problem {
    Problem {
        name,
        constraint: Rc::new(constraint),
        start: DVector::from_column_slice(start),
        goal: DVector::from_column_slice(goal),
        validity,
        artificial_delay: Duration::ZERO,
    }
}

fn circle() -> Result<Problem> {
    let constraint = ExpressionConstraint::new(&["x", "y"], &[], &["x^2 + y^2 - 1"])?;
    Ok(problem("circle", constraint, &[1.0, 0.0], &[-1.0, 0.0], free_space()))
}

/// Unit sphere split at the equator by a wall with gaps at x = ±1.
fn sphere() -> Result<Problem> {
    let constraint =
        ExpressionConstraint::new(&["x", "y", "z"], &[], &["x^2 + y^2 + z^2 - 1"])?;
    let wall: ValidityFn =
        Rc::new(|x: &[f64]| x[2].abs() >= WALL_HALF_HEIGHT || x[1].abs() < GAP_HALF_WIDTH);
    Ok(problem(
        "sphere",
        constraint,
        &[0.0, 0.0, -1.0],
        &[0.0, 0.0, 1.0],
        wall,
    ))
}

fn torus() -> Result<Problem> {
    let constraint = ExpressionConstraint::new(
        &["x", "y", "z"],
        &[("R", 2.0), ("r", 1.0)],
        &["(sqrt(x^2 + y^2) - R)^2 + z^2 - r^2"],
    )?;
    Ok(problem(
        "torus",
        constraint,
        &[-2.0, 0.0, -1.0],
        &[2.0, 0.0, 1.0],
        free_space(),
    ))
}

fn paraboloid() -> Result<Problem> {
    let constraint = ExpressionConstraint::new(&["x", "y", "z"], &[], &["z - x^2 - y^2"])?;
    Ok(problem(
        "paraboloid",
        constraint,
        &[-1.0, -1.0, 2.0],
        &[1.0, 1.0, 2.0],
        free_space(),
    ))
}
