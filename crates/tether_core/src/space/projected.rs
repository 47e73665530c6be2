//! Manifold space without persistent structure: every new point is an ambient
//! guess pushed onto the manifold by Newton projection.

use std::rc::Rc;

use nalgebra::DVector;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traversal::{self, Step, WalkParams};
use super::{sample_ball, Configuration, SpaceBase, Traversal, TraversalSettings};
use crate::error::{Result, SpaceError};
use crate::projection::{project, ProjectionSettings};
use crate::traits::Constraint;

/// Attempts per call before sampling gives up.
pub(crate) const MAX_SAMPLE_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProjectedSettings {
    /// Maximum ambient distance between consecutive traversal states.
    pub delta: f64,
    /// Ratio of the traversal budget to the straight-line step count.
    pub lambda: f64,
    pub projection: ProjectionSettings,
    pub seed: u64,
}

impl Default for ProjectedSettings {
    fn default() -> Self {
        Self {
            delta: 0.02,
            lambda: 2.0,
            projection: ProjectionSettings::default(),
            seed: 0,
        }
    }
}

impl ProjectedSettings {
    fn validate(&self) -> Result<()> {
        if !(self.delta > 0.0 && self.delta.is_finite()) {
            return Err(SpaceError::InvalidSettings("delta must be positive".into()));
        }
        if !(self.lambda >= 1.0 && self.lambda.is_finite()) {
            return Err(SpaceError::InvalidSettings("lambda must be at least 1".into()));
        }
        validate_projection(&self.projection)
    }
}

pub(crate) fn validate_projection(settings: &ProjectionSettings) -> Result<()> {
    if settings.max_iterations == 0 {
        return Err(SpaceError::InvalidSettings(
            "projection max_iterations must be greater than zero".into(),
        ));
    }
    if !(settings.tolerance > 0.0) {
        return Err(SpaceError::InvalidSettings(
            "projection tolerance must be positive".into(),
        ));
    }
    Ok(())
}

pub struct ProjectedSpace {
    pub(crate) base: SpaceBase,
    pub(crate) settings: ProjectedSettings,
}

impl ProjectedSpace {
    pub fn new(constraint: Rc<dyn Constraint>, settings: ProjectedSettings) -> Result<Self> {
        settings.validate()?;
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Ok(Self {
            base: SpaceBase::new(constraint, settings.projection, rng),
            settings,
        })
    }

    pub fn settings(&self) -> &ProjectedSettings {
        &self.settings
    }

    /// Wraps a point already on the manifold.
    pub fn set_real_state(&self, values: DVector<f64>) -> Result<Configuration> {
        self.base.check_on_manifold(&values)?;
        Ok(Configuration::projected(values))
    }

    pub fn sample_uniform(&mut self) -> Result<Configuration> {
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let guess = self.base.bounds.sample(&mut self.base.rng);
            if let Some(cfg) = self.project_in_bounds(&guess) {
                return Ok(cfg);
            }
        }
        debug!(attempts = MAX_SAMPLE_ATTEMPTS, "uniform projection sampling failed");
        Err(SpaceError::SamplingFailed(MAX_SAMPLE_ATTEMPTS))
    }

    pub fn sample_near(&mut self, near: &Configuration, radius: f64) -> Result<Configuration> {
        self.base.check_dimension(&near.values)?;
        let dim = near.values.len();
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let guess = &near.values + sample_ball(&mut self.base.rng, dim, radius);
            if let Some(cfg) = self.project_in_bounds(&guess) {
                return Ok(cfg);
            }
        }
        Err(SpaceError::SamplingFailed(MAX_SAMPLE_ATTEMPTS))
    }

    fn project_in_bounds(&self, guess: &DVector<f64>) -> Option<Configuration> {
        let point = project(&*self.base.constraint, guess, self.base.projection).ok()?;
        self.base
            .bounds
            .contains(point.as_slice())
            .then(|| Configuration::projected(point))
    }

    /// Steps `delta` along the straight line toward `to` and projects back,
    /// until within `delta` of the target.
    pub fn traverse(
        &self,
        from: &Configuration,
        to: &Configuration,
        settings: TraversalSettings,
    ) -> Result<Traversal> {
        let constraint = &*self.base.constraint;
        let projection = self.base.projection;
        let params = WalkParams {
            delta: self.settings.delta,
            lambda: self.settings.lambda,
            settings,
        };

        traversal::walk(
            &self.base,
            from,
            to,
            params,
            |current, target, step| {
                let direction = target - current;
                let norm = direction.norm();
                if norm == 0.0 {
                    return Step::Stall;
                }
                let guess = current + direction * (step / norm);
                match project(constraint, &guess, projection) {
                    Ok(point) => Step::Candidate { point, chart: None },
                    Err(err) => Step::Diverge(format!("{err:#}")),
                }
            },
            |point, _| Configuration::projected(point),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::ExpressionConstraint;
    use crate::space::{distance, TraversalStop};

    fn circle_space() -> ProjectedSpace {
        let constraint =
            ExpressionConstraint::new(&["x", "y"], &[], &["x^2 + y^2 - 1"]).unwrap();
        ProjectedSpace::new(Rc::new(constraint), ProjectedSettings::default()).unwrap()
    }

    fn point(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    #[test]
    fn rejects_off_manifold_state() {
        let space = circle_space();
        let err = space.set_real_state(point(&[2.0, 2.0])).unwrap_err();
        assert!(matches!(err, SpaceError::InvalidAnchor { .. }));
    }

    #[test]
    fn rejects_invalid_settings() {
        let constraint =
            ExpressionConstraint::new(&["x", "y"], &[], &["x^2 + y^2 - 1"]).unwrap();
        let settings = ProjectedSettings {
            delta: 0.0,
            ..ProjectedSettings::default()
        };
        assert!(matches!(
            ProjectedSpace::new(Rc::new(constraint), settings),
            Err(SpaceError::InvalidSettings(_))
        ));
    }

    #[test]
    fn quarter_circle_traversal_is_dense_and_on_manifold() {
        let space = circle_space();
        let from = space.set_real_state(point(&[1.0, 0.0])).unwrap();
        let to = space.set_real_state(point(&[0.0, 1.0])).unwrap();
        let traversal = space
            .traverse(&from, &to, TraversalSettings::default())
            .expect("traversal");

        assert!(traversal.is_complete());
        assert_eq!(traversal.first(), &from);
        assert_eq!(traversal.last(), &to);
        for pair in traversal.states.windows(2) {
            assert!(distance(&pair[0].values, &pair[1].values) <= 0.02 + 1e-9);
        }
        for state in &traversal.states {
            assert!(space.base.constraint.residual_norm(state.as_slice()) <= 1e-6);
        }
        let quarter = std::f64::consts::FRAC_PI_2;
        assert!((traversal.length() - quarter).abs() < 0.01);
    }

    #[test]
    fn self_traversal_is_degenerate() {
        let space = circle_space();
        let p = space.set_real_state(point(&[0.0, -1.0])).unwrap();
        let traversal = space.traverse(&p, &p, TraversalSettings::default()).unwrap();
        assert!(traversal.is_complete());
        assert!(traversal.length() < 1e-12);
    }

    #[test]
    fn exhausted_step_budget_diverges() {
        let space = circle_space();
        let from = space.set_real_state(point(&[1.0, 0.0])).unwrap();
        let to = space.set_real_state(point(&[0.0, 1.0])).unwrap();
        let err = space
            .traverse(&from, &to, TraversalSettings::with_max_steps(1))
            .unwrap_err();
        assert!(matches!(err, SpaceError::TraversalDiverged { steps: 1, .. }));
    }

    #[test]
    fn antipodal_straight_line_stalls() {
        let space = circle_space();
        let from = space.set_real_state(point(&[1.0, 0.0])).unwrap();
        let to = space.set_real_state(point(&[-1.0, 0.0])).unwrap();
        let traversal = space.traverse(&from, &to, TraversalSettings::default()).unwrap();
        assert_eq!(traversal.stop, TraversalStop::NoProgress);
        assert_eq!(traversal.states.len(), 1);
    }

    #[test]
    fn validity_predicate_stops_traversal() {
        let mut space = circle_space();
        space.base.validity = Some(Rc::new(|x: &[f64]| x[1] < 0.5));
        let from = space.set_real_state(point(&[1.0, 0.0])).unwrap();
        let to = space.set_real_state(point(&[0.0, 1.0])).unwrap();
        let traversal = space.traverse(&from, &to, TraversalSettings::default()).unwrap();
        assert_eq!(traversal.stop, TraversalStop::Invalid);
        assert!(traversal.states.iter().all(|s| s.values[1] < 0.5));
    }

    #[test]
    fn samples_lie_on_manifold_and_in_bounds() {
        let mut space = circle_space();
        for _ in 0..20 {
            let cfg = space.sample_uniform().unwrap();
            assert!(space.base.constraint.residual_norm(cfg.as_slice()) <= 1e-6);
        }
        let anchor = space.set_real_state(point(&[1.0, 0.0])).unwrap();
        let near = space.sample_near(&anchor, 0.1).unwrap();
        assert!(distance(&near.values, &anchor.values) < 0.2);
    }
}
