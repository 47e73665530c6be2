//! Configuration spaces confined to a constraint manifold.
//!
//! `ManifoldSpace` is the single interface the planners and the experiment
//! driver use. It dispatches to one of two representations:
//! - **Atlas**: a growing set of charts (local tangent-plane parameterizations)
//!   used to sample and to walk along the manifold.
//! - **Projected**: no persistent structure; points are pushed onto the manifold
//!   by Newton projection whenever needed.

pub mod atlas;
pub mod projected;
pub mod traversal;

pub use atlas::{AtlasSettings, AtlasSpace, Chart};
pub use projected::{ProjectedSettings, ProjectedSpace};
pub use traversal::{Traversal, TraversalSettings, TraversalStop};

use std::rc::Rc;

use nalgebra::DVector;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpaceError};
use crate::projection::ProjectionSettings;
use crate::traits::Constraint;

/// Index of a chart in an atlas' chart arena.
pub type ChartId = usize;

/// Predicate deciding whether an ambient point is collision free.
pub type ValidityFn = Rc<dyn Fn(&[f64]) -> bool>;

/// Component-wise tolerance used by `equal_states`.
pub const STATE_EQUALITY_TOL: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceVariant {
    Atlas,
    Projected,
}

/// Which representation produced a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// `chart` is a non-owning back-reference into the atlas.
    Atlas { chart: Option<ChartId> },
    Projected,
}

/// A point of the ambient space known to lie on the manifold.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub values: DVector<f64>,
    pub representation: Representation,
}

impl Configuration {
    pub fn atlas(values: DVector<f64>, chart: Option<ChartId>) -> Self {
        Self {
            values,
            representation: Representation::Atlas { chart },
        }
    }

    pub fn projected(values: DVector<f64>) -> Self {
        Self {
            values,
            representation: Representation::Projected,
        }
    }

    pub fn chart(&self) -> Option<ChartId> {
        match self.representation {
            Representation::Atlas { chart } => chart,
            Representation::Projected => None,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        self.values.as_slice()
    }
}

/// Axis-aligned box in the ambient space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

impl Bounds {
    pub fn uniform(dim: usize, low: f64, high: f64) -> Self {
        Self {
            low: vec![low; dim],
            high: vec![high; dim],
        }
    }

    pub fn dimension(&self) -> usize {
        self.low.len()
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.low.len()
            && x
                .iter()
                .zip(self.low.iter().zip(&self.high))
                .all(|(v, (lo, hi))| *v >= *lo && *v <= *hi)
    }

    pub fn sample(&self, rng: &mut impl Rng) -> DVector<f64> {
        DVector::from_iterator(
            self.low.len(),
            self.low
                .iter()
                .zip(&self.high)
                .map(|(lo, hi)| if hi > lo { rng.random_range(*lo..*hi) } else { *lo }),
        )
    }

    fn validate(&self) -> Result<()> {
        if self.low.len() != self.high.len() {
            return Err(SpaceError::InvalidSettings(
                "bounds must have matching low/high lengths".into(),
            ));
        }
        if self.low.iter().zip(&self.high).any(|(lo, hi)| !(lo <= hi)) {
            return Err(SpaceError::InvalidSettings(
                "bounds must satisfy low <= high".into(),
            ));
        }
        Ok(())
    }
}

/// State shared by both representations.
pub struct SpaceBase {
    pub(crate) constraint: Rc<dyn Constraint>,
    pub(crate) bounds: Bounds,
    pub(crate) validity: Option<ValidityFn>,
    pub(crate) projection: ProjectionSettings,
    pub(crate) rng: ChaCha8Rng,
}

impl SpaceBase {
    pub(crate) fn new(
        constraint: Rc<dyn Constraint>,
        projection: ProjectionSettings,
        rng: ChaCha8Rng,
    ) -> Self {
        let bounds = Bounds::uniform(constraint.ambient_dimension(), -10.0, 10.0);
        Self {
            constraint,
            bounds,
            validity: None,
            projection,
            rng,
        }
    }

    pub(crate) fn check_dimension(&self, x: &DVector<f64>) -> Result<()> {
        let expected = self.constraint.ambient_dimension();
        if x.len() != expected {
            return Err(SpaceError::DimensionMismatch {
                expected,
                got: x.len(),
            });
        }
        Ok(())
    }

    /// Errors with `InvalidAnchor` if `x` is off the manifold.
    pub(crate) fn check_on_manifold(&self, x: &DVector<f64>) -> Result<()> {
        self.check_dimension(x)?;
        let residual = self.constraint.residual_norm(x.as_slice());
        if !(residual <= self.projection.tolerance) {
            return Err(SpaceError::InvalidAnchor {
                residual,
                tolerance: self.projection.tolerance,
            });
        }
        Ok(())
    }

    /// Bounds and the user predicate; the manifold itself is checked elsewhere.
    pub(crate) fn is_valid(&self, x: &[f64]) -> bool {
        self.bounds.contains(x) && self.validity.as_ref().map_or(true, |f| f(x))
    }
}

/// Ambient Euclidean distance. Along dense traversals this approximates the
/// geodesic distance on the manifold.
pub fn distance(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    (a - b).norm()
}

/// Uniform sample from the ball of radius `radius` in R^dim.
pub(crate) fn sample_ball(rng: &mut impl Rng, dim: usize, radius: f64) -> DVector<f64> {
    let mut direction: DVector<f64> =
        DVector::from_fn(dim, |_, _| StandardNormal.sample(&mut *rng));
    let norm = direction.norm();
    if norm > 0.0 {
        direction /= norm;
    }
    let scale: f64 = rng.random::<f64>().powf(1.0 / dim as f64);
    direction * (radius * scale)
}

/// A constraint-confined configuration space in one of two representations.
pub enum ManifoldSpace {
    Atlas(AtlasSpace),
    Projected(ProjectedSpace),
}

impl ManifoldSpace {
    fn base(&self) -> &SpaceBase {
        match self {
            ManifoldSpace::Atlas(space) => &space.base,
            ManifoldSpace::Projected(space) => &space.base,
        }
    }

    fn base_mut(&mut self) -> &mut SpaceBase {
        match self {
            ManifoldSpace::Atlas(space) => &mut space.base,
            ManifoldSpace::Projected(space) => &mut space.base,
        }
    }

    pub fn variant(&self) -> SpaceVariant {
        match self {
            ManifoldSpace::Atlas(_) => SpaceVariant::Atlas,
            ManifoldSpace::Projected(_) => SpaceVariant::Projected,
        }
    }

    pub fn constraint(&self) -> &Rc<dyn Constraint> {
        &self.base().constraint
    }

    pub fn ambient_dimension(&self) -> usize {
        self.base().constraint.ambient_dimension()
    }

    pub fn manifold_dimension(&self) -> usize {
        self.base().constraint.manifold_dimension()
    }

    pub fn bounds(&self) -> &Bounds {
        &self.base().bounds
    }

    pub fn set_bounds(&mut self, bounds: Bounds) -> Result<()> {
        bounds.validate()?;
        if bounds.dimension() != self.ambient_dimension() {
            return Err(SpaceError::DimensionMismatch {
                expected: self.ambient_dimension(),
                got: bounds.dimension(),
            });
        }
        self.base_mut().bounds = bounds;
        Ok(())
    }

    pub fn set_validity_checker(&mut self, validity: ValidityFn) {
        self.base_mut().validity = Some(validity);
    }

    /// On the manifold, inside the bounds, and accepted by the validity predicate.
    pub fn is_valid(&self, cfg: &Configuration) -> bool {
        let base = self.base();
        base.constraint.is_satisfied(cfg.as_slice(), base.projection.tolerance)
            && base.is_valid(cfg.as_slice())
    }

    pub fn distance(&self, a: &Configuration, b: &Configuration) -> f64 {
        distance(&a.values, &b.values)
    }

    pub fn equal_states(&self, a: &Configuration, b: &Configuration) -> bool {
        a.values.len() == b.values.len()
            && a.values
                .iter()
                .zip(b.values.iter())
                .all(|(x, y)| (x - y).abs() <= STATE_EQUALITY_TOL)
    }

    /// Maximum ambient distance between consecutive traversal states.
    pub fn delta(&self) -> f64 {
        match self {
            ManifoldSpace::Atlas(space) => space.settings.delta,
            ManifoldSpace::Projected(space) => space.settings.delta,
        }
    }

    pub fn lambda(&self) -> f64 {
        match self {
            ManifoldSpace::Atlas(space) => space.settings.lambda,
            ManifoldSpace::Projected(space) => space.settings.lambda,
        }
    }

    /// Number of charts; always zero for the projected representation.
    pub fn chart_count(&self) -> usize {
        match self {
            ManifoldSpace::Atlas(space) => space.chart_count(),
            ManifoldSpace::Projected(_) => 0,
        }
    }

    /// Builds a configuration at `values`, which must already be on the manifold.
    /// Atlas spaces bind it to the owning chart, creating one if needed.
    pub fn configuration_at(&mut self, values: DVector<f64>) -> Result<Configuration> {
        match self {
            ManifoldSpace::Atlas(space) => space.configuration_at(values),
            ManifoldSpace::Projected(space) => space.set_real_state(values),
        }
    }

    /// Draws a configuration from the whole manifold (within bounds).
    pub fn sample_uniform(&mut self) -> Result<Configuration> {
        match self {
            ManifoldSpace::Atlas(space) => space.sample_uniform(),
            ManifoldSpace::Projected(space) => space.sample_uniform(),
        }
    }

    /// Draws a configuration within roughly `radius` of `near`.
    pub fn sample_near(&mut self, near: &Configuration, radius: f64) -> Result<Configuration> {
        match self {
            ManifoldSpace::Atlas(space) => space.sample_near(near, radius),
            ManifoldSpace::Projected(space) => space.sample_near(near, radius),
        }
    }

    /// Walks the manifold from `from` to `to`. See `space::traversal`.
    pub fn traverse(
        &mut self,
        from: &Configuration,
        to: &Configuration,
        settings: TraversalSettings,
    ) -> Result<Traversal> {
        match self {
            ManifoldSpace::Atlas(space) => space.traverse(from, to, settings),
            ManifoldSpace::Projected(space) => space.traverse(from, to, settings),
        }
    }

    pub fn as_atlas(&self) -> Option<&AtlasSpace> {
        match self {
            ManifoldSpace::Atlas(space) => Some(space),
            ManifoldSpace::Projected(_) => None,
        }
    }

}

impl From<AtlasSpace> for ManifoldSpace {
    fn from(space: AtlasSpace) -> Self {
        ManifoldSpace::Atlas(space)
    }
}

impl From<ProjectedSpace> for ManifoldSpace {
    fn from(space: ProjectedSpace) -> Self {
        ManifoldSpace::Projected(space)
    }
}
