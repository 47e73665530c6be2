//! Atlas representation: the manifold is covered incrementally by charts.
//!
//! A chart is anchored at a manifold point `x0` with an orthonormal tangent
//! basis `B`. Chart coordinates `u` map to the tangent plane by
//! `phi(u) = x0 + B u` and onto the manifold by `psi(u)`, the lift of `phi(u)`
//! along the normal space. Each chart owns a convex polytope of its tangent
//! plane: the ball of radius `rho`, cut by one halfspace per neighboring chart
//! so that neighbors do not overlap.

use std::f64::consts::PI;
use std::iter;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::projected::{validate_projection, MAX_SAMPLE_ATTEMPTS};
use super::traversal::{self, Step, WalkParams};
use super::{distance, sample_ball, ChartId, Configuration, SpaceBase, Traversal, TraversalSettings};
use crate::error::{Result, SpaceError};
use crate::projection::{project_orthogonal, tangent_basis, ProjectionSettings};
use crate::traits::Constraint;

/// Consecutive sampling rejections before the atlas is grown at its frontier.
const REJECTIONS_BEFORE_SPAWN: usize = 20;
/// Probe directions for two-dimensional charts.
const FRONTIER_PROBES: usize = 32;
/// Probes for frontier detection stop just short of the chart radius.
const FRONTIER_PROBE_SCALE: f64 = 0.99;
/// Diagonal probe directions are only generated up to this manifold dimension.
const MAX_DIAGONAL_DIMENSION: usize = 6;
/// A freshly anchored chart shrinks its step down to this fraction of `delta`.
const MIN_LIFT_FRACTION: f64 = 1e-3;
/// Chart-coordinate distance below which the target is normal to the chart.
const REACH_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AtlasSettings {
    /// Fraction of samples drawn outside the existing charts, in `[0, 1)`.
    pub exploration: f64,
    /// Chart radius.
    pub rho: f64,
    /// Maximum angle between a chart and the manifold along a traversal step.
    pub alpha: f64,
    /// Maximum distance between a chart's tangent plane and the manifold.
    pub epsilon: f64,
    pub delta: f64,
    pub lambda: f64,
    /// Charts a single traversal may create before it gives up.
    pub max_charts_per_extension: usize,
    pub projection: ProjectionSettings,
    pub seed: u64,
}

impl Default for AtlasSettings {
    fn default() -> Self {
        Self {
            exploration: 0.5,
            rho: 0.5,
            alpha: PI / 8.0,
            epsilon: 0.2,
            delta: 0.02,
            lambda: 2.0,
            max_charts_per_extension: 200,
            projection: ProjectionSettings::default(),
            seed: 0,
        }
    }
}

impl AtlasSettings {
    fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SpaceError::InvalidSettings(msg.to_string()));
        if !(0.0..1.0).contains(&self.exploration) {
            return fail("exploration must lie in [0, 1)");
        }
        if !(self.rho > 0.0 && self.rho.is_finite()) {
            return fail("rho must be positive");
        }
        if !(self.alpha > 0.0 && self.alpha < PI / 2.0) {
            return fail("alpha must lie in (0, pi/2)");
        }
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return fail("epsilon must be positive");
        }
        if !(self.delta > 0.0 && self.delta.is_finite()) {
            return fail("delta must be positive");
        }
        if !(self.lambda >= 1.0 && self.lambda.is_finite()) {
            return fail("lambda must be at least 1");
        }
        if self.max_charts_per_extension == 0 {
            return fail("max_charts_per_extension must be greater than zero");
        }
        validate_projection(&self.projection)
    }
}

/// `normal · u <= offset`, the side of the bisector facing this chart's anchor.
#[derive(Debug, Clone)]
struct Halfspace {
    neighbor: ChartId,
    normal: DVector<f64>,
    offset: f64,
}

impl Halfspace {
    fn contains(&self, u: &DVector<f64>) -> bool {
        self.normal.dot(u) <= self.offset
    }
}

#[derive(Debug, Clone)]
pub struct Chart {
    id: ChartId,
    anchor: DVector<f64>,
    basis: DMatrix<f64>,
    radius: f64,
    halfspaces: Vec<Halfspace>,
    frontier: bool,
}

impl Chart {
    fn new(id: ChartId, anchor: DVector<f64>, basis: DMatrix<f64>, radius: f64) -> Self {
        Self {
            id,
            anchor,
            basis,
            radius,
            halfspaces: Vec::new(),
            frontier: true,
        }
    }

    pub fn id(&self) -> ChartId {
        self.id
    }

    pub fn anchor(&self) -> &DVector<f64> {
        &self.anchor
    }

    /// Tangent basis as columns (n×m).
    pub fn basis(&self) -> &DMatrix<f64> {
        &self.basis
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn dimension(&self) -> usize {
        self.basis.ncols()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = ChartId> + '_ {
        self.halfspaces.iter().map(|h| h.neighbor)
    }

    /// Whether part of the polytope boundary is still the ball of radius `rho`,
    /// i.e. the chart may border unexplored manifold.
    pub fn is_frontier(&self) -> bool {
        self.frontier
    }

    pub fn phi(&self, u: &DVector<f64>) -> DVector<f64> {
        &self.anchor + &self.basis * u
    }

    pub fn psi_inverse(&self, x: &DVector<f64>) -> DVector<f64> {
        self.basis.tr_mul(&(x - &self.anchor))
    }

    pub fn psi(
        &self,
        u: &DVector<f64>,
        constraint: &dyn Constraint,
        projection: ProjectionSettings,
    ) -> anyhow::Result<DVector<f64>> {
        project_orthogonal(constraint, &self.phi(u), &self.basis, projection)
    }

    pub fn in_polytope(&self, u: &DVector<f64>) -> bool {
        u.norm() <= self.radius && self.halfspaces.iter().all(|h| h.contains(u))
    }

    /// `x` lies in this chart's polytope and close to its tangent plane.
    fn owns(&self, x: &DVector<f64>, epsilon: f64) -> bool {
        let u = self.psi_inverse(x);
        self.in_polytope(&u) && (x - self.phi(&u)).norm() <= epsilon
    }

    fn admits_step(
        &self,
        u: &DVector<f64>,
        lifted: &DVector<f64>,
        current: &DVector<f64>,
        step: f64,
        epsilon: f64,
        cos_alpha: f64,
    ) -> bool {
        let chord = distance(current, lifted);
        (lifted - self.phi(u)).norm() <= epsilon && (chord == 0.0 || step / chord >= cos_alpha)
    }

    fn add_halfspace(&mut self, neighbor: &Chart) {
        let normal = self.psi_inverse(&neighbor.anchor);
        let norm_sq = normal.norm_squared();
        if norm_sq == 0.0 {
            return;
        }
        self.halfspaces.push(Halfspace {
            neighbor: neighbor.id,
            normal,
            offset: norm_sq / 2.0,
        });
        self.refresh_frontier();
    }

    fn refresh_frontier(&mut self) {
        let reach = FRONTIER_PROBE_SCALE * self.radius;
        self.frontier = probe_directions(self.dimension())
            .iter()
            .any(|d| self.in_polytope(&(d * reach)));
    }

    /// Ambient vertices of the polytope boundary. Only two-dimensional charts
    /// have a polygon; other dimensions return an empty list.
    pub fn boundary_polygon(&self) -> Vec<DVector<f64>> {
        if self.dimension() != 2 {
            return Vec::new();
        }
        probe_directions(2)
            .iter()
            .map(|d| {
                let (mut inside, mut outside) = (0.0, self.radius);
                if self.in_polytope(&(d * outside)) {
                    inside = outside;
                } else {
                    for _ in 0..40 {
                        let mid = 0.5 * (inside + outside);
                        if self.in_polytope(&(d * mid)) {
                            inside = mid;
                        } else {
                            outside = mid;
                        }
                    }
                }
                self.phi(&(d * inside))
            })
            .collect()
    }
}

/// Unit directions in chart coordinates used to probe the polytope boundary.
fn probe_directions(m: usize) -> Vec<DVector<f64>> {
    match m {
        0 => Vec::new(),
        1 => vec![
            DVector::from_element(1, 1.0),
            DVector::from_element(1, -1.0),
        ],
        2 => (0..FRONTIER_PROBES)
            .map(|k| {
                let theta = 2.0 * PI * k as f64 / FRONTIER_PROBES as f64;
                DVector::from_vec(vec![theta.cos(), theta.sin()])
            })
            .collect(),
        _ => {
            let mut dirs = Vec::new();
            for axis in 0..m {
                for sign in [1.0, -1.0] {
                    let mut d = DVector::zeros(m);
                    d[axis] = sign;
                    dirs.push(d);
                }
            }
            if m <= MAX_DIAGONAL_DIMENSION {
                let scale = 1.0 / (m as f64).sqrt();
                for mask in 0..(1usize << m) {
                    dirs.push(DVector::from_fn(m, |i, _| {
                        if mask & (1 << i) == 0 {
                            scale
                        } else {
                            -scale
                        }
                    }));
                }
            }
            dirs
        }
    }
}

/// Anchors a chart at `x` and cuts it against every chart within `2 rho`.
fn create_chart(
    charts: &mut Vec<Chart>,
    constraint: &dyn Constraint,
    rho: f64,
    x: &DVector<f64>,
) -> anyhow::Result<ChartId> {
    let basis = tangent_basis(constraint, x)?;
    let id = charts.len();
    let mut chart = Chart::new(id, x.clone(), basis, rho);
    for other in charts.iter_mut() {
        if distance(&other.anchor, x) < 2.0 * rho {
            other.add_halfspace(&chart);
            chart.add_halfspace(other);
        }
    }
    charts.push(chart);
    trace!(chart = id, total = charts.len(), "anchored chart");
    Ok(id)
}

/// Closest-anchored chart owning `x`, skipping `exclude`.
fn find_owner(
    charts: &[Chart],
    x: &DVector<f64>,
    epsilon: f64,
    exclude: &[ChartId],
) -> Option<ChartId> {
    charts
        .iter()
        .filter(|c| !exclude.contains(&c.id) && c.owns(x, epsilon))
        .min_by(|a, b| distance(&a.anchor, x).total_cmp(&distance(&b.anchor, x)))
        .map(|c| c.id)
}

pub struct AtlasSpace {
    pub(crate) base: SpaceBase,
    pub(crate) settings: AtlasSettings,
    charts: Vec<Chart>,
}

impl AtlasSpace {
    pub fn new(constraint: Rc<dyn Constraint>, settings: AtlasSettings) -> Result<Self> {
        settings.validate()?;
        if constraint.manifold_dimension() == 0 {
            return Err(SpaceError::InvalidSettings(
                "an atlas needs a manifold of positive dimension".into(),
            ));
        }
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Ok(Self {
            base: SpaceBase::new(constraint, settings.projection, rng),
            settings,
            charts: Vec::new(),
        })
    }

    pub fn settings(&self) -> &AtlasSettings {
        &self.settings
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    pub fn chart(&self, id: ChartId) -> Option<&Chart> {
        self.charts.get(id)
    }

    pub fn chart_count(&self) -> usize {
        self.charts.len()
    }

    /// Sampling radius around chart anchors. Larger than `rho` so that a
    /// fraction `exploration` of samples falls outside the charts.
    pub fn rho_s(&self) -> f64 {
        let m = self.base.constraint.manifold_dimension() as f64;
        self.settings.rho / (1.0 - self.settings.exploration).powf(1.0 / m)
    }

    /// Percentage of charts on the frontier.
    pub fn estimate_frontier_percent(&self) -> f64 {
        if self.charts.is_empty() {
            return 0.0;
        }
        let open = self.charts.iter().filter(|c| c.frontier).count();
        100.0 * open as f64 / self.charts.len() as f64
    }

    /// Creates a chart anchored at `x`, which must be on the manifold.
    pub fn anchor_chart(&mut self, x: &DVector<f64>) -> Result<ChartId> {
        self.base.check_on_manifold(x)?;
        let id = create_chart(&mut self.charts, &*self.base.constraint, self.settings.rho, x)
            .map_err(SpaceError::Projection)?;
        debug!(chart = id, "anchored chart at user point");
        Ok(id)
    }

    pub fn owning_chart(&self, x: &DVector<f64>) -> Option<ChartId> {
        find_owner(&self.charts, x, self.settings.epsilon, &[])
    }

    /// Binds `values` to `chart`. Errors with `InvalidAnchor` off the manifold
    /// and `ChartMismatch` when the chart does not own the point.
    pub fn set_real_state(&self, values: DVector<f64>, chart: ChartId) -> Result<Configuration> {
        self.base.check_on_manifold(&values)?;
        match self.charts.get(chart) {
            Some(c) if c.owns(&values, self.settings.epsilon) => {
                Ok(Configuration::atlas(values, Some(chart)))
            }
            _ => Err(SpaceError::ChartMismatch { chart }),
        }
    }

    /// Binds `values` to its owning chart, anchoring a new one if none owns it.
    pub fn configuration_at(&mut self, values: DVector<f64>) -> Result<Configuration> {
        self.base.check_on_manifold(&values)?;
        let chart = match self.owning_chart(&values) {
            Some(id) => id,
            None => create_chart(
                &mut self.charts,
                &*self.base.constraint,
                self.settings.rho,
                &values,
            )
            .map_err(SpaceError::Projection)?,
        };
        Ok(Configuration::atlas(values, Some(chart)))
    }

    fn owner_or_new(&mut self, x: &DVector<f64>) -> Option<ChartId> {
        self.owning_chart(x).or_else(|| {
            create_chart(&mut self.charts, &*self.base.constraint, self.settings.rho, x).ok()
        })
    }

    /// Picks a chart uniformly and samples its coordinates in the ball of
    /// radius `rho_s`. Samples inside `rho` must fall in the chart's polytope;
    /// samples beyond it are lifted and may anchor new charts.
    pub fn sample_uniform(&mut self) -> Result<Configuration> {
        if self.charts.is_empty() {
            return Err(SpaceError::SamplingFailed(0));
        }
        let m = self.base.constraint.manifold_dimension();
        let rho = self.settings.rho;
        let rho_s = self.rho_s();
        let mut rejections = 0usize;

        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            if rejections >= REJECTIONS_BEFORE_SPAWN {
                rejections = 0;
                self.expand_frontier();
            }

            let id = self.base.rng.random_range(0..self.charts.len());
            let u = sample_ball(&mut self.base.rng, m, rho_s);
            let inside = u.norm() <= rho;
            if inside && !self.charts[id].in_polytope(&u) {
                rejections += 1;
                continue;
            }
            let Ok(x) = self.charts[id].psi(&u, &*self.base.constraint, self.base.projection)
            else {
                rejections += 1;
                continue;
            };
            if !self.base.bounds.contains(x.as_slice()) {
                rejections += 1;
                continue;
            }

            let owner = if inside { Some(id) } else { self.owner_or_new(&x) };
            match owner {
                Some(chart) => return Ok(Configuration::atlas(x, Some(chart))),
                None => rejections += 1,
            }
        }
        debug!(
            attempts = MAX_SAMPLE_ATTEMPTS,
            charts = self.charts.len(),
            "atlas sampling failed"
        );
        Err(SpaceError::SamplingFailed(MAX_SAMPLE_ATTEMPTS))
    }

    /// Samples chart coordinates within `radius` of `near` in its chart.
    pub fn sample_near(&mut self, near: &Configuration, radius: f64) -> Result<Configuration> {
        self.base.check_dimension(&near.values)?;
        let epsilon = self.settings.epsilon;
        let bound = near
            .chart()
            .filter(|&id| self.charts.get(id).is_some_and(|c| c.owns(&near.values, epsilon)));
        let chart = match bound {
            Some(id) => id,
            None => self
                .owner_or_new(&near.values)
                .ok_or(SpaceError::SamplingFailed(0))?,
        };

        let m = self.base.constraint.manifold_dimension();
        let center = self.charts[chart].psi_inverse(&near.values);
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            let u = &center + sample_ball(&mut self.base.rng, m, radius);
            let Ok(x) = self.charts[chart].psi(&u, &*self.base.constraint, self.base.projection)
            else {
                continue;
            };
            if !self.base.bounds.contains(x.as_slice()) {
                continue;
            }
            if let Some(owner) = self.owner_or_new(&x) {
                return Ok(Configuration::atlas(x, Some(owner)));
            }
        }
        Err(SpaceError::SamplingFailed(MAX_SAMPLE_ATTEMPTS))
    }

    /// Grows the atlas from a random frontier chart by anchoring a chart where
    /// one of its probe directions reaches the ball boundary unowned.
    pub fn expand_frontier(&mut self) -> Option<ChartId> {
        let frontier: Vec<ChartId> = self
            .charts
            .iter()
            .filter(|c| c.frontier)
            .map(|c| c.id)
            .collect();
        if frontier.is_empty() {
            return None;
        }
        let id = frontier[self.base.rng.random_range(0..frontier.len())];
        let rho = self.settings.rho;
        let epsilon = self.settings.epsilon;
        let constraint = &*self.base.constraint;

        for d in probe_directions(self.charts[id].dimension()) {
            if !self.charts[id].in_polytope(&(&d * (FRONTIER_PROBE_SCALE * rho))) {
                continue;
            }
            let Ok(x) = self.charts[id].psi(&(&d * rho), constraint, self.base.projection) else {
                continue;
            };
            if !self.base.bounds.contains(x.as_slice())
                || find_owner(&self.charts, &x, epsilon, &[id]).is_some()
            {
                continue;
            }
            if let Ok(new) = create_chart(&mut self.charts, constraint, rho, &x) {
                debug!(from = id, chart = new, "expanded atlas frontier");
                return Some(new);
            }
        }
        self.charts[id].frontier = false;
        None
    }

    /// Walks in chart coordinates toward the target and lifts each step. The
    /// walk switches charts when a step leaves the polytope, strays more than
    /// `epsilon` from the tangent plane, bends by more than `alpha`, or cannot
    /// be lifted. It moves to the chart owning the new point, else anchors a
    /// chart at the current state.
    pub fn traverse(
        &mut self,
        from: &Configuration,
        to: &Configuration,
        settings: TraversalSettings,
    ) -> Result<Traversal> {
        self.base.check_dimension(&from.values)?;
        let atlas = self.settings;
        let epsilon = atlas.epsilon;
        let cos_alpha = atlas.alpha.cos();
        let cap = atlas.max_charts_per_extension;
        let base = &self.base;
        let constraint = &*base.constraint;
        let projection = base.projection;
        let charts = &mut self.charts;

        let start = from
            .chart()
            .filter(|&id| charts.get(id).is_some_and(|c| c.owns(&from.values, epsilon)))
            .or_else(|| find_owner(charts.as_slice(), &from.values, epsilon, &[]));
        let mut active = match start {
            Some(id) => id,
            None => create_chart(charts, constraint, atlas.rho, &from.values)
                .map_err(SpaceError::Projection)?,
        };
        let mut fresh: Option<ChartId> = None;
        let mut tried: Vec<ChartId> = Vec::new();
        let mut created = 0usize;

        let params = WalkParams {
            delta: atlas.delta,
            lambda: atlas.lambda,
            settings,
        };

        traversal::walk(
            base,
            from,
            to,
            params,
            |current, target, step| {
                let is_fresh = fresh == Some(active);
                let mut spill = None;
                {
                    let chart = &charts[active];
                    let u_cur = chart.psi_inverse(current);
                    let offset = chart.psi_inverse(target) - &u_cur;
                    let reach = offset.norm();

                    if reach > REACH_EPS && (reach >= step || is_fresh) {
                        let mut s = step.min(reach);
                        loop {
                            let u = &u_cur + &offset * (s / reach);
                            if let Ok(x) = chart.psi(&u, constraint, projection) {
                                if chart.admits_step(&u, &x, current, s, epsilon, cos_alpha)
                                    && (is_fresh || chart.in_polytope(&u))
                                {
                                    tried.clear();
                                    fresh = None;
                                    return Step::Candidate {
                                        point: x,
                                        chart: Some(active),
                                    };
                                }
                                spill = Some(x);
                            }
                            if !is_fresh {
                                break;
                            }
                            // A chart anchored right here still fails: shrink.
                            s *= 0.5;
                            if s < atlas.delta * MIN_LIFT_FRACTION {
                                return Step::Diverge(format!(
                                    "chart {active} cannot lift a step toward the target"
                                ));
                            }
                        }
                    } else if is_fresh
                        || (reach <= REACH_EPS && distance(current, chart.anchor()) < atlas.delta)
                    {
                        // A chart anchored here would see the target the same way.
                        return Step::Stall;
                    }
                }

                tried.push(active);
                let owner = spill
                    .iter()
                    .chain(iter::once(current))
                    .find_map(|x| find_owner(charts.as_slice(), x, epsilon, &tried));
                if let Some(id) = owner {
                    trace!(from = active, to = id, "switching chart");
                    active = id;
                    return Step::Retry;
                }
                if created >= cap {
                    return Step::Diverge(format!("created {cap} charts without reaching the target"));
                }
                match create_chart(charts, constraint, atlas.rho, current) {
                    Ok(id) => {
                        created += 1;
                        active = id;
                        fresh = Some(id);
                        Step::Retry
                    }
                    Err(err) => Step::Diverge(format!("{err:#}")),
                }
            },
            |point, chart| Configuration::atlas(point, chart),
        )
    }
}
