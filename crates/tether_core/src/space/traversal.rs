//! Walking along the manifold between two configurations.
//!
//! Both representations share the same walk: propose a point roughly `step`
//! closer to the target, check that it moved at most `delta` and made progress,
//! check validity, accept. Only the proposal differs (chart lift vs. ambient
//! step + projection), so it is passed in as a closure.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{distance, ChartId, Configuration, SpaceBase};
use crate::error::{Result, SpaceError};

/// Proposals may shrink the step down to this fraction of `delta` before the
/// walk gives up.
const MIN_STEP_FRACTION: f64 = 1e-3;
/// Consecutive proposals without an accepted step (chart switches, shrinking).
const MAX_RETRIES: usize = 64;
/// Accepted steps regrow toward `delta` after a halving.
const STEP_GROW: f64 = 1.25;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraversalSettings {
    /// Accepted-step budget. `None` derives it from `lambda` and the distance.
    pub max_steps: Option<usize>,
    /// Stop at the first state rejected by the validity predicate.
    pub check_validity: bool,
}

impl Default for TraversalSettings {
    fn default() -> Self {
        Self {
            max_steps: None,
            check_validity: true,
        }
    }
}

impl TraversalSettings {
    pub fn with_max_steps(max_steps: usize) -> Self {
        Self {
            max_steps: Some(max_steps),
            ..Self::default()
        }
    }

    pub(crate) fn step_budget(&self, lambda: f64, distance: f64, delta: f64) -> usize {
        self.max_steps
            .unwrap_or_else(|| (lambda * distance / delta).ceil() as usize + 1)
    }
}

/// Why a traversal stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalStop {
    Reached,
    /// The next state failed the validity predicate.
    Invalid,
    OutOfBounds,
    /// The walk stopped getting closer to the target.
    NoProgress,
}

/// States produced by a traversal, `from` first. When `stop` is `Reached` the
/// last state is `to`.
#[derive(Debug, Clone)]
pub struct Traversal {
    pub states: Vec<Configuration>,
    pub stop: TraversalStop,
}

impl Traversal {
    pub fn is_complete(&self) -> bool {
        self.stop == TraversalStop::Reached
    }

    pub fn first(&self) -> &Configuration {
        &self.states[0]
    }

    pub fn last(&self) -> &Configuration {
        &self.states[self.states.len() - 1]
    }

    /// Sum of distances between consecutive states.
    pub fn length(&self) -> f64 {
        self.states
            .windows(2)
            .map(|pair| distance(&pair[0].values, &pair[1].values))
            .sum()
    }
}

/// Outcome of one proposal.
pub(crate) enum Step {
    Candidate {
        point: DVector<f64>,
        chart: Option<ChartId>,
    },
    /// Internal state changed (e.g. a chart switch); propose again.
    Retry,
    /// No direction toward the target exists from here.
    Stall,
    Diverge(String),
}

pub(crate) struct WalkParams {
    pub delta: f64,
    pub lambda: f64,
    pub settings: TraversalSettings,
}

/// Runs the shared walk. `propose(current, target, step)` returns the next
/// candidate; `make` wraps accepted points into configurations.
pub(crate) fn walk<P, M>(
    base: &SpaceBase,
    from: &Configuration,
    to: &Configuration,
    params: WalkParams,
    mut propose: P,
    make: M,
) -> Result<Traversal>
where
    P: FnMut(&DVector<f64>, &DVector<f64>, f64) -> Step,
    M: Fn(DVector<f64>, Option<ChartId>) -> Configuration,
{
    base.check_dimension(&from.values)?;
    base.check_dimension(&to.values)?;

    let WalkParams {
        delta,
        lambda,
        settings,
    } = params;
    let target = &to.values;
    let mut states = vec![from.clone()];
    let total = distance(&from.values, target);

    let finish = |mut states: Vec<Configuration>| {
        if settings.check_validity && !base.is_valid(to.as_slice()) {
            let stop = if base.bounds.contains(to.as_slice()) {
                TraversalStop::Invalid
            } else {
                TraversalStop::OutOfBounds
            };
            return Traversal { states, stop };
        }
        states.push(to.clone());
        Traversal {
            states,
            stop: TraversalStop::Reached,
        }
    };

    if total <= delta {
        return Ok(finish(states));
    }

    let budget = settings.step_budget(lambda, total, delta);
    let mut current = from.values.clone();
    let mut remaining = total;
    let mut steps = 0usize;
    let mut retries = 0usize;
    let mut step = delta;

    loop {
        if steps >= budget {
            return Err(SpaceError::TraversalDiverged {
                steps,
                reason: format!("step budget of {budget} exhausted {remaining:.4} from the target"),
            });
        }
        if retries > MAX_RETRIES {
            return Err(SpaceError::TraversalDiverged {
                steps,
                reason: format!("{MAX_RETRIES} consecutive proposals rejected"),
            });
        }

        let (point, chart) = match propose(&current, target, step) {
            Step::Candidate { point, chart } => (point, chart),
            Step::Retry => {
                retries += 1;
                continue;
            }
            Step::Stall => {
                return Ok(Traversal {
                    states,
                    stop: TraversalStop::NoProgress,
                })
            }
            Step::Diverge(reason) => {
                return Err(SpaceError::TraversalDiverged { steps, reason });
            }
        };

        let chord = distance(&current, &point);
        if !chord.is_finite() {
            return Err(SpaceError::TraversalDiverged {
                steps,
                reason: "non-finite step".into(),
            });
        }
        if chord > delta {
            step *= 0.5;
            retries += 1;
            if step < delta * MIN_STEP_FRACTION {
                return Err(SpaceError::TraversalDiverged {
                    steps,
                    reason: format!("step size fell below {:e}", delta * MIN_STEP_FRACTION),
                });
            }
            continue;
        }

        let next_remaining = distance(&point, target);
        if !(next_remaining < remaining) {
            trace!(steps, remaining, "traversal stopped making progress");
            return Ok(Traversal {
                states,
                stop: TraversalStop::NoProgress,
            });
        }
        if !base.bounds.contains(point.as_slice()) {
            return Ok(Traversal {
                states,
                stop: TraversalStop::OutOfBounds,
            });
        }
        if settings.check_validity && !base.is_valid(point.as_slice()) {
            return Ok(Traversal {
                states,
                stop: TraversalStop::Invalid,
            });
        }

        steps += 1;
        retries = 0;
        step = (step * STEP_GROW).min(delta);
        current = point.clone();
        remaining = next_remaining;
        states.push(make(point, chart));

        if remaining <= delta {
            return Ok(finish(states));
        }
    }
}
