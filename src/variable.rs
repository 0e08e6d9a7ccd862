extern crate nalgebra as na;

use std::collections::HashMap;

use na::DVector;
use serde::{Deserialize, Serialize};

/// Stable identifier of a consensus variable.
///
/// Two subproblems that declare the same id share that variable and are
/// driven toward a common value by the iteration. Ids are assigned by the
/// caller when the subproblems are set up and never change during a run.
pub type VarId = u64;

/// Declared shape of one variable owned by a subproblem.
///
/// The full set of `(subproblem, id, dim)` triples is fixed at setup time;
/// the coordinator uses it to validate the problem and to route consensus
/// values back to the workers that own them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Identifier shared across subproblems that contain this variable.
    pub id: VarId,
    /// Number of entries in the variable vector.
    pub dim: usize,
}

impl VariableSpec {
    pub fn new(id: VarId, dim: usize) -> Self {
        VariableSpec { id, dim }
    }
}

/// Initial step size assignment for a run.
///
/// A scalar gives every variable in every subproblem the same initial value.
/// A per-variable mapping assigns listed ids their value and falls back to
/// `1.0` for ids it does not contain.
///
/// # Example
///
/// ```rust
/// # use acadmm_core::variable::RhoInit;
///
/// let rho = RhoInit::Scalar(0.5);
/// assert_eq!(rho.resolve(42), 0.5);
///
/// let rho = RhoInit::PerVariable([(7, 2.0)].into_iter().collect());
/// assert_eq!(rho.resolve(7), 2.0);
/// assert_eq!(rho.resolve(8), 1.0);
/// ```
#[derive(Debug, Clone)]
pub enum RhoInit {
    /// One value for every variable of every subproblem.
    Scalar(f64),
    /// Explicit values by variable id; missing ids default to `1.0`.
    PerVariable(HashMap<VarId, f64>),
}

impl Default for RhoInit {
    fn default() -> Self {
        RhoInit::Scalar(1.0)
    }
}

impl RhoInit {
    /// Resolves the initial step size for a single variable id.
    pub fn resolve(&self, id: VarId) -> f64 {
        match self {
            RhoInit::Scalar(value) => *value,
            RhoInit::PerVariable(map) => map.get(&id).copied().unwrap_or(1.0),
        }
    }

    /// Builds the id-to-step-size map for one subproblem's variable set.
    pub fn assign(&self, specs: &[VariableSpec]) -> HashMap<VarId, f64> {
        specs
            .iter()
            .map(|spec| (spec.id, self.resolve(spec.id)))
            .collect()
    }
}

/// Snapshot of a variable's iterates at the last step-size adaptation.
///
/// Spectral adaptation estimates curvature from the change since this
/// baseline; it is refreshed every time the step size is updated.
#[derive(Debug, Clone)]
pub(crate) struct SpectralBaseline {
    pub x: DVector<f64>,
    pub xbar: DVector<f64>,
    pub y: DVector<f64>,
    pub yhat: DVector<f64>,
}

impl SpectralBaseline {
    fn zeros(dim: usize) -> Self {
        SpectralBaseline {
            x: DVector::zeros(dim),
            xbar: DVector::zeros(dim),
            y: DVector::zeros(dim),
            yhat: DVector::zeros(dim),
        }
    }
}

/// Per-variable consensus state held by exactly one worker.
///
/// `x` is the worker's local copy of the variable and stays `None` until the
/// first proximal solve reports a value for it. `xbar` is the last received
/// consensus value and `y` the dual variable, both zero-initialized. `rho`
/// is the current step size and is strictly positive at all times.
#[derive(Debug, Clone)]
pub struct VariableState {
    /// Local copy of the variable; `None` before the first solve.
    pub x: Option<DVector<f64>>,
    /// Last received consensus value.
    pub xbar: DVector<f64>,
    /// Dual variable tracking accumulated disagreement.
    pub y: DVector<f64>,
    /// Current step size, `> 0`.
    pub rho: f64,
    /// Adaptation baseline, present only when spectral step sizes are on.
    pub(crate) baseline: Option<SpectralBaseline>,
}

impl VariableState {
    /// Creates the round-zero state for one variable.
    ///
    /// # Arguments
    ///
    /// * `dim` - Number of entries in the variable vector
    /// * `rho` - Initial step size, must be positive
    /// * `spectral` - Whether to track a spectral adaptation baseline
    pub fn new(dim: usize, rho: f64, spectral: bool) -> Self {
        VariableState {
            x: None,
            xbar: DVector::zeros(dim),
            y: DVector::zeros(dim),
            rho,
            baseline: spectral.then(|| SpectralBaseline::zeros(dim)),
        }
    }

    /// The local copy with `None` read as the zero vector.
    pub(crate) fn x_or_zero(&self) -> DVector<f64> {
        match &self.x {
            Some(x) => x.clone(),
            None => DVector::zeros(self.xbar.len()),
        }
    }
}
