extern crate nalgebra as na;

use std::collections::HashMap;
use std::time::Duration;

use na::DVector;
use serde::{Deserialize, Serialize};

use crate::spectral::SpectralOptions;
use crate::variable::{RhoInit, VarId, VariableSpec};

/// Outcome status of one local proximal solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// The penalized local problem was solved to optimality.
    Optimal,
    /// The local constraints admit no solution.
    Infeasible,
    /// The penalized local objective is unbounded below.
    Unbounded,
    /// The solver failed for any other reason.
    Error,
}

impl SolveStatus {
    /// Whether this status makes the whole run infeasible.
    pub fn is_infeasible_or_unbounded(&self) -> bool {
        matches!(self, SolveStatus::Infeasible | SolveStatus::Unbounded)
    }
}

/// Per-variable penalty parameters handed to the local solver each round.
///
/// The solver is expected to add `(rho / 2) * ||x - xbar + y_scaled||^2` to
/// its local objective for each penalized variable; the worker precomputes
/// `y_scaled` from the dual scaling mode so the solver never needs to know
/// whether duals are pre-scaled.
#[derive(Debug, Clone)]
pub struct ProxPenalty {
    /// Current step size for the variable.
    pub rho: f64,
    /// Consensus value received in the previous round.
    pub xbar: DVector<f64>,
    /// Dual offset, already divided by `rho` unless duals are pre-scaled.
    pub y_scaled: DVector<f64>,
}

/// Result of a local proximal solve.
#[derive(Debug, Clone)]
pub struct ProxOutcome {
    /// Solver status for this round.
    pub status: SolveStatus,
    /// Optimal value of every owned variable. May be partial or empty on a
    /// non-optimal status.
    pub values: HashMap<VarId, DVector<f64>>,
}

impl ProxOutcome {
    /// Shorthand for an optimal outcome with the given values.
    pub fn optimal(values: HashMap<VarId, DVector<f64>>) -> Self {
        ProxOutcome {
            status: SolveStatus::Optimal,
            values,
        }
    }
}

/// The opaque local solve capability consumed by each worker.
///
/// An implementation owns one participant's objective and constraints. Each
/// round it must minimize that objective (with the sign flipped first if it
/// is a maximization) plus the quadratic consensus penalties described by
/// `penalties`, subject to its own constraints, and return a value for every
/// penalized variable. Any numerical optimization backend satisfying this
/// contract is acceptable; the iteration never inspects the objective
/// itself.
///
/// Implementations should report an infeasible or unbounded outcome through
/// [`SolveStatus`] rather than panicking; the coordinator surfaces the
/// failure as a run-level error.
pub trait LocalSolver: Send + 'static {
    /// Solves the penalized local problem for the current round.
    fn solve(&mut self, penalties: &HashMap<VarId, ProxPenalty>) -> ProxOutcome;
}

/// One participant's share of the consensus problem.
///
/// A subproblem pairs the declared set of variables it contains with the
/// solver that owns its objective and constraints. It is owned exclusively
/// by its worker once the run starts; the coordinator never touches it.
pub struct Subproblem {
    variables: Vec<VariableSpec>,
    solver: Box<dyn LocalSolver>,
}

impl Subproblem {
    /// Creates a subproblem from its variable set and local solver.
    pub fn new(variables: Vec<VariableSpec>, solver: impl LocalSolver) -> Self {
        Subproblem {
            variables,
            solver: Box::new(solver),
        }
    }

    /// The variables this subproblem contains.
    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub(crate) fn into_parts(self) -> (Vec<VariableSpec>, Box<dyn LocalSolver>) {
        (self.variables, self.solver)
    }
}

/// Options controlling a consensus run.
///
/// Defaults: 100 rounds, a relative tolerance of `1e-6`, fixed step sizes,
/// unscaled duals, and unbounded barrier waits.
///
/// # Example
///
/// ```rust
/// # use acadmm_core::problem::ConsensusOptions;
/// # use acadmm_core::spectral::SpectralOptions;
///
/// let options = ConsensusOptions {
///     max_iterations: 500,
///     tolerance: 1e-4,
///     spectral: Some(SpectralOptions::default()),
///     ..ConsensusOptions::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    /// Initial step size assignment.
    pub rho_init: RhoInit,
    /// Iteration budget; the run stops after this many rounds at the latest.
    pub max_iterations: usize,
    /// Relative stopping tolerance on the squared residual norms.
    pub tolerance: f64,
    /// Spectral step-size adaptation; `None` keeps step sizes fixed.
    pub spectral: Option<SpectralOptions>,
    /// Whether duals are pre-scaled by `rho`. When false the penalty uses
    /// `y / rho`.
    pub scaled_dual: bool,
    /// Upper bound on each gather barrier wait. `None` waits forever, which
    /// means a worker stuck in its local solve stalls the run.
    pub gather_timeout: Option<Duration>,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        ConsensusOptions {
            rho_init: RhoInit::default(),
            max_iterations: 100,
            tolerance: 1e-6,
            spectral: None,
            scaled_dual: false,
            gather_timeout: None,
        }
    }
}
