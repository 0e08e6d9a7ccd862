extern crate nalgebra as na;

use std::collections::HashMap;

use na::DVector;

use crate::problem::{LocalSolver, ProxOutcome, ProxPenalty};
use crate::variable::VarId;

/// A quadratic attraction term `(weight / 2) * ||x - target||^2` on one
/// variable.
#[derive(Debug, Clone)]
pub struct QuadraticTerm {
    /// Curvature of the term; zero leaves the variable governed by the
    /// consensus penalty alone.
    pub weight: f64,
    /// Point the term pulls the variable toward.
    pub target: DVector<f64>,
}

impl QuadraticTerm {
    pub fn new(weight: f64, target: DVector<f64>) -> Self {
        QuadraticTerm { weight, target }
    }
}

/// Closed-form local solver for separable quadratic objectives.
///
/// Minimizes `sum_v (w_v / 2) * ||x_v - t_v||^2` plus the consensus
/// penalties. Each penalized variable has the closed-form proximal point
///
/// ```text
/// x_v = (w_v * t_v + rho_v * (xbar_v - y_scaled_v)) / (w_v + rho_v)
/// ```
///
/// so no numerical backend is needed. A variable without a quadratic term is
/// treated as `w = 0` and lands on `xbar - y_scaled`. Used by the tests and
/// demos; any real deployment supplies its own [`LocalSolver`] backed by an
/// optimization library.
#[derive(Debug, Clone, Default)]
pub struct SeparableQuadratic {
    terms: HashMap<VarId, QuadraticTerm>,
}

impl SeparableQuadratic {
    pub fn new(terms: HashMap<VarId, QuadraticTerm>) -> Self {
        SeparableQuadratic { terms }
    }

    /// Convenience constructor for a single-variable objective.
    pub fn single(id: VarId, weight: f64, target: DVector<f64>) -> Self {
        SeparableQuadratic {
            terms: [(id, QuadraticTerm::new(weight, target))].into_iter().collect(),
        }
    }
}

impl LocalSolver for SeparableQuadratic {
    fn solve(&mut self, penalties: &HashMap<VarId, ProxPenalty>) -> ProxOutcome {
        let values = penalties
            .iter()
            .map(|(id, penalty)| {
                let pulled = (&penalty.xbar - &penalty.y_scaled) * penalty.rho;
                let value = match self.terms.get(id) {
                    Some(term) => {
                        (&term.target * term.weight + pulled) / (term.weight + penalty.rho)
                    }
                    None => pulled / penalty.rho,
                };
                (*id, value)
            })
            .collect();
        ProxOutcome::optimal(values)
    }
}
