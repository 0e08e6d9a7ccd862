extern crate nalgebra as na;

use std::collections::HashMap;

use na::DVector;

use crate::error::ConsensusError;
use crate::problem::SolveStatus;
use crate::variable::VarId;
use crate::worker::ProxReport;

/// Averages the local values over the workers that report them, weighted by
/// each worker's step size.
///
/// For every variable id appearing in any report the consensus value is
/// `sum_i(rho_i * x_i) / sum_i(rho_i)` over the reporting workers. Pure
/// apart from the failure signal: a report whose status is infeasible or
/// unbounded fails the run with [`ConsensusError::InfeasibleSubproblem`], an
/// error status with [`ConsensusError::SolverFailure`]. Reports are indexed
/// in worker order so the failing subproblem is identified.
///
/// # Arguments
///
/// * `reports` - One proximal report per worker, in worker order
///
/// # Returns
///
/// The consensus value for every reported variable id.
pub fn aggregate(
    reports: &[ProxReport],
) -> Result<HashMap<VarId, DVector<f64>>, ConsensusError> {
    let mut weighted: HashMap<VarId, DVector<f64>> = HashMap::new();
    let mut rho_sum: HashMap<VarId, f64> = HashMap::new();

    for (worker, report) in reports.iter().enumerate() {
        if report.status.is_infeasible_or_unbounded() {
            return Err(ConsensusError::InfeasibleSubproblem { worker });
        }
        if report.status == SolveStatus::Error {
            return Err(ConsensusError::SolverFailure { worker });
        }

        for (id, value) in &report.x {
            let rho = report.rho.get(id).copied().unwrap_or(1.0);
            let term = value * rho;
            weighted
                .entry(*id)
                .and_modify(|acc| *acc += &term)
                .or_insert(term);
            *rho_sum.entry(*id).or_insert(0.0) += rho;
        }
    }

    Ok(weighted
        .into_iter()
        .map(|(id, sum)| {
            let total = rho_sum[&id];
            (id, sum / total)
        })
        .collect())
}
