extern crate nalgebra as na;

use std::collections::HashMap;
use std::time::Duration;

use float_eq::assert_float_eq;
use na::DVector;

use acadmm_core::consensus::consensus;
use acadmm_core::error::ConsensusError;
use acadmm_core::problem::{
    ConsensusOptions, LocalSolver, ProxOutcome, ProxPenalty, SolveStatus, Subproblem,
};
use acadmm_core::spectral::SpectralOptions;
use acadmm_core::utils::SeparableQuadratic;
use acadmm_core::variable::{RhoInit, VarId, VariableSpec};

/// Solver whose variable is pinned to a constant, as if by an equality
/// constraint.
struct PinnedSolver {
    id: VarId,
    value: DVector<f64>,
}

impl LocalSolver for PinnedSolver {
    fn solve(&mut self, _penalties: &HashMap<VarId, ProxPenalty>) -> ProxOutcome {
        ProxOutcome::optimal([(self.id, self.value.clone())].into_iter().collect())
    }
}

/// Solver that always reports the given status.
struct StatusSolver(SolveStatus);

impl LocalSolver for StatusSolver {
    fn solve(&mut self, _penalties: &HashMap<VarId, ProxPenalty>) -> ProxOutcome {
        ProxOutcome {
            status: self.0,
            values: HashMap::new(),
        }
    }
}

/// Solver that stalls long enough to trip the gather timeout.
struct StallingSolver;

impl LocalSolver for StallingSolver {
    fn solve(&mut self, _penalties: &HashMap<VarId, ProxPenalty>) -> ProxOutcome {
        std::thread::sleep(Duration::from_secs(2));
        ProxOutcome::optimal(HashMap::new())
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scalar_var(id: VarId) -> Vec<VariableSpec> {
    vec![VariableSpec::new(id, 1)]
}

fn pinned(id: VarId, value: f64) -> Subproblem {
    Subproblem::new(
        scalar_var(id),
        PinnedSolver {
            id,
            value: DVector::from_vec(vec![value]),
        },
    )
}

fn quadratic(id: VarId, weight: f64, target: Vec<f64>) -> Subproblem {
    let dim = target.len();
    Subproblem::new(
        vec![VariableSpec::new(id, dim)],
        SeparableQuadratic::single(id, weight, DVector::from_vec(target)),
    )
}

#[tokio::test]
async fn first_round_consensus_is_the_unweighted_average() {
    // Two workers pinning the shared variable to 5 and 1 with equal step
    // sizes: the first consensus value is exactly 3.
    let subproblems = vec![pinned(1, 5.0), pinned(1, 1.0)];
    let options = ConsensusOptions {
        max_iterations: 1,
        ..ConsensusOptions::default()
    };

    let result = consensus(subproblems, options).await.unwrap();
    assert_eq!(result.iterations, 1);
    assert_eq!(result.consensus[&1][0], 3.0);

    // The residual totals the stopping evaluator saw are exactly the
    // per-worker recomputation of the report/aggregate/scatter cycle:
    // primal = (5-3)^2 + (1-3)^2, dual = (0-3)^2 + (0-3)^2.
    assert_eq!(result.residuals.len(), 1);
    assert_float_eq!(result.residuals[0].0, 8.0, abs <= 1e-12);
    assert_float_eq!(result.residuals[0].1, 18.0, abs <= 1e-12);
}

#[tokio::test]
async fn exact_agreement_converges_immediately() {
    // Both workers keep producing the same value: duals stay zero and the
    // round after consensus first equals the local copies reports zero
    // primal and dual residual.
    let value = 2.5;
    let subproblems = vec![pinned(7, value), pinned(7, value)];

    let result = consensus(subproblems, ConsensusOptions::default())
        .await
        .unwrap();

    assert_eq!(result.iterations, 2);
    assert_eq!(result.consensus[&7][0], value);
    let (primal, dual) = result.residuals[1];
    assert_eq!(primal, 0.0);
    assert_eq!(dual, 0.0);
}

#[tokio::test]
async fn two_quadratic_workers_converge_to_the_joint_minimizer() {
    // Worker A pulls the shared scalar toward 5, worker B toward 1; the sum
    // of both objectives is minimized at 3.
    init_logs();
    let subproblems = vec![quadratic(1, 1.0, vec![5.0]), quadratic(1, 1.0, vec![1.0])];
    let options = ConsensusOptions {
        tolerance: 1e-4,
        ..ConsensusOptions::default()
    };

    let result = consensus(subproblems, options).await.unwrap();

    assert!(result.iterations < 100, "budget exhausted");
    assert_float_eq!(result.consensus[&1][0], 3.0, abs <= 0.05);
    assert!(
        result
            .residuals
            .iter()
            .all(|(primal, dual)| *primal >= 0.0 && *dual >= 0.0)
    );
    // Residuals settle under the tolerance by the final round.
    let (primal, dual) = result.residuals[result.iterations - 1];
    assert!(primal <= 1e-2 && dual <= 1e-2);
}

#[tokio::test]
async fn spectral_step_sizes_still_converge() {
    init_logs();
    let subproblems = vec![quadratic(1, 1.0, vec![5.0]), quadratic(1, 1.0, vec![1.0])];
    let options = ConsensusOptions {
        tolerance: 1e-4,
        spectral: Some(SpectralOptions::default()),
        ..ConsensusOptions::default()
    };

    let result = consensus(subproblems, options).await.unwrap();

    assert!(result.iterations < 100, "budget exhausted");
    assert_float_eq!(result.consensus[&1][0], 3.0, abs <= 0.05);
}

#[tokio::test]
async fn weighted_consensus_lands_on_the_weighted_average() {
    // Three workers with different curvatures over a shared 2-vector; the
    // joint minimizer is the curvature-weighted average of the targets.
    let subproblems = vec![
        quadratic(1, 1.0, vec![1.0, -2.0]),
        quadratic(1, 2.0, vec![4.0, 0.5]),
        quadratic(1, 0.5, vec![-1.0, 3.0]),
    ];
    let result = consensus(subproblems, ConsensusOptions::default())
        .await
        .unwrap();

    let expected = [2.0 + 3.0 / 7.0, 1.0 / 7.0];
    assert!(result.iterations < 100);
    assert_float_eq!(result.consensus[&1][0], expected[0], abs <= 1e-2);
    assert_float_eq!(result.consensus[&1][1], expected[1], abs <= 1e-2);
}

#[tokio::test]
async fn per_variable_step_sizes_change_the_proximal_pull() {
    // Two unshared variables with the same quadratic objective. Variable 1
    // runs with rho = 3 from the mapping, variable 2 with the default 1;
    // the first proximal point is w*t / (w + rho), so 1.0 versus 2.0.
    let subproblems = vec![quadratic(1, 1.0, vec![4.0]), quadratic(2, 1.0, vec![4.0])];
    let options = ConsensusOptions {
        rho_init: RhoInit::PerVariable([(1, 3.0)].into_iter().collect()),
        max_iterations: 1,
        ..ConsensusOptions::default()
    };

    let result = consensus(subproblems, options).await.unwrap();
    assert_float_eq!(result.consensus[&1][0], 1.0, abs <= 1e-12);
    assert_float_eq!(result.consensus[&2][0], 2.0, abs <= 1e-12);
}

#[tokio::test]
async fn one_infeasible_subproblem_aborts_the_run() {
    let subproblems = vec![
        pinned(1, 5.0),
        Subproblem::new(scalar_var(1), StatusSolver(SolveStatus::Infeasible)),
        pinned(1, 1.0),
    ];

    match consensus(subproblems, ConsensusOptions::default()).await {
        Err(ConsensusError::InfeasibleSubproblem { worker }) => assert_eq!(worker, 1),
        other => panic!("expected infeasibility, got {other:?}"),
    }
}

#[tokio::test]
async fn solver_error_status_aborts_the_run() {
    let subproblems = vec![
        pinned(1, 5.0),
        Subproblem::new(scalar_var(1), StatusSolver(SolveStatus::Error)),
    ];

    assert!(matches!(
        consensus(subproblems, ConsensusOptions::default()).await,
        Err(ConsensusError::SolverFailure { worker: 1 })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_worker_trips_the_gather_timeout() {
    let subproblems = vec![
        Subproblem::new(scalar_var(1), StallingSolver),
        pinned(1, 1.0),
    ];
    let options = ConsensusOptions {
        gather_timeout: Some(Duration::from_millis(50)),
        ..ConsensusOptions::default()
    };

    assert!(matches!(
        consensus(subproblems, options).await,
        Err(ConsensusError::WorkerUnresponsive { worker: 0 })
    ));
}

#[tokio::test]
async fn empty_runs_are_rejected_before_spawning() {
    assert!(matches!(
        consensus(Vec::new(), ConsensusOptions::default()).await,
        Err(ConsensusError::Config(_))
    ));
}
