extern crate nalgebra as na;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, info, warn};
use na::DVector;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::aggregate::aggregate;
use crate::error::ConsensusError;
use crate::problem::{ConsensusOptions, Subproblem};
use crate::stopping::{ResidualSsq, evaluate};
use crate::timing::{TimingTracker, time_phase};
use crate::variable::{VarId, VariableSpec};
use crate::worker::{CoordinatorMsg, ProxReport, WorkerMsg, WorkerState, run_worker};

/// Outcome of a completed consensus run.
#[derive(Debug)]
pub struct RunResult {
    /// Final consensus value per variable id.
    pub consensus: HashMap<VarId, DVector<f64>>,
    /// Per-round `(primal, dual)` residual totals, one entry per executed
    /// round.
    pub residuals: Vec<(f64, f64)>,
    /// Number of rounds executed.
    pub iterations: usize,
    /// Wall-clock duration of the iteration loop.
    pub solve_time: Duration,
    /// Per-phase timings of the coordinator's round loop.
    pub timing: TimingTracker,
}

const CHANNEL_CAPACITY: usize = 4;

struct WorkerChannel {
    tx: Sender<CoordinatorMsg>,
    rx: Receiver<WorkerMsg>,
    owned: Vec<VarId>,
}

/// Solves a consensus problem over the given subproblems.
///
/// Spawns one worker task per subproblem, each with a dedicated
/// bidirectional channel, and drives the round-based protocol: gather one
/// proximal report per worker, average the shared variables weighted by
/// step size, scatter the consensus values back to their owners, gather
/// residual sums, and stop once the global criterion is met or the
/// iteration budget runs out.
///
/// Workers are terminated gracefully on exit; a fatal error (an infeasible
/// subproblem, a failed solver, or an unresponsive worker) aborts the run
/// and discards any rounds completed so far.
///
/// # Arguments
///
/// * `subproblems` - One participant per entry; ownership moves to the
///   spawned workers
/// * `options` - Step sizes, iteration budget, tolerance, and spectral
///   adaptation settings
///
/// # Returns
///
/// * `Ok(RunResult)` with the final consensus values and residual history
/// * `Err(ConsensusError)` if validation or the run itself fails
///
/// # Example
///
/// ```rust,no_run
/// # use acadmm_core::consensus::consensus;
/// # use acadmm_core::problem::{ConsensusOptions, Subproblem};
/// # async fn example(subproblems: Vec<Subproblem>) -> Result<(), Box<dyn std::error::Error>> {
/// let result = consensus(subproblems, ConsensusOptions::default()).await?;
/// println!("converged in {} rounds", result.iterations);
/// # Ok(())
/// # }
/// ```
pub async fn consensus(
    subproblems: Vec<Subproblem>,
    options: ConsensusOptions,
) -> Result<RunResult, ConsensusError> {
    validate(&subproblems, &options)?;

    info!(
        "starting consensus run: {} subproblems, max {} rounds, tolerance {:.1e}, spectral {}",
        subproblems.len(),
        options.max_iterations,
        options.tolerance,
        options.spectral.is_some(),
    );

    // Spawn one worker per subproblem with a dedicated channel pair.
    let mut workers = JoinSet::new();
    let mut channels = Vec::with_capacity(subproblems.len());
    for (index, subproblem) in subproblems.into_iter().enumerate() {
        let (specs, solver) = subproblem.into_parts();
        let rho = options.rho_init.assign(&specs);
        let state = WorkerState::new(&specs, &rho, options.scaled_dual, options.spectral);

        let (down_tx, down_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (up_tx, up_rx) = mpsc::channel(CHANNEL_CAPACITY);
        workers.spawn(run_worker(index, solver, state, down_rx, up_tx));
        channels.push(WorkerChannel {
            tx: down_tx,
            rx: up_rx,
            owned: specs.iter().map(|spec| spec.id).collect(),
        });
    }

    let run = drive_rounds(&mut channels, &options).await;

    // Graceful shutdown regardless of how the loop ended; a worker that
    // already exited has closed its channel, which is fine.
    for channel in &channels {
        let _ = channel.tx.send(CoordinatorMsg::Stop).await;
    }
    drop(channels);
    if run.is_ok() {
        while workers.join_next().await.is_some() {}
    } else {
        // A fatal run may leave a worker stuck inside its local solve;
        // abort instead of joining so an unresponsive solver cannot also
        // hang the coordinator.
        workers.abort_all();
    }

    run
}

async fn drive_rounds(
    channels: &mut [WorkerChannel],
    options: &ConsensusOptions,
) -> Result<RunResult, ConsensusError> {
    let mut tracker = TimingTracker::new();
    let mut residuals = Vec::new();
    let mut consensus_value = HashMap::new();
    let start = Instant::now();

    for round in 0..options.max_iterations {
        tracker.start_round();

        let reports = time_phase(
            &mut tracker,
            "gather_prox",
            gather_prox(channels, options.gather_timeout),
        )
        .await?;

        consensus_value = time_phase(&mut tracker, "aggregate", async {
            aggregate(&reports)
        })
        .await
        .inspect_err(|e| warn!("round {round}: aborting, {e}"))?;

        time_phase(
            &mut tracker,
            "scatter",
            scatter(channels, &consensus_value, round),
        )
        .await?;

        let ssq = time_phase(
            &mut tracker,
            "gather_residual",
            gather_residual(channels, options.gather_timeout),
        )
        .await?;

        let (primal, dual, stopped) = evaluate(&ssq, options.tolerance);
        residuals.push((primal, dual));
        debug!("round {round}: primal={primal:.6e} dual={dual:.6e}");

        if stopped {
            break;
        }
    }

    let solve_time = start.elapsed();
    let iterations = residuals.len();
    info!(
        "consensus run finished after {iterations} rounds in {:.3}s",
        solve_time.as_secs_f64()
    );

    Ok(RunResult {
        consensus: consensus_value,
        residuals,
        iterations,
        solve_time,
        timing: tracker,
    })
}

/// Receives one message from the given worker, honoring the barrier timeout.
async fn recv_from(
    worker: usize,
    channel: &mut WorkerChannel,
    wait: Option<Duration>,
) -> Result<WorkerMsg, ConsensusError> {
    let msg = match wait {
        Some(limit) => timeout(limit, channel.rx.recv())
            .await
            .map_err(|_| ConsensusError::WorkerUnresponsive { worker })?,
        None => channel.rx.recv().await,
    };
    msg.ok_or(ConsensusError::WorkerUnresponsive { worker })
}

async fn gather_prox(
    channels: &mut [WorkerChannel],
    wait: Option<Duration>,
) -> Result<Vec<ProxReport>, ConsensusError> {
    let receives = channels
        .iter_mut()
        .enumerate()
        .map(|(worker, channel)| async move {
            match recv_from(worker, channel, wait).await? {
                WorkerMsg::Prox(report) => Ok(report),
                WorkerMsg::Residual(_) => Err(ConsensusError::UnexpectedMessage { worker }),
            }
        });
    join_all(receives).await.into_iter().collect()
}

async fn gather_residual(
    channels: &mut [WorkerChannel],
    wait: Option<Duration>,
) -> Result<Vec<ResidualSsq>, ConsensusError> {
    let receives = channels
        .iter_mut()
        .enumerate()
        .map(|(worker, channel)| async move {
            match recv_from(worker, channel, wait).await? {
                WorkerMsg::Residual(ssq) => Ok(ssq),
                WorkerMsg::Prox(_) => Err(ConsensusError::UnexpectedMessage { worker }),
            }
        });
    join_all(receives).await.into_iter().collect()
}

/// Sends each worker the consensus values for the variables it owns.
async fn scatter(
    channels: &[WorkerChannel],
    xbars: &HashMap<VarId, DVector<f64>>,
    round: usize,
) -> Result<(), ConsensusError> {
    for (worker, channel) in channels.iter().enumerate() {
        let owned = channel
            .owned
            .iter()
            .filter_map(|id| xbars.get(id).map(|value| (*id, value.clone())))
            .collect();
        channel
            .tx
            .send(CoordinatorMsg::Consensus {
                xbars: owned,
                round,
            })
            .await
            .map_err(|_| ConsensusError::WorkerUnresponsive { worker })?;
    }
    Ok(())
}

fn validate(
    subproblems: &[Subproblem],
    options: &ConsensusOptions,
) -> Result<(), ConsensusError> {
    if subproblems.is_empty() {
        return Err(ConsensusError::Config(
            "at least one subproblem is required".to_string(),
        ));
    }
    if options.max_iterations == 0 {
        return Err(ConsensusError::Config(
            "max_iterations must be at least 1".to_string(),
        ));
    }
    if !(options.tolerance >= 0.0) {
        return Err(ConsensusError::Config(
            "tolerance must be non-negative".to_string(),
        ));
    }
    if let Some(spectral) = &options.spectral {
        if spectral.period == 0 {
            return Err(ConsensusError::Config(
                "spectral adaptation period must be at least 1".to_string(),
            ));
        }
        if !(spectral.safeguard_eps > 0.0) || !(spectral.convergence_const > 0.0) {
            return Err(ConsensusError::Config(
                "spectral safeguard and convergence constants must be positive".to_string(),
            ));
        }
    }

    // Declared dimensions must agree across every subproblem sharing an id,
    // and every initial step size must be positive.
    let mut dims: HashMap<VarId, usize> = HashMap::new();
    for subproblem in subproblems {
        let mut seen: Vec<VarId> = Vec::new();
        for VariableSpec { id, dim } in subproblem.variables() {
            if *dim == 0 {
                return Err(ConsensusError::Config(format!(
                    "variable {id} has dimension 0"
                )));
            }
            if seen.contains(id) {
                return Err(ConsensusError::Config(format!(
                    "variable {id} is declared twice in one subproblem"
                )));
            }
            seen.push(*id);
            if let Some(existing) = dims.insert(*id, *dim)
                && existing != *dim
            {
                return Err(ConsensusError::Config(format!(
                    "variable {id} is declared with dimensions {existing} and {dim}"
                )));
            }
            let rho = options.rho_init.resolve(*id);
            if !(rho > 0.0) {
                return Err(ConsensusError::Config(format!(
                    "initial step size for variable {id} must be positive, got {rho}"
                )));
            }
        }
    }

    Ok(())
}
