extern crate nalgebra as na;

use std::collections::HashMap;

use log::debug;
use na::DVector;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::problem::{LocalSolver, ProxOutcome, ProxPenalty, SolveStatus};
use crate::spectral::{SpectralOptions, spectral_step};
use crate::stopping::ResidualSsq;
use crate::variable::{SpectralBaseline, VarId, VariableSpec, VariableState};

/// One worker's local solve result for the current round.
///
/// Plain numeric aggregates only: reports cross a channel and must never
/// carry live references into worker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxReport {
    /// Solver status for this round.
    pub status: SolveStatus,
    /// Current step size per owned variable.
    pub rho: HashMap<VarId, f64>,
    /// Local value per owned variable that has one.
    pub x: HashMap<VarId, DVector<f64>>,
}

/// Messages from a worker to the coordinator.
///
/// Within a round a worker always sends `Prox` first and `Residual` second;
/// the coordinator treats any other ordering as a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMsg {
    /// Local solve result, sent at the first barrier of a round.
    Prox(ProxReport),
    /// Residual sums, sent at the second barrier of a round.
    Residual(ResidualSsq),
}

/// Messages from the coordinator to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorMsg {
    /// Consensus values for the worker's owned variables plus the round
    /// index.
    Consensus {
        xbars: HashMap<VarId, DVector<f64>>,
        round: usize,
    },
    /// Graceful stop; the worker exits at its next receive point.
    Stop,
}

/// Consensus-side state of one worker, advanced one round at a time.
///
/// Holds the per-variable [`VariableState`] and implements the round
/// algebra: penalty formation, dual updates, residual accumulation, and the
/// periodic spectral step-size adaptation. Separate from the channel loop so
/// the algebra is directly testable.
pub(crate) struct WorkerState {
    vars: HashMap<VarId, VariableState>,
    scaled_dual: bool,
    spectral: Option<SpectralOptions>,
}

impl WorkerState {
    pub(crate) fn new(
        specs: &[VariableSpec],
        rho: &HashMap<VarId, f64>,
        scaled_dual: bool,
        spectral: Option<SpectralOptions>,
    ) -> Self {
        let vars = specs
            .iter()
            .map(|spec| {
                let state = VariableState::new(spec.dim, rho[&spec.id], spectral.is_some());
                (spec.id, state)
            })
            .collect();
        WorkerState {
            vars,
            scaled_dual,
            spectral,
        }
    }

    /// Penalty parameters for the current round's proximal solve.
    pub(crate) fn penalties(&self) -> HashMap<VarId, ProxPenalty> {
        self.vars
            .iter()
            .map(|(id, state)| {
                let y_scaled = if self.scaled_dual {
                    state.y.clone()
                } else {
                    &state.y / state.rho
                };
                let penalty = ProxPenalty {
                    rho: state.rho,
                    xbar: state.xbar.clone(),
                    y_scaled,
                };
                (*id, penalty)
            })
            .collect()
    }

    /// Records the solver's variable values into the local copies.
    pub(crate) fn record_outcome(&mut self, outcome: &ProxOutcome) {
        for (id, value) in &outcome.values {
            if let Some(state) = self.vars.get_mut(id) {
                state.x = Some(value.clone());
            }
        }
    }

    /// Builds the report for the first barrier of the round.
    pub(crate) fn prox_report(&self, status: SolveStatus) -> ProxReport {
        let rho = self
            .vars
            .iter()
            .map(|(id, state)| (*id, state.rho))
            .collect();
        let x = self
            .vars
            .iter()
            .filter_map(|(id, state)| state.x.as_ref().map(|x| (*id, x.clone())))
            .collect();
        ProxReport { status, rho, x }
    }

    /// Applies the consensus values for one round.
    ///
    /// For each owned variable this computes the primal contribution
    /// `x - xbar_new` (zero local copy if `x` is still undefined) and the
    /// dual contribution `rho * (xbar_old - xbar_new)`, then advances
    /// `xbar` and `y <- y + rho * (x - xbar)` and accumulates the squared
    /// norms for the stopping test. On adaptation rounds the spectral update
    /// runs against the pre-update `y` and `xbar`.
    pub(crate) fn absorb_consensus(
        &mut self,
        xbars: &HashMap<VarId, DVector<f64>>,
        round: usize,
    ) -> ResidualSsq {
        let mut ssq = ResidualSsq::default();

        for (id, state) in &mut self.vars {
            let Some(xbar_new) = xbars.get(id) else {
                continue;
            };
            let x = state.x_or_zero();

            let primal = &x - xbar_new;
            let dual = (&state.xbar - xbar_new) * state.rho;

            let xbar_old = std::mem::replace(&mut state.xbar, xbar_new.clone());
            let y_old = state.y.clone();
            state.y += (&x - &state.xbar) * state.rho;

            ssq.primal += primal.norm_squared();
            ssq.dual += dual.norm_squared();
            if state.x.is_some() {
                ssq.x += x.norm_squared();
            }
            ssq.xbar += state.xbar.norm_squared();
            ssq.y += state.y.norm_squared();

            if let Some(opts) = &self.spectral
                && round % opts.period == 1
            {
                // Intermediate dual from the pre-update iterates.
                let yhat = &y_old + (&x - &xbar_old) * state.rho;
                if let Some(base) = state.baseline.take() {
                    let dx = &x - &base.x;
                    let dxbar = &base.xbar - &state.xbar;
                    let dy = &state.y - &base.y;
                    let dyhat = &yhat - &base.yhat;
                    state.rho = spectral_step(state.rho, round, &dx, &dxbar, &dy, &dyhat, opts);
                    state.baseline = Some(SpectralBaseline {
                        x,
                        xbar: state.xbar.clone(),
                        y: state.y.clone(),
                        yhat,
                    });
                }
            }
        }

        ssq
    }
}

/// Runs one worker until the coordinator signals stop.
///
/// Each round: solve the penalized local problem, report the outcome, block
/// for the consensus value, absorb it, report residual sums. A `Stop`
/// message or a closed channel ends the loop at the post-report receive
/// point; an in-flight local solve finishes first and its result is
/// discarded.
pub(crate) async fn run_worker(
    index: usize,
    mut solver: Box<dyn LocalSolver>,
    mut state: WorkerState,
    mut rx: Receiver<CoordinatorMsg>,
    tx: Sender<WorkerMsg>,
) {
    loop {
        let outcome = solver.solve(&state.penalties());
        state.record_outcome(&outcome);
        let report = state.prox_report(outcome.status);
        if tx.send(WorkerMsg::Prox(report)).await.is_err() {
            break;
        }

        match rx.recv().await {
            Some(CoordinatorMsg::Consensus { xbars, round }) => {
                let ssq = state.absorb_consensus(&xbars, round);
                debug!(
                    "worker {index}: round {round} primal_ssq={:.3e} dual_ssq={:.3e}",
                    ssq.primal, ssq.dual
                );
                if tx.send(WorkerMsg::Residual(ssq)).await.is_err() {
                    break;
                }
            }
            Some(CoordinatorMsg::Stop) | None => break,
        }
    }
    debug!("worker {index}: stopped");
}
