use thiserror::Error;

/// Errors that can abort a consensus run.
///
/// `ConsensusError` is the primary error type used throughout the library.
/// Per-round numerical issues (an unreliable spectral curvature estimate, a
/// non-triggering safeguard) are absorbed locally by the iteration and never
/// appear here; only global infeasibility, a misbehaving solver, or a
/// communication failure is fatal. A fatal error discards the rounds
/// completed so far; no partial residual history is returned.
///
/// # Example
///
/// ```rust
/// # use acadmm_core::error::ConsensusError;
///
/// fn might_fail() -> Result<(), ConsensusError> {
///     Err(ConsensusError::InfeasibleSubproblem { worker: 3 })
/// }
/// ```
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The run options were invalid. Raised before any worker is spawned.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A worker's proximal step reported an infeasible or unbounded status.
    /// Fatal and not retried: a subproblem's feasibility does not change
    /// across rounds without a formulation change.
    #[error("proximal problem of subproblem {worker} is infeasible or unbounded")]
    InfeasibleSubproblem {
        /// Index of the subproblem whose solve failed.
        worker: usize,
    },

    /// A worker's local solver reported an error status.
    #[error("local solver of subproblem {worker} failed")]
    SolverFailure {
        /// Index of the subproblem whose solver failed.
        worker: usize,
    },

    /// A worker failed to report within the configured gather timeout, or
    /// its channel closed mid-protocol.
    #[error("worker {worker} did not respond during a gather barrier")]
    WorkerUnresponsive {
        /// Index of the unresponsive worker.
        worker: usize,
    },

    /// A worker sent a message out of protocol order.
    #[error("worker {worker} sent an unexpected message kind")]
    UnexpectedMessage {
        /// Index of the offending worker.
        worker: usize,
    },

    /// An I/O failure while exporting timing data.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
