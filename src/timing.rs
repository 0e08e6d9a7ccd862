use crate::error::ConsensusError;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::OpenOptions,
    future::Future,
    io::Write,
    time::{Duration, Instant},
};

/// A record of timing information for one protocol phase of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimingRecord {
    /// Name of the protocol phase (e.g., "gather_prox", "scatter")
    pub phase: String,
    /// The round number when this phase was executed
    pub round: usize,
    /// Duration of the phase in milliseconds
    pub duration_ms: f64,
}

/// Performance tracking for the coordinator's round loop.
///
/// `TimingTracker` collects per-phase timings across rounds and provides
/// statistics and CSV export for bottleneck identification. The coordinator
/// records the gather, aggregate, scatter, and residual phases
/// automatically; the tracker is returned as part of the run result.
#[derive(Debug, Clone, Default)]
pub struct TimingTracker {
    phase_timings: Vec<PhaseTimingRecord>,
    current_round: usize,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self {
            phase_timings: Vec::new(),
            current_round: 0,
        }
    }

    pub fn start_round(&mut self) {
        self.current_round += 1;
    }

    pub fn record_phase(&mut self, phase: &str, duration: Duration) {
        self.phase_timings.push(PhaseTimingRecord {
            phase: phase.to_string(),
            round: self.current_round,
            duration_ms: duration.as_secs_f64() * 1000.0,
        });
    }

    /// Per-phase statistics as `(average_ms, max_ms, count)`.
    pub fn phase_statistics(&self) -> HashMap<String, (f64, f64, usize)> {
        let mut grouped: HashMap<String, Vec<f64>> = HashMap::new();
        for record in &self.phase_timings {
            grouped
                .entry(record.phase.clone())
                .or_default()
                .push(record.duration_ms);
        }

        grouped
            .into_iter()
            .map(|(phase, durations)| {
                let count = durations.len();
                let avg = durations.iter().sum::<f64>() / count as f64;
                let max = durations.iter().fold(0.0f64, |m, &d| m.max(d));
                (phase, (avg, max, count))
            })
            .collect()
    }

    /// Writes phase timing data to a CSV file for analysis.
    ///
    /// # Arguments
    ///
    /// * `filename` - Path to the output CSV file
    pub fn write_phase_timings_to_csv(&self, filename: &str) -> Result<(), ConsensusError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(filename)?;

        writeln!(file, "phase,round,duration_ms")?;
        for record in &self.phase_timings {
            writeln!(
                file,
                "{},{},{:.3}",
                record.phase, record.round, record.duration_ms
            )?;
        }

        Ok(())
    }
}

/// Awaits a future and records its duration under the given phase name.
pub(crate) async fn time_phase<T>(
    tracker: &mut TimingTracker,
    phase: &str,
    fut: impl Future<Output = T>,
) -> T {
    let start = Instant::now();
    let result = fut.await;
    tracker.record_phase(phase, start.elapsed());
    result
}
