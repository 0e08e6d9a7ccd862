extern crate nalgebra as na;

use na::DVector;
use serde::{Deserialize, Serialize};

/// Tuning parameters for adaptive spectral step sizes.
///
/// The defaults follow Xu, Taylor, et al., "Adaptive Consensus ADMM for
/// Distributed Optimization": adapt every second round, accept a curvature
/// estimate only when its correlation exceeds `0.2`, and bound the change
/// rate by a convergence constant of `1e10`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpectralOptions {
    /// Adaptation period in rounds; the step size is updated on rounds
    /// where `round % period == 1`.
    pub period: usize,
    /// Correlation threshold below which a curvature estimate is rejected.
    pub safeguard_eps: f64,
    /// Convergence constant `C`; the per-adaptation change factor is
    /// bounded by `1 + C / round^2`.
    pub convergence_const: f64,
}

impl Default for SpectralOptions {
    fn default() -> Self {
        SpectralOptions {
            period: 2,
            safeguard_eps: 0.2,
            convergence_const: 1e10,
        }
    }
}

/// Least squares curvature estimate from a primal change `p` and a dual
/// change `d`.
///
/// Combines the steepest descent estimate `sum(d^2) / sum(p.d)` and the
/// minimum gradient estimate `sum(p.d) / sum(p^2)`: returns the minimum
/// gradient value when it dominates, otherwise the hybrid
/// `steepest_descent - min_gradient / 2`.
pub(crate) fn ls_estimate(p: &DVector<f64>, d: &DVector<f64>) -> f64 {
    let pd = p.dot(d);
    let sd = d.norm_squared() / pd;
    let mg = pd / p.norm_squared();

    if 2.0 * mg > sd { mg } else { sd - mg / 2.0 }
}

/// Correlation coefficient `sum(p.d) / (||p|| * ||d||)` between two change
/// vectors.
pub(crate) fn correlation(p: &DVector<f64>, d: &DVector<f64>) -> f64 {
    p.dot(d) / (p.norm() * d.norm())
}

/// Safeguarding rule for the spectral step size update.
///
/// Uses the geometric mean of both curvature estimates when both
/// correlations exceed `eps`, a single estimate when only its correlation
/// does, and keeps the current step size when neither is trustworthy.
pub(crate) fn safeguard(rho: f64, a: f64, b: f64, a_cor: f64, b_cor: f64, eps: f64) -> f64 {
    if a_cor > eps && b_cor > eps {
        (a * b).sqrt()
    } else if a_cor > eps {
        a
    } else if b_cor > eps {
        b
    } else {
        rho
    }
}

/// Computes the generalized spectral step size with safeguarding.
///
/// The change vectors are the deltas of the worker's local value `x`, the
/// consensus value `xbar` (old minus new), the dual `y`, and the
/// intermediate dual `yhat` since the last adaptation. If any delta has a
/// squared norm at or below machine epsilon the curvature estimate is
/// numerically unreliable and the current step size is kept, silently.
///
/// The result is clamped to `[rho / scale, rho * scale]` with
/// `scale = 1 + C / round^2`, which bounds the per-adaptation change rate so
/// step sizes settle instead of oscillating. A positive `rho` stays
/// positive: every accepted curvature estimate has positive correlation and
/// is therefore positive itself.
///
/// # Arguments
///
/// * `rho` - The current step size
/// * `round` - The current round index (`>= 1` at every adaptation point)
/// * `dx` - Change in the local primal value
/// * `dxbar` - Change in the consensus value, old minus new
/// * `dy` - Change in the dual value
/// * `dyhat` - Change in the intermediate dual value
/// * `opts` - Safeguard threshold and convergence constant
///
/// # Returns
///
/// The step size for the next rounds.
pub fn spectral_step(
    rho: f64,
    round: usize,
    dx: &DVector<f64>,
    dxbar: &DVector<f64>,
    dy: &DVector<f64>,
    dyhat: &DVector<f64>,
    opts: &SpectralOptions,
) -> f64 {
    if dx.norm_squared() <= f64::EPSILON
        || dxbar.norm_squared() <= f64::EPSILON
        || dy.norm_squared() <= f64::EPSILON
        || dyhat.norm_squared() <= f64::EPSILON
    {
        return rho;
    }

    let a = ls_estimate(dx, dyhat);
    let b = ls_estimate(dxbar, dy);

    let a_cor = correlation(dx, dyhat);
    let b_cor = correlation(dxbar, dy);

    let scale = 1.0 + opts.convergence_const / (round as f64).powi(2);
    let candidate = safeguard(rho, a, b, a_cor, b_cor, opts.safeguard_eps);
    candidate.min(rho * scale).max(rho / scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    fn random_vector(rng: &mut StdRng, dim: usize) -> DVector<f64> {
        DVector::from_iterator(dim, (0..dim).map(|_| StandardNormal.sample(rng)))
    }

    #[test]
    fn ls_estimate_picks_minimum_gradient_when_dominant() {
        let p = DVector::from_vec(vec![1.0, 0.0]);
        let d = DVector::from_vec(vec![2.0, 0.0]);
        // sd = 4/2 = 2, mg = 2/1 = 2, 2*mg > sd picks mg.
        assert_float_eq!(ls_estimate(&p, &d), 2.0, abs <= 1e-12);
    }

    #[test]
    fn ls_estimate_hybrid_branch() {
        // p misaligned with d so that mg is small relative to sd.
        let p = DVector::from_vec(vec![1.0, 1.0]);
        let d = DVector::from_vec(vec![3.0, -1.0]);
        let pd = 2.0;
        let sd = 10.0 / pd;
        let mg = pd / 2.0;
        assert!(2.0 * mg <= sd);
        assert_float_eq!(ls_estimate(&p, &d), sd - mg / 2.0, abs <= 1e-12);
    }

    #[test]
    fn safeguard_takes_geometric_mean_when_both_correlated() {
        for (rho, a, b) in [(1.0, 2.0, 8.0), (0.3, 0.5, 0.02), (10.0, 1e-3, 1e3)] {
            let picked = safeguard(rho, a, b, 0.9, 0.21, 0.2);
            assert_float_eq!(picked, (a * b).sqrt(), rel <= 1e-12);
        }
    }

    #[test]
    fn safeguard_falls_back_to_single_estimates_and_rho() {
        assert_eq!(safeguard(1.5, 2.0, 8.0, 0.5, 0.1, 0.2), 2.0);
        assert_eq!(safeguard(1.5, 2.0, 8.0, 0.1, 0.5, 0.2), 8.0);
        assert_eq!(safeguard(1.5, 2.0, 8.0, 0.1, 0.1, 0.2), 1.5);
    }

    #[test]
    fn step_is_clamped_to_change_rate_bound() {
        // Small convergence constant so the clamp actually binds.
        let opts = SpectralOptions {
            convergence_const: 1.5,
            ..SpectralOptions::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for round in [1usize, 3, 5, 9, 25] {
            for _ in 0..20 {
                let dx = random_vector(&mut rng, 6);
                let dxbar = random_vector(&mut rng, 6);
                let dy = random_vector(&mut rng, 6);
                let dyhat = random_vector(&mut rng, 6);
                let rho = 0.8;
                let next = spectral_step(rho, round, &dx, &dxbar, &dy, &dyhat, &opts);
                let scale = 1.0 + opts.convergence_const / (round as f64).powi(2);
                assert!(next <= rho * scale + 1e-12);
                assert!(next >= rho / scale - 1e-12);
                assert!(next > 0.0);
            }
        }
    }

    #[test]
    fn negligible_deltas_keep_the_step_size() {
        let tiny = DVector::from_element(3, 1e-12);
        let normal = DVector::from_element(3, 1.0);
        let opts = SpectralOptions::default();
        let rho = spectral_step(2.0, 5, &tiny, &normal, &normal, &normal, &opts);
        assert_eq!(rho, 2.0);
    }

    #[test]
    fn uncorrelated_changes_keep_the_step_size() {
        // Orthogonal primal/dual changes: both correlations are zero.
        let p = DVector::from_vec(vec![1.0, 0.0]);
        let d = DVector::from_vec(vec![0.0, 1.0]);
        let opts = SpectralOptions::default();
        assert_eq!(spectral_step(0.7, 3, &p, &p, &d, &d, &opts), 0.7);
    }
}
