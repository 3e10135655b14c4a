//! Numeric helpers shared by the six algorithm drivers: weighted
//! covariance, percentile/quantile thresholds, effective sample size,
//! weighted resampling, and the kernel-mixture denominator weight formula
//! common to PMC-ABC, RSMC-ABC and APMC-ABC.

use bisection::bisect_left;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ordered_float::OrderedFloat;
use rand::Rng;

/// `1 / sum(w^2)`, the effective sample size (GLOSSARY).
pub fn ess(weights: &ArrayView1<f64>) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq <= 0.0 {
        0.0
    } else {
        1.0 / sum_sq
    }
}

/// The empirical percentile of `values` at probability `p` (0-100), used by
/// PMC-ABC's threshold update `epsilon[t+1] = percentile(distances, p)`.
/// Implemented via `bisection::bisect_left` against the sorted copy, the
/// same primitive Python's `numpy.percentile`-free variant relies on for a
/// linear-interpolation-free nearest-rank percentile.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    assert!((0.0..=100.0).contains(&p));
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.is_empty() {
        return f64::INFINITY;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// The index in `sorted` at which `value` would be inserted to keep it
/// sorted -- used to find how many accepted particles fall below a proposed
/// threshold without a full linear scan.
pub fn count_below(sorted_ascending: &[f64], value: f64) -> usize {
    bisect_left(sorted_ascending, &value)
}

/// Draws a single index in `0..weights.len()` with probability proportional
/// to `weights[i]`.
pub fn weighted_resample_index(weights: &ArrayView1<f64>, rng: &mut dyn rand::RngCore) -> usize {
    let total: f64 = weights.sum();
    debug_assert!(total > 0.0, "weighted_resample_index requires a positive weight sum");
    let target = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if acc >= target {
            return i;
        }
    }
    weights.len() - 1
}

/// Draws `n` indices by weight, used to replenish a generation's worth of
/// particles in one shot (APMC-ABC, RSMC-ABC replenishment).
pub fn weighted_resample_indices(weights: &ArrayView1<f64>, n: usize, rng: &mut dyn rand::RngCore) -> Vec<usize> {
    (0..n).map(|_| weighted_resample_index(weights, rng)).collect()
}

/// The empirical weighted covariance of `params` (N x D) under `weights`
/// (assumed to sum to 1). Used by `SubKernel::calculate_cov` for
/// continuous sub-kernels and by SABC/ABCsubsim's covariance scaling.
pub fn weighted_covariance(params: &ArrayView2<f64>, weights: &ArrayView1<f64>) -> Array2<f64> {
    let (n, d) = params.dim();
    if n == 0 || d == 0 {
        return Array2::zeros((d, d));
    }
    let mean: Array1<f64> = (0..d)
        .map(|j| {
            (0..n)
                .map(|i| weights[i] * params[[i, j]])
                .sum::<f64>()
        })
        .collect();
    let mut cov = Array2::zeros((d, d));
    for i in 0..n {
        let centered: Array1<f64> = (0..d).map(|j| params[[i, j]] - mean[j]).collect();
        for a in 0..d {
            for b in 0..d {
                cov[[a, b]] += weights[i] * centered[a] * centered[b];
            }
        }
    }
    cov
}

/// Sorts `(index, distance)` pairs by distance using `ordered_float`, the
/// wrapper needed because `f64` is not `Ord` -- exactly the role it plays in
/// the teacher's particle ordering (`OrderedFloat(x.eps)`).
pub fn argsort_by_distance(distances: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..distances.len()).collect();
    idx.sort_by_key(|&i| OrderedFloat(distances[i]));
    idx
}

/// `w'_j = pi(theta'_j) / sum_i w_i * K_i(theta'_j | theta_i)`, the
/// kernel-mixture denominator weight shared by PMC-ABC, RSMC-ABC and
/// APMC-ABC (spec.md §4.5.2/.6/.7).
pub fn kernel_mixture_weight(
    prior_pdf: f64,
    proposal: &[f64],
    accepted_parameters: &ArrayView2<f64>,
    accepted_weights: &ArrayView1<f64>,
    kernel_pdf: impl Fn(&[f64], &[f64]) -> f64,
) -> f64 {
    if prior_pdf == 0.0 {
        return 0.0;
    }
    let n = accepted_parameters.nrows();
    let mut denom = 0.0;
    for i in 0..n {
        let theta_i: Vec<f64> = accepted_parameters.row(i).to_vec();
        denom += accepted_weights[i] * kernel_pdf(&theta_i, proposal);
    }
    if denom <= 0.0 {
        0.0
    } else {
        prior_pdf / denom
    }
}

/// Interval bisection for a monotonic scalar equation `f(x) = 0` on
/// `[lo, hi]`, used by SABC's `_schedule` (`eps^2 + v*eps^1.5 - rho^2 = 0`)
/// and SMC-ABC's ESS-matching epsilon search. This is a hand-rolled
/// numerical method distinct from the `bisection` crate (which bisects
/// sorted arrays, used above) -- the original Python relies on
/// `scipy.optimize.fsolve`, which is not part of this crate's dependency
/// stack.
pub fn bisection_root<F: Fn(f64) -> f64>(f: F, mut lo: f64, mut hi: f64, tol: f64, max_iter: usize) -> f64 {
    let mut f_lo = f(lo);
    for _ in 0..max_iter {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if f_mid.abs() < tol || (hi - lo) < tol {
            return mid;
        }
        if f_lo.signum() == f_mid.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ess_of_uniform_weights_equals_n() {
        let w = array![0.25, 0.25, 0.25, 0.25];
        assert!((ess(&w.view()) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_of_sorted_range() {
        let v: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        assert!((percentile(&v, 50.0) - 50.0).abs() < 1.0);
    }

    #[test]
    fn weighted_covariance_of_point_mass_is_zero() {
        let params = array![[1.0, 2.0], [1.0, 2.0]];
        let weights = array![0.5, 0.5];
        let cov = weighted_covariance(&params.view(), &weights.view());
        assert!(cov.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn bisection_root_finds_sqrt_two() {
        let root = bisection_root(|x| x * x - 2.0, 0.0, 2.0, 1e-10, 100);
        assert!((root - std::f64::consts::SQRT_2).abs() < 1e-6);
    }
}
