//! Distance and approximate-likelihood protocols (spec.md §6). Concrete
//! implementations (Euclidean, LogReg, etc.) are external collaborators;
//! this crate only specifies the trait boundary plus the `dist_max`
//! sentinel used when a simulation fails (spec.md §7, `SimulationFailure`).

use ndarray::Array2;

/// `distance(observed, simulated) -> f64`, an upper sentinel used in place
/// of a real score when simulation fails, and an opaque summary-statistics
/// tag carried for bookkeeping only.
pub trait Distance: Send + Sync {
    fn distance(&self, observed: &Array2<f64>, simulated: &Array2<f64>) -> f64;

    /// Upper sentinel distance, substituted whenever
    /// `sample_from_distribution` reports `ok = false`.
    fn dist_max(&self) -> f64 {
        f64::INFINITY
    }

    fn statistics_calc(&self) -> &str {
        "default"
    }
}

/// `likelihood(observed, simulated) -> f64`.
pub trait ApproxLikelihood: Send + Sync {
    fn likelihood(&self, observed: &Array2<f64>, simulated: &Array2<f64>) -> f64;
}
