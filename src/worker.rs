//! The worker task (spec component C4): a stateless function of
//! `(seed, context) -> result` executed once per particle on the backend.
//! Every algorithm driver builds its own worker closure out of the pieces
//! below rather than sharing one god-function, because each variant
//! returns a different tuple (spec.md §4.4) -- but all of them reseed,
//! resample-or-draw-from-prior, propose, simulate and score the same way.

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::Distance;
use crate::error::AbcError;
use crate::graph::{Graph, Mapping};
use crate::kernel::CompositeKernel;
use crate::stats::weighted_resample_index;

/// Reseeds a worker-local RNG from the input seed, guaranteeing
/// determinism given `(seed, context)` (spec.md §5).
pub fn reseed(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Chooses a parent particle: unconditionally from the prior for
/// generation 0 (`weights = None`), or by weighted resampling otherwise.
pub fn choose_parent_index(weights: Option<&ndarray::Array1<f64>>, n: usize, rng: &mut StdRng) -> usize {
    match weights {
        Some(w) => weighted_resample_index(&w.view(), rng),
        None => rng.gen_range(0..n),
    }
}

/// Proposes via the kernel, rejecting proposals the graph or the prior
/// reject, retrying up to `epochs` times (spec.md §4.4 step 3). Returns
/// `ProposalExhausted` rather than looping forever -- the driver decides
/// whether to fall back to the unperturbed particle or drop it.
pub fn propose_until_prior_support(
    graph: &mut Graph,
    mapping: &Mapping,
    kernel: &CompositeKernel,
    parameters: &ArrayView2<f64>,
    column_index: usize,
    cov_mats: &[Array2<f64>],
    epochs: usize,
    rng: &mut StdRng,
) -> Result<Vec<f64>, AbcError> {
    for _ in 0..epochs {
        let proposals = kernel.update(mapping, parameters, column_index, cov_mats, rng);
        let ordered = graph.get_correct_ordering(mapping, &proposals);
        if graph.set_parameters(mapping, &ordered).is_ok()
            && graph.pdf_of_prior(mapping, &ordered) > 0.0
        {
            return Ok(ordered);
        }
    }
    Err(AbcError::ProposalExhausted { attempts: epochs })
}

/// Draws a fresh particle from the prior and returns its flat parameter
/// vector (generation 0 worker path).
pub fn draw_from_prior(graph: &mut Graph, mapping: &Mapping, rng: &mut StdRng) -> Vec<f64> {
    graph.sample_from_prior(rng);
    graph.get_parameters(mapping)
}

/// Simulates the first data-generating root model for `n_samples_per_param`
/// points and scores it against `observations`. `sample_from_distribution`
/// reporting `ok = false` is a `SimulationFailure`: the worker treats the
/// distance as `distance.dist_max()` rather than propagating an error
/// (spec.md §7).
///
/// The original source simulates only `self.model[0]` and notes
/// `#TODO multiple models` at every call site; this crate reproduces that
/// single-root behavior rather than inventing a multi-root aggregation
/// rule the source never specifies.
pub fn simulate_and_score(
    graph: &mut Graph,
    distance: &dyn Distance,
    observations: &Array2<f64>,
    n_samples_per_param: usize,
    rng: &mut StdRng,
) -> (Array2<f64>, f64) {
    graph.sync_root_inputs();
    let root_id = graph.roots()[0];
    let (ok, y_sim) = graph
        .node(root_id)
        .sample_from_distribution(n_samples_per_param, rng);
    if !ok {
        log::warn!("simulation failure, falling back to dist_max");
        return (y_sim, distance.dist_max());
    }
    let d = distance.distance(observations, &y_sim);
    (y_sim, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reseed_is_deterministic_given_same_seed() {
        let mut a = reseed(42);
        let mut b = reseed(42);
        let xa: u64 = a.gen();
        let xb: u64 = b.gen();
        assert_eq!(xa, xb);
    }
}
