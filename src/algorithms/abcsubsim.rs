//! ABCsubsim (spec.md §4.5.5): approximate Bayesian subset simulation.
//! Each level keeps `n_seeds = n_samples / chain_length` particles from the
//! previous level's low-distance tail and extends each into a Markov chain
//! of `chain_length` draws via Metropolis-Hastings against the indicator
//! target `prior(theta) * 1[distance(theta) <= epsilon_t]`. The proposal
//! covariance is rescaled per level by a power-of-two search against a
//! 0.44 target acceptance rate before the full chain batch runs.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::Rng;

use super::{derive_seed, require_positive_f64, require_positive_usize};
use crate::backend::Backend;
use crate::distance::Distance;
use crate::error::{AbcError, Result};
use crate::graph::{Graph, Mapping};
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{default_kernel, CompositeKernel};
use crate::stats::argsort_by_distance;
use crate::worker::{reseed, simulate_and_score};

const TARGET_ACCEPTANCE: f64 = 0.44;
const SCALE_CANDIDATES: usize = 10;

pub struct AbcSubsim {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

/// One Metropolis-Hastings step, shared by the scale search and the full
/// chain extension: propose from `theta` through the kernel at the given
/// covariance, then accept with probability
/// `min(1, pi(theta')/pi(theta) * K(theta|theta')/K(theta'|theta))`
/// gated by the indicator `d(theta') <= epsilon` (spec.md §4.5.5).
#[allow(clippy::too_many_arguments)]
fn mh_step(
    graph: &mut Graph,
    mapping: &Mapping,
    kernel: &CompositeKernel,
    distance_fn: &dyn Distance,
    observations: &Array2<f64>,
    n_samples_per_param: usize,
    theta: &[f64],
    current_distance: f64,
    epsilon: f64,
    cov: &[Array2<f64>],
    rng: &mut rand::rngs::StdRng,
) -> (Vec<f64>, f64, bool) {
    let single_row = Array2::from_shape_vec((1, theta.len()), theta.to_vec()).unwrap();
    let proposals = kernel.update(mapping, &single_row.view(), 0, cov, rng);
    let proposed = graph.get_correct_ordering(mapping, &proposals);

    if graph.set_parameters(mapping, &proposed).is_err() {
        let _ = graph.set_parameters(mapping, theta);
        return (theta.to_vec(), current_distance, false);
    }
    let prior_new = graph.pdf_of_prior(mapping, &proposed);
    if prior_new == 0.0 {
        let _ = graph.set_parameters(mapping, theta);
        return (theta.to_vec(), current_distance, false);
    }
    let prior_old = graph.pdf_of_prior(mapping, theta);
    let (_, d) = simulate_and_score(graph, distance_fn, observations, n_samples_per_param, rng);

    let ratio = if prior_old > 0.0 {
        let k_reverse = kernel.pdf(mapping, &proposed, theta, cov);
        let k_forward = kernel.pdf(mapping, theta, &proposed, cov);
        if k_forward > 0.0 {
            (prior_new / prior_old) * (k_reverse / k_forward)
        } else {
            1.0
        }
    } else {
        1.0
    };
    let accept = d <= epsilon && rng.gen::<f64>() < ratio.min(1.0);

    if accept {
        (proposed, d, true)
    } else {
        let _ = graph.set_parameters(mapping, theta);
        (theta.to_vec(), current_distance, false)
    }
}

impl AbcSubsim {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(AbcSubsim {
            graph,
            distance,
            kernel: Arc::new(kernel),
            mapping,
            seed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sample<B: Backend>(
        &mut self,
        backend: &B,
        observations: Array2<f64>,
        steps: usize,
        n_samples: usize,
        n_samples_per_param: usize,
        chain_length: usize,
        ap_change_cutoff: f64,
        full_output: u8,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_usize("chain_length", chain_length)?;
        require_positive_f64("ap_change_cutoff", ap_change_cutoff)?;
        if n_samples % chain_length != 0 {
            return Err(AbcError::InvalidConfiguration(
                "n_samples must be a multiple of chain_length".to_string(),
            ));
        }
        let n_seeds = n_samples / chain_length;

        let observations = Arc::new(observations);
        let d = self.mapping.total_dim;

        let init_items: Vec<(u64, Graph)> = (0..n_samples)
            .map(|i| (derive_seed(self.seed, 0, i), self.graph.duplicate()))
            .collect();
        let distance0 = Arc::clone(&self.distance);
        let mapping0 = self.mapping.clone();
        let obs0 = Arc::clone(&observations);
        let dataset = backend.parallelize(init_items);
        let results = backend.map(dataset, move |(seed, mut graph)| {
            let mut rng = reseed(seed);
            graph.sample_from_prior(&mut rng);
            let theta = graph.get_parameters(&mapping0);
            let (_, dist) = simulate_and_score(&mut graph, distance0.as_ref(), obs0.as_ref(), n_samples_per_param, &mut rng);
            (theta, dist)
        });
        let results = backend.collect(results);

        let mut thetas: Vec<Vec<f64>> = Vec::with_capacity(n_samples);
        let mut distances: Vec<f64> = Vec::with_capacity(n_samples);
        for (theta, dist) in results {
            thetas.push(theta);
            distances.push(dist);
        }

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));
        journal.set_config("chain_length", serde_json::json!(chain_length));

        let mut prev_acceptance: Option<f64> = None;

        for step in 0..steps {
            let order = argsort_by_distance(&distances);
            let epsilon = distances[order[n_seeds - 1]];
            log::debug!("ABCsubsim step {step}: epsilon={epsilon}");
            journal.set_config(&format!("anneal_parameter_step_{step}"), serde_json::json!(epsilon));

            let seed_params = Array2::from_shape_fn((n_seeds, d), |(i, j)| thetas[order[i]][j]);
            let uniform = Array1::from_elem(n_seeds, 1.0 / n_seeds as f64);
            let base_cov = self.kernel.calculate_cov(&self.mapping, &seed_params.view(), &uniform.view());

            let scale = self.search_scale(&base_cov, &seed_params, &observations, epsilon, n_samples_per_param, step);
            let cov: Vec<Array2<f64>> = base_cov.iter().map(|c| c * scale).collect();

            let items: Vec<(u64, Graph, Vec<f64>, f64)> = (0..n_seeds)
                .map(|i| {
                    (
                        derive_seed(self.seed, step + 1, i),
                        self.graph.duplicate(),
                        thetas[order[i]].clone(),
                        distances[order[i]],
                    )
                })
                .collect();

            let distance_fn = Arc::clone(&self.distance);
            let kernel = Arc::clone(&self.kernel);
            let mapping = self.mapping.clone();
            let obs = Arc::clone(&observations);
            let cov = cov.clone();

            let dataset = backend.parallelize(items);
            let results = backend.map(dataset, move |(seed, mut graph, seed_theta, seed_dist)| {
                let mut rng = reseed(seed);
                let _ = graph.set_parameters(&mapping, &seed_theta);
                let mut chain = Vec::with_capacity(chain_length);
                chain.push((seed_theta.clone(), seed_dist));
                let mut theta = seed_theta;
                let mut dist = seed_dist;
                let mut accepts = 0usize;
                for _ in 1..chain_length {
                    let (next_theta, next_dist, accepted) = mh_step(
                        &mut graph,
                        &mapping,
                        &kernel,
                        distance_fn.as_ref(),
                        obs.as_ref(),
                        n_samples_per_param,
                        &theta,
                        dist,
                        epsilon,
                        &cov,
                        &mut rng,
                    );
                    if accepted {
                        accepts += 1;
                    }
                    theta = next_theta;
                    dist = next_dist;
                    chain.push((theta.clone(), dist));
                }
                (chain, accepts)
            });
            let results = backend.collect(results);

            thetas.clear();
            distances.clear();
            let mut total_accepts = 0usize;
            for (chain, accepts) in results {
                total_accepts += accepts;
                for (theta, dist) in chain {
                    thetas.push(theta);
                    distances.push(dist);
                }
            }
            let acceptance_rate = total_accepts as f64 / (n_seeds * (chain_length - 1)).max(1) as f64;
            log::debug!("ABCsubsim step {step}: acceptance_rate={acceptance_rate} scale={scale}");

            let mut parameters = Array2::zeros((n_samples, d));
            for (i, theta) in thetas.iter().enumerate() {
                parameters.row_mut(i).assign(&Array1::from(theta.clone()));
            }
            let weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            journal.append(JournalEntry {
                parameters,
                weights,
                approx_likelihoods: None,
            });

            if let Some(prev) = prev_acceptance {
                if (acceptance_rate - prev).abs() < ap_change_cutoff {
                    log::debug!("ABCsubsim terminating at step {step}: acceptance-rate change below cutoff");
                    break;
                }
            }
            prev_acceptance = Some(acceptance_rate);
        }

        Ok(journal)
    }

    /// Power-of-two covariance scale search (Chiachio et al. 2014, §3.2):
    /// tries `base_cov * 2^(-2k)` for `k in 0..SCALE_CANDIDATES` against a
    /// short trial chain from the first seed, keeping the scale whose
    /// acceptance rate is closest to 0.44.
    fn search_scale(
        &self,
        base_cov: &[Array2<f64>],
        seed_params: &Array2<f64>,
        observations: &Array2<f64>,
        epsilon: f64,
        n_samples_per_param: usize,
        step: usize,
    ) -> f64 {
        let trial_seeds = seed_params.nrows().min(5);
        let mut best_scale = 1.0;
        let mut best_gap = f64::INFINITY;

        for k in 0..SCALE_CANDIDATES {
            let scale = 2f64.powi(-2 * k as i32);
            let cov: Vec<Array2<f64>> = base_cov.iter().map(|c| c * scale).collect();
            let mut accepts = 0usize;
            let mut trials = 0usize;
            for s in 0..trial_seeds {
                let mut rng = reseed(derive_seed(self.seed, step + 1, 1_000_000 + k * 100 + s));
                let mut graph = self.graph.duplicate();
                let mut theta = seed_params.row(s).to_vec();
                let _ = graph.set_parameters(&self.mapping, &theta);
                let (_, mut dist) = simulate_and_score(&mut graph, self.distance.as_ref(), observations, n_samples_per_param, &mut rng);
                for _ in 0..3 {
                    let (next_theta, next_dist, accepted) = mh_step(
                        &mut graph,
                        &self.mapping,
                        &self.kernel,
                        self.distance.as_ref(),
                        observations,
                        n_samples_per_param,
                        &theta,
                        dist,
                        epsilon,
                        &cov,
                        &mut rng,
                    );
                    theta = next_theta;
                    dist = next_dist;
                    trials += 1;
                    if accepted {
                        accepts += 1;
                    }
                }
            }
            let rate = if trials == 0 { 0.0 } else { accepts as f64 / trials as f64 };
            let gap = (rate - TARGET_ACCEPTANCE).abs();
            if gap < best_gap {
                best_gap = gap;
                best_scale = scale;
            }
        }
        best_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_candidates_are_decreasing_powers_of_two() {
        let scales: Vec<f64> = (0..SCALE_CANDIDATES).map(|k| 2f64.powi(-2 * k as i32)).collect();
        for w in scales.windows(2) {
            assert!(w[1] < w[0]);
        }
    }
}
