//! SMC-ABC (spec.md §4.5.8): sequential Monte Carlo ABC with a data-driven
//! threshold schedule. Each step's epsilon is *solved for*, not scheduled:
//! find the largest epsilon < epsilon_{t-1} whose reweighting would drop
//! the population's ESS to `resample_threshold * n_samples`, via bisection
//! over the sorted distance array (`count_below`). Populations are
//! resampled and MCMC-perturbed whenever ESS falls below that threshold.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::Rng;

use super::{derive_seed, require_positive_f64, require_positive_usize};
use crate::backend::Backend;
use crate::distance::Distance;
use crate::error::Result;
use crate::graph::{Graph, Mapping};
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{default_kernel, CompositeKernel};
use crate::stats::{bisection_root, count_below, ess, weighted_resample_indices};
use crate::worker::{reseed, simulate_and_score};

pub struct SmcAbc {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

/// Given the current weights and distances, finds the largest `epsilon`
/// strictly below `prev_epsilon` such that reweighting `w_i *
/// 1[d_i <= epsilon] / 1[d_i <= prev_epsilon]` leaves the population's ESS
/// at `target_ess`. Monotonic in epsilon (more particles survive as
/// epsilon grows), so a plain bisection over `[min(d), prev_epsilon]`
/// finds it.
fn solve_epsilon_for_target_ess(
    weights: &Array1<f64>,
    distances: &[f64],
    prev_epsilon: f64,
    target_ess: f64,
) -> f64 {
    let min_d = distances.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(min_d < prev_epsilon) {
        return prev_epsilon;
    }
    let ess_at = |eps: f64| -> f64 {
        let reweighted: Array1<f64> = Array1::from_iter(weights.iter().zip(distances).map(|(w, d)| if *d <= eps { *w } else { 0.0 }));
        let total: f64 = reweighted.sum();
        if total <= 0.0 {
            return 0.0;
        }
        ess(&(&reweighted / total).view())
    };
    bisection_root(|eps| ess_at(eps) - target_ess, min_d, prev_epsilon, 1e-6, 60)
}

impl SmcAbc {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(SmcAbc {
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
        resample_threshold: f64,
        epsilon_final: f64,
        mcmc_steps: usize,
        full_output: u8,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_usize("mcmc_steps", mcmc_steps)?;
        require_positive_f64("resample_threshold", resample_threshold)?;

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

        let mut parameters = Array2::zeros((n_samples, d));
        let mut distances = Array1::zeros(n_samples);
        for (i, (theta, dist)) in results.into_iter().enumerate() {
            parameters.row_mut(i).assign(&Array1::from(theta));
            distances[i] = dist;
        }
        let mut weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
        let mut epsilon = distances.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));
        journal.set_config("epsilon_final", serde_json::json!(epsilon_final));
        journal.append(JournalEntry {
            parameters: parameters.clone(),
            weights: weights.clone(),
            approx_likelihoods: None,
        });

        let target_ess = resample_threshold * n_samples as f64;

        for step in 1..steps {
            let dist_vec = distances.to_vec();
            let new_epsilon = solve_epsilon_for_target_ess(&weights, &dist_vec, epsilon, target_ess).max(epsilon_final);
            log::debug!("SMC-ABC step {step}: epsilon={new_epsilon}");

            let mut reweighted: Array1<f64> = Array1::from_iter(
                weights
                    .iter()
                    .zip(&dist_vec)
                    .map(|(w, d)| if *d <= new_epsilon { *w } else { 0.0 }),
            );
            let total: f64 = reweighted.sum();
            if total > 0.0 {
                reweighted.mapv_inplace(|w| w / total);
            } else {
                reweighted = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            }

            let current_ess = ess(&reweighted.view());
            log::debug!("SMC-ABC step {step}: ess={current_ess}");

            if current_ess < target_ess {
                let sorted: Vec<f64> = {
                    let mut s = dist_vec.clone();
                    s.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    s
                };
                let survivors = count_below(&sorted, new_epsilon).max(1);
                log::debug!("SMC-ABC step {step}: resampling ({survivors} of {n_samples} below epsilon)");

                let mut rng = reseed(derive_seed(self.seed, step, n_samples + 7));
                let idxs = weighted_resample_indices(&reweighted.view(), n_samples, &mut rng);
                let resampled_params = Array2::from_shape_fn((n_samples, d), |(i, j)| parameters[[idxs[i], j]]);
                let resampled_dists = Array1::from_shape_fn(n_samples, |i| distances[idxs[i]]);

                let uniform = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
                let cov = self.kernel.calculate_cov(&self.mapping, &resampled_params.view(), &uniform.view());

                let items: Vec<(u64, Graph, Vec<f64>, f64)> = (0..n_samples)
                    .map(|i| {
                        (
                            derive_seed(self.seed, step, i),
                            self.graph.duplicate(),
                            resampled_params.row(i).to_vec(),
                            resampled_dists[i],
                        )
                    })
                    .collect();

                let distance_fn = Arc::clone(&self.distance);
                let kernel = Arc::clone(&self.kernel);
                let mapping = self.mapping.clone();
                let obs = Arc::clone(&observations);
                let cov = cov.clone();

                let dataset = backend.parallelize(items);
                let results = backend.map(dataset, move |(seed, mut graph, start_theta, start_dist)| {
                    let mut rng = reseed(seed);
                    let _ = graph.set_parameters(&mapping, &start_theta);
                    let mut theta = start_theta;
                    let mut dist = start_dist;
                    for _ in 0..mcmc_steps {
                        let single_row = Array2::from_shape_vec((1, theta.len()), theta.clone()).unwrap();
                        let proposals = kernel.update(&mapping, &single_row.view(), 0, &cov, &mut rng);
                        let proposed = graph.get_correct_ordering(&mapping, &proposals);
                        let prior_old = graph.pdf_of_prior(&mapping, &theta);
                        if graph.set_parameters(&mapping, &proposed).is_ok() {
                            let prior_new = graph.pdf_of_prior(&mapping, &proposed);
                            if prior_new > 0.0 {
                                let (_, d) = simulate_and_score(&mut graph, distance_fn.as_ref(), obs.as_ref(), n_samples_per_param, &mut rng);
                                // ratio_data_epsilon = 1: both theta and
                                // proposed are evaluated against the same
                                // new_epsilon within one MCMC sweep.
                                let ratio = if prior_old > 0.0 {
                                    let k_reverse = kernel.pdf(&mapping, &proposed, &theta, &cov);
                                    let k_forward = kernel.pdf(&mapping, &theta, &proposed, &cov);
                                    if k_forward > 0.0 {
                                        (prior_new / prior_old) * (k_reverse / k_forward)
                                    } else {
                                        1.0
                                    }
                                } else {
                                    1.0
                                };
                                if d <= new_epsilon && rng.gen::<f64>() < ratio.min(1.0) {
                                    theta = proposed;
                                    dist = d;
                                    continue;
                                }
                            }
                        }
                        let _ = graph.set_parameters(&mapping, &theta);
                    }
                    (theta, dist)
                });
                let results = backend.collect(results);

                for (i, (theta, dist)) in results.into_iter().enumerate() {
                    parameters.row_mut(i).assign(&Array1::from(theta));
                    distances[i] = dist;
                }
                weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            } else {
                weights = reweighted;
            }

            epsilon = new_epsilon;

            journal.append(JournalEntry {
                parameters: parameters.clone(),
                weights: weights.clone(),
                approx_likelihoods: None,
            });

            if epsilon <= epsilon_final {
                log::debug!("SMC-ABC terminating at step {step}: reached epsilon_final");
                break;
            }
        }

        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn solve_epsilon_for_target_ess_is_monotonic_in_target() {
        let weights = array![0.25, 0.25, 0.25, 0.25];
        let distances = vec![0.1, 0.5, 1.0, 2.0];
        let eps_loose = solve_epsilon_for_target_ess(&weights, &distances, 2.0, 3.5);
        let eps_tight = solve_epsilon_for_target_ess(&weights, &distances, 2.0, 1.5);
        assert!(eps_loose >= eps_tight);
    }

    #[test]
    fn solve_epsilon_for_target_ess_returns_prev_when_degenerate() {
        let weights = array![1.0];
        let distances = vec![5.0];
        let eps = solve_epsilon_for_target_ess(&weights, &distances, 5.0, 0.5);
        assert_eq!(eps, 5.0);
    }
}
