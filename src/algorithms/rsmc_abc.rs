//! RSMC-ABC (spec.md §4.5.6): replenishment sequential Monte Carlo ABC
//! (Drovandi & Pettitt 2011). Each step shrinks the threshold, resamples
//! survivors under the new threshold, and replenishes diversity with `R`
//! Metropolis-Hastings moves per particle -- `R` itself recomputed every
//! step from the previous step's single-move acceptance probability so
//! that the expected number of *unmoved* particles stays below `c`.

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
use crate::stats::{percentile, weighted_resample_indices};
use crate::worker::{reseed, simulate_and_score};

/// Probability that none of `r` independent Metropolis moves, each
/// accepting with probability `p_acc`, succeed in moving a particle --
/// solved for `r` so this probability stays at or below `c`.
fn replenishment_steps(p_acc: f64, c: f64) -> usize {
    let p_acc = p_acc.clamp(1e-6, 1.0 - 1e-6);
    let r = (c.ln() / (1.0 - p_acc).ln()).ceil();
    r.max(1.0) as usize
}

pub struct RsmcAbc {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

impl RsmcAbc {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(RsmcAbc {
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
        alpha: f64,
        epsilon_final: f64,
        c: f64,
        full_output: u8,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_f64("alpha", alpha)?;
        require_positive_f64("c", c)?;

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

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));
        journal.set_config("epsilon_final", serde_json::json!(epsilon_final));

        let mut p_acc_estimate = 0.2;

        for step in 0..steps {
            let dist_slice = distances.to_vec();
            let shrunk = percentile(&dist_slice, alpha * 100.0);
            let epsilon = shrunk.max(epsilon_final);
            let r = replenishment_steps(p_acc_estimate, c);
            log::debug!("RSMC-ABC step {step}: epsilon={epsilon} R={r}");

            let survivor_idx: Vec<usize> = (0..n_samples).filter(|&i| distances[i] <= epsilon).collect();
            let survivor_idx = if survivor_idx.is_empty() {
                vec![0]
            } else {
                survivor_idx
            };

            let uniform = Array1::from_elem(survivor_idx.len(), 1.0 / survivor_idx.len() as f64);
            let survivor_params = Array2::from_shape_fn((survivor_idx.len(), d), |(i, j)| parameters[[survivor_idx[i], j]]);
            let cov = self.kernel.calculate_cov(&self.mapping, &survivor_params.view(), &uniform.view());

            let mut rng = reseed(derive_seed(self.seed, step + 1, n_samples + 1));
            let picks: Vec<usize> = {
                let survivor_weights = Array1::from_elem(survivor_idx.len(), 1.0);
                let local_idx = weighted_resample_indices(&survivor_weights.view(), n_samples, &mut rng);
                local_idx.into_iter().map(|li| survivor_idx[li]).collect()
            };

            let items: Vec<(u64, Graph, Vec<f64>, f64)> = picks
                .iter()
                .enumerate()
                .map(|(i, &src)| {
                    (
                        derive_seed(self.seed, step + 1, i),
                        self.graph.duplicate(),
                        parameters.row(src).to_vec(),
                        distances[src],
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
                let mut accepts = 0usize;
                for _ in 0..r {
                    let single_row = Array2::from_shape_vec((1, theta.len()), theta.clone()).unwrap();
                    let proposals = kernel.update(&mapping, &single_row.view(), 0, &cov, &mut rng);
                    let proposed = graph.get_correct_ordering(&mapping, &proposals);
                    let prior_old = graph.pdf_of_prior(&mapping, &theta);
                    if graph.set_parameters(&mapping, &proposed).is_ok() {
                        let prior_new = graph.pdf_of_prior(&mapping, &proposed);
                        if prior_new > 0.0 {
                            let (_, d) = simulate_and_score(&mut graph, distance_fn.as_ref(), obs.as_ref(), n_samples_per_param, &mut rng);
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
                            if d <= epsilon && rng.gen::<f64>() < ratio.min(1.0) {
                                theta = proposed;
                                dist = d;
                                accepts += 1;
                                continue;
                            }
                        }
                    }
                    let _ = graph.set_parameters(&mapping, &theta);
                }
                (theta, dist, accepts)
            });
            let results = backend.collect(results);

            let mut total_accepts = 0usize;
            for (i, (theta, dist, accepts)) in results.into_iter().enumerate() {
                parameters.row_mut(i).assign(&Array1::from(theta));
                distances[i] = dist;
                total_accepts += accepts;
            }

            let moves_attempted = n_samples * r;
            p_acc_estimate = if moves_attempted == 0 {
                p_acc_estimate
            } else {
                (total_accepts as f64 / moves_attempted as f64).clamp(1e-6, 1.0 - 1e-6)
            };
            log::debug!("RSMC-ABC step {step}: p_acc_estimate={p_acc_estimate}");

            let weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            journal.append(JournalEntry {
                parameters: parameters.clone(),
                weights,
                approx_likelihoods: None,
            });

            if epsilon <= epsilon_final {
                log::debug!("RSMC-ABC terminating at step {step}: reached epsilon_final");
                break;
            }
        }

        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenishment_steps_grows_as_acceptance_shrinks() {
        let r_high = replenishment_steps(0.5, 0.01);
        let r_low = replenishment_steps(0.05, 0.01);
        assert!(r_low > r_high);
    }

    #[test]
    fn replenishment_steps_is_at_least_one() {
        assert!(replenishment_steps(0.999999, 0.01) >= 1);
    }
}
