//! APMC-ABC (spec.md §4.5.7): Lenormand et al.'s adaptive population Monte
//! Carlo ABC. Unlike PMC-ABC's fixed epsilon schedule, the threshold here
//! is implicit: each step keeps the `alpha` fraction of the population with
//! the smallest distance and replenishes the rest by perturbation, tracking
//! what fraction of *freshly drawn* particles would have cleared the
//! previous round's alpha-quantile distance as the stopping signal.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use super::{derive_seed, require_positive_f64, require_positive_usize};
use crate::backend::Backend;
use crate::distance::Distance;
use crate::error::Result;
use crate::graph::{Graph, Mapping};
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{default_kernel, CompositeKernel};
use crate::stats::{argsort_by_distance, kernel_mixture_weight};
use crate::worker::{choose_parent_index, propose_until_prior_support, reseed, simulate_and_score};

pub struct ApmcAbc {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

impl ApmcAbc {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(ApmcAbc {
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
        acceptance_cutoff: f64,
        epochs: usize,
        full_output: u8,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_f64("alpha", alpha)?;
        require_positive_f64("acceptance_cutoff", acceptance_cutoff)?;
        if !(0.0..1.0).contains(&alpha) {
            return Err(crate::error::AbcError::InvalidConfiguration(
                "alpha must be in (0, 1)".to_string(),
            ));
        }

        let observations = Arc::new(observations);
        let d = self.mapping.total_dim;
        let n_keep = ((alpha * n_samples as f64).floor() as usize).clamp(1, n_samples - 1);

        let n_total0 = ((n_samples as f64 / alpha).ceil() as usize).max(n_samples);
        let init_items: Vec<(u64, Graph)> = (0..n_total0)
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

        let mut all_theta: Vec<Vec<f64>> = Vec::with_capacity(n_total0);
        let mut all_dist: Vec<f64> = Vec::with_capacity(n_total0);
        for (theta, dist) in results {
            all_theta.push(theta);
            all_dist.push(dist);
        }
        let order = argsort_by_distance(&all_dist);
        let mut parameters = Array2::from_shape_fn((n_samples, d), |(i, j)| all_theta[order[i]][j]);
        let mut distances = Array1::from_shape_fn(n_samples, |i| all_dist[order[i]]);
        let mut weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
        let mut epsilon = distances[n_keep.min(n_samples - 1)];

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));
        journal.set_config("alpha", serde_json::json!(alpha));
        journal.append(JournalEntry {
            parameters: parameters.clone(),
            weights: weights.clone(),
            approx_likelihoods: None,
        });

        for step in 1..steps {
            let order = argsort_by_distance(&distances.to_vec());
            let kept_idx: Vec<usize> = order[..n_keep].to_vec();
            let n_new = n_samples - n_keep;

            let kept_params = Array2::from_shape_fn((n_keep, d), |(i, j)| parameters[[kept_idx[i], j]]);
            let kept_weights_raw: Vec<f64> = kept_idx.iter().map(|&i| weights[i]).collect();
            let kept_total: f64 = kept_weights_raw.iter().sum();
            let kept_weights = Array1::from_vec(
                kept_weights_raw
                    .iter()
                    .map(|w| if kept_total > 0.0 { w / kept_total } else { 1.0 / n_keep as f64 })
                    .collect(),
            );
            let cov_mats = self.kernel.calculate_cov(&self.mapping, &kept_params.view(), &kept_weights.view());

            let items: Vec<(u64, Graph)> = (0..n_new)
                .map(|i| (derive_seed(self.seed, step, i), self.graph.duplicate()))
                .collect();
            let distance_fn = Arc::clone(&self.distance);
            let kernel = Arc::clone(&self.kernel);
            let mapping = self.mapping.clone();
            let obs = Arc::clone(&observations);
            let kept_params_bc = kept_params.clone();
            let kept_weights_bc = kept_weights.clone();
            let cov_mats_bc = cov_mats.clone();

            let dataset = backend.parallelize(items);
            let results = backend.map(dataset, move |(seed, mut graph)| {
                let mut rng = reseed(seed);
                let index = choose_parent_index(Some(&kept_weights_bc), kept_params_bc.nrows(), &mut rng);
                let theta = match propose_until_prior_support(
                    &mut graph,
                    &mapping,
                    &kernel,
                    &kept_params_bc.view(),
                    index,
                    &cov_mats_bc,
                    epochs,
                    &mut rng,
                ) {
                    Ok(theta) => theta,
                    Err(_) => kept_params_bc.row(index).to_vec(),
                };
                let _ = graph.set_parameters(&mapping, &theta);
                let (_, dist) = simulate_and_score(&mut graph, distance_fn.as_ref(), obs.as_ref(), n_samples_per_param, &mut rng);
                let prior_pdf = graph.pdf_of_prior(&mapping, &theta);
                let weight = kernel_mixture_weight(
                    prior_pdf,
                    &theta,
                    &kept_params_bc.view(),
                    &kept_weights_bc.view(),
                    |from, to| kernel.pdf(&mapping, from, to, &cov_mats_bc),
                );
                (theta, dist, weight)
            });
            let results = backend.collect(results);

            let mut new_parameters = Array2::zeros((n_samples, d));
            let mut new_distances = Array1::zeros(n_samples);
            let mut new_weights = Array1::zeros(n_samples);
            for i in 0..n_keep {
                new_parameters.row_mut(i).assign(&parameters.row(kept_idx[i]));
                new_distances[i] = distances[kept_idx[i]];
                new_weights[i] = kept_weights[i];
            }
            let mut accepted_under_prev_epsilon = 0usize;
            for (offset, (theta, dist, weight)) in results.into_iter().enumerate() {
                let row = n_keep + offset;
                new_parameters.row_mut(row).assign(&Array1::from(theta));
                new_distances[row] = dist;
                new_weights[row] = weight;
                if dist <= epsilon {
                    accepted_under_prev_epsilon += 1;
                }
            }

            let total_weight: f64 = new_weights.sum();
            if total_weight > 0.0 {
                new_weights.mapv_inplace(|w| w / total_weight);
            }

            parameters = new_parameters;
            distances = new_distances;
            weights = new_weights;

            let acceptance_rate = accepted_under_prev_epsilon as f64 / n_new.max(1) as f64;
            log::debug!("APMC-ABC step {step}: acceptance_rate={acceptance_rate}");

            let order = argsort_by_distance(&distances.to_vec());
            epsilon = distances[order[n_keep.min(n_samples - 1)]];

            journal.append(JournalEntry {
                parameters: parameters.clone(),
                weights: weights.clone(),
                approx_likelihoods: None,
            });

            if acceptance_rate < acceptance_cutoff {
                log::debug!("APMC-ABC terminating at step {step}: acceptance_rate below cutoff");
                break;
            }
        }

        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;
}
