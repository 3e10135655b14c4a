//! SABC (spec.md §4.5.4): simulated-annealing ABC. Unlike the PMC family,
//! SABC keeps one full N-particle population alive across the whole run --
//! each step is a local resample-and-Metropolis move against an annealed
//! threshold, not a full replenishment.

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
use crate::stats::{bisection_root, weighted_covariance};
use crate::worker::{reseed, simulate_and_score};

/// Equation 14 of Albert, Kuensch & Scheidegger (2014): values below the
/// reference population's minimum distance are rescaled linearly; values
/// above it get the empirical CDF of the reference population at that
/// point. The division by `old_distance.len()` in the below-min branch is
/// reproduced as the source has it, even though it is numerically suspect
/// for a very small `min(old_distance)` (spec.md §9, "flagged as
/// numerically suspicious").
fn smoother_distance(distance: &[f64], old_distance: &[f64]) -> Vec<f64> {
    let min_old = old_distance.iter().cloned().fold(f64::INFINITY, f64::min);
    distance
        .iter()
        .map(|&d| {
            if d < min_old {
                (d / min_old) / old_distance.len() as f64
            } else {
                old_distance.iter().filter(|&&x| x < d).count() as f64 / old_distance.len() as f64
            }
        })
        .collect()
}

fn average_redefined_distance(distance: &[f64], epsilon: f64) -> f64 {
    if epsilon == 0.0 {
        return 0.0;
    }
    let weights: Vec<f64> = distance.iter().map(|d| (-d / epsilon).exp()).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    distance.iter().zip(&weights).map(|(d, w)| d * w).sum::<f64>() / total
}

fn schedule(rho: f64, v: f64) -> f64 {
    if rho < 1e-100 {
        0.0
    } else {
        bisection_root(|eps| eps.powi(2) + v * eps.powf(1.5) - rho.powi(2), 0.0, rho.max(1e-6) * 4.0, 1e-10, 200)
    }
}

pub struct Sabc {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

struct WorkItem {
    seed: u64,
    graph: Graph,
    resample_index: usize,
}

struct WorkResult {
    theta: Vec<f64>,
    distance: f64,
    smooth_distance: f64,
    accepted: bool,
}

impl Sabc {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(Sabc {
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
        epsilon_init: f64,
        n_samples: usize,
        n_samples_per_param: usize,
        beta: f64,
        delta: f64,
        v: f64,
        ar_cutoff: f64,
        resample: Option<usize>,
        full_output: u8,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_usize("n_samples_per_param", n_samples_per_param)?;
        require_positive_f64("epsilon_init", epsilon_init)?;
        let resample_threshold = resample.unwrap_or(n_samples / 2);

        let observations = Arc::new(observations);
        let d = self.mapping.total_dim;

        // Step 0: plain prior draws, no threshold.
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
        journal.set_config("beta", serde_json::json!(beta));

        let mut epsilon = epsilon_init;

        for step in 0..steps {
            let dist_slice: Vec<f64> = distances.to_vec();
            let smooth: Vec<f64> = smoother_distance(&dist_slice, &dist_slice);
            let u = smooth.iter().sum::<f64>() / smooth.len() as f64;
            epsilon = schedule(average_redefined_distance(&dist_slice, epsilon).max(u), v).max(1e-12);

            log::debug!("SABC step {step}: epsilon={epsilon} U={u}");

            let uniform_weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            let plain_cov = weighted_covariance(&parameters.view(), &uniform_weights.view());
            let trace: f64 = (0..d).map(|i| plain_cov[[i, i]]).sum();
            let cov = &plain_cov * beta + Array2::<f64>::eye(d) * (1e-4 * trace);

            let resample_weights: Array1<f64> = Array1::from_iter(smooth.iter().map(|s| (-s * delta / u.max(1e-300)).exp()));

            let items: Vec<WorkItem> = (0..n_samples)
                .map(|i| {
                    let mut rng = reseed(derive_seed(self.seed, step + 1, i));
                    let idx = crate::stats::weighted_resample_index(&resample_weights.view(), &mut rng);
                    WorkItem {
                        seed: derive_seed(self.seed, step + 1, i),
                        graph: self.graph.duplicate(),
                        resample_index: idx,
                    }
                })
                .collect();

            let distance_fn = Arc::clone(&self.distance);
            let kernel = Arc::clone(&self.kernel);
            let mapping = self.mapping.clone();
            let obs = Arc::clone(&observations);
            let cov = cov.clone();
            let parameters_bc = Arc::new(parameters.clone());
            let smooth_bc = Arc::new(smooth.clone());
            let distances_bc = Arc::new(dist_slice.clone());

            let dataset = backend.parallelize(items);
            let results = backend.map(dataset, move |item| {
                let mut rng = reseed(item.seed);
                let mut graph = item.graph;
                let j = item.resample_index;
                let theta_j = parameters_bc.row(j).to_vec();
                let proposal_nodes = kernel.update(&mapping, &parameters_bc.view(), j, &vec![cov.clone(); kernel.sub_kernels().len()], &mut rng);
                let theta_prime = graph.get_correct_ordering(&mapping, &proposal_nodes);

                let prior_new = graph.pdf_of_prior(&mapping, &theta_prime);
                if prior_new == 0.0 || graph.set_parameters(&mapping, &theta_prime).is_err() {
                    return WorkResult {
                        theta: theta_j.clone(),
                        distance: distances_bc[j],
                        smooth_distance: smooth_bc[j],
                        accepted: false,
                    };
                }
                let prior_old = graph.pdf_of_prior(&mapping, &theta_j);

                let (_, d_new) = simulate_and_score(&mut graph, distance_fn.as_ref(), obs.as_ref(), n_samples_per_param, &mut rng);
                let s_new = smoother_distance(&[d_new], &distances_bc)[0];

                let ratio = if prior_old > 0.0 {
                    (prior_new / prior_old) * ((smooth_bc[j] - s_new) / epsilon).exp()
                } else {
                    1.0
                };
                let accept = rng.gen::<f64>() < ratio.min(1.0);

                if accept {
                    WorkResult {
                        theta: theta_prime,
                        distance: d_new,
                        smooth_distance: s_new,
                        accepted: true,
                    }
                } else {
                    WorkResult {
                        theta: theta_j,
                        distance: distances_bc[j],
                        smooth_distance: smooth_bc[j],
                        accepted: false,
                    }
                }
            });
            let results = backend.collect(results);

            let mut next_parameters = Array2::zeros((n_samples, d));
            let mut next_distances = Array1::zeros(n_samples);
            let mut accept_count = 0usize;
            for (i, r) in results.into_iter().enumerate() {
                next_parameters.row_mut(i).assign(&Array1::from(r.theta));
                next_distances[i] = r.distance;
                if r.accepted {
                    accept_count += 1;
                }
            }

            let acceptance_rate = accept_count as f64 / n_samples as f64;
            log::debug!("SABC step {step}: acceptance_rate={acceptance_rate}");
            journal.set_config(&format!("acceptance_rate_step_{step}"), serde_json::json!(acceptance_rate));

            if accept_count >= resample_threshold {
                let smooth_now = smoother_distance(&next_distances.to_vec(), &next_distances.to_vec());
                let weights: Array1<f64> = Array1::from_iter(smooth_now.iter().map(|s| (-s * delta / u.max(1e-300)).exp()));
                let mut rng = reseed(derive_seed(self.seed, step + 1, n_samples));
                let idxs = crate::stats::weighted_resample_indices(&weights.view(), n_samples, &mut rng);
                let resampled_params = Array2::from_shape_fn((n_samples, d), |(i, j)| next_parameters[[idxs[i], j]]);
                let resampled_dists = Array1::from_shape_fn(n_samples, |i| next_distances[idxs[i]]);
                parameters = resampled_params;
                distances = resampled_dists;
                log::debug!("SABC step {step}: resampled population (accept_count={accept_count})");
            } else {
                parameters = next_parameters;
                distances = next_distances;
            }

            let weights = Array1::from_elem(n_samples, 1.0 / n_samples as f64);
            journal.append(JournalEntry {
                parameters: parameters.clone(),
                weights,
                approx_likelihoods: None,
            });

            if acceptance_rate < ar_cutoff {
                log::debug!("SABC terminating at step {step}: acceptance_rate {acceptance_rate} < ar_cutoff {ar_cutoff}");
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
    fn smoother_distance_below_min_scales_linearly() {
        let old = vec![1.0, 2.0, 3.0];
        let smoothed = smoother_distance(&[0.5], &old);
        assert!((smoothed[0] - (0.5 / 1.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn smoother_distance_above_min_is_empirical_cdf() {
        let old = vec![1.0, 2.0, 3.0];
        let smoothed = smoother_distance(&[2.5], &old);
        assert!((smoothed[0] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn schedule_returns_zero_for_degenerate_rho() {
        assert_eq!(schedule(0.0, 0.3), 0.0);
    }
}
