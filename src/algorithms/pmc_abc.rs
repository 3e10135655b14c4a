//! PMC-ABC (spec.md §4.5.2): population Monte Carlo ABC. Generation 0 is a
//! plain rejection sampler; every later generation resamples by weight,
//! perturbs through the composite kernel, accepts iff `distance <=
//! epsilon[step]`, and reweights by the kernel-mixture denominator formula.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use super::{derive_seed, require_epsilon_len, require_positive_f64, require_positive_usize};
use crate::backend::Backend;
use crate::distance::Distance;
use crate::error::{AbcError, Result};
use crate::graph::{Graph, Mapping};
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{default_kernel, CompositeKernel};
use crate::population::{AcceptedPopulationStore, Population};
use crate::stats::{kernel_mixture_weight, percentile};
use crate::worker::{choose_parent_index, propose_until_prior_support, reseed, simulate_and_score};

pub struct PmcAbc {
    graph: Graph,
    distance: Arc<dyn Distance>,
    kernel: Arc<CompositeKernel>,
    mapping: Mapping,
    seed: u64,
}

struct WorkItem {
    seed: u64,
    graph: Graph,
}

struct WorkResult {
    theta: Vec<f64>,
    distance: f64,
    weight: f64,
}

impl PmcAbc {
    pub fn new(graph: Graph, distance: Arc<dyn Distance>, kernel: Option<CompositeKernel>, seed: u64) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(PmcAbc {
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
        epsilon_init: Vec<f64>,
        n_samples: usize,
        n_samples_per_param: usize,
        epsilon_percentile: f64,
        cov_factor: f64,
        full_output: u8,
        epochs: usize,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_usize("n_samples_per_param", n_samples_per_param)?;
        require_positive_usize("epochs", epochs)?;
        require_epsilon_len(&epsilon_init, steps)?;
        require_positive_f64("cov_factor", cov_factor)?;

        let observations = Arc::new(observations);
        let mut store = AcceptedPopulationStore::new();
        store.set_observations(observations.as_ref().clone());

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));
        journal.set_config("epsilon_percentile", serde_json::json!(epsilon_percentile));

        let mut epsilon = epsilon_init[0];
        let mut population: Option<Population> = None;

        for step in 0..steps {
            if epsilon_init.len() == steps {
                epsilon = epsilon_init[step];
            }
            log::debug!("PMC-ABC step {step}: epsilon={epsilon}");

            let items: Vec<WorkItem> = (0..n_samples)
                .map(|i| WorkItem {
                    seed: derive_seed(self.seed, step, i),
                    graph: self.graph.duplicate(),
                })
                .collect();

            let distance = Arc::clone(&self.distance);
            let kernel = Arc::clone(&self.kernel);
            let mapping = self.mapping.clone();
            let observations = Arc::clone(&observations);
            let store = store.clone();
            let gen0 = population.is_none();

            let dataset = backend.parallelize(items);
            let results = backend.map(dataset, move |item| {
                let mut rng = reseed(item.seed);
                let mut graph = item.graph;

                if gen0 {
                    loop {
                        graph.sample_from_prior(&mut rng);
                        let theta = graph.get_parameters(&mapping);
                        let (_, d) = simulate_and_score(
                            &mut graph,
                            distance.as_ref(),
                            observations.as_ref(),
                            n_samples_per_param,
                            &mut rng,
                        );
                        if d <= epsilon {
                            return WorkResult {
                                theta,
                                distance: d,
                                weight: 1.0,
                            };
                        }
                    }
                }

                let accepted_params = store.accepted_parameters.as_ref().unwrap().value().clone();
                let accepted_weights = store.accepted_weights.as_ref().unwrap().value().clone();
                let accepted_dists = store.accepted_distances.as_ref().unwrap().value().clone();
                let cov_mats = store.accepted_cov_mats.as_ref().unwrap().value().clone();

                let index = choose_parent_index(Some(&accepted_weights), accepted_params.nrows(), &mut rng);

                let theta = match propose_until_prior_support(
                    &mut graph,
                    &mapping,
                    &kernel,
                    &accepted_params.view(),
                    index,
                    &cov_mats,
                    epochs,
                    &mut rng,
                ) {
                    Ok(theta) => theta,
                    Err(AbcError::ProposalExhausted { .. }) => {
                        log::warn!("proposal exhausted at particle, keeping unperturbed parent");
                        accepted_params.row(index).to_vec()
                    }
                    Err(e) => unreachable!("propose_until_prior_support cannot fail otherwise: {e}"),
                };

                let (d, weight) = if theta == accepted_params.row(index).to_vec() {
                    (accepted_dists[index], accepted_weights[index])
                } else {
                    let (_, d) = simulate_and_score(
                        &mut graph,
                        distance.as_ref(),
                        observations.as_ref(),
                        n_samples_per_param,
                        &mut rng,
                    );
                    if d > epsilon {
                        // Rejected: fall back to the unperturbed parent,
                        // same treatment as a ProposalExhausted particle.
                        (accepted_dists[index], accepted_weights[index])
                    } else {
                        let prior_pdf = graph.pdf_of_prior(&mapping, &theta);
                        let w = kernel_mixture_weight(
                            prior_pdf,
                            &theta,
                            &accepted_params.view(),
                            &accepted_weights.view(),
                            |from, to| kernel.pdf(&mapping, from, to, &cov_mats),
                        );
                        (d, w)
                    }
                };

                WorkResult {
                    theta,
                    distance: d,
                    weight,
                }
            });
            let results = backend.collect(results);

            let d = self.mapping.total_dim;
            let mut parameters = Array2::zeros((n_samples, d));
            let mut distances = Array1::zeros(n_samples);
            let mut weights = Array1::zeros(n_samples);
            for (i, r) in results.into_iter().enumerate() {
                parameters.row_mut(i).assign(&Array1::from(r.theta));
                distances[i] = r.distance;
                weights[i] = r.weight;
            }

            let mut next_population = Population::new(parameters, weights);
            next_population.distances = Some(distances.clone());
            next_population.normalize_weights()?;

            let cov_mats = self.kernel.calculate_cov(
                &self.mapping,
                &next_population.parameters.view(),
                &next_population.weights.view(),
            );
            let cov_mats: Vec<Array2<f64>> = cov_mats.into_iter().map(|m| m * cov_factor).collect();

            store.update_broadcast(
                Some(next_population.parameters.clone()),
                Some(next_population.weights.clone()),
                Some(cov_mats),
                Some(distances.clone()),
            );

            journal.append(JournalEntry {
                parameters: next_population.parameters.clone(),
                weights: next_population.weights.clone(),
                approx_likelihoods: None,
            });

            if epsilon_percentile > 0.0 && step + 1 < steps {
                let percentile_eps = percentile(distances.as_slice().unwrap(), epsilon_percentile);
                epsilon = if epsilon_init.len() == steps {
                    epsilon_init[step + 1].max(percentile_eps)
                } else {
                    percentile_eps
                };
            }

            population = Some(next_population);
        }

        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;
}
