//! PMC (spec.md §4.5.3): population Monte Carlo against an approximate
//! likelihood rather than a distance threshold. There is no accept/reject
//! step on simulated data -- every particle whose perturbation has positive
//! prior support is kept, and its weight is
//! `w'_j = likelihood(theta'_j) * prior(theta'_j) / sum_i w_i K(theta'_j | theta_i)`.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use super::{derive_seed, require_positive_f64, require_positive_usize};
use crate::distance::ApproxLikelihood;
use crate::backend::Backend;
use crate::error::{AbcError, Result};
use crate::graph::{Graph, Mapping};
use crate::journal::{Journal, JournalEntry};
use crate::kernel::{default_kernel, CompositeKernel};
use crate::population::{AcceptedPopulationStore, Population};
use crate::stats::kernel_mixture_weight;
use crate::worker::{choose_parent_index, propose_until_prior_support, reseed};

pub struct Pmc {
    graph: Graph,
    likelihood: Arc<dyn ApproxLikelihood>,
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
    weight: f64,
    likelihood: f64,
}

impl Pmc {
    pub fn new(
        graph: Graph,
        likelihood: Arc<dyn ApproxLikelihood>,
        kernel: Option<CompositeKernel>,
        seed: u64,
    ) -> Result<Self> {
        let mapping = graph.get_mapping()?;
        let kernel = match kernel {
            Some(k) => k,
            None => default_kernel(&graph, &mapping)?,
        };
        Ok(Pmc {
            graph,
            likelihood,
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
        cov_factor: f64,
        ini_points: Option<Array2<f64>>,
        full_output: u8,
        epochs: usize,
    ) -> Result<Journal> {
        require_positive_usize("steps", steps)?;
        require_positive_usize("n_samples", n_samples)?;
        require_positive_usize("n_samples_per_param", n_samples_per_param)?;
        require_positive_f64("cov_factor", cov_factor)?;
        if let Some(p) = &ini_points {
            if p.nrows() != n_samples {
                return Err(AbcError::InvalidConfiguration(
                    "ini_points must have n_samples rows".to_string(),
                ));
            }
        }

        let observations = Arc::new(observations);
        let mut store = AcceptedPopulationStore::new();
        store.set_observations(observations.as_ref().clone());

        let mut journal = Journal::new(full_output);
        journal.set_config("steps", serde_json::json!(steps));

        let mut population: Option<Population> = None;

        for step in 0..steps {
            log::debug!("PMC step {step}");

            let items: Vec<WorkItem> = (0..n_samples)
                .map(|i| WorkItem {
                    seed: derive_seed(self.seed, step, i),
                    graph: self.graph.duplicate(),
                })
                .collect();

            let likelihood = Arc::clone(&self.likelihood);
            let kernel = Arc::clone(&self.kernel);
            let mapping = self.mapping.clone();
            let observations = Arc::clone(&observations);
            let store = store.clone();
            let gen0 = population.is_none();
            let ini_points = ini_points.clone();

            let dataset = backend.parallelize(items);
            let results = backend.map(dataset, move |item| {
                let mut rng = reseed(item.seed);
                let mut graph = item.graph;

                let theta = if gen0 {
                    if let Some(points) = &ini_points {
                        points.row(item.seed as usize % points.nrows()).to_vec()
                    } else {
                        graph.sample_from_prior(&mut rng);
                        graph.get_parameters(&mapping)
                    }
                } else {
                    let accepted_params = store.accepted_parameters.as_ref().unwrap().value().clone();
                    let accepted_weights = store.accepted_weights.as_ref().unwrap().value().clone();
                    let cov_mats = store.accepted_cov_mats.as_ref().unwrap().value().clone();
                    let index = choose_parent_index(Some(&accepted_weights), accepted_params.nrows(), &mut rng);
                    match propose_until_prior_support(
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
                            log::warn!("proposal exhausted, keeping unperturbed parent");
                            accepted_params.row(index).to_vec()
                        }
                        Err(e) => unreachable!("propose_until_prior_support cannot fail otherwise: {e}"),
                    }
                };

                if gen0 {
                    let _ = graph.set_parameters(&mapping, &theta);
                }
                graph.sync_root_inputs();
                let root_id = graph.roots()[0];
                let (ok, y_sim) = graph.node(root_id).sample_from_distribution(n_samples_per_param, &mut rng);
                let lik = if ok { likelihood.likelihood(observations.as_ref(), &y_sim) } else { 0.0 };
                let prior_pdf = graph.pdf_of_prior(&mapping, &theta);

                let weight = if gen0 {
                    lik * prior_pdf
                } else {
                    let accepted_params = store.accepted_parameters.as_ref().unwrap().value().clone();
                    let accepted_weights = store.accepted_weights.as_ref().unwrap().value().clone();
                    let cov_mats = store.accepted_cov_mats.as_ref().unwrap().value().clone();
                    let base = kernel_mixture_weight(
                        prior_pdf,
                        &theta,
                        &accepted_params.view(),
                        &accepted_weights.view(),
                        |from, to| kernel.pdf(&mapping, from, to, &cov_mats),
                    );
                    base * lik
                };

                WorkResult { theta, weight, likelihood: lik }
            });
            let results = backend.collect(results);

            let d = self.mapping.total_dim;
            let mut parameters = Array2::zeros((n_samples, d));
            let mut weights = Array1::zeros(n_samples);
            let mut likelihoods = Array1::zeros(n_samples);
            for (i, r) in results.into_iter().enumerate() {
                parameters.row_mut(i).assign(&Array1::from(r.theta));
                weights[i] = r.weight;
                likelihoods[i] = r.likelihood;
            }

            let mut next_population = Population::new(parameters, weights);
            next_population.normalize_weights()?;

            // "Covariance covFactor x weighted-cov as diagonal scaling":
            // zero the off-diagonal terms before scaling.
            let mut cov_mats = self.kernel.calculate_cov(
                &self.mapping,
                &next_population.parameters.view(),
                &next_population.weights.view(),
            );
            for cov in &mut cov_mats {
                let n = cov.nrows();
                for i in 0..n {
                    for j in 0..n {
                        if i != j {
                            cov[[i, j]] = 0.0;
                        }
                    }
                }
                *cov *= cov_factor;
            }

            store.update_broadcast(
                Some(next_population.parameters.clone()),
                Some(next_population.weights.clone()),
                Some(cov_mats),
                None,
            );

            journal.append(JournalEntry {
                parameters: next_population.parameters.clone(),
                weights: next_population.weights.clone(),
                approx_likelihoods: Some(likelihoods),
            });

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
