//! The particle population engine (spec components C2/§3).
//!
//! `Population` is the per-generation N x D weighted particle table a
//! driver mutates in place each step. `AcceptedPopulationStore` is the thin
//! broadcast holder (C2): up to five read-only slots the driver publishes
//! once per generation and workers read through `Broadcast<T>::value()`
//! without the driver re-shipping anything per worker.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{AbcError, Result};
use crate::graph::Mapping;
use crate::kernel::CompositeKernel;
use crate::stats::{ess, weighted_covariance};

/// A read-only, reference-counted broadcast handle. `.value()` is the
/// accessor a worker closure reads; dropping the last handle releases the
/// slot, matching the "drop = release" rule in the design notes.
#[derive(Clone)]
pub struct Broadcast<T> {
    inner: Arc<T>,
}

impl<T> Broadcast<T> {
    pub fn new(value: T) -> Self {
        Broadcast {
            inner: Arc::new(value),
        }
    }

    pub fn value(&self) -> &T {
        &self.inner
    }
}

/// The weighted particle table a driver owns and replaces by reference each
/// generation.
#[derive(Debug, Clone)]
pub struct Population {
    pub parameters: Array2<f64>,
    pub weights: Array1<f64>,
    pub distances: Option<Array1<f64>>,
    /// Variant-specific: SMC-ABC additionally keeps the simulated data used
    /// to accept each particle so it can recompute acceptance counts
    /// against a revised epsilon without resimulating.
    pub simulated_data: Option<Vec<Array2<f64>>>,
}

impl Population {
    pub fn new(parameters: Array2<f64>, weights: Array1<f64>) -> Self {
        Population {
            parameters,
            weights,
            distances: None,
            simulated_data: None,
        }
    }

    pub fn n(&self) -> usize {
        self.parameters.nrows()
    }

    pub fn dim(&self) -> usize {
        self.parameters.ncols()
    }

    pub fn ess(&self) -> f64 {
        ess(&self.weights.view())
    }

    /// Normalizes `weights` in place so they sum to 1 (invariant I2).
    /// Returns `DegenerateWeights` rather than dividing by zero.
    pub fn normalize_weights(&mut self) -> Result<()> {
        let total: f64 = self.weights.sum();
        if total <= 0.0 || !total.is_finite() {
            return Err(AbcError::DegenerateWeights);
        }
        self.weights.mapv_inplace(|w| w / total);
        Ok(())
    }

    pub fn weighted_covariance(&self) -> Array2<f64> {
        weighted_covariance(&self.parameters.view(), &self.weights.view())
    }
}

/// Up to five broadcast slots per algorithm (spec.md §4.2).
#[derive(Clone, Default)]
pub struct AcceptedPopulationStore {
    pub accepted_parameters: Option<Broadcast<Array2<f64>>>,
    pub accepted_weights: Option<Broadcast<Array1<f64>>>,
    pub accepted_cov_mats: Option<Broadcast<Vec<Array2<f64>>>>,
    pub observations: Option<Broadcast<Array2<f64>>>,
    pub kernel_parameters: Option<Broadcast<Vec<Array2<f64>>>>,
    pub accepted_distances: Option<Broadcast<Array1<f64>>>,
}

impl AcceptedPopulationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces only the provided (`Some`) slots; a `None` argument leaves
    /// the existing broadcast handle (and thus the previous generation's
    /// data) untouched until the caller supplies a replacement.
    pub fn update_broadcast(
        &mut self,
        parameters: Option<Array2<f64>>,
        weights: Option<Array1<f64>>,
        cov_mats: Option<Vec<Array2<f64>>>,
        distances: Option<Array1<f64>>,
    ) {
        if let Some(p) = parameters {
            self.accepted_parameters = Some(Broadcast::new(p));
        }
        if let Some(w) = weights {
            self.accepted_weights = Some(Broadcast::new(w));
        }
        if let Some(c) = cov_mats {
            self.accepted_cov_mats = Some(Broadcast::new(c));
        }
        if let Some(d) = distances {
            self.accepted_distances = Some(Broadcast::new(d));
        }
    }

    pub fn set_observations(&mut self, observations: Array2<f64>) {
        self.observations = Some(Broadcast::new(observations));
    }

    /// Materializes, once per generation, the per-sub-kernel input table:
    /// for each particle, the concatenation of each sub-kernel's slice of
    /// the flat parameter vector, in the sub-kernels' own order. Workers
    /// then index into this table rather than recomputing the slice
    /// per-worker.
    pub fn get_accepted_parameters_bds_values(
        &self,
        mapping: &Mapping,
        kernel: &CompositeKernel,
    ) -> Vec<Array2<f64>> {
        let params = match &self.accepted_parameters {
            Some(bc) => bc.value().clone(),
            None => return Vec::new(),
        };
        kernel
            .sub_kernels()
            .iter()
            .map(|sk| {
                let cols: Vec<usize> = mapping
                    .entries
                    .iter()
                    .filter(|e| sk.node_ids().contains(&e.node))
                    .flat_map(|e| e.start..e.start + e.dimension)
                    .collect();
                params.select(Axis(1), &cols)
            })
            .collect()
    }
}

/// Row-view convenience used by worker closures reading a single particle
/// out of a broadcast N x D table.
pub fn row(params: &ArrayView2<f64>, i: usize) -> Vec<f64> {
    params.row(i).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn normalize_rejects_zero_sum() {
        let mut pop = Population::new(array![[0.0], [0.0]], array![0.0, 0.0]);
        assert!(matches!(pop.normalize_weights(), Err(AbcError::DegenerateWeights)));
    }

    #[test]
    fn normalize_produces_unit_sum() {
        let mut pop = Population::new(array![[0.0], [0.0]], array![1.0, 3.0]);
        pop.normalize_weights().unwrap();
        assert!((pop.weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn store_update_broadcast_leaves_unset_slots_untouched() {
        let mut store = AcceptedPopulationStore::new();
        store.update_broadcast(Some(array![[1.0]]), Some(array![1.0]), None, None);
        assert!(store.accepted_parameters.is_some());
        assert!(store.accepted_cov_mats.is_none());
        store.update_broadcast(None, None, Some(vec![array![[1.0]]]), None);
        assert!(store.accepted_parameters.is_some());
        assert!(store.accepted_cov_mats.is_some());
    }
}
