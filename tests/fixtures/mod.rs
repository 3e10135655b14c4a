//! Shared fixtures for the end-to-end scenario tests (spec.md §8): a
//! scalar Normal(mu, 1) model with prior mu ~ Uniform(-10, 10), plus a
//! Euclidean distance on the sample mean. One root, one free parameter --
//! enough to exercise every driver without pulling in an external model
//! crate the core deliberately treats as an interface boundary.

use abc_sequential::distance::Distance;
use abc_sequential::graph::{Graph, NodeId, NodeKind, ProbabilisticModel};
use rand::RngCore;

use ndarray::Array2;

/// A scalar Uniform(lo, hi) free-parameter node with no parents.
pub struct UniformPrior {
    pub lo: f64,
    pub hi: f64,
    pub current: f64,
}

impl ProbabilisticModel for UniformPrior {
    fn dimension(&self) -> usize {
        1
    }
    fn parents(&self) -> &[(NodeId, usize)] {
        &[]
    }
    fn kind(&self) -> NodeKind {
        NodeKind::Free
    }
    fn sample_parameters(&mut self, rng: &mut dyn RngCore) -> bool {
        self.current = self.lo + (self.hi - self.lo) * (rng.next_u32() as f64 / u32::MAX as f64);
        true
    }
    fn set_parameters(&mut self, value: &[f64]) -> bool {
        if value.len() != 1 || value[0] < self.lo || value[0] > self.hi {
            return false;
        }
        self.current = value[0];
        true
    }
    fn get_parameters(&self) -> Vec<f64> {
        vec![self.current]
    }
    fn pdf(&self, value: &[f64]) -> f64 {
        if value[0] < self.lo || value[0] > self.hi {
            0.0
        } else {
            1.0 / (self.hi - self.lo)
        }
    }
    fn sample_from_distribution(&self, _n: usize, _rng: &mut dyn RngCore) -> (bool, Array2<f64>) {
        (true, Array2::zeros((0, 0)))
    }
    fn clone_box(&self) -> Box<dyn ProbabilisticModel> {
        Box::new(UniformPrior {
            lo: self.lo,
            hi: self.hi,
            current: self.current,
        })
    }
}

/// A scalar Normal(mu, 1) root model whose mean is its only parent. The
/// graph runtime pushes the parent's current value in via
/// `set_input_values` right before `sample_from_distribution` runs.
pub struct NormalRoot {
    pub parents: Vec<(NodeId, usize)>,
    pub mean: f64,
}

impl ProbabilisticModel for NormalRoot {
    fn dimension(&self) -> usize {
        1
    }
    fn parents(&self) -> &[(NodeId, usize)] {
        &self.parents
    }
    fn kind(&self) -> NodeKind {
        NodeKind::RootData
    }
    fn sample_parameters(&mut self, _rng: &mut dyn RngCore) -> bool {
        true
    }
    fn set_parameters(&mut self, _value: &[f64]) -> bool {
        true
    }
    fn get_parameters(&self) -> Vec<f64> {
        vec![]
    }
    fn pdf(&self, _value: &[f64]) -> f64 {
        1.0
    }
    fn set_input_values(&mut self, values: &[f64]) {
        self.mean = values[0];
    }
    fn sample_from_distribution(&self, n: usize, rng: &mut dyn RngCore) -> (bool, Array2<f64>) {
        let mut data = Array2::zeros((n, 1));
        for i in 0..n {
            let u1 = (rng.next_u32() as f64 + 1.0) / (u32::MAX as f64 + 2.0);
            let u2 = rng.next_u32() as f64 / u32::MAX as f64;
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            data[[i, 0]] = self.mean + z;
        }
        (true, data)
    }
    fn clone_box(&self) -> Box<dyn ProbabilisticModel> {
        Box::new(NormalRoot {
            parents: self.parents.clone(),
            mean: self.mean,
        })
    }
}

/// Absolute difference of sample means, the simplest distance that makes
/// Rejection/PMC-ABC/SABC/ABCsubsim converge towards the observed mean.
pub struct EuclideanDistance;

impl Distance for EuclideanDistance {
    fn distance(&self, observed: &Array2<f64>, simulated: &Array2<f64>) -> f64 {
        let obs_mean = observed.column(0).mean().unwrap_or(0.0);
        let sim_mean = simulated.column(0).mean().unwrap_or(0.0);
        (obs_mean - sim_mean).abs()
    }
}

/// A fresh two-node graph: node 0 is the Uniform(-10, 10) prior, node 1 is
/// the Normal(mu, 1) root depending on it. `Graph` is not `Clone` (nodes
/// are trait objects), so every scenario that needs its own driver calls
/// this to build an independent graph.
pub fn build_graph() -> Graph {
    let nodes: Vec<Box<dyn ProbabilisticModel>> = vec![
        Box::new(UniformPrior {
            lo: -10.0,
            hi: 10.0,
            current: 0.0,
        }),
        Box::new(NormalRoot {
            parents: vec![(0, 0)],
            mean: 0.0,
        }),
    ];
    Graph::new(nodes, vec![1])
}

pub fn observation(value: f64) -> Array2<f64> {
    Array2::from_shape_vec((1, 1), vec![value]).unwrap()
}
