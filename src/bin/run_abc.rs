//! Demo binary: runs Rejection ABC against a scalar Normal(mu, 1) model
//! with a Uniform(-10, 10) prior on mu, the same fixture scenario S1 in
//! spec.md §8 describes. Exercises the public driver API end to end the
//! way the teacher repo's own `fn main` exercises its algorithm on
//! synthetic data; the CLI/config-file loader this wraps is explicitly out
//! of scope (spec.md §1) beyond this single clap-based entry point.

use std::sync::Arc;

use abc_sequential::algorithms::rejection::RejectionAbc;
use abc_sequential::backend::LocalBackend;
use abc_sequential::distance::Distance;
use abc_sequential::graph::{Graph, NodeId, NodeKind, ProbabilisticModel};
use clap::Parser;
use ndarray::Array2;
use rand::RngCore;

#[derive(Parser, Debug)]
#[command(name = "run_abc", about = "Rejection ABC demo: scalar Normal(mu, 1) with a Uniform(-10, 10) prior")]
struct Args {
    /// Observed scalar value.
    #[arg(long, default_value_t = 0.0)]
    observed: f64,

    /// Number of accepted particles.
    #[arg(long, default_value_t = 1000)]
    n_samples: usize,

    /// Acceptance threshold on |simulated - observed|.
    #[arg(long, default_value_t = 0.5)]
    epsilon: f64,

    /// Top-level RNG seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// A scalar Uniform(lo, hi) free-parameter node with no parents.
struct UniformPrior {
    lo: f64,
    hi: f64,
    current: f64,
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

/// A scalar Normal(mu, 1) root model whose mean is its only parent. Its
/// mean is pushed in by the graph runtime via `set_input_values` right
/// before `sample_from_distribution` is called (spec.md §4.1: "root
/// models are data-generating; their parameters are set by parents").
struct NormalRoot {
    parents: Vec<(NodeId, usize)>,
    mean: f64,
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

struct EuclideanDistance;

impl Distance for EuclideanDistance {
    fn distance(&self, observed: &Array2<f64>, simulated: &Array2<f64>) -> f64 {
        let obs_mean = observed.column(0).mean().unwrap_or(0.0);
        let sim_mean = simulated.column(0).mean().unwrap_or(0.0);
        (obs_mean - sim_mean).abs()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

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
    let graph = Graph::new(nodes, vec![1]);

    let mut driver = RejectionAbc::new(graph, Arc::new(EuclideanDistance), args.seed)?;
    let observations = Array2::from_shape_vec((1, 1), vec![args.observed])?;
    let journal = driver.sample(&LocalBackend, observations, args.n_samples, 1, args.epsilon, 1)?;

    let last = journal.last().expect("rejection ABC always appends one generation");
    let mean: f64 = last.parameters.column(0).mean().unwrap_or(f64::NAN);
    println!("posterior mean(mu) over {} accepted particles: {:.4}", args.n_samples, mean);

    Ok(())
}
