use thiserror::Error;

/// Error kinds raised by driver-level operations.
///
/// Worker-level failures (`ModelRejection`, `SimulationFailure`) are handled
/// locally inside the worker closure and turned into sentinel values before
/// they ever reach a driver; they exist here so the graph runtime and the
/// test fixtures can report them precisely, not because a driver propagates
/// them as an `Err`.
#[derive(Debug, Error)]
pub enum AbcError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("proposal exhausted after {attempts} perturbation attempts")]
    ProposalExhausted { attempts: usize },

    #[error("model at node {node} rejected parameters at slice offset {offset}")]
    ModelRejection { node: usize, offset: usize },

    #[error("simulation failed to produce data for the proposed parameters")]
    SimulationFailure,

    #[error("sum of weights degenerated to zero")]
    DegenerateWeights,

    #[error("covariance is singular: {0}")]
    SingularCovariance(String),
}

pub type Result<T> = std::result::Result<T, AbcError>;
