//! The six-plus-two algorithm drivers (spec component C5): Rejection,
//! PMC-ABC, PMC, SABC, ABCsubsim, RSMC-ABC, APMC-ABC and SMC-ABC. All eight
//! share the generation loop skeleton described in spec.md §4.5: initialize
//! -> broadcast -> map -> collect -> update population -> update
//! threshold/covariance -> record -> check termination.

pub mod abcsubsim;
pub mod apmc_abc;
pub mod pmc;
pub mod pmc_abc;
pub mod rejection;
pub mod rsmc_abc;
pub mod sabc;
pub mod smc_abc;

use crate::error::{AbcError, Result};

/// `InvalidConfiguration` validation shared by every driver's `sample(...)`
/// entry point (spec.md §7): raised before generation 0, never mid-run.
pub fn require_positive_usize(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(AbcError::InvalidConfiguration(format!("{} must be > 0", name)))
    } else {
        Ok(())
    }
}

pub fn require_positive_f64(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0) {
        Err(AbcError::InvalidConfiguration(format!("{} must be > 0", name)))
    } else {
        Ok(())
    }
}

/// `len(epsilon_init) in {1, steps}`.
pub fn require_epsilon_len(epsilon_init: &[f64], steps: usize) -> Result<()> {
    if epsilon_init.len() == 1 || epsilon_init.len() == steps {
        Ok(())
    } else {
        Err(AbcError::InvalidConfiguration(format!(
            "epsilon_init must have length 1 or steps ({}), got {}",
            steps,
            epsilon_init.len()
        )))
    }
}

/// Derives a deterministic per-particle, per-generation seed from the
/// top-level seed (spec.md §5: "given a fixed top-level seed" the sequence
/// of accepted populations is reproducible). A fixed-increment LCG-style mix
/// avoids pulling in a hashing crate for what is just index scrambling.
pub fn derive_seed(top_level_seed: u64, generation: usize, particle_index: usize) -> u64 {
    top_level_seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(generation as u64 * 1_000_003 + particle_index as u64 * 2 + 1)
}
