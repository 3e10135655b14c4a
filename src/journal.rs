//! Append-only record of per-generation particles, weights and metadata
//! (spec component C7). Output persistence (writing the journal to disk)
//! is out of scope; this module only models the in-memory layout spec.md
//! §6 specifies.

use std::collections::HashMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// One generation's worth of particles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub parameters: Array2<f64>,
    pub weights: Array1<f64>,
    /// Present only for PMC, which weights by an approximate likelihood
    /// rather than a distance threshold.
    pub approx_likelihoods: Option<Array1<f64>>,
}

/// Append-only log of `(parameters, weights, optional approximate
/// likelihoods)` tuples plus a free-form configuration map. `full_output =
/// 0` keeps only the final generation; `full_output = 1` appends every
/// generation (spec.md §4.7/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    configuration: HashMap<String, serde_json::Value>,
    full_output: u8,
}

impl Journal {
    pub fn new(full_output: u8) -> Self {
        Journal {
            entries: Vec::new(),
            configuration: HashMap::new(),
            full_output,
        }
    }

    pub fn set_config(&mut self, key: &str, value: serde_json::Value) {
        self.configuration.insert(key.to_string(), value);
    }

    pub fn configuration(&self) -> &HashMap<String, serde_json::Value> {
        &self.configuration
    }

    /// Appends a generation. When `full_output == 0` only the final
    /// generation is kept: every call before the last overwrites the
    /// single stored entry, exactly mirroring the original's behavior of
    /// only ever materializing the most recent generation on disk.
    pub fn append(&mut self, entry: JournalEntry) {
        if self.full_output == 0 {
            self.entries.clear();
        }
        self.entries.push(entry);
    }

    pub fn generations(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn nth(&self, idx: usize) -> Option<&JournalEntry> {
        self.entries.get(idx)
    }

    pub fn last(&self) -> Option<&JournalEntry> {
        self.entries.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn entry(tag: f64) -> JournalEntry {
        JournalEntry {
            parameters: array![[tag]],
            weights: array![1.0],
            approx_likelihoods: None,
        }
    }

    #[test]
    fn full_output_one_keeps_every_generation() {
        let mut j = Journal::new(1);
        for i in 0..3 {
            j.append(entry(i as f64));
        }
        assert_eq!(j.generations().len(), 3);
    }

    #[test]
    fn full_output_zero_keeps_only_last_generation() {
        let mut j = Journal::new(0);
        for i in 0..3 {
            j.append(entry(i as f64));
        }
        assert_eq!(j.generations().len(), 1);
        assert_eq!(j.last().unwrap().parameters[[0, 0]], 2.0);
    }
}
