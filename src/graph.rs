//! The probabilistic-graph runtime (spec component C1).
//!
//! Nodes live in a flat arena (`Graph::nodes`) and are addressed by
//! `NodeId`. The DAG is not owned as a tree of `Rc<RefCell<_>>` pointers --
//! a node referenced as a parent by more than one child is just another
//! `NodeId`, so sharing falls out of the arena for free.
//!
//! The `visited` flag that the original algorithm keeps on every node is
//! instead owned by the traversal (`TraversalGuard`), not by the node. A
//! guard clears its bitset on every exit path via `Drop`, which is the one
//! property the hand-written "set then clear" discipline had to maintain by
//! hand. This keeps `ProbabilisticModel` free of interior mutability that
//! traversal alone needs.

use std::cell::RefCell;

use rand::RngCore;

use crate::error::{AbcError, Result};

pub type NodeId = usize;

/// Distinguishes free parameters from hyperparameters and from the
/// data-generating root models, replacing `isinstance(Hyperparameter)`
/// checks with a tag read during mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A free parameter: participates in the mapping, prior pdf, sampling.
    Free,
    /// A fixed hyperparameter: skipped by the mapping and by get/set.
    Hyper,
    /// A root, data-generating model: its own `sample_parameters` is never
    /// invoked by the traversal; its value is produced by
    /// `sample_from_distribution` instead.
    RootData,
}

/// The model-node protocol external collaborators implement (spec.md §6).
pub trait ProbabilisticModel: Send + Sync {
    fn dimension(&self) -> usize;
    fn parents(&self) -> &[(NodeId, usize)];
    fn kind(&self) -> NodeKind;

    /// Whether this node's sample space is continuous (used by
    /// `DefaultKernel` to choose a normal vs. random-walk sub-kernel).
    fn is_continuous(&self) -> bool {
        true
    }

    /// Receives the resolved current values of this node's parents,
    /// concatenated in parent order (indexed by each parent's declared
    /// output index). A root model uses this to set its own generative
    /// parameters ("root models are data-generating; their parameters are
    /// set by parents", spec.md §4.1); a free or hyperparameter node has
    /// no parents to receive and keeps the default no-op.
    fn set_input_values(&mut self, _values: &[f64]) {
    }

    /// Draws a value for this node consistent with its parents' current
    /// values. Returns `false` iff the parents' values render this node's
    /// distribution invalid (e.g. a negative scale).
    fn sample_parameters(&mut self, rng: &mut dyn RngCore) -> bool;

    /// Accepts or rejects a proposed value.
    fn set_parameters(&mut self, value: &[f64]) -> bool;

    fn get_parameters(&self) -> Vec<f64>;

    fn pdf(&self, value: &[f64]) -> f64;

    /// Draws `n` data points given the node's current parameter values.
    /// `ok = false` signals a simulation failure (spec.md §7); the caller
    /// must treat the distance as `Distance::dist_max()`.
    fn sample_from_distribution(
        &self,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> (bool, ndarray::Array2<f64>);

    /// Produces an independent clone of this node for per-worker graph
    /// duplication (spec.md §5, "the graph object is conceptually
    /// duplicated per worker").
    fn clone_box(&self) -> Box<dyn ProbabilisticModel>;
}

/// A single `(node, start_index)` entry of the canonical flat-parameter
/// mapping.
#[derive(Debug, Clone, Copy)]
pub struct MappingEntry {
    pub node: NodeId,
    pub start: usize,
    pub dimension: usize,
}

/// The canonical DFS ordering of free, non-hyperparameter nodes.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    pub entries: Vec<MappingEntry>,
    pub total_dim: usize,
}

impl Mapping {
    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node == node)
    }

    pub fn slice<'a>(&self, entry_idx: usize, values: &'a [f64]) -> &'a [f64] {
        let e = &self.entries[entry_idx];
        &values[e.start..e.start + e.dimension]
    }
}

/// RAII guard clearing a traversal's visited bitset on every exit path
/// (including early `?`/`return false` paths), satisfying invariant I1
/// ("all visited flags are false on entry and exit") by construction rather
/// than by manual bookkeeping at each return site.
struct TraversalGuard<'g> {
    visited: &'g RefCell<Vec<bool>>,
}

impl Drop for TraversalGuard<'_> {
    fn drop(&mut self) {
        for flag in self.visited.borrow_mut().iter_mut() {
            *flag = false;
        }
    }
}

/// The DAG runtime: an arena of nodes plus the ordered list of root models
/// the driver was constructed with.
pub struct Graph {
    nodes: Vec<Box<dyn ProbabilisticModel>>,
    roots: Vec<NodeId>,
    visited: RefCell<Vec<bool>>,
}

impl Graph {
    pub fn new(nodes: Vec<Box<dyn ProbabilisticModel>>, roots: Vec<NodeId>) -> Self {
        let n = nodes.len();
        Graph {
            nodes,
            roots,
            visited: RefCell::new(vec![false; n]),
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &dyn ProbabilisticModel {
        self.nodes[id].as_ref()
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut dyn ProbabilisticModel {
        self.nodes[id].as_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn guard(&self) -> TraversalGuard<'_> {
        debug_assert!(self.visited.borrow().iter().all(|v| !v));
        TraversalGuard {
            visited: &self.visited,
        }
    }

    fn is_visited(&self, id: NodeId) -> bool {
        self.visited.borrow()[id]
    }

    fn mark_visited(&self, id: NodeId) {
        self.visited.borrow_mut()[id] = true;
    }

    /// Repeatedly attempts a full DFS sampling of the graph, retrying from
    /// scratch whenever a node rejects its parents' values. No bound on
    /// attempts: the caller relies on prior support being non-degenerate.
    pub fn sample_from_prior(&mut self, rng: &mut dyn RngCore) {
        loop {
            let _g = self.guard();
            if self.try_sample_from_prior(self.roots.clone(), rng) {
                return;
            }
        }
    }

    fn try_sample_from_prior(&mut self, models: Vec<NodeId>, rng: &mut dyn RngCore) -> bool {
        for id in models {
            let parents: Vec<(NodeId, usize)> = self.node(id).parents().to_vec();
            for (parent, _output_index) in parents {
                if !self.is_visited(parent) {
                    self.mark_visited(parent);
                    if !self.try_sample_from_prior(vec![parent], rng) {
                        return false;
                    }
                }
            }

            let is_root = self.roots.contains(&id);
            if !is_root && !self.node_mut(id).sample_parameters(rng) {
                return false;
            }
        }
        true
    }

    /// DFS; collects `get_parameters()` from every non-root, non-hyper node
    /// in mapping order. Length equals `mapping.total_dim`.
    pub fn get_parameters(&self, mapping: &Mapping) -> Vec<f64> {
        let _g = self.guard();
        let mut out = Vec::with_capacity(mapping.total_dim);
        for entry in &mapping.entries {
            out.extend(self.node(entry.node).get_parameters());
        }
        out
    }

    /// DFS; consumes `values` in mapping order, calling each node's
    /// `set_parameters` on its slice. On the first rejection the partial
    /// mutation already applied to earlier nodes is left in place -- the
    /// caller must not commit the particle; it returns the byte offset of
    /// the first consumed index of the rejecting node.
    pub fn set_parameters(&mut self, mapping: &Mapping, values: &[f64]) -> std::result::Result<(), (NodeId, usize)> {
        let _g = self.guard();
        if values.len() != mapping.total_dim {
            return Err((mapping.entries.last().map(|e| e.node).unwrap_or(0), values.len()));
        }
        for entry in &mapping.entries {
            let slice = &values[entry.start..entry.start + entry.dimension];
            if !self.node_mut(entry.node).set_parameters(slice) {
                return Err((entry.node, entry.start));
            }
        }
        Ok(())
    }

    /// Product of `node.pdf(slice)` over every non-root non-hyperparameter
    /// node in mapping order. A node reachable through more than one child
    /// is counted once, guarded by the same visited bitset the other
    /// traversals use. Returns 0 if any factor is 0.
    pub fn pdf_of_prior(&self, mapping: &Mapping, values: &[f64]) -> f64 {
        let _g = self.guard();
        let mut product = 1.0;
        for entry in &mapping.entries {
            if self.is_visited(entry.node) {
                continue;
            }
            self.mark_visited(entry.node);
            let slice = &values[entry.start..entry.start + entry.dimension];
            let factor = self.node(entry.node).pdf(slice);
            product *= factor;
            if product == 0.0 {
                return 0.0;
            }
        }
        product
    }

    /// Computes the canonical `(node, start_index)` mapping: DFS from
    /// `roots`, leaves-first, recording each non-root non-hyperparameter
    /// node the first time it's encountered.
    pub fn get_mapping(&self) -> Result<Mapping> {
        let _g = self.guard();
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let roots = self.roots.clone();
        for id in roots {
            self.visit_for_mapping(id, true, &mut entries, &mut offset);
        }
        if self.nodes.iter().enumerate().any(|(_, n)| n.dimension() == 0) {
            return Err(AbcError::InvalidConfiguration(
                "a node declares dimension 0".to_string(),
            ));
        }
        Ok(Mapping {
            entries,
            total_dim: offset,
        })
    }

    fn visit_for_mapping(
        &self,
        id: NodeId,
        is_root: bool,
        entries: &mut Vec<MappingEntry>,
        offset: &mut usize,
    ) {
        if self.is_visited(id) {
            return;
        }
        self.mark_visited(id);
        for (parent, _) in self.node(id).parents() {
            self.visit_for_mapping(*parent, false, entries, offset);
        }
        if !is_root && !matches!(self.node(id).kind(), NodeKind::Hyper) {
            let dim = self.node(id).dimension();
            entries.push(MappingEntry {
                node: id,
                start: *offset,
                dimension: dim,
            });
            *offset += dim;
        }
    }

    /// Reorders an arbitrary `(node, values)` ordering (as produced by a
    /// composite kernel, whose sub-kernels enumerate their own node subset
    /// in their own order) into the mapping's canonical DFS order, ready
    /// for `set_parameters`.
    pub fn get_correct_ordering(
        &self,
        mapping: &Mapping,
        proposals: &[(NodeId, Vec<f64>)],
    ) -> Vec<f64> {
        let mut out = vec![0.0; mapping.total_dim];
        for entry in &mapping.entries {
            if let Some((_, values)) = proposals.iter().find(|(n, _)| *n == entry.node) {
                out[entry.start..entry.start + entry.dimension].copy_from_slice(values);
            }
        }
        out
    }

    /// Conceptual per-worker duplication (spec.md §5): clones every node
    /// and the root list, leaving an empty (correctly-sized) visited
    /// bitset.
    pub fn duplicate(&self) -> Graph {
        Graph::new(self.nodes.iter().map(|n| n.clone_box()).collect(), self.roots.clone())
    }

    /// Pushes every root's parents' current values into the root via
    /// `set_input_values`, so its `sample_from_distribution` call reads
    /// parameters consistent with whatever `set_parameters`/
    /// `sample_from_prior` last wrote to those parents. Called by
    /// `worker::simulate_and_score` immediately before simulating; not
    /// gated by the mapping since hyperparameter parents are valid root
    /// inputs too.
    pub fn sync_root_inputs(&mut self) {
        let _g = self.guard();
        let roots = self.roots.clone();
        for root in roots {
            let parents: Vec<(NodeId, usize)> = self.node(root).parents().to_vec();
            let mut values = Vec::with_capacity(parents.len());
            for (parent, output_index) in parents {
                let parent_values = self.node(parent).get_parameters();
                values.push(parent_values.get(output_index).copied().unwrap_or(0.0));
            }
            self.node_mut(root).set_input_values(&values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// A scalar Uniform(lo, hi) free-parameter node with no parents.
    struct UniformNode {
        lo: f64,
        hi: f64,
        current: f64,
    }

    impl ProbabilisticModel for UniformNode {
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
        fn sample_from_distribution(
            &self,
            _n: usize,
            _rng: &mut dyn RngCore,
        ) -> (bool, ndarray::Array2<f64>) {
            (true, ndarray::Array2::zeros((0, 0)))
        }
        fn clone_box(&self) -> Box<dyn ProbabilisticModel> {
            Box::new(UniformNode {
                lo: self.lo,
                hi: self.hi,
                current: self.current,
            })
        }
    }

    /// A scalar Normal(mu, 1) root model whose mean is its only parent.
    struct NormalRoot {
        parents: Vec<(NodeId, usize)>,
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
        fn sample_from_distribution(
            &self,
            n: usize,
            _rng: &mut dyn RngCore,
        ) -> (bool, ndarray::Array2<f64>) {
            (true, ndarray::Array2::zeros((n, 1)))
        }
        fn clone_box(&self) -> Box<dyn ProbabilisticModel> {
            Box::new(NormalRoot {
                parents: self.parents.clone(),
            })
        }
    }

    fn build_graph() -> (Graph, Mapping) {
        let nodes: Vec<Box<dyn ProbabilisticModel>> = vec![
            Box::new(UniformNode {
                lo: -10.0,
                hi: 10.0,
                current: 0.0,
            }),
            Box::new(NormalRoot {
                parents: vec![(0, 0)],
            }),
        ];
        let mut graph = Graph::new(nodes, vec![1]);
        let mapping = graph.get_mapping().unwrap();
        (graph, mapping)
    }

    #[test]
    fn flags_clean_after_every_operation() {
        let (mut graph, mapping) = build_graph();
        let mut rng = StdRng::seed_from_u64(7);

        graph.sample_from_prior(&mut rng);
        assert!(graph.visited.borrow().iter().all(|v| !v));

        let _ = graph.get_parameters(&mapping);
        assert!(graph.visited.borrow().iter().all(|v| !v));

        let _ = graph.set_parameters(&mapping, &[1.0]);
        assert!(graph.visited.borrow().iter().all(|v| !v));

        let _ = graph.pdf_of_prior(&mapping, &[1.0]);
        assert!(graph.visited.borrow().iter().all(|v| !v));
    }

    #[test]
    fn mapping_dimension_matches_free_nodes() {
        let (_, mapping) = build_graph();
        assert_eq!(mapping.total_dim, 1);
        assert_eq!(mapping.entries.len(), 1);
    }

    #[test]
    fn round_trip_set_then_get() {
        let (mut graph, mapping) = build_graph();
        assert!(graph.set_parameters(&mapping, &[3.5]).is_ok());
        assert_eq!(graph.get_parameters(&mapping), vec![3.5]);
    }

    #[test]
    fn pdf_of_prior_is_zero_outside_support() {
        let (graph, mapping) = build_graph();
        assert_eq!(graph.pdf_of_prior(&mapping, &[100.0]), 0.0);
        assert!(graph.pdf_of_prior(&mapping, &[0.0]) > 0.0);
    }

    #[test]
    fn set_parameters_rejects_out_of_support_value() {
        let (mut graph, mapping) = build_graph();
        assert!(graph.set_parameters(&mapping, &[100.0]).is_err());
    }
}
