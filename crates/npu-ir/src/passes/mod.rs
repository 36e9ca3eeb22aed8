//! Graph-rewriting passes and the infrastructure they share.

mod redundant_copies;

pub use redundant_copies::RedundantCopyElimination;

use crate::graph::{GraphError, OwnedOpGraph};
use crate::placement::PlacementRule;

/// Services a pass needs beyond the graph itself.
pub struct PassContext<'a> {
    /// Placement/capacity rule consulted when a pass wants to introduce a
    /// direct SRAM/DRAM copy.
    pub placement: &'a dyn PlacementRule,
}

impl<'a> PassContext<'a> {
    pub fn new(placement: &'a dyn PlacementRule) -> Self {
        PassContext { placement }
    }
}

/// Result returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of copy chains collapsed by the pass.
    pub chains_collapsed: usize,
    /// Ops and buffers removed from the graph.
    pub entities_removed: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            chains_collapsed: self.chains_collapsed + other.chains_collapsed,
            entities_removed: self.entities_removed + other.entities_removed,
        }
    }
}

/// Interface implemented by passes that rewrite one plan graph in place.
///
/// A pass is a pure rewrite from one valid graph to another valid graph: it
/// keeps no state across invocations, and an error indicates a bug in the
/// pass's own bookkeeping (the container rejects anything that would corrupt
/// the graph), which callers should treat as fatal.
pub trait GraphPass {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut OwnedOpGraph, cx: &PassContext<'_>) -> Result<PassResult, GraphError>;
}
