use crate::models::HierarchyEdge;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDecision {
    Write,
    /// Parent not loaded yet; kept until it appears
    Deferred,
    /// Would close a loop (including child == parent)
    Cycle,
    /// Already written during this run
    Duplicate,
}

/// Tracks `PART_OF` edges written during the run so a cycle is caught before
/// it reaches the store. Follows the same staged/commit/discard protocol as the
/// dedup index.
#[derive(Debug, Default)]
pub struct HierarchyGuard {
    parents: FxHashMap<String, BTreeSet<String>>,
    staged: Vec<HierarchyEdge>,
    /// parent id → edges waiting for it
    pending: BTreeMap<String, BTreeSet<HierarchyEdge>>,
    pending_before_batch: Option<BTreeMap<String, BTreeSet<HierarchyEdge>>>,
}

impl HierarchyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild with edges deferred by an earlier run.
    pub fn with_pending(edges: impl IntoIterator<Item = HierarchyEdge>) -> Self {
        let mut guard = Self::new();
        for edge in edges {
            guard
                .pending
                .entry(edge.parent_id.clone())
                .or_default()
                .insert(edge);
        }
        guard
    }

    pub fn consider(&mut self, edge: &HierarchyEdge, parent_known: bool) -> EdgeDecision {
        if edge.child_id == edge.parent_id {
            return EdgeDecision::Cycle;
        }
        if self.has_edge(&edge.child_id, &edge.parent_id) {
            return EdgeDecision::Duplicate;
        }
        if !parent_known {
            self.snapshot_pending();
            self.pending
                .entry(edge.parent_id.clone())
                .or_default()
                .insert(edge.clone());
            return EdgeDecision::Deferred;
        }
        if self.reaches(&edge.parent_id, &edge.child_id) {
            return EdgeDecision::Cycle;
        }
        self.staged.push(edge.clone());
        EdgeDecision::Write
    }

    /// Take the edges that were waiting for `parent_id`.
    pub fn release(&mut self, parent_id: &str) -> Vec<HierarchyEdge> {
        if !self.pending.contains_key(parent_id) {
            return Vec::new();
        }
        self.snapshot_pending();
        self.pending
            .remove(parent_id)
            .map(|edges| edges.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<HierarchyEdge> {
        self.pending.values().flatten().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    pub fn commit_staged(&mut self) {
        for edge in self.staged.drain(..) {
            self.parents
                .entry(edge.child_id)
                .or_default()
                .insert(edge.parent_id);
        }
        self.pending_before_batch = None;
    }

    pub fn discard_staged(&mut self) {
        self.staged.clear();
        if let Some(pending) = self.pending_before_batch.take() {
            self.pending = pending;
        }
    }

    fn snapshot_pending(&mut self) {
        if self.pending_before_batch.is_none() {
            self.pending_before_batch = Some(self.pending.clone());
        }
    }

    fn has_edge(&self, child: &str, parent: &str) -> bool {
        self.parents
            .get(child)
            .is_some_and(|parents| parents.contains(parent))
            || self
                .staged
                .iter()
                .any(|e| e.child_id == child && e.parent_id == parent)
    }

    /// Whether `target` is an ancestor of (or equal to) `from`.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = FxHashSet::default();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(parents) = self.parents.get(&node) {
                stack.extend(parents.iter().cloned());
            }
            stack.extend(
                self.staged
                    .iter()
                    .filter(|e| e.child_id == node)
                    .map(|e| e.parent_id.clone()),
            );
        }
        false
    }
}
