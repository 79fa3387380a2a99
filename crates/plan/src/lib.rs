//! Planner: orders a changeset into an executable plan.
//!
//! Creates/updates run forward (dependencies first), deletes run reverse
//! (dependents first), and kind precedence layers resources that share a
//! namespace. Ready-set ties break lexicographically so identical inputs
//! always produce an identical plan.

#![forbid(unsafe_code)]

use metrics::counter;
use rekon_core::{ChangeEntry, ResourceId, ResourceKind, ValidationError};
use rekon_diff::Changeset;
use rekon_graph::DesiredGraph;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Declared,
    Precedence,
}

/// Ordered, dependency-respecting sequence of mutations. Immutable once
/// produced; re-derived every reconciliation cycle.
#[derive(Debug, Clone)]
pub struct Plan {
    entries: Vec<ChangeEntry>,
    deps: FxHashMap<ResourceId, Vec<ResourceId>>,
}

impl Plan {
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plan entries `id` must wait for, sorted. Same-phase only: an apply
    /// entry never waits on a delete or vice versa.
    pub fn deps_of(&self, id: &ResourceId) -> &[ResourceId] {
        self.deps.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Precedence applies between resources that share a namespace, or between a
/// Namespace and the resources it contains. Unrelated namespaces stay
/// unordered so one namespace's failure cannot block another.
fn precedence_applies(a: &ResourceId, b: &ResourceId) -> bool {
    if a.kind.precedence_rank() >= b.kind.precedence_rank() {
        return false;
    }
    match (&a.namespace, &b.namespace) {
        (Some(x), Some(y)) => x == y,
        (None, Some(ns)) => a.kind == ResourceKind::Namespace && ns == &a.name,
        _ => false,
    }
}

struct EdgeSet {
    succ: FxHashMap<ResourceId, Vec<(ResourceId, EdgeKind)>>,
    seen: FxHashSet<(ResourceId, ResourceId)>,
}

impl EdgeSet {
    fn new(nodes: &[ResourceId]) -> Self {
        let mut succ = FxHashMap::default();
        for n in nodes {
            succ.insert(n.clone(), Vec::new());
        }
        Self { succ, seen: FxHashSet::default() }
    }

    fn add(&mut self, from: &ResourceId, to: &ResourceId, kind: EdgeKind) {
        if from == to || !self.seen.insert((from.clone(), to.clone())) {
            return;
        }
        self.succ.get_mut(from).expect("edge endpoints are nodes").push((to.clone(), kind));
    }
}

/// Kahn's algorithm with a lexicographically ordered ready-set. Returns the
/// node order, or the unorderable-plan error naming a declared edge and a
/// precedence edge from the offending cycle.
fn order(nodes: Vec<ResourceId>, edges: &EdgeSet) -> Result<Vec<ResourceId>, ValidationError> {
    let mut indegree: FxHashMap<&ResourceId, usize> =
        nodes.iter().map(|n| (n, 0)).collect();
    for (_, succs) in edges.succ.iter() {
        for (to, _) in succs {
            if let Some(d) = indegree.get_mut(to) {
                *d += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<ResourceId>> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(n, _)| Reverse((*n).clone()))
        .collect();

    let mut out: Vec<ResourceId> = Vec::with_capacity(nodes.len());
    while let Some(Reverse(n)) = ready.pop() {
        for (to, _) in edges.succ.get(&n).map(|v| v.as_slice()).unwrap_or(&[]) {
            let d = indegree.get_mut(to).expect("edge endpoints are nodes");
            *d -= 1;
            if *d == 0 {
                ready.push(Reverse(to.clone()));
            }
        }
        out.push(n);
    }

    if out.len() == nodes.len() {
        return Ok(out);
    }
    Err(unorderable(&nodes, edges, &out))
}

// A cycle survived ordering: declared references and precedence disagree.
// (Pure declared-reference cycles are rejected at graph build time, and
// precedence alone is a strict layering, so the cycle holds one of each.)
fn unorderable(
    nodes: &[ResourceId],
    edges: &EdgeSet,
    ordered: &[ResourceId],
) -> ValidationError {
    let done: FxHashSet<&ResourceId> = ordered.iter().collect();
    let mut remaining: Vec<&ResourceId> = nodes.iter().filter(|n| !done.contains(n)).collect();
    remaining.sort();
    let residual: FxHashSet<&ResourceId> = remaining.iter().copied().collect();

    // Every residual node kept a positive indegree, so it has at least one
    // residual predecessor; walking predecessors must loop.
    let mut preds: FxHashMap<&ResourceId, Vec<&ResourceId>> = FxHashMap::default();
    for (from, succs) in edges.succ.iter() {
        if !residual.contains(from) {
            continue;
        }
        for (to, _) in succs {
            if residual.contains(to) {
                preds.entry(to).or_default().push(from);
            }
        }
    }
    for v in preds.values_mut() {
        v.sort();
    }

    let mut chain: Vec<&ResourceId> = Vec::new();
    let mut seen_at: FxHashMap<&ResourceId, usize> = FxHashMap::default();
    let mut at: &ResourceId = remaining[0];
    loop {
        if let Some(&start) = seen_at.get(at) {
            chain.push(at);
            chain.drain(..start);
            break;
        }
        seen_at.insert(at, chain.len());
        chain.push(at);
        at = preds.get(at).expect("residual node has a residual predecessor")[0];
    }
    // The walk ran against edge direction; reverse so consecutive pairs read
    // from -> to.
    chain.reverse();
    let path: Vec<ResourceId> = chain.into_iter().cloned().collect();

    let mut declared: Option<(ResourceId, ResourceId)> = None;
    let mut precedence: Option<(ResourceId, ResourceId)> = None;
    for pair in path.windows(2) {
        let kind = edges
            .succ
            .get(&pair[0])
            .and_then(|succs| succs.iter().find(|(to, _)| *to == pair[1]))
            .map(|(_, k)| *k)
            .expect("cycle edge exists");
        match kind {
            EdgeKind::Declared if declared.is_none() => {
                declared = Some((pair[0].clone(), pair[1].clone()))
            }
            EdgeKind::Precedence if precedence.is_none() => {
                precedence = Some((pair[0].clone(), pair[1].clone()))
            }
            _ => {}
        }
    }
    let fallback = (path[0].clone(), path[1].clone());
    ValidationError::UnorderablePlan {
        declared: declared.unwrap_or_else(|| fallback.clone()),
        precedence: precedence.unwrap_or(fallback),
    }
}

/// Order a changeset into a plan: creates/updates first (forward topological
/// order), then deletes (reverse).
pub fn plan(changeset: &Changeset, graph: &DesiredGraph) -> Result<Plan, ValidationError> {
    counter!("plan_runs_total", 1u64);

    let mut apply_entries: FxHashMap<ResourceId, ChangeEntry> = FxHashMap::default();
    let mut delete_ids: Vec<ResourceId> = Vec::new();
    for entry in changeset.actionable() {
        match entry {
            ChangeEntry::Delete(id) => delete_ids.push(id.clone()),
            e => {
                apply_entries.insert(e.id(), e.clone());
            }
        }
    }

    // Apply phase: declared references point dependency -> dependent, so the
    // dependency pops first.
    let apply_nodes: Vec<ResourceId> = apply_entries.keys().cloned().collect();
    let mut apply_edges = EdgeSet::new(&apply_nodes);
    for id in &apply_nodes {
        for reference in graph.references(id) {
            if apply_entries.contains_key(reference) {
                apply_edges.add(reference, id, EdgeKind::Declared);
            }
        }
    }
    for a in &apply_nodes {
        for b in &apply_nodes {
            if precedence_applies(a, b) {
                apply_edges.add(a, b, EdgeKind::Precedence);
            }
        }
    }
    let apply_order = order(apply_nodes, &apply_edges)?;

    // Delete phase: reversed. A dependent's delete must land before the
    // delete of anything it referenced at last apply time.
    let mut delete_edges = EdgeSet::new(&delete_ids);
    let delete_set: FxHashSet<&ResourceId> = delete_ids.iter().collect();
    for id in &delete_ids {
        for reference in changeset.delete_refs(id) {
            if delete_set.contains(reference) {
                delete_edges.add(id, reference, EdgeKind::Declared);
            }
        }
    }
    for a in &delete_ids {
        for b in &delete_ids {
            if precedence_applies(a, b) {
                delete_edges.add(b, a, EdgeKind::Precedence);
            }
        }
    }
    let delete_order = order(delete_ids, &delete_edges)?;

    // Executor dependency lists: predecessors within the same phase.
    let mut deps: FxHashMap<ResourceId, Vec<ResourceId>> = FxHashMap::default();
    for edges in [&apply_edges, &delete_edges] {
        for (from, succs) in edges.succ.iter() {
            for (to, _) in succs {
                deps.entry(to.clone()).or_default().push(from.clone());
            }
        }
    }
    for preds in deps.values_mut() {
        preds.sort();
        preds.dedup();
    }

    let mut entries: Vec<ChangeEntry> = Vec::with_capacity(apply_order.len() + delete_order.len());
    for id in apply_order {
        entries.push(apply_entries.remove(&id).expect("ordered id came from the entry set"));
    }
    for id in delete_order {
        entries.push(ChangeEntry::Delete(id));
    }

    debug!(entries = entries.len(), "plan: ordered");
    Ok(Plan { entries, deps })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: ResourceKind, ns: Option<&str>, name: &str) -> ResourceId {
        ResourceId { kind, namespace: ns.map(|s| s.to_string()), name: name.to_string() }
    }

    #[test]
    fn precedence_is_scoped_to_one_namespace() {
        let ns_a = id(ResourceKind::Namespace, None, "a");
        let cm_a = id(ResourceKind::ConfigMap, Some("a"), "cfg");
        let cm_b = id(ResourceKind::ConfigMap, Some("b"), "cfg");
        let dep_a = id(ResourceKind::Deployment, Some("a"), "api");

        assert!(precedence_applies(&ns_a, &cm_a));
        assert!(!precedence_applies(&ns_a, &cm_b));
        assert!(precedence_applies(&cm_a, &dep_a));
        assert!(!precedence_applies(&cm_b, &dep_a));
        assert!(!precedence_applies(&dep_a, &cm_a));
    }

    #[test]
    fn order_breaks_ties_lexicographically() {
        let nodes = vec![
            id(ResourceKind::Service, Some("ns"), "zeta"),
            id(ResourceKind::ConfigMap, Some("ns2"), "beta"),
            id(ResourceKind::ConfigMap, Some("ns1"), "alpha"),
        ];
        let edges = EdgeSet::new(&nodes);
        let got = order(nodes, &edges).unwrap();
        assert_eq!(
            got,
            vec![
                id(ResourceKind::ConfigMap, Some("ns1"), "alpha"),
                id(ResourceKind::ConfigMap, Some("ns2"), "beta"),
                id(ResourceKind::Service, Some("ns"), "zeta"),
            ]
        );
    }

    #[test]
    fn conflicting_declared_and_precedence_edges_are_unorderable() {
        // A declared edge demanding a Service before the ConfigMap that
        // shares its namespace contradicts the precedence layering.
        let cm = id(ResourceKind::ConfigMap, Some("ns"), "cfg");
        let svc = id(ResourceKind::Service, Some("ns"), "svc");
        let nodes = vec![cm.clone(), svc.clone()];
        let mut edges = EdgeSet::new(&nodes);
        edges.add(&svc, &cm, EdgeKind::Declared);
        edges.add(&cm, &svc, EdgeKind::Precedence);

        match order(nodes, &edges).unwrap_err() {
            ValidationError::UnorderablePlan { declared, precedence } => {
                assert_eq!(declared, (svc.clone(), cm.clone()));
                assert_eq!(precedence, (cm, svc));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
