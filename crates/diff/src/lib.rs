//! Differ: desired graph vs. state-store snapshot -> unordered changeset.

#![forbid(unsafe_code)]

use metrics::counter;
use rekon_core::{ChangeEntry, ObservedRecord, Resource, ResourceId, ResourceKind};
use rekon_graph::{extract_references, DesiredGraph};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Field-level counts for one spec diff. Audit/logging only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Walk target against base and count added, changed, and removed nodes.
pub fn diff_summary(target: &serde_json::Value, base: &serde_json::Value) -> DiffSummary {
    fn walk(a: &serde_json::Value, b: &serde_json::Value, s: &mut DiffSummary) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                for (k, _) in bo.iter() {
                    if !ao.contains_key(k) {
                        s.removes += 1;
                    }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] {
                        s.updates += 1;
                    }
                }
                if aa.len() > bb.len() {
                    s.adds += aa.len() - bb.len();
                }
                if bb.len() > aa.len() {
                    s.removes += bb.len() - aa.len();
                }
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Changed top-level spec fields between the last-applied and desired specs,
/// sorted for stable logs.
pub fn changed_top_level(old: &serde_json::Value, new: &serde_json::Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);
    let mut fields: Vec<String> = Vec::new();
    for (k, v) in new_map.iter() {
        if old_map.get(k) != Some(v) {
            fields.push(k.clone());
        }
    }
    for (k, _) in old_map.iter() {
        if !new_map.contains_key(k) {
            fields.push(k.clone());
        }
    }
    fields.sort();
    fields.dedup();
    fields
}

/// The unordered set of required mutations derived from one diff, plus the
/// reference edges of deleted identities (reconstructed from their stored
/// specs) so the planner can reverse-order deletes.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub entries: Vec<ChangeEntry>,
    delete_refs: FxHashMap<ResourceId, Vec<ResourceId>>,
}

impl Changeset {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// References a deleted identity held at last apply time.
    pub fn delete_refs(&self, id: &ResourceId) -> &[ResourceId] {
        self.delete_refs.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn actionable(&self) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(|e| e.actionable())
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut c = (0, 0, 0, 0);
        for e in &self.entries {
            match e {
                ChangeEntry::Create(_) => c.0 += 1,
                ChangeEntry::Update { .. } => c.1 += 1,
                ChangeEntry::Delete(_) => c.2 += 1,
                ChangeEntry::Unchanged(_) => c.3 += 1,
            }
        }
        c
    }
}

/// Compare the desired graph against a store snapshot.
///
/// Entries come out sorted by identity; ordering them by dependency is the
/// planner's job.
pub fn compute(
    graph: &DesiredGraph,
    stored: &FxHashMap<ResourceId, ObservedRecord>,
) -> Changeset {
    counter!("diff_runs_total", 1u64);

    let mut entries: FxHashMap<ResourceId, ChangeEntry> = FxHashMap::default();

    for resource in graph.resources() {
        let id = resource.id();
        match stored.get(&id) {
            None => {
                debug!(id = %id, "diff: create");
                entries.insert(id, ChangeEntry::Create(resource.clone()));
            }
            Some(record) if record.spec_hash != resource.spec_hash() => {
                let changed_fields = changed_top_level(&record.spec, &resource.spec);
                let summary = diff_summary(&resource.spec, &record.spec);
                debug!(
                    id = %id,
                    fields = ?changed_fields,
                    adds = summary.adds,
                    updates = summary.updates,
                    removes = summary.removes,
                    "diff: update"
                );
                entries.insert(
                    id,
                    ChangeEntry::Update {
                        resource: resource.clone(),
                        changed_fields,
                        cascade_from: None,
                    },
                );
            }
            Some(_) => {
                entries.insert(id.clone(), ChangeEntry::Unchanged(id));
            }
        }
    }

    // Cascade: a content-changed Secret/ConfigMap forces a rolling restart of
    // every workload that mounts it, even when the workload spec is
    // untouched. Comparing each resource in isolation would leave stale
    // config in running pods.
    let mut cascades: Vec<(ResourceId, ResourceId)> = Vec::new();
    for (id, entry) in entries.iter() {
        let config_kind =
            matches!(id.kind, ResourceKind::Secret | ResourceKind::ConfigMap);
        if !config_kind || !matches!(entry, ChangeEntry::Update { .. }) {
            continue;
        }
        for dependent in graph.dependents(id) {
            if !dependent.kind.is_workload() {
                continue;
            }
            if matches!(entries.get(&dependent), Some(ChangeEntry::Unchanged(_))) {
                cascades.push((dependent, id.clone()));
            }
        }
    }
    for (workload, source) in cascades {
        let resource = graph
            .get(&workload)
            .expect("cascade target is in the desired graph")
            .clone();
        debug!(id = %workload, source = %source, "diff: cascade update");
        counter!("diff_cascade_updates_total", 1u64);
        entries.insert(
            workload,
            ChangeEntry::Update {
                resource,
                changed_fields: Vec::new(),
                cascade_from: Some(source),
            },
        );
    }

    // Stored identities gone from the desired set are deleted unless the
    // record is retained.
    let mut delete_refs: FxHashMap<ResourceId, Vec<ResourceId>> = FxHashMap::default();
    for (id, record) in stored.iter() {
        if graph.contains(id) {
            continue;
        }
        if record.retain {
            warn!(id = %id, "diff: left desired set but flagged retain; keeping");
            entries.insert(id.clone(), ChangeEntry::Unchanged(id.clone()));
            continue;
        }
        debug!(id = %id, "diff: delete");
        let last_applied = Resource {
            kind: id.kind,
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            spec: record.spec.clone(),
            policy: Default::default(),
        };
        let refs = extract_references(&last_applied)
            .into_iter()
            .filter(|r| stored.contains_key(r) && !graph.contains(r))
            .collect();
        delete_refs.insert(id.clone(), refs);
        entries.insert(id.clone(), ChangeEntry::Delete(id.clone()));
    }

    let mut out: Vec<ChangeEntry> = entries.into_values().collect();
    out.sort_by(|a, b| a.id().cmp(&b.id()));
    let changeset = Changeset { entries: out, delete_refs };
    let (creates, updates, deletes, unchanged) = changeset.counts();
    debug!(creates, updates, deletes, unchanged, "diff: changeset ready");
    changeset
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{ObservedStatus, ResourcePolicy};
    use rustc_hash::FxHashSet;
    use serde_json::json;

    fn ns(name: &str) -> Resource {
        Resource {
            kind: ResourceKind::Namespace,
            namespace: None,
            name: name.into(),
            spec: json!({}),
            policy: Default::default(),
        }
    }

    fn secret(ns: &str, name: &str, data: serde_json::Value) -> Resource {
        Resource {
            kind: ResourceKind::Secret,
            namespace: Some(ns.into()),
            name: name.into(),
            spec: json!({"data": data}),
            policy: Default::default(),
        }
    }

    fn deployment(ns: &str, name: &str, secret: &str) -> Resource {
        Resource {
            kind: ResourceKind::Deployment,
            namespace: Some(ns.into()),
            name: name.into(),
            spec: json!({
                "replicas": 2,
                "template": {"containers": [
                    {"name": "main", "envFrom": [{"secretRef": {"name": secret}}]}
                ]}
            }),
            policy: Default::default(),
        }
    }

    fn record_for(r: &Resource) -> ObservedRecord {
        ObservedRecord {
            spec_hash: r.spec_hash(),
            spec: r.spec.clone(),
            status: ObservedStatus { ready: true, replicas: None, message: None },
            generation: 1,
            retain: r.policy.retain,
            updated_ts: 0,
        }
    }

    fn graph(resources: Vec<Resource>) -> DesiredGraph {
        DesiredGraph::build(resources, &FxHashSet::default()).unwrap()
    }

    #[test]
    fn empty_store_yields_all_creates() {
        let g = graph(vec![ns("prod"), secret("prod", "s", json!({"k": "v"})), deployment("prod", "api", "s")]);
        let cs = compute(&g, &FxHashMap::default());
        assert_eq!(cs.counts(), (3, 0, 0, 0));
    }

    #[test]
    fn identical_specs_are_unchanged_and_second_run_is_idempotent() {
        let resources = vec![ns("prod"), secret("prod", "s", json!({"k": "v"}))];
        let g = graph(resources.clone());
        let mut stored = FxHashMap::default();
        for r in &resources {
            stored.insert(r.id(), record_for(r));
        }
        let cs = compute(&g, &stored);
        assert_eq!(cs.counts(), (0, 0, 0, 2));
        assert!(cs.actionable().next().is_none());
    }

    #[test]
    fn changed_spec_yields_update_with_changed_fields() {
        let old = secret("prod", "s", json!({"k": "v"}));
        let mut stored = FxHashMap::default();
        stored.insert(old.id(), record_for(&old));

        let mut new = secret("prod", "s", json!({"k": "v2"}));
        new.spec["ttl"] = json!(60);
        let g = graph(vec![ns("prod"), new]);
        // Namespace is new in this graph; only look at the secret entry.
        let entry = compute(&g, &stored)
            .entries
            .iter()
            .find(|e| e.id().kind == ResourceKind::Secret)
            .cloned()
            .unwrap();
        match entry {
            ChangeEntry::Update { changed_fields, cascade_from, .. } => {
                assert_eq!(changed_fields, vec!["data".to_string(), "ttl".to_string()]);
                assert!(cascade_from.is_none());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn secret_content_change_cascades_to_referencing_deployments() {
        let old_secret = secret("prod", "s", json!({"k": "v"}));
        let dep_a = deployment("prod", "api", "s");
        let dep_b = deployment("prod", "worker", "s");
        let unrelated = deployment("prod", "other", "s2");
        let namespace = ns("prod");
        let other_secret = secret("prod", "s2", json!({}));

        let mut stored = FxHashMap::default();
        for r in [&namespace, &old_secret, &other_secret, &dep_a, &dep_b, &unrelated] {
            stored.insert(r.id(), record_for(r));
        }

        let g = graph(vec![
            namespace,
            secret("prod", "s", json!({"k": "rotated"})),
            other_secret,
            dep_a.clone(),
            dep_b.clone(),
            unrelated.clone(),
        ]);
        let cs = compute(&g, &stored);
        // Both referencing deployments roll; the unrelated one stays put.
        for dep in [&dep_a, &dep_b] {
            let entry = cs.entries.iter().find(|e| e.id() == dep.id()).unwrap();
            match entry {
                ChangeEntry::Update { cascade_from: Some(src), changed_fields, .. } => {
                    assert_eq!(*src, ResourceId::namespaced(ResourceKind::Secret, "prod", "s"));
                    assert!(changed_fields.is_empty());
                }
                other => panic!("expected cascade update for {}, got {other:?}", dep.name),
            }
        }
        let entry = cs.entries.iter().find(|e| e.id() == unrelated.id()).unwrap();
        assert!(matches!(entry, ChangeEntry::Unchanged(_)));
    }

    #[test]
    fn removed_resource_is_deleted_unless_retained() {
        let gone = secret("prod", "old", json!({"k": "v"}));
        let kept = Resource { policy: ResourcePolicy { retain: true, unmanaged: false }, ..secret("prod", "keep", json!({})) };
        let mut stored = FxHashMap::default();
        stored.insert(gone.id(), record_for(&gone));
        stored.insert(kept.id(), record_for(&kept));

        let g = graph(vec![]);
        let cs = compute(&g, &stored);
        let gone_entry = cs.entries.iter().find(|e| e.id() == gone.id()).unwrap();
        assert!(matches!(gone_entry, ChangeEntry::Delete(_)));
        let kept_entry = cs.entries.iter().find(|e| e.id() == kept.id()).unwrap();
        assert!(matches!(kept_entry, ChangeEntry::Unchanged(_)));
    }

    #[test]
    fn delete_refs_come_from_last_applied_spec() {
        let namespace = ns("legacy");
        let s = secret("legacy", "cred", json!({"k": "v"}));
        let d = deployment("legacy", "api", "cred");
        let mut stored = FxHashMap::default();
        for r in [&namespace, &s, &d] {
            stored.insert(r.id(), record_for(r));
        }
        let cs = compute(&graph(vec![]), &stored);
        assert_eq!(cs.counts(), (0, 0, 3, 0));
        let refs = cs.delete_refs(&d.id());
        assert!(refs.contains(&s.id()));
        assert!(refs.contains(&namespace.id()));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
    }
}
