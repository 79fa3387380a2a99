use rekon_core::{ChangeEntry, ObservedRecord, ObservedStatus, Resource, ResourceId, ResourceKind};
use rekon_graph::DesiredGraph;
use rustc_hash::{FxHashMap, FxHashSet};
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

fn res(kind: ResourceKind, ns: &str, name: &str, spec: serde_json::Value) -> Resource {
    Resource { kind, namespace: Some(ns.into()), name: name.into(), spec, policy: Default::default() }
}

fn deployment(ns: &str, name: &str, secret: &str) -> Resource {
    res(
        ResourceKind::Deployment,
        ns,
        name,
        json!({
            "replicas": 2,
            "template": {"containers": [
                {"name": "main", "envFrom": [{"secretRef": {"name": secret}}]}
            ]}
        }),
    )
}

/// The two-tier application fixture: one namespace, config material, two
/// workloads, service, ingress, autoscaler.
fn two_tier() -> Vec<Resource> {
    vec![
        ns("production"),
        res(ResourceKind::Secret, "production", "backend-secret", json!({"data": {"k": "v"}})),
        res(ResourceKind::ConfigMap, "production", "frontend-config", json!({"data": {"mode": "on"}})),
        deployment("production", "backend", "backend-secret"),
        res(
            ResourceKind::Deployment,
            "production",
            "frontend",
            json!({
                "replicas": 2,
                "template": {"containers": [
                    {"name": "web", "envFrom": [{"configMapRef": {"name": "frontend-config"}}]}
                ]}
            }),
        ),
        res(ResourceKind::Service, "production", "frontend-svc", json!({"port": 80})),
        res(
            ResourceKind::Ingress,
            "production",
            "web",
            json!({"rules": [{"paths": [{"backend": {"service": {"name": "frontend-svc"}}}]}]}),
        ),
        res(
            ResourceKind::HorizontalPodAutoscaler,
            "production",
            "backend-hpa",
            json!({"scaleTargetRef": {"name": "backend"}, "maxReplicas": 6}),
        ),
        res(ResourceKind::PodDisruptionBudget, "production", "backend-pdb", json!({"minAvailable": 1})),
        res(ResourceKind::NetworkPolicy, "production", "default-deny", json!({"policyTypes": ["Ingress"]})),
    ]
}

fn graph(resources: Vec<Resource>) -> DesiredGraph {
    DesiredGraph::build(resources, &FxHashSet::default()).unwrap()
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

fn position(entries: &[ChangeEntry], id: &ResourceId) -> usize {
    entries.iter().position(|e| &e.id() == id).unwrap_or_else(|| panic!("{id} not in plan"))
}

#[test]
fn worked_example_orders_namespace_secret_deployment() {
    let g = graph(vec![
        ns("production"),
        res(ResourceKind::Secret, "production", "backend-secret", json!({"data": {"k": "v"}})),
        deployment("production", "backend", "backend-secret"),
    ]);
    let cs = rekon_diff::compute(&g, &FxHashMap::default());
    let plan = rekon_plan::plan(&cs, &g).unwrap();

    let ids: Vec<ResourceId> = plan.entries().iter().map(|e| e.id()).collect();
    assert_eq!(
        ids,
        vec![
            ResourceId::cluster(ResourceKind::Namespace, "production"),
            ResourceId::namespaced(ResourceKind::Secret, "production", "backend-secret"),
            ResourceId::namespaced(ResourceKind::Deployment, "production", "backend"),
        ]
    );
    assert!(plan.entries().iter().all(|e| matches!(e, ChangeEntry::Create(_))));
}

#[test]
fn planner_is_deterministic_across_input_permutations() {
    let forward = two_tier();
    let mut backward = two_tier();
    backward.reverse();

    let stored = FxHashMap::default();
    let g1 = graph(forward);
    let g2 = graph(backward);
    let p1 = rekon_plan::plan(&rekon_diff::compute(&g1, &stored), &g1).unwrap();
    let p2 = rekon_plan::plan(&rekon_diff::compute(&g2, &stored), &g2).unwrap();

    let bytes1 = serde_json::to_vec(p1.entries()).unwrap();
    let bytes2 = serde_json::to_vec(p2.entries()).unwrap();
    assert_eq!(bytes1, bytes2);
}

#[test]
fn creates_respect_every_declared_edge_and_precedence() {
    let g = graph(two_tier());
    let cs = rekon_diff::compute(&g, &FxHashMap::default());
    let plan = rekon_plan::plan(&cs, &g).unwrap();
    let entries = plan.entries();

    for id in g.ids() {
        for reference in g.references(&id) {
            assert!(
                position(entries, reference) < position(entries, &id),
                "{reference} must precede {id}"
            );
        }
    }
    // Precedence layering within the namespace.
    let namespace = ResourceId::cluster(ResourceKind::Namespace, "production");
    let secret = ResourceId::namespaced(ResourceKind::Secret, "production", "backend-secret");
    let dep = ResourceId::namespaced(ResourceKind::Deployment, "production", "frontend");
    let svc = ResourceId::namespaced(ResourceKind::Service, "production", "frontend-svc");
    let ing = ResourceId::namespaced(ResourceKind::Ingress, "production", "web");
    assert!(position(entries, &namespace) < position(entries, &secret));
    assert!(position(entries, &secret) < position(entries, &dep));
    assert!(position(entries, &dep) < position(entries, &svc));
    assert!(position(entries, &svc) < position(entries, &ing));
}

#[test]
fn deletes_run_in_reverse_dependency_order() {
    let resources = vec![
        ns("legacy"),
        res(ResourceKind::Secret, "legacy", "cred", json!({"data": {}})),
        deployment("legacy", "api", "cred"),
    ];
    let mut stored = FxHashMap::default();
    for r in &resources {
        stored.insert(r.id(), record_for(r));
    }

    let g = graph(vec![]);
    let cs = rekon_diff::compute(&g, &stored);
    let plan = rekon_plan::plan(&cs, &g).unwrap();
    let entries = plan.entries();

    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| matches!(e, ChangeEntry::Delete(_))));
    let dep = ResourceId::namespaced(ResourceKind::Deployment, "legacy", "api");
    let secret = ResourceId::namespaced(ResourceKind::Secret, "legacy", "cred");
    let namespace = ResourceId::cluster(ResourceKind::Namespace, "legacy");
    assert!(position(entries, &dep) < position(entries, &secret));
    assert!(position(entries, &secret) < position(entries, &namespace));
}

#[test]
fn unchanged_world_yields_empty_plan() {
    let resources = two_tier();
    let g = graph(resources.clone());
    let mut stored = FxHashMap::default();
    for r in &resources {
        stored.insert(r.id(), record_for(r));
    }
    let cs = rekon_diff::compute(&g, &stored);
    assert!(cs.actionable().next().is_none());
    let plan = rekon_plan::plan(&cs, &g).unwrap();
    assert!(plan.is_empty());
}

#[test]
fn mixed_plan_keeps_applies_before_deletes() {
    // One surviving namespace gains a configmap while a legacy secret goes
    // away; the create phase must precede the delete phase.
    let survivor = vec![ns("prod"), res(ResourceKind::ConfigMap, "prod", "cfg", json!({"data": {}}))];
    let legacy = res(ResourceKind::Secret, "prod", "old", json!({"data": {}}));

    let mut stored = FxHashMap::default();
    stored.insert(ns("prod").id(), record_for(&ns("prod")));
    stored.insert(legacy.id(), record_for(&legacy));

    let g = graph(survivor);
    let cs = rekon_diff::compute(&g, &stored);
    let plan = rekon_plan::plan(&cs, &g).unwrap();
    let entries = plan.entries();

    let cfg = ResourceId::namespaced(ResourceKind::ConfigMap, "prod", "cfg");
    let old = ResourceId::namespaced(ResourceKind::Secret, "prod", "old");
    assert!(position(entries, &cfg) < position(entries, &old));
    assert!(matches!(entries[position(entries, &old)], ChangeEntry::Delete(_)));
}
