//! Desired-state graph builder: duplicate/dangling/cycle validation and
//! table-driven reference extraction.
//!
//! Pure code: no I/O, no side effects. Input is an already-decoded resource
//! collection; output is a validated graph whose edges are exactly the
//! declared references.

#![forbid(unsafe_code)]

use rekon_core::{Resource, ResourceId, ResourceKind, ValidationError};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// One reference-bearing field for a kind: a dotted path into the spec
/// payload and the kind the named object must have. Arrays along the path
/// are mapped over.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceRule {
    pub path: &'static str,
    pub target: ResourceKind,
}

const fn rule(path: &'static str, target: ResourceKind) -> ReferenceRule {
    ReferenceRule { path, target }
}

/// Per-kind reference field table. Selector-matched kinds (PodDisruptionBudget,
/// NetworkPolicy) carry no name references; they order purely by precedence.
pub fn reference_rules(kind: ResourceKind) -> &'static [ReferenceRule] {
    use ResourceKind::*;

    const DEPLOYMENT_RULES: &[ReferenceRule] = &[
        rule("template.containers.envFrom.secretRef.name", Secret),
        rule("template.containers.envFrom.configMapRef.name", ConfigMap),
        rule("template.volumes.secret.secretName", Secret),
        rule("template.volumes.configMap.name", ConfigMap),
        rule("imagePullSecrets.name", Secret),
    ];
    const INGRESS_RULES: &[ReferenceRule] = &[
        rule("defaultBackend.service.name", Service),
        rule("rules.paths.backend.service.name", Service),
        rule("tls.secretName", Secret),
    ];
    const HPA_RULES: &[ReferenceRule] = &[rule("scaleTargetRef.name", Deployment)];

    match kind {
        Deployment => DEPLOYMENT_RULES,
        Ingress => INGRESS_RULES,
        HorizontalPodAutoscaler => HPA_RULES,
        Namespace | ConfigMap | Secret | Service | PodDisruptionBudget | NetworkPolicy => &[],
    }
}

/// Collect every string value reachable by `path` in `spec`. Objects are
/// descended by key; arrays are mapped over at any depth.
fn collect_path<'a>(spec: &'a serde_json::Value, path: &str, out: &mut Vec<&'a str>) {
    fn walk<'a>(v: &'a serde_json::Value, segs: &[&str], out: &mut Vec<&'a str>) {
        if let serde_json::Value::Array(items) = v {
            for item in items {
                walk(item, segs, out);
            }
            return;
        }
        match segs.split_first() {
            None => {
                if let Some(s) = v.as_str() {
                    out.push(s);
                }
            }
            Some((head, rest)) => {
                if let Some(next) = v.get(*head) {
                    walk(next, rest, out);
                }
            }
        }
    }
    let segs: Vec<&str> = path.split('.').collect();
    walk(spec, &segs, out);
}

/// Extract declared references for one resource: table rules plus the
/// implicit edge to its Namespace. Order follows the rule table; duplicates
/// are removed keeping the first occurrence.
pub fn extract_references(resource: &Resource) -> SmallVec<[ResourceId; 4]> {
    let mut refs: SmallVec<[ResourceId; 4]> = SmallVec::new();
    let mut seen: FxHashSet<ResourceId> = FxHashSet::default();

    if let Some(ns) = &resource.namespace {
        let id = ResourceId::cluster(ResourceKind::Namespace, ns.clone());
        if seen.insert(id.clone()) {
            refs.push(id);
        }
    }
    for r in reference_rules(resource.kind) {
        let mut names = Vec::new();
        collect_path(&resource.spec, r.path, &mut names);
        for name in names {
            let id = match &resource.namespace {
                Some(ns) => ResourceId::namespaced(r.target, ns.clone(), name),
                // Namespaced targets cannot be referenced from cluster scope.
                None => continue,
            };
            if seen.insert(id.clone()) {
                refs.push(id);
            }
        }
    }
    refs
}

/// Validated desired-state graph: the full resource set for one
/// reconciliation unit, with edges = declared references. Immutable once
/// built.
#[derive(Debug, Clone)]
pub struct DesiredGraph {
    resources: Vec<Resource>,
    index: FxHashMap<ResourceId, usize>,
    edges: FxHashMap<ResourceId, SmallVec<[ResourceId; 4]>>,
}

impl DesiredGraph {
    /// Build and validate a graph from a decoded resource collection.
    ///
    /// `preexisting` names identities already applied in the state store;
    /// references to them are satisfied without an edge (the target is not
    /// part of this reconciliation unit).
    pub fn build(
        resources: Vec<Resource>,
        preexisting: &FxHashSet<ResourceId>,
    ) -> Result<Self, ValidationError> {
        let mut index: FxHashMap<ResourceId, usize> = FxHashMap::default();
        for (i, r) in resources.iter().enumerate() {
            if let Some(&first) = index.get(&r.id()) {
                return Err(ValidationError::DuplicateResource {
                    id: r.id(),
                    first,
                    second: i,
                });
            }
            index.insert(r.id(), i);
        }

        let mut edges: FxHashMap<ResourceId, SmallVec<[ResourceId; 4]>> = FxHashMap::default();
        for r in &resources {
            let mut kept: SmallVec<[ResourceId; 4]> = SmallVec::new();
            for target in extract_references(r) {
                if index.contains_key(&target) {
                    kept.push(target);
                } else if !preexisting.contains(&target) {
                    return Err(ValidationError::DanglingReference { from: r.id(), to: target });
                }
            }
            edges.insert(r.id(), kept);
        }

        let graph = Self { resources, index, edges };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources.iter().map(|r| r.id())
    }

    /// Declared references of `id`, in extraction order.
    pub fn references(&self, id: &ResourceId) -> &[ResourceId] {
        self.edges.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Identities that declare a reference to `id`.
    pub fn dependents(&self, id: &ResourceId) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self
            .resources
            .iter()
            .map(|r| r.id())
            .filter(|from| self.references(from).contains(id))
            .collect();
        out.sort();
        out
    }

    // DFS three-color cycle check; reports the full cycle path.
    fn check_acyclic(&self) -> Result<(), ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        fn visit(
            g: &DesiredGraph,
            id: &ResourceId,
            color: &mut FxHashMap<ResourceId, Color>,
            stack: &mut Vec<ResourceId>,
        ) -> Result<(), ValidationError> {
            color.insert(id.clone(), Color::Grey);
            stack.push(id.clone());
            for next in g.references(id) {
                match color.get(next).copied().unwrap_or(Color::White) {
                    Color::Black => {}
                    Color::Grey => {
                        let start = stack.iter().position(|x| x == next).unwrap_or(0);
                        let mut path: Vec<ResourceId> = stack[start..].to_vec();
                        path.push(next.clone());
                        return Err(ValidationError::CyclicDependency { path });
                    }
                    Color::White => visit(g, next, color, stack)?,
                }
            }
            stack.pop();
            color.insert(id.clone(), Color::Black);
            Ok(())
        }

        let mut color: FxHashMap<ResourceId, Color> = FxHashMap::default();
        // Deterministic visit order so the reported cycle is stable.
        let mut ids: Vec<ResourceId> = self.ids().collect();
        ids.sort();
        for id in ids {
            if color.get(&id).copied().unwrap_or(Color::White) == Color::White {
                visit(self, &id, &mut color, &mut Vec::new())?;
            }
        }
        Ok(())
    }
}
