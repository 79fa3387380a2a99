//! Rekon core types: resource model, observed records, changeset entries.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Closed set of resource kinds the engine reconciles.
///
/// Variant order is not meaningful; ordering between kinds goes through
/// [`ResourceKind::precedence_rank`] (apply layering) or the lexicographic
/// [`ResourceId`] order (determinism tie-break).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Namespace,
    ConfigMap,
    Secret,
    Deployment,
    Service,
    Ingress,
    HorizontalPodAutoscaler,
    PodDisruptionBudget,
    NetworkPolicy,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::PodDisruptionBudget => "PodDisruptionBudget",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
        }
    }

    /// Static apply layering: lower ranks apply before higher ranks.
    /// Namespaces first, config material before workloads, services before
    /// the routing/policy layer.
    pub fn precedence_rank(&self) -> u8 {
        match self {
            ResourceKind::Namespace => 0,
            ResourceKind::ConfigMap | ResourceKind::Secret => 1,
            ResourceKind::Deployment => 2,
            ResourceKind::Service => 3,
            ResourceKind::Ingress
            | ResourceKind::HorizontalPodAutoscaler
            | ResourceKind::PodDisruptionBudget
            | ResourceKind::NetworkPolicy => 4,
        }
    }

    /// Kinds that live inside a namespace. Only `Namespace` itself is
    /// cluster-scoped in the reconciled set.
    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }

    /// Workload kinds that must roll when config material they mount changes.
    pub fn is_workload(&self) -> bool {
        matches!(self, ResourceKind::Deployment)
    }

    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ConfigMap,
            ResourceKind::Secret,
            ResourceKind::Deployment,
            ResourceKind::Service,
            ResourceKind::Ingress,
            ResourceKind::HorizontalPodAutoscaler,
            ResourceKind::PodDisruptionBudget,
            ResourceKind::NetworkPolicy,
        ]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Identity of a resource: (kind, namespace, name). Unique within a
/// desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }

    pub fn namespaced(kind: ResourceKind, ns: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(ns.into()), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl Ord for ResourceId {
    // Lexicographic (kind, namespace, name) so sorted collections of ids are
    // stable across runs.
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-resource reconciliation policy, decoded alongside the spec.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcePolicy {
    /// Keep the external object when the resource leaves the desired set.
    #[serde(default)]
    pub retain: bool,
    /// Never corrected by drift runs; applied once and left alone.
    #[serde(default)]
    pub unmanaged: bool,
}

/// One typed, named resource declaration. The spec payload is opaque to the
/// engine; reference extraction walks it with the per-kind field table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub policy: ResourcePolicy,
}

impl Resource {
    pub fn id(&self) -> ResourceId {
        ResourceId { kind: self.kind, namespace: self.namespace.clone(), name: self.name.clone() }
    }

    pub fn spec_hash(&self) -> String {
        spec_hash(&self.spec)
    }
}

/// Content hash of a spec payload. serde_json maps are key-ordered, so the
/// serialization is canonical and the hash stable across runs.
pub fn spec_hash(spec: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(spec).unwrap_or_default();
    let mut h = Sha256::new();
    h.update(&bytes);
    hex(&h.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Last-observed external status for a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedStatus {
    pub ready: bool,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Last-known-applied state for one identity. Owned by the state store and
/// mutated only after a confirmed external change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedRecord {
    pub spec_hash: String,
    /// Full last-applied spec, kept for audit diffs on later updates.
    pub spec: serde_json::Value,
    pub status: ObservedStatus,
    pub generation: u64,
    pub retain: bool,
    pub updated_ts: i64,
}

/// One required mutation (or explicit no-op) derived from a diff.
/// Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeEntry {
    Create(Resource),
    Update {
        resource: Resource,
        /// Changed top-level spec fields; audit/logging only, updates are
        /// always whole-spec replacements.
        changed_fields: Vec<String>,
        /// Set when the update was forced by a referenced ConfigMap/Secret
        /// content change rather than the resource's own spec.
        cascade_from: Option<ResourceId>,
    },
    Delete(ResourceId),
    Unchanged(ResourceId),
}

impl ChangeEntry {
    pub fn id(&self) -> ResourceId {
        match self {
            ChangeEntry::Create(r) => r.id(),
            ChangeEntry::Update { resource, .. } => resource.id(),
            ChangeEntry::Delete(id) | ChangeEntry::Unchanged(id) => id.clone(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChangeEntry::Create(_) => "create",
            ChangeEntry::Update { .. } => "update",
            ChangeEntry::Delete(_) => "delete",
            ChangeEntry::Unchanged(_) => "unchanged",
        }
    }

    /// Entries the planner orders and the executor dispatches. Unchanged
    /// entries are record-keeping only.
    pub fn actionable(&self) -> bool {
        !matches!(self, ChangeEntry::Unchanged(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeEntry::Delete(_))
    }
}

/// Fatal problems with a desired-state document or plan. Reported before any
/// external call is made; nothing is applied.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate resource {id} (declarations #{first} and #{second})")]
    DuplicateResource { id: ResourceId, first: usize, second: usize },

    #[error("resource {from} references {to}, which is not declared")]
    DanglingReference { from: ResourceId, to: ResourceId },

    #[error("dependency cycle: {}", fmt_cycle(.path))]
    CyclicDependency { path: Vec<ResourceId> },

    #[error("plan cannot be ordered: {}", fmt_conflict(.declared, .precedence))]
    UnorderablePlan {
        declared: (ResourceId, ResourceId),
        precedence: (ResourceId, ResourceId),
    },
}

fn fmt_cycle(path: &[ResourceId]) -> String {
    path.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> ")
}

fn fmt_conflict(declared: &(ResourceId, ResourceId), precedence: &(ResourceId, ResourceId)) -> String {
    format!(
        "declared reference {} -> {} conflicts with precedence {} -> {}",
        declared.0, declared.1, precedence.0, precedence.1
    )
}
