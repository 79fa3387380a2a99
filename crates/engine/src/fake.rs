//! In-memory client simulator: backs the executor/drift tests and the CLI
//! sim driver. Failures are scriptable per identity.

use crate::client::{ClientError, LiveObject, ResourceClient};
use async_trait::async_trait;
use rekon_core::{ObservedStatus, Resource, ResourceId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    objects: FxHashMap<ResourceId, LiveObject>,
    fail_permanent: FxHashSet<ResourceId>,
    fail_transient: FxHashMap<ResourceId, u32>,
    journal: Vec<String>,
}

#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every apply/delete of `id` is rejected as a permanent error.
    pub fn fail_permanently(&self, id: ResourceId) {
        self.state.lock().unwrap().fail_permanent.insert(id);
    }

    /// The next `times` apply/delete calls for `id` fail transiently.
    pub fn fail_transiently(&self, id: ResourceId, times: u32) {
        self.state.lock().unwrap().fail_transient.insert(id, times);
    }

    /// Mutation log, in call order: "apply Kind/ns/name" / "delete ...".
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn live(&self, id: &ResourceId) -> Option<LiveObject> {
        self.state.lock().unwrap().objects.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Overwrite the live spec out-of-band, as a manual edit would.
    pub fn tamper(&self, id: &ResourceId, spec: serde_json::Value) {
        let mut s = self.state.lock().unwrap();
        if let Some(obj) = s.objects.get_mut(id) {
            obj.spec = spec;
        }
    }

    /// Remove the live object out-of-band.
    pub fn remove(&self, id: &ResourceId) {
        self.state.lock().unwrap().objects.remove(id);
    }

    fn check_failures(s: &mut FakeState, id: &ResourceId) -> Result<(), ClientError> {
        if s.fail_permanent.contains(id) {
            return Err(ClientError::Permanent("rejected by external api".into()));
        }
        if let Some(left) = s.fail_transient.get_mut(id) {
            if *left > 0 {
                *left -= 1;
                return Err(ClientError::Transient("simulated timeout".into()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for FakeClient {
    async fn apply(&self, resource: &Resource) -> Result<ObservedStatus, ClientError> {
        let mut s = self.state.lock().unwrap();
        let id = resource.id();
        s.journal.push(format!("apply {}", id));
        Self::check_failures(&mut s, &id)?;
        let status = ObservedStatus {
            ready: true,
            replicas: resource.spec.get("replicas").and_then(|v| v.as_i64()).map(|v| v as i32),
            message: None,
        };
        s.objects.insert(id, LiveObject { spec: resource.spec.clone(), status: status.clone() });
        Ok(status)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError> {
        let mut s = self.state.lock().unwrap();
        s.journal.push(format!("delete {}", id));
        Self::check_failures(&mut s, id)?;
        s.objects.remove(id);
        Ok(())
    }

    async fn observe(&self, id: &ResourceId) -> Result<Option<LiveObject>, ClientError> {
        Ok(self.state.lock().unwrap().objects.get(id).cloned())
    }
}
