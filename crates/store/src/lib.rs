//! State store contract and the in-RAM backend.
//!
//! The store holds one [`ObservedRecord`] per identity: the last-applied spec
//! and the last-observed external status. Writes happen only after a
//! confirmed external change, so the store never runs ahead of the world.

#![forbid(unsafe_code)]

use rekon_core::{ObservedRecord, ResourceId};
use rustc_hash::FxHashMap;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

/// Last-known-applied state, keyed by identity.
///
/// `put` must be atomic and durable before it returns; operations on
/// different identities must not interfere. Callers never hold a store lock
/// across an external call.
pub trait StateStore: Send + Sync {
    fn get(&self, id: &ResourceId) -> Result<Option<ObservedRecord>, StoreError>;
    fn put(&self, id: &ResourceId, record: ObservedRecord) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<(ResourceId, ObservedRecord)>, StoreError>;
    fn delete(&self, id: &ResourceId) -> Result<(), StoreError>;
}

/// Load the full store contents into a map for the differ.
pub fn snapshot(store: &dyn StateStore) -> Result<FxHashMap<ResourceId, ObservedRecord>, StoreError> {
    Ok(store.list()?.into_iter().collect())
}

const SHARDS: usize = 16;

/// In-memory store, sharded by identity hash so writers on unrelated
/// identities rarely contend on the same lock.
pub struct MemoryStore {
    shards: Vec<RwLock<FxHashMap<ResourceId, ObservedRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| RwLock::new(FxHashMap::default())).collect() }
    }

    fn shard(&self, id: &ResourceId) -> &RwLock<FxHashMap<ResourceId, ObservedRecord>> {
        // FNV-1a over the display form; only distribution matters here.
        let mut h: u64 = 0xcbf29ce484222325;
        for b in id.to_string().as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        &self.shards[(h as usize) % SHARDS]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, id: &ResourceId) -> Result<Option<ObservedRecord>, StoreError> {
        let shard = self.shard(id).read().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(shard.get(id).cloned())
    }

    fn put(&self, id: &ResourceId, record: ObservedRecord) -> Result<(), StoreError> {
        let mut shard = self.shard(id).write().map_err(|e| StoreError::Backend(e.to_string()))?;
        shard.insert(id.clone(), record);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ResourceId, ObservedRecord)>, StoreError> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().map_err(|e| StoreError::Backend(e.to_string()))?;
            out.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn delete(&self, id: &ResourceId) -> Result<(), StoreError> {
        let mut shard = self.shard(id).write().map_err(|e| StoreError::Backend(e.to_string()))?;
        shard.remove(id);
        Ok(())
    }
}

/// Seconds since epoch, for record timestamps.
pub fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{ObservedStatus, ResourceKind};

    fn record(gen: u64) -> ObservedRecord {
        ObservedRecord {
            spec_hash: format!("hash-{gen}"),
            spec: serde_json::json!({"gen": gen}),
            status: ObservedStatus::default(),
            generation: gen,
            retain: false,
            updated_ts: 0,
        }
    }

    #[test]
    fn put_get_replace_delete() {
        let s = MemoryStore::new();
        let id = ResourceId::namespaced(ResourceKind::ConfigMap, "ns", "cfg");
        assert!(s.get(&id).unwrap().is_none());

        s.put(&id, record(1)).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().generation, 1);

        s.put(&id, record(2)).unwrap();
        assert_eq!(s.get(&id).unwrap().unwrap().generation, 2);

        s.delete(&id).unwrap();
        assert!(s.get(&id).unwrap().is_none());
    }

    #[test]
    fn list_is_sorted_by_identity() {
        let s = MemoryStore::new();
        let ids = [
            ResourceId::namespaced(ResourceKind::Service, "b", "svc"),
            ResourceId::cluster(ResourceKind::Namespace, "a"),
            ResourceId::namespaced(ResourceKind::ConfigMap, "a", "cfg"),
        ];
        for id in &ids {
            s.put(id, record(1)).unwrap();
        }
        let listed: Vec<ResourceId> = s.list().unwrap().into_iter().map(|(id, _)| id).collect();
        let mut want = ids.to_vec();
        want.sort();
        assert_eq!(listed, want);
    }
}
