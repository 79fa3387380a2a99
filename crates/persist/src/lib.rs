//! Durable state store over SQLite. One row per identity; each put is one
//! transaction, so records are atomic and durable before the call returns.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::histogram;
use rekon_core::{ObservedRecord, ObservedStatus, ResourceId, ResourceKind};
use rekon_store::{StateStore, StoreError};
use std::str::FromStr;

pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("REKON_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS observed (
                kind       TEXT NOT NULL,
                namespace  TEXT NOT NULL,
                name       TEXT NOT NULL,
                spec_hash  TEXT NOT NULL,
                spec       TEXT NOT NULL,
                status     TEXT NOT NULL,
                generation INTEGER NOT NULL,
                retain     INTEGER NOT NULL,
                updated_ts INTEGER NOT NULL,
                PRIMARY KEY (kind, namespace, name)
            )",
            [],
        )
        .context("creating observed table")?;
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

// Cluster-scoped identities store an empty namespace column.
fn ns_column(id: &ResourceId) -> &str {
    id.namespace.as_deref().unwrap_or("")
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn row_to_record(
    kind: String,
    namespace: String,
    name: String,
    spec_hash: String,
    spec: String,
    status: String,
    generation: i64,
    retain: bool,
    updated_ts: i64,
) -> Result<(ResourceId, ObservedRecord), StoreError> {
    let kind = ResourceKind::from_str(&kind).map_err(backend)?;
    let namespace = if namespace.is_empty() { None } else { Some(namespace) };
    let spec: serde_json::Value = serde_json::from_str(&spec).map_err(backend)?;
    let status: ObservedStatus = serde_json::from_str(&status).map_err(backend)?;
    Ok((
        ResourceId { kind, namespace, name },
        ObservedRecord { spec_hash, spec, status, generation: generation as u64, retain, updated_ts },
    ))
}

impl StateStore for SqliteStore {
    fn get(&self, id: &ResourceId) -> Result<Option<ObservedRecord>, StoreError> {
        let started = std::time::Instant::now();
        let db = self.db.lock().map_err(backend)?;
        let mut stmt = db
            .prepare(
                "SELECT spec_hash, spec, status, generation, retain, updated_ts
                 FROM observed WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            )
            .map_err(backend)?;
        let mut rows = stmt
            .query((id.kind.as_str(), ns_column(id), id.name.as_str()))
            .map_err(backend)?;
        let out = match rows.next().map_err(backend)? {
            None => None,
            Some(row) => {
                let spec_hash: String = row.get(0).map_err(backend)?;
                let spec: String = row.get(1).map_err(backend)?;
                let status: String = row.get(2).map_err(backend)?;
                let generation: i64 = row.get(3).map_err(backend)?;
                let retain: bool = row.get(4).map_err(backend)?;
                let updated_ts: i64 = row.get(5).map_err(backend)?;
                let (_, record) = row_to_record(
                    id.kind.as_str().to_string(),
                    ns_column(id).to_string(),
                    id.name.clone(),
                    spec_hash,
                    spec,
                    status,
                    generation,
                    retain,
                    updated_ts,
                )?;
                Some(record)
            }
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn put(&self, id: &ResourceId, record: ObservedRecord) -> Result<(), StoreError> {
        let started = std::time::Instant::now();
        let spec = serde_json::to_string(&record.spec).map_err(backend)?;
        let status = serde_json::to_string(&record.status).map_err(backend)?;
        let db = self.db.lock().map_err(backend)?;
        db.execute(
            "INSERT OR REPLACE INTO observed
                 (kind, namespace, name, spec_hash, spec, status, generation, retain, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            (
                id.kind.as_str(),
                ns_column(id),
                id.name.as_str(),
                &record.spec_hash,
                &spec,
                &status,
                record.generation as i64,
                record.retain,
                record.updated_ts,
            ),
        )
        .map_err(backend)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(ResourceId, ObservedRecord)>, StoreError> {
        let db = self.db.lock().map_err(backend)?;
        let mut stmt = db
            .prepare(
                "SELECT kind, namespace, name, spec_hash, spec, status, generation, retain, updated_ts
                 FROM observed",
            )
            .map_err(backend)?;
        let mut rows = stmt.query([]).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let kind: String = row.get(0).map_err(backend)?;
            let namespace: String = row.get(1).map_err(backend)?;
            let name: String = row.get(2).map_err(backend)?;
            let spec_hash: String = row.get(3).map_err(backend)?;
            let spec: String = row.get(4).map_err(backend)?;
            let status: String = row.get(5).map_err(backend)?;
            let generation: i64 = row.get(6).map_err(backend)?;
            let retain: bool = row.get(7).map_err(backend)?;
            let updated_ts: i64 = row.get(8).map_err(backend)?;
            out.push(row_to_record(
                kind, namespace, name, spec_hash, spec, status, generation, retain, updated_ts,
            )?);
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn delete(&self, id: &ResourceId) -> Result<(), StoreError> {
        let db = self.db.lock().map_err(backend)?;
        db.execute(
            "DELETE FROM observed WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            (id.kind.as_str(), ns_column(id), id.name.as_str()),
        )
        .map_err(backend)?;
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".rekon");
        let _ = std::fs::create_dir_all(&p);
        p.push("rekon.db");
        return p.to_string_lossy().to_string();
    }
    "rekon.db".to_string()
}
