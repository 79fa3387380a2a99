//! Plan execution: a bounded worker pool over independent branches of the
//! dependency graph.
//!
//! Entries in one chain run strictly in plan order; unrelated chains share
//! the pool with no ordering between them. A failed entry takes its
//! transitive dependents out of the run (skip-and-report) without touching
//! other branches.

use crate::client::{ClientError, ResourceClient};
use crate::report::{EntryReport, ExecutionReport, Outcome};
use crate::retry::{with_backoff, RetryConfig};
use metrics::{counter, histogram};
use rekon_core::{ChangeEntry, ObservedRecord, ObservedStatus, Resource, ResourceId};
use rekon_plan::Plan;
use rekon_store::{now_ts, StateStore, StoreError};
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool size; one dependency chain never uses more than one slot
    /// at a time.
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { concurrency: 4, retry: RetryConfig::default() }
    }
}

type Completion = (usize, Result<(), (ClientError, u32)>, u64);

pub struct Executor<C> {
    client: Arc<C>,
    store: Arc<dyn StateStore>,
    config: ExecutorConfig,
}

impl<C: ResourceClient + 'static> Executor<C> {
    pub fn new(client: Arc<C>, store: Arc<dyn StateStore>, config: ExecutorConfig) -> Self {
        Self { client, store, config }
    }

    /// Execute one plan to completion (or cancellation). In-flight calls are
    /// allowed to finish after a cancel; nothing new is dispatched.
    pub async fn execute(&self, plan: &Plan, cancel: watch::Receiver<bool>) -> ExecutionReport {
        let t0 = Instant::now();
        let started_ts = chrono::Utc::now().timestamp();
        let n = plan.len();
        if n == 0 {
            return ExecutionReport { started_ts, ..Default::default() };
        }
        counter!("exec_runs_total", 1u64);
        info!(entries = n, concurrency = self.config.concurrency, "exec: plan start");

        let entries = plan.entries();
        let index: FxHashMap<ResourceId, usize> =
            entries.iter().enumerate().map(|(i, e)| (e.id(), i)).collect();
        let mut preds_left: Vec<usize> = vec![0; n];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, e) in entries.iter().enumerate() {
            for dep in plan.deps_of(&e.id()) {
                let Some(&j) = index.get(dep) else { continue };
                preds_left[i] += 1;
                children[j].push(i);
            }
        }

        let mut outcomes: Vec<Option<(Outcome, u64)>> = vec![None; n];
        let mut running: Vec<bool> = vec![false; n];
        let mut ready: BinaryHeap<Reverse<usize>> = preds_left
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let (tx, mut rx) = mpsc::channel::<Completion>(n);
        let mut inflight = 0usize;
        let mut finished = 0usize;
        let mut cancelled = *cancel.borrow();
        let mut cancel_closed = false;
        let mut cancel_watch = cancel.clone();

        while finished < n {
            if !cancelled {
                while inflight < self.config.concurrency.max(1) {
                    let Some(Reverse(i)) = ready.pop() else { break };
                    running[i] = true;
                    self.dispatch(i, entries[i].clone(), tx.clone(), cancel.clone());
                    inflight += 1;
                }
            }
            if inflight == 0 {
                // Only cancellation can leave entries behind with nothing
                // running: mark them and stop.
                finished += mark_unstarted_skipped(&mut outcomes, &running, "cancelled");
                break;
            }

            tokio::select! {
                maybe = rx.recv() => {
                    let Some((i, result, took_ms)) = maybe else { break };
                    inflight -= 1;
                    finished += 1;
                    running[i] = false;
                    match result {
                        Ok(()) => {
                            outcomes[i] = Some((Outcome::Applied, took_ms));
                            for &c in &children[i] {
                                preds_left[c] -= 1;
                                if preds_left[c] == 0 && outcomes[c].is_none() {
                                    ready.push(Reverse(c));
                                }
                            }
                        }
                        Err((e, attempts)) => {
                            warn!(id = %entries[i].id(), error = %e, attempts, "exec: entry failed");
                            outcomes[i] =
                                Some((Outcome::Failed { reason: e.to_string(), attempts }, took_ms));
                            finished += skip_dependents(i, entries, &children, &mut outcomes);
                        }
                    }
                }
                changed = cancel_watch.changed(), if !cancelled && !cancel_closed => {
                    match changed {
                        Err(_) => cancel_closed = true,
                        Ok(()) if *cancel_watch.borrow() => {
                            cancelled = true;
                            info!("exec: cancellation observed; draining in-flight entries");
                            finished += mark_unstarted_skipped(&mut outcomes, &running, "cancelled");
                        }
                        Ok(()) => {}
                    }
                }
            }
        }

        let report_entries: Vec<EntryReport> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let (outcome, took_ms) = outcomes[i]
                    .clone()
                    .unwrap_or((Outcome::Skipped { reason: "cancelled".into() }, 0));
                EntryReport { id: e.id(), verb: e.verb().to_string(), outcome, took_ms }
            })
            .collect();
        let report = ExecutionReport {
            entries: report_entries,
            took_ms: t0.elapsed().as_millis() as u64,
            cancelled,
            started_ts,
        };
        info!(
            applied = report.applied(),
            skipped = report.skipped(),
            failed = report.failed(),
            took_ms = report.took_ms,
            "exec: plan finished"
        );
        report
    }

    fn dispatch(
        &self,
        i: usize,
        entry: ChangeEntry,
        tx: mpsc::Sender<Completion>,
        cancel: watch::Receiver<bool>,
    ) {
        let client = self.client.clone();
        let store = self.store.clone();
        let retry = self.config.retry.clone();
        tokio::spawn(async move {
            let t0 = Instant::now();
            let mut cancel = cancel;
            let id = entry.id();
            debug!(id = %id, verb = entry.verb(), "exec: dispatch");

            let result = match &entry {
                ChangeEntry::Create(r) | ChangeEntry::Update { resource: r, .. } => {
                    let op = format!("apply {}", id);
                    let (res, attempts) =
                        with_backoff(&retry, &op, &mut cancel, || client.apply(r)).await;
                    match res {
                        Ok(status) => persist_applied(store.as_ref(), r, status)
                            .map_err(|e| store_failure(e, attempts)),
                        Err(e) => Err((e, attempts)),
                    }
                }
                ChangeEntry::Delete(id) => {
                    let op = format!("delete {}", id);
                    let (res, attempts) =
                        with_backoff(&retry, &op, &mut cancel, || client.delete(id)).await;
                    match res {
                        Ok(()) => {
                            store.delete(id).map_err(|e| store_failure(e, attempts))
                        }
                        Err(e) => Err((e, attempts)),
                    }
                }
                // Unchanged entries never reach a plan.
                ChangeEntry::Unchanged(_) => Ok(()),
            };

            let took_ms = t0.elapsed().as_millis() as u64;
            histogram!("exec_entry_ms", took_ms as f64);
            match &result {
                Ok(()) => counter!("exec_apply_ok", 1u64),
                Err(_) => counter!("exec_apply_err", 1u64),
            }
            let _ = tx.send((i, result, took_ms)).await;
        });
    }
}

/// Record the confirmed external state. Called only after the apply call
/// succeeded, never speculatively.
fn persist_applied(
    store: &dyn StateStore,
    resource: &Resource,
    status: ObservedStatus,
) -> Result<(), StoreError> {
    let id = resource.id();
    let generation = store.get(&id)?.map(|r| r.generation).unwrap_or(0) + 1;
    store.put(
        &id,
        ObservedRecord {
            spec_hash: resource.spec_hash(),
            spec: resource.spec.clone(),
            status,
            generation,
            retain: resource.policy.retain,
            updated_ts: now_ts(),
        },
    )
}

fn store_failure(e: StoreError, attempts: u32) -> (ClientError, u32) {
    (ClientError::Permanent(format!("state store write failed: {e}")), attempts)
}

fn mark_unstarted_skipped(
    outcomes: &mut [Option<(Outcome, u64)>],
    running: &[bool],
    reason: &str,
) -> usize {
    let mut marked = 0;
    for (i, slot) in outcomes.iter_mut().enumerate() {
        if slot.is_none() && !running[i] {
            *slot = Some((Outcome::Skipped { reason: reason.to_string() }, 0));
            marked += 1;
        }
    }
    marked
}

/// Transitively mark everything waiting on `i` as skipped. Entries on
/// unrelated branches are untouched.
fn skip_dependents(
    i: usize,
    entries: &[ChangeEntry],
    children: &[Vec<usize>],
    outcomes: &mut [Option<(Outcome, u64)>],
) -> usize {
    let failed = entries[i].id();
    let mut marked = 0;
    let mut stack: Vec<usize> = children[i].clone();
    while let Some(c) = stack.pop() {
        if outcomes[c].is_some() {
            continue;
        }
        debug!(id = %entries[c].id(), dependency = %failed, "exec: skipping dependent");
        counter!("exec_skipped_total", 1u64);
        outcomes[c] =
            Some((Outcome::Skipped { reason: format!("dependency {} failed", failed) }, 0));
        marked += 1;
        stack.extend(children[c].iter().copied());
    }
    marked
}
