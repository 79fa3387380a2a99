//! Drift reconciliation: periodically re-observe live state and re-run the
//! diff/plan/execute cycle against the same desired graph.

use crate::client::ResourceClient;
use crate::executor::{Executor, ExecutorConfig};
use crate::report::ExecutionReport;
use crate::EngineError;
use arc_swap::ArcSwap;
use metrics::counter;
use rekon_core::{spec_hash, ObservedRecord};
use rekon_graph::DesiredGraph;
use rekon_store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub executor: ExecutorConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(60), executor: ExecutorConfig::default() }
    }
}

/// Read access to the latest cycle's report: current snapshot plus an epoch
/// subscription, so embedders can follow progress without polling.
pub struct ReportHandle {
    current: Arc<ArcSwap<ExecutionReport>>,
    epoch_rx: watch::Receiver<u64>,
}

impl ReportHandle {
    pub fn current(&self) -> Arc<ExecutionReport> {
        self.current.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

pub struct Reconciler<C> {
    client: Arc<C>,
    store: Arc<dyn StateStore>,
    graph: Arc<DesiredGraph>,
    config: ReconcilerConfig,
}

impl<C: ResourceClient + 'static> Reconciler<C> {
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn StateStore>,
        graph: Arc<DesiredGraph>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { client, store, graph, config }
    }

    /// One full cycle: overlay freshly observed state on the store snapshot,
    /// then diff, plan, and execute.
    pub async fn run_once(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionReport, EngineError> {
        counter!("drift_runs_total", 1u64);
        let mut snapshot = rekon_store::snapshot(self.store.as_ref())?;

        for resource in self.graph.resources() {
            let id = resource.id();
            let Some(record) = snapshot.get(&id).cloned() else { continue };
            if resource.policy.unmanaged {
                continue;
            }
            match self.client.observe(&id).await {
                Ok(Some(live)) => {
                    let live_hash = spec_hash(&live.spec);
                    if live_hash != record.spec_hash {
                        counter!("drift_detected_total", 1u64);
                        info!(id = %id, "drift detected: live spec diverged, scheduling correction");
                        snapshot.insert(
                            id,
                            ObservedRecord {
                                spec_hash: live_hash,
                                spec: live.spec,
                                status: live.status,
                                ..record
                            },
                        );
                    }
                }
                Ok(None) => {
                    counter!("drift_detected_total", 1u64);
                    info!(id = %id, "drift detected: object gone, scheduling re-create");
                    snapshot.remove(&id);
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "observe failed; trusting stored record this cycle");
                }
            }
        }

        let changeset = rekon_diff::compute(&self.graph, &snapshot);
        let plan = rekon_plan::plan(&changeset, &self.graph)?;
        let executor =
            Executor::new(self.client.clone(), self.store.clone(), self.config.executor.clone());
        Ok(executor.execute(&plan, cancel).await)
    }

    /// Run cycles on the configured interval until cancelled. In-flight work
    /// finishes before the loop exits.
    pub fn spawn(self, cancel: watch::Receiver<bool>) -> (ReportHandle, tokio::task::JoinHandle<()>) {
        let current = Arc::new(ArcSwap::from_pointee(ExecutionReport::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = ReportHandle { current: Arc::clone(&current), epoch_rx };

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            let mut cancel_watch = cancel.clone();
            let mut epoch = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once(cancel.clone()).await {
                            Ok(report) => {
                                epoch += 1;
                                current.store(Arc::new(report));
                                let _ = epoch_tx.send(epoch);
                            }
                            Err(e) => error!(error = %e, "reconcile cycle failed"),
                        }
                        if *cancel.borrow() {
                            break;
                        }
                    }
                    changed = cancel_watch.changed() => {
                        if changed.is_err() || *cancel_watch.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciler stopped");
        });

        (handle, task)
    }
}
