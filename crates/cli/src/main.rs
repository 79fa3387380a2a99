use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rekon_core::{ChangeEntry, Resource, ValidationError};
use rekon_diff::Changeset;
use rekon_engine::{
    ExecutionReport, Executor, ExecutorConfig, FakeClient, Outcome, Reconciler, ReconcilerConfig,
};
use rekon_graph::DesiredGraph;
use rekon_persist::SqliteStore;
use rekon_store::StateStore;
use rustc_hash::FxHashSet;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Rekon desired-state reconciliation CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// State store database path (default: ~/.rekon/rekon.db)
    #[arg(long = "db", global = true, env = "REKON_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Diff a desired-state document against the recorded state
    Diff {
        /// Document path ("-" for stdin)
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Order the changeset into an executable plan and print it
    Plan {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Execute the plan once (sim driver; real drivers embed rekon-engine)
    Apply {
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Worker pool size
        #[arg(long = "concurrency", env = "REKON_CONCURRENCY", default_value_t = 4)]
        concurrency: usize,
    },
    /// Reconcile on an interval until interrupted (sim driver)
    Reconcile {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long = "concurrency", env = "REKON_CONCURRENCY", default_value_t = 4)]
        concurrency: usize,
        /// Seconds between cycles
        #[arg(long = "interval", default_value_t = 60)]
        interval_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_document(path: &str) -> Result<Vec<Resource>> {
    let text = if path == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    serde_yaml::from_str(&text).with_context(|| format!("decoding {}", path))
}

fn open_store(db: Option<&str>) -> Result<Arc<dyn StateStore>> {
    let store = match db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

/// Build and validate the graph, then diff it against the store. Validation
/// failures abort before anything is applied (exit code 2).
fn build_changeset(
    store: &dyn StateStore,
    resources: Vec<Resource>,
) -> Result<(DesiredGraph, Changeset)> {
    let preexisting: FxHashSet<_> =
        store.list()?.into_iter().map(|(id, _)| id).collect();
    let graph = match DesiredGraph::build(resources, &preexisting) {
        Ok(g) => g,
        Err(e) => validation_exit(e),
    };
    let stored = rekon_store::snapshot(store)?;
    let changeset = rekon_diff::compute(&graph, &stored);
    Ok((graph, changeset))
}

fn validation_exit(e: ValidationError) -> ! {
    error!(error = %e, "validation failed; nothing applied");
    eprintln!("validation error: {}", e);
    std::process::exit(2);
}

fn entry_line(entry: &ChangeEntry) -> String {
    match entry {
        ChangeEntry::Create(r) => format!("+ create {}", r.id()),
        ChangeEntry::Update { resource, changed_fields, cascade_from } => match cascade_from {
            Some(src) => format!("~ update {} (config change in {})", resource.id(), src),
            None => format!("~ update {} [{}]", resource.id(), changed_fields.join(", ")),
        },
        ChangeEntry::Delete(id) => format!("- delete {}", id),
        ChangeEntry::Unchanged(id) => format!("= unchanged {}", id),
    }
}

fn print_report(report: &ExecutionReport, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            for e in &report.entries {
                match &e.outcome {
                    Outcome::Applied => println!("applied  {} {} ({}ms)", e.verb, e.id, e.took_ms),
                    Outcome::Skipped { reason } => println!("skipped  {} {}: {}", e.verb, e.id, reason),
                    Outcome::Failed { reason, attempts } => {
                        println!("failed   {} {}: {} (attempts: {})", e.verb, e.id, reason, attempts)
                    }
                }
            }
            println!(
                "{} applied, {} skipped, {} failed in {}ms",
                report.applied(),
                report.skipped(),
                report.failed(),
                report.took_ms
            );
        }
    }
    Ok(())
}

/// Flip the returned watch to true on ctrl-c.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; letting in-flight work finish");
            let _ = tx.send(true);
        } else {
            // Keep the sender alive so receivers never see a closed channel.
            std::future::pending::<()>().await;
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;

    match cli.command {
        Commands::Diff { file } => {
            let resources = load_document(&file)?;
            let (_graph, changeset) = build_changeset(store.as_ref(), resources)?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&changeset.entries)?),
                Output::Human => {
                    for entry in &changeset.entries {
                        println!("{}", entry_line(entry));
                    }
                    let (c, u, d, n) = changeset.counts();
                    println!("{} to create, {} to update, {} to delete, {} unchanged", c, u, d, n);
                }
            }
        }
        Commands::Plan { file } => {
            let resources = load_document(&file)?;
            let (graph, changeset) = build_changeset(store.as_ref(), resources)?;
            let plan = match rekon_plan::plan(&changeset, &graph) {
                Ok(p) => p,
                Err(e) => validation_exit(e),
            };
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(plan.entries())?),
                Output::Human => {
                    if plan.is_empty() {
                        println!("nothing to do");
                    }
                    for (i, entry) in plan.entries().iter().enumerate() {
                        println!("{:>3}. {}", i + 1, entry_line(entry));
                    }
                }
            }
        }
        Commands::Apply { file, concurrency } => {
            let resources = load_document(&file)?;
            let (graph, changeset) = build_changeset(store.as_ref(), resources)?;
            let plan = match rekon_plan::plan(&changeset, &graph) {
                Ok(p) => p,
                Err(e) => validation_exit(e),
            };
            info!(entries = plan.len(), concurrency, "apply starting");
            let client = Arc::new(FakeClient::new());
            let config = ExecutorConfig { concurrency, ..Default::default() };
            let executor = Executor::new(client, store.clone(), config);
            let report = executor.execute(&plan, cancel_on_ctrl_c()).await;
            print_report(&report, cli.output)?;
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Reconcile { file, concurrency, interval_secs } => {
            let resources = load_document(&file)?;
            let preexisting: FxHashSet<_> =
                store.list()?.into_iter().map(|(id, _)| id).collect();
            let graph = match DesiredGraph::build(resources, &preexisting) {
                Ok(g) => Arc::new(g),
                Err(e) => validation_exit(e),
            };
            let client = Arc::new(FakeClient::new());
            let config = ReconcilerConfig {
                interval: Duration::from_secs(interval_secs.max(1)),
                executor: ExecutorConfig { concurrency, ..Default::default() },
            };
            let reconciler = Reconciler::new(client, store.clone(), graph, config);

            let cancel = cancel_on_ctrl_c();
            let (handle, task) = reconciler.spawn(cancel);
            let mut epochs = handle.subscribe_epoch();
            loop {
                tokio::select! {
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let report = handle.current();
                        info!(
                            epoch = *epochs.borrow(),
                            applied = report.applied(),
                            skipped = report.skipped(),
                            failed = report.failed(),
                            "cycle complete"
                        );
                        if cli.output == Output::Json {
                            println!("{}", serde_json::to_string(report.as_ref())?);
                        }
                    }
                    res = signal::ctrl_c() => {
                        res.context("waiting for interrupt")?;
                        break;
                    }
                }
            }
            let _ = task.await;
            let last = handle.current();
            if cli.output == Output::Human {
                print_report(&last, cli.output)?;
            }
            if !last.succeeded() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
