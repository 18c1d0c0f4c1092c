//! converge — consolidation engine for interview-extracted entity records.
//! Deduplicates, merges, scores, and cross-references; commits each run as
//! one transaction with a full audit trail.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use converge::config::EngineConfig;
use converge::consolidate::ConsolidationAgent;
use converge::embed::{Embedder, EmbeddingProvider, HttpEmbeddingProvider};
use converge::entity::EntityKind;
use converge::store::SqliteStore;
use converge::SharedStore;

#[derive(Parser)]
#[command(name = "converge", version, about = "Entity consolidation engine")]
struct Args {
    /// SQLite database path
    #[arg(short, long, default_value = "converge.db", env = "CONVERGE_DB")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run consolidation over all kinds, or a subset via --kind
    Run {
        /// Restrict the run to specific kinds (repeatable)
        #[arg(short, long)]
        kind: Vec<String>,
    },
    /// Restore a committed run's before-snapshots and mark it reversed
    Rollback {
        /// Run identifier from a previous consolidation report
        run_id: String,
    },
    /// Print undispatched change events from the outbox
    Events {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let store: SharedStore = Arc::new(SqliteStore::open(&args.db).expect("failed to open database"));

    match args.command {
        Command::Run { kind } => {
            let kinds: Vec<EntityKind> = if kind.is_empty() {
                EntityKind::ALL.to_vec()
            } else {
                kind.iter()
                    .map(|k| k.parse().expect("unknown entity kind"))
                    .collect()
            };

            let cfg = EngineConfig::from_env();
            let provider = HttpEmbeddingProvider::from_env()
                .map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>);
            if provider.is_none() {
                info!("CONVERGE_EMBED_URL not set — semantic similarity disabled");
            }
            let embedder = Arc::new(Embedder::new(
                provider,
                store.clone(),
                cfg.retry.clone(),
                cfg.breaker.clone(),
                cfg.embed_cache_capacity,
            ));

            let agent = ConsolidationAgent::new(store, embedder, cfg);
            let report = agent.run(&kinds).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).expect("report serialization")
            );
            if report.error.is_some() {
                std::process::exit(1);
            }
        }
        Command::Rollback { run_id } => {
            let restored = store.rollback_run(&run_id).expect("rollback failed");
            info!(run_id = %run_id, restored, "rollback complete");
        }
        Command::Events { limit } => {
            let events = store.pending_events(limit).expect("outbox query failed");
            for event in events {
                println!(
                    "{}",
                    serde_json::to_string(&event).expect("event serialization")
                );
            }
        }
    }
}
