//! docket: command-line front end for lifecycle resolution and batch runs.
//!
//! `resolve` paints every document of a catalog snapshot with its lifecycle
//! state. `simulate` runs the batch scheduler end-to-end against the
//! in-memory mock services.

mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_core::{plan_refresh, reconcile, ResolverConfig, StatusSummary, TaggingTracking};
use docket_jobs::mock::{InMemoryCandidates, MockJobService};
use docket_jobs::{
    AbnormalReason, BatchScheduler, JobKind, JobTracker, SchedulerConfig, TrackerConfig,
    TrackerExecutor,
};

use crate::snapshot::CatalogSnapshot;

#[derive(Parser, Debug)]
#[command(name = "docket")]
#[command(author, version, about = "Document lifecycle resolution and job orchestration")]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the lifecycle state of every document in a catalog snapshot
    Resolve {
        /// Catalog snapshot file (JSON)
        #[arg(short, long)]
        catalog: PathBuf,

        /// Override the tag dictionary timestamp recorded in the snapshot (RFC 3339)
        #[arg(long)]
        tag_dictionary_updated_at: Option<DateTime<Utc>>,

        /// Report tagging sub-states (overrides DOCKET_TAGGING_TRACKED)
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        tagging_tracked: Option<bool>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the batch scheduler against simulated documents
    Simulate {
        /// Documents in the candidate pool
        #[arg(long, default_value_t = 40)]
        documents: usize,

        /// Documents flagged abnormal at the start
        #[arg(long, default_value_t = 8)]
        abnormal: usize,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        abnormal_slots: Option<usize>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Early-termination threshold in percent
        #[arg(long)]
        threshold: Option<f64>,

        /// Poll interval of the simulated jobs
        #[arg(long, default_value_t = 50)]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Resolve {
            catalog,
            tag_dictionary_updated_at,
            tagging_tracked,
            json,
        } => cmd_resolve(catalog, tag_dictionary_updated_at, tagging_tracked, json).await,
        Commands::Simulate {
            documents,
            abnormal,
            batch_size,
            abnormal_slots,
            max_iterations,
            threshold,
            poll_interval_ms,
        } => {
            let mut config = SchedulerConfig::from_env()?;
            if let Some(size) = batch_size {
                config.set_batch_size(size)?;
            }
            if let Some(slots) = abnormal_slots {
                config.set_abnormal_slots(slots)?;
            }
            if let Some(max) = max_iterations {
                config.set_max_iterations(max)?;
            }
            if let Some(pct) = threshold {
                config.set_abnormal_doc_threshold_pct(pct)?;
            }
            cmd_simulate(documents, abnormal, config, poll_interval_ms).await
        }
    }
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   RUST_LOG    - standard env filter (default: "docket=info", or debug with --verbose)
fn init_tracing(verbose: bool) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    // target prefix match covers docket_core, docket_jobs and docket_cli
    let default_filter = if verbose { "docket=debug" } else { "docket=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn cmd_resolve(
    path: PathBuf,
    tag_dictionary_updated_at: Option<DateTime<Utc>>,
    tagging_tracked: Option<bool>,
    json: bool,
) -> anyhow::Result<()> {
    let snapshot = CatalogSnapshot::load(&path)
        .with_context(|| format!("reading catalog snapshot {}", path.display()))?
        .with_tag_dictionary_updated_at(tag_dictionary_updated_at);

    let mut config = ResolverConfig::from_env();
    if let Some(tracked) = tagging_tracked {
        config = config.with_tagging(if tracked {
            TaggingTracking::Tracked
        } else {
            TaggingTracking::Untracked
        });
    }

    let statuses = reconcile(&snapshot, &snapshot, &snapshot.signals, &config).await?;
    let summary = StatusSummary::from_statuses(&statuses);
    let refresh = plan_refresh(&statuses);
    info!(documents = statuses.len(), refresh = refresh.len(), "Resolved catalog");

    if json {
        let out = serde_json::json!({
            "documents": statuses,
            "summary": summary,
            "refresh": refresh,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for status in &statuses {
        let r = &status.resolution;
        let mut line = format!("{:<32} {}", status.document_id, r.state);
        if let Some(progress) = r.progress {
            line.push_str(&format!(" ({progress}%)"));
        }
        if let Some(error) = &r.error {
            line.push_str(&format!("  last error: {error}"));
        }
        println!("{line}");
    }
    println!();
    for (state, count) in summary.iter() {
        println!("{:<20} {count}", state.label());
    }
    println!("{:<20} {}", "Total", summary.total());
    if !refresh.is_empty() {
        println!();
        println!("{} document(s) need a refresh:", refresh.len());
        for item in &refresh {
            println!("  {:<32} {} ({})", item.document_id, item.kind, item.reason);
        }
    }
    Ok(())
}

async fn cmd_simulate(
    documents: usize,
    abnormal: usize,
    config: SchedulerConfig,
    poll_interval_ms: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        abnormal <= documents,
        "--abnormal ({abnormal}) cannot exceed --documents ({documents})"
    );

    let ids: Vec<String> = (1..=documents).map(|i| format!("doc-{i:04}")).collect();
    let candidates = InMemoryCandidates::new(ids.clone());
    let reasons = [
        AbnormalReason::UnderAnnotated,
        AbnormalReason::OverAnnotated,
        AbnormalReason::Indistinguishable,
        AbnormalReason::ColdStart,
    ];
    for (i, id) in ids.iter().take(abnormal).enumerate() {
        candidates.flag(id.clone(), reasons[i % reasons.len()]);
    }

    // a finished tagging job clears the document's abnormal flag
    let resolver = candidates.clone();
    let service = MockJobService::new().with_completion_hook(move |document_id, _| {
        resolver.resolve(document_id);
    });

    let tracker = JobTracker::new(
        Arc::new(service),
        TrackerConfig::from_env().with_poll_interval(poll_interval_ms),
    );
    let executor = TrackerExecutor::new(tracker.clone(), JobKind::Tagging);
    let scheduler = BatchScheduler::new(config, Arc::new(candidates), Arc::new(executor));

    scheduler.on_round_complete(|round| {
        println!(
            "round {:>2}: {} abnormal / {} normal (slots {}+{}), pool abnormal {:.1}%",
            round.iteration,
            round.selected_abnormal_count,
            round.selected_normal_count,
            round.abnormal_slots,
            round.normal_slots,
            round.pool_abnormal_ratio * 100.0,
        );
    });

    let run = scheduler.run();
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling current round");
            scheduler.cancel();
            run.await
        }
    };
    tracker.shutdown();

    let summary = result?;
    println!(
        "stopped after {} round(s): {}",
        summary.rounds.len(),
        summary.reason
    );
    Ok(())
}
