use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod args;
mod config;
mod copier;
mod duplicate;
mod error;
mod filter;
mod inventory;
mod model;
mod orchestrator;
mod progress;
mod reconcile;
mod report;
mod retry;
mod segment;
mod staging;
mod store;

use args::{Args, Command};
use config::{MigrationConfig, RegionSpec};
use copier::CopySettings;
use duplicate::DuplicateDetector;
use inventory::InventoryScanner;
use orchestrator::{MigrationContext, Orchestrator, RunMode};
use progress::ProgressBoard;
use reconcile::Reconciler;
use store::s3::S3Store;
use store::{ObjectStore, RegionStore};

fn setup_tracing(log_level: &str) {
    // RUST_LOG wins over the CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'warn'", log_level);
            EnvFilter::new("warn")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn connect_regions(
    config: &MigrationConfig,
    specs: Vec<RegionSpec>,
    profile: Option<&str>,
) -> Vec<RegionStore> {
    let mut regions = Vec::with_capacity(specs.len());
    for spec in specs {
        let store = S3Store::connect(config.store(Some(spec.endpoint.as_str()), &spec.name, profile)).await;
        regions.push(RegionStore {
            name: spec.name,
            suffix: spec.suffix,
            store: Arc::new(store),
        });
    }
    regions
}

fn write_report<T: serde::Serialize>(config: &MigrationConfig, value: &T) -> Result<()> {
    if let Some(path) = &config.json_report {
        report::write_json(path, value)?;
        if !config.quiet {
            println!("📄 Report written to {}", path.display());
        }
    }
    Ok(())
}

async fn run_orchestrated(
    config: &MigrationConfig,
    context: MigrationContext,
    mode: RunMode,
    top_n: usize,
) -> Result<bool> {
    let tenants = InventoryScanner::new(context.source.as_ref(), &context.filter)
        .tenants()
        .await
        .context("Failed to list tenants at the source")?;
    if !config.quiet {
        println!(
            "🚀 {} tenant(s) across {} worker(s)",
            tenants.len(),
            config.concurrency.min(tenants.len().max(1))
        );
    }

    let orchestrator = Orchestrator::new(context, config.concurrency, ProgressBoard::new(config.quiet));
    let run = orchestrator.run(tenants, mode).await;

    if !config.quiet {
        println!("{}", run.render(top_n, config.verbose));
    }
    write_report(config, &run)?;
    Ok(run.has_failures())
}

async fn run(args: Args) -> Result<bool> {
    let config = MigrationConfig::from_args(&args.common)?;
    let retry = config.retry_policy();

    match args.command {
        Command::Stat { source, top_n } => {
            let store = S3Store::connect(config.store(
                source.source_endpoint.as_deref(),
                &source.source_region,
                source.source_profile.as_deref(),
            ))
            .await;
            let context = MigrationContext {
                source: Arc::new(store),
                destination: None,
                filter: config.filter.clone(),
                settings: CopySettings {
                    retry,
                    region: source.source_region.clone(),
                    ..CopySettings::default()
                },
                staging_dir: std::env::temp_dir(),
                staging_quota: None,
                verbose: config.verbose,
            };
            run_orchestrated(&config, context, RunMode::Stat, top_n).await
        }

        Command::Copy {
            source,
            destination,
            transfer,
        } => {
            let settings = config::copy_settings(&transfer, &source.source_region, retry)?;
            let staging_quota = config::staging_quota(&transfer)?;
            let staging_dir = config::staging_dir(transfer.staging_dir.clone())?;
            info!(
                staging_dir = %staging_dir.display(),
                staging_quota = ?staging_quota,
                "staging area ready"
            );

            let source_store = S3Store::connect(config.store(
                source.source_endpoint.as_deref(),
                &source.source_region,
                source.source_profile.as_deref(),
            ))
            .await;
            let destination_store = S3Store::connect(config.store(
                destination.dest_endpoint.as_deref(),
                &destination.dest_region,
                destination.dest_profile.as_deref(),
            ))
            .await;

            let context = MigrationContext {
                source: Arc::new(source_store),
                destination: Some(Arc::new(destination_store) as Arc<dyn ObjectStore>),
                filter: config.filter.clone(),
                settings,
                staging_dir,
                staging_quota,
                verbose: config.verbose,
            };
            run_orchestrated(&config, context, RunMode::Copy, inventory::DEFAULT_TOP_N).await
        }

        Command::CheckDuplicate {
            regions,
            suffixes,
            source_profile,
            action,
        } => {
            let specs = config::region_specs(&regions, &suffixes)?;
            let regions = connect_regions(&config, specs, source_profile.as_deref()).await;

            let detector = DuplicateDetector::new(&regions, &config.filter);
            let tenants = detector
                .tenants()
                .await
                .context("Failed to list tenants across regions")?;
            let result = detector.run(&tenants, action).await;

            if !config.quiet {
                println!("{}", report::render_duplicates(&result));
            }
            write_report(&config, &result)?;
            Ok(!result.is_clean())
        }

        Command::CheckDeleted {
            regions,
            source_profile,
            destination,
            action,
        } => {
            let specs = config::region_specs(&regions, &[])?;
            let sources = connect_regions(&config, specs, source_profile.as_deref()).await;
            let destination_store = S3Store::connect(config.store(
                destination.dest_endpoint.as_deref(),
                &destination.dest_region,
                destination.dest_profile.as_deref(),
            ))
            .await;

            let reconciler = Reconciler::new(&sources, &destination_store, &config.filter);
            let tenants = reconciler
                .tenants()
                .await
                .context("Failed to list tenants at the destination")?;
            let result = reconciler.run(&tenants, action).await;

            if !config.quiet {
                println!("{}", report::render_reconcile(&result));
            }
            write_report(&config, &result)?;
            Ok(!result.failures.is_empty())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    setup_tracing(&args.common.log_level);
    let quiet = args.common.quiet;

    match run(args).await {
        Ok(false) => {
            if !quiet {
                println!("\n🎉 Completed without failures");
            }
            Ok(())
        }
        Ok(true) => Err(anyhow!("completed with failures, see the summary above")),
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            Err(e)
        }
    }
}
