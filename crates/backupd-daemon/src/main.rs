use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backupd_core::config::BackupdConfig;
use backupd_pipeline::{build_sink, BackupPipeline};
use backupd_scheduler::{parse_time_zone, ProfileRegistry};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use tracing::info;

mod reload;
mod worker;

use reload::{ConfigWatcher, Fingerprint};
use worker::Worker;

#[derive(Parser)]
#[command(name = "backupd", version, about = "Scheduled directory backups")]
struct Cli {
    /// Configuration file [default: ~/.backupd/backupd.toml]
    #[arg(short, long, env = "BACKUPD_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the daemon until interrupted (default)
    Run,
    /// Validate every profile and print its next run
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backupd=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = BackupdConfig::resolve_path(cli.config.as_deref());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            // Taken before the load so an edit racing it still counts as a change.
            let baseline = Fingerprint::of(&config_path);
            let config = load_config(cli.config.as_deref(), &config_path)?;
            run(config, config_path, baseline).await
        }
        Command::Check => {
            let config = load_config(cli.config.as_deref(), &config_path)?;
            check(&config)
        }
    }
}

/// A file that does not parse is fatal at startup: the output sink is fixed
/// for the life of the process and must come from the operator's file.
fn load_config(explicit: Option<&str>, resolved: &Path) -> anyhow::Result<BackupdConfig> {
    BackupdConfig::load(explicit).with_context(|| format!("loading {}", resolved.display()))
}

async fn run(
    config: BackupdConfig,
    config_path: PathBuf,
    baseline: Option<Fingerprint>,
) -> anyhow::Result<()> {
    let time_zone = parse_time_zone(&config.scheduler.time_zone)?;
    let sink = build_sink(&config.output)?;
    let pipeline = Arc::new(BackupPipeline::new(sink, config.archive.compression_level));

    let registry = Arc::new(ProfileRegistry::new(time_zone));
    let report = registry.apply_configuration(&config.profiles);
    info!(
        profiles = registry.len(),
        rejected = report.rejected.len(),
        sink = pipeline.sink_name(),
        time_zone = %time_zone,
        "backupd starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let watcher = ConfigWatcher::new(config_path, Arc::clone(&registry), &config, baseline);
    let watcher_task = tokio::spawn(watcher.run(shutdown_rx.clone()));

    let tick = Duration::from_millis(config.scheduler.tick_interval_ms.max(1));
    let worker = Worker::new(Arc::clone(&registry), pipeline, tick);
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");

    let _ = shutdown_tx.send(true);
    watcher_task.await?;
    worker_task.await?;
    info!("backupd stopped");
    Ok(())
}

fn check(config: &BackupdConfig) -> anyhow::Result<()> {
    let time_zone = parse_time_zone(&config.scheduler.time_zone)?;
    let sink = build_sink(&config.output)?;
    println!("output: {}", sink.name());

    let summary = summarize(config, time_zone, Utc::now());
    for line in &summary.lines {
        println!("{line}");
    }
    if summary.rejected > 0 {
        anyhow::bail!("{} profile(s) rejected", summary.rejected);
    }
    Ok(())
}

struct CheckSummary {
    lines: Vec<String>,
    rejected: usize,
}

/// Bind the configured profiles the same way the daemon would and describe
/// each one.
fn summarize(config: &BackupdConfig, time_zone: Tz, now: DateTime<Utc>) -> CheckSummary {
    let registry = ProfileRegistry::new(time_zone);
    let report = registry.apply_configuration(&config.profiles);

    let next: std::collections::HashMap<String, DateTime<Utc>> = registry
        .get_invocations(now)
        .into_iter()
        .map(|i| (i.profile_id, i.invoke_at))
        .collect();

    let mut lines: Vec<String> = registry
        .profile_ids()
        .into_iter()
        .map(|id| match next.get(&id) {
            Some(at) => format!("ok       {id:<24} next {}", at.to_rfc3339()),
            None => format!("ok       {id:<24} no future occurrence"),
        })
        .collect();
    lines.extend(
        report
            .rejected
            .iter()
            .map(|r| format!("rejected {:<24} {}", r.profile_id, r.error)),
    );

    CheckSummary {
        lines,
        rejected: report.rejected.len(),
    }
}
