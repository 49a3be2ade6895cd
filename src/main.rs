//! pofetch - bulk purchase-order attachment retrieval over a
//! persistent browser worker pool.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pofetch_core::{BrowserLauncher, PoTask, SettlementHook, TaskPriority};
use pofetch_monitor::SystemProbe;
use pofetch_pool::PersistentWorkerPool;

mod adapters;
mod cli;
mod settings;

use adapters::{CommandLauncher, JsonlSettlement, NullLauncher, StandInDriver};
use cli::{Cli, Commands};
use settings::Settings;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing with a console layer and, when a log directory
/// is configured, a daily-rotated file layer.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(true).with_ansi(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("pofetch")
                .filename_suffix("log")
                .max_log_files(30)
                .build(dir)
                .context("building rolling log appender")?;
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            registry
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}

/// Read PO numbers from an input file: one per line, `#` starts a
/// comment, duplicates dropped.
fn read_po_numbers(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading input file {}", path.display()))?;
    let mut seen = std::collections::HashSet::new();
    let mut numbers = Vec::new();
    for line in raw.lines() {
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            numbers.push(trimmed.to_string());
        }
    }
    Ok(numbers)
}

fn parse_priority(raw: &str) -> anyhow::Result<TaskPriority> {
    match raw.to_ascii_lowercase().as_str() {
        "urgent" => Ok(TaskPriority::Urgent),
        "high" => Ok(TaskPriority::High),
        "normal" => Ok(TaskPriority::Normal),
        "low" => Ok(TaskPriority::Low),
        other => anyhow::bail!("unknown priority {other:?} (expected urgent, high, normal, low)"),
    }
}

async fn run_batch(
    settings: Settings,
    numbers: Vec<String>,
    priority: TaskPriority,
    output: Option<&Path>,
) -> anyhow::Result<i32> {
    info!("Fetching attachments for {} purchase orders", numbers.len());

    let launcher: Arc<dyn BrowserLauncher> = if settings.browser_command.is_empty() {
        warn!("No browser_command configured; running with synthetic sessions");
        Arc::new(NullLauncher::new())
    } else {
        Arc::new(CommandLauncher::new(
            settings.browser_command.clone(),
            settings.browser_args.clone(),
        ))
    };

    let results_path = output.map(Path::to_path_buf).or(settings.results_file.clone());
    let hook: Option<Arc<dyn SettlementHook>> = match &results_path {
        Some(path) => {
            let hook = JsonlSettlement::open(path)
                .with_context(|| format!("opening results file {}", path.display()))?;
            info!("Appending results to {}", path.display());
            Some(Arc::new(hook))
        }
        None => None,
    };

    let pool = PersistentWorkerPool::with_collaborators(
        settings.pool,
        Arc::new(StandInDriver),
        launcher,
        hook,
        Arc::new(SystemProbe::new()),
    )
    .await?;

    pool.initialize().await?;
    pool.start().await?;
    pool.signals()
        .install_os_handlers()
        .context("installing signal handlers")?;

    let tasks: Vec<PoTask> = numbers
        .into_iter()
        .map(|po| PoTask::new(po).with_priority(priority))
        .collect();
    let accepted = pool.add_tasks(tasks).await?;
    info!("Queued {accepted} tasks");

    let mut signals = pool.signals().subscribe();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if pool.queue().outstanding().await == 0 {
                    info!("All tasks settled");
                    break;
                }
            }
            sig = signals.recv() => {
                match sig {
                    Ok(sig) => warn!("Received {sig:?}, shutting down"),
                    Err(_) => warn!("Signal channel closed, shutting down"),
                }
                break;
            }
        }
    }

    let report = pool.shutdown(None).await;
    if !report.success {
        warn!("Shutdown finished with failed phases");
    }

    let status = pool.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(if status.failed_tasks > 0 { 1 } else { 0 })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            po_numbers,
            input,
            workers,
            priority,
            output,
        } => {
            let mut settings = Settings::load(cli.config.as_deref())?;
            if let Some(workers) = workers {
                settings.pool.worker_count = workers;
            }
            let priority = parse_priority(&priority)?;

            let mut numbers = po_numbers;
            if let Some(input) = &input {
                numbers.extend(read_po_numbers(input)?);
            }
            let mut seen = std::collections::HashSet::new();
            numbers.retain(|n| seen.insert(n.clone()));
            if numbers.is_empty() {
                anyhow::bail!("no PO numbers given (pass them as arguments or via --input)");
            }

            init_tracing(settings.log_dir.as_deref())?;
            let code = run_batch(settings, numbers, priority, output.as_deref()).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::PrintConfig => {
            let rendered = toml::to_string_pretty(&Settings::default())?;
            print!("{rendered}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_po_numbers_skips_comments_and_dupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.txt");
        std::fs::write(
            &path,
            "PO-1\n# a comment\nPO-2  # trailing comment\n\nPO-1\n",
        )
        .unwrap();
        let numbers = read_po_numbers(&path).unwrap();
        assert_eq!(numbers, vec!["PO-1", "PO-2"]);
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!(parse_priority("Urgent").unwrap(), TaskPriority::Urgent);
        assert_eq!(parse_priority("low").unwrap(), TaskPriority::Low);
        assert!(parse_priority("asap").is_err());
    }
}
