mod models;
mod repo;
mod service;
mod utils;

use crate::models::config::{setup_config, Config, ConfigOverrides};
use crate::models::dry_run_mode::DryRunMode;
use crate::models::manifest::SelectionManifest;
use crate::repo::sqlite::Ledger;
use crate::service::backup::{execute_manifest, prepare_manifest, run_backup, RunPlan, RunReport};
use crate::service::downloader::CommandDownloader;
use crate::service::metadata::FigmaClient;
use crate::service::recorder::OutcomeRecorder;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use log::{debug, info, warn};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Parser)]
#[command(name = "figma-backup")]
#[command(about = "Scheduled backups of Figma design files", long_about = None)]
struct Cli {
    #[arg(
        short = 'c',
        long = "config",
        default_value = DEFAULT_CONFIG_FILE,
        env = "FIGMA_BACKUP_CONFIG",
        global = true
    )]
    config_file: String,

    #[arg(
        short = 'l',
        long = "log-level",
        default_value = "info",
        env = "LOG_LEVEL",
        global = true
    )]
    log_level: String,

    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    /// Pause between Figma API requests, in milliseconds
    #[arg(long = "request-delay-ms", env = "FIGMA_API_REQUEST_DELAY_MS", global = true)]
    request_delay_ms: Option<u64>,

    /// Figma personal access token
    #[arg(long = "token", env = "FIGMA_ACCESS_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Sync metadata, select due files and download them (default)
    Run {
        /// Figma project ids; defaults to project_ids from the config file
        project_ids: Vec<String>,

        /// Select files without downloading or touching backup state
        #[arg(short = 'd', long = "dry-run")]
        dry_run: bool,

        /// Run once even if a schedule is configured
        #[arg(short = 'o', long = "once")]
        once: bool,
    },
    /// Sync metadata and write the selection manifest without downloading
    Select {
        project_ids: Vec<String>,

        /// Manifest path; stdout when omitted and no manifest_file is configured
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Download the files listed in a saved selection manifest
    Download {
        #[arg(short = 'm', long = "manifest")]
        manifest: PathBuf,
    },
    /// Record the outcome of a download done outside this tool
    Record {
        file_key: String,

        /// Record a failure (starts the 72 hour backoff) instead of a success
        #[arg(long = "failed")]
        failed: bool,

        #[arg(long = "reason", default_value = "reported by external downloader")]
        reason: String,
    },
    /// Show ledger counts
    Status,
    /// Validate the configuration and exit
    Validate,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    let config_optional = args.config_file == DEFAULT_CONFIG_FILE;
    let overrides = ConfigOverrides {
        request_delay_ms: args.request_delay_ms,
        api_token: args.token.clone(),
    };
    let config: Config = setup_config(args.config_file.clone(), config_optional, overrides)
        .context("Failed to load configuration")?;
    // Serialized form skips api_token
    debug!(
        "Loaded config: {}",
        serde_json::to_string(&config).unwrap_or_default()
    );

    let command = args.command.unwrap_or(Command::Run {
        project_ids: Vec::new(),
        dry_run: false,
        once: false,
    });

    match command {
        Command::Validate => {
            info!("Configuration is valid.");
            Ok(())
        }
        Command::Status => with_ledger(&config, print_status),
        Command::Record {
            file_key,
            failed,
            reason,
        } => with_ledger(&config, |ledger| {
            let outcome = if failed { Err(reason) } else { Ok(()) };
            record_outcome(ledger, &file_key, outcome, Utc::now())
        }),
        Command::Select {
            project_ids,
            output,
        } => {
            let mut plan = build_plan(&config, &project_ids, DryRunMode::Preview)?;
            if output.is_some() {
                plan.manifest_file = output;
            }
            let source = figma_client(&config)?;
            let progress = multi_progress(args.quiet);
            let manifest = with_ledger(&config, |ledger| {
                Ok(prepare_manifest(ledger, &source, &plan, progress.as_ref())?)
            })?;
            if plan.manifest_file.is_none() {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            }
            Ok(())
        }
        Command::Download { manifest } => {
            let manifest = SelectionManifest::load(&manifest)
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
            let downloader = command_downloader(&config)?;
            let progress = multi_progress(args.quiet);
            let report = with_ledger(&config, |ledger| {
                Ok(execute_manifest(
                    ledger,
                    &downloader,
                    &manifest,
                    config.download_workers,
                    progress.as_ref(),
                )?)
            })?;
            check_report(&report)
        }
        Command::Run {
            project_ids,
            dry_run,
            once,
        } => {
            let plan = build_plan(&config, &project_ids, DryRunMode::from_flag(dry_run))?;
            let run_once = once || config.schedule.is_none();
            if run_once {
                run_once_with_ledger(&config, &plan, args.quiet)
            } else {
                run_scheduled(&config, &plan, args.quiet)
            }
        }
    }
}

fn build_plan(config: &Config, cli_project_ids: &[String], dry_run_mode: DryRunMode) -> Result<RunPlan> {
    Ok(RunPlan {
        project_ids: config.resolve_project_ids(cli_project_ids)?,
        request_delay: config.request_delay(),
        download_workers: config.download_workers,
        manifest_file: config.manifest_file(),
        dry_run_mode,
    })
}

fn figma_client(config: &Config) -> Result<FigmaClient> {
    Ok(FigmaClient::new(
        &config.api_base_url,
        config.require_api_token()?,
        config.team_id.clone(),
    )?)
}

fn command_downloader(config: &Config) -> Result<CommandDownloader> {
    Ok(CommandDownloader::new(
        &config.download_command,
        config.download_path(),
    )?)
}

fn multi_progress(quiet: bool) -> Option<MultiProgress> {
    if !quiet {
        Some(MultiProgress::new())
    } else {
        None
    }
}

/// Open the ledger, run `f`, and close the ledger whether or not `f` failed.
fn with_ledger<T>(config: &Config, f: impl FnOnce(&Ledger) -> Result<T>) -> Result<T> {
    let ledger = Ledger::open(&config.database_file).context("Failed to open backup ledger")?;
    let result = f(&ledger);
    match (result, ledger.close()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_error)) => Err(close_error).context("Failed to close backup ledger"),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(close_error)) => {
            warn!("Failed to close backup ledger: {}", close_error);
            Err(error)
        }
    }
}

/// Apply one downloader outcome by hand. The file has to be known to the
/// ledger, so a mistyped key fails instead of being silently ignored.
fn record_outcome(
    ledger: &Ledger,
    file_key: &str,
    outcome: std::result::Result<(), String>,
    now: DateTime<Utc>,
) -> Result<()> {
    if ledger.get(file_key)?.is_none() {
        bail!(
            "No ledger record for file {}; run a sync of its project first",
            file_key
        );
    }

    let result = OutcomeRecorder::new(ledger).record(file_key, now, outcome);
    if let Ok(Some(record)) = ledger.get(file_key) {
        info!(
            "{} ({}) is now {:?}",
            record.file_name,
            file_key,
            record.state(now)
        );
    }
    Ok(result?)
}

fn print_status(ledger: &Ledger) -> Result<()> {
    let summary = ledger.summary(Utc::now())?;
    println!("Ledger:          {}", ledger.path());
    println!("Files tracked:   {}", summary.total);
    println!("Never backed up: {}", summary.never_backed_up);
    println!("Due now:         {}", summary.due);
    println!("In backoff:      {}", summary.in_backoff);
    Ok(())
}

fn run_once_with_ledger(config: &Config, plan: &RunPlan, quiet: bool) -> Result<()> {
    let source = figma_client(config)?;
    let progress = multi_progress(quiet);

    // A dry run never reaches the downloader, so it need not be configured
    if plan.dry_run_mode.is_dry_run() {
        let manifest = with_ledger(config, |ledger| {
            Ok(prepare_manifest(ledger, &source, plan, progress.as_ref())
                .context("Dry run failed")?)
        })?;
        for (project, file) in manifest.entries() {
            println!("{} / {} ({})", project.name, file.name, file.key);
        }
        info!("DRY RUN completed - {} files would be downloaded", manifest.len());
        return Ok(());
    }

    let downloader = command_downloader(config)?;
    let (_, report) = with_ledger(config, |ledger| {
        Ok(run_backup(ledger, &source, &downloader, plan, progress.as_ref())
            .context("Backup run failed")?)
    })?;

    check_report(&report)
}

fn check_report(report: &RunReport) -> Result<()> {
    if report.is_success() {
        info!(
            "Backup completed successfully - {} of {} files",
            report.succeeded, report.selected
        );
        return Ok(());
    }
    for failed in &report.failed {
        warn!("Failed: {} ({}): {}", failed.file_name, failed.file_key, failed.reason);
    }
    bail!(
        "{} of {} files failed to back up",
        report.failed.len(),
        report.selected
    )
}

fn run_scheduled(config: &Config, plan: &RunPlan, quiet: bool) -> Result<()> {
    use cron::Schedule;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let schedule_str = config
        .schedule
        .as_deref()
        .context("Scheduled mode needs a schedule")?;
    let schedule = Schedule::from_str(schedule_str).context("Invalid cron expression")?;

    info!(
        "Starting scheduled backup mode with schedule: {}",
        schedule_str
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping scheduler...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    if config.run_on_startup {
        info!("Running initial backup on startup...");
        if let Err(e) = run_once_with_ledger(config, plan, quiet) {
            warn!("Initial backup failed: {:#}", e);
        }
    }

    while running.load(Ordering::SeqCst) {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("No upcoming scheduled times found");
            break;
        };

        info!(
            "Next backup scheduled for: {}",
            next.format("%Y-%m-%d %H:%M:%S %Z")
        );

        // Wake every second so Ctrl+C is noticed between runs
        while running.load(Ordering::SeqCst) && Utc::now() < next {
            let remaining = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            std::thread::sleep(remaining.min(std::time::Duration::from_secs(1)));
        }

        if running.load(Ordering::SeqCst) {
            info!("Running scheduled backup...");
            if let Err(e) = run_once_with_ledger(config, plan, quiet) {
                warn!("Scheduled backup failed: {:#}", e);
            }
        }
    }

    info!("Scheduler stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_record::BackupState;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["figma-backup"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_takes_project_ids_and_flags() {
        let cli = Cli::try_parse_from(["figma-backup", "run", "--dry-run", "100", "200"]).unwrap();
        match cli.command {
            Some(Command::Run {
                project_ids,
                dry_run,
                once,
            }) => {
                assert_eq!(project_ids, vec!["100", "200"]);
                assert!(dry_run);
                assert!(!once);
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_record_failure_with_reason() {
        let cli = Cli::try_parse_from([
            "figma-backup",
            "record",
            "aBcD123",
            "--failed",
            "--reason",
            "Save As menu item not found",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Record {
                file_key,
                failed,
                reason,
            }) => {
                assert_eq!(file_key, "aBcD123");
                assert!(failed);
                assert_eq!(reason, "Save As menu item not found");
            }
            _ => panic!("Expected record command"),
        }
    }

    #[test]
    fn test_global_request_delay_after_subcommand() {
        let cli = Cli::try_parse_from(["figma-backup", "select", "--request-delay-ms", "500", "7"])
            .unwrap();
        assert_eq!(cli.request_delay_ms, Some(500));
    }

    #[test]
    fn test_record_outcome_rejects_unknown_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.db").to_str().unwrap()).unwrap();

        let result = record_outcome(&ledger, "typo", Ok(()), Utc::now());

        assert!(result.unwrap_err().to_string().contains("typo"));
        assert!(ledger.get("typo").unwrap().is_none());
    }

    #[test]
    fn test_record_outcome_failure_starts_backoff() {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
        let now = Utc::now();
        ledger.upsert("a", now, "P", "A").unwrap();

        let result = record_outcome(&ledger, "a", Err("no Save As".to_string()), now);

        assert!(result.is_err());
        let record = ledger.get("a").unwrap().unwrap();
        assert_eq!(record.state(now), BackupState::Backoff);

        record_outcome(&ledger, "a", Ok(()), now).unwrap();
        let record = ledger.get("a").unwrap().unwrap();
        assert_eq!(record.state(now), BackupState::Current);
    }

    #[test]
    fn test_with_ledger_closes_after_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            database_file: dir.path().join("ledger.db").to_str().unwrap().to_string(),
            ..Config::default()
        };

        let result: Result<()> = with_ledger(&config, |ledger| {
            ledger.upsert("a", Utc::now(), "P", "A")?;
            bail!("downloader blew up")
        });
        assert!(result.is_err());

        let kept = with_ledger(&config, |ledger| Ok(ledger.get("a")?.is_some())).unwrap();
        assert!(kept);
    }
}
