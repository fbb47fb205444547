use crate::models::dry_run_mode::DryRunMode;
use crate::models::error::{BackupError, Result};
use crate::models::manifest::SelectionManifest;
use crate::repo::sqlite::Ledger;
use crate::service::downloader::Downloader;
use crate::service::metadata::MetadataSource;
use crate::service::recorder::OutcomeRecorder;
use crate::service::selector::select;
use crate::service::sync::sync_projects;
use crate::utils::progress::{create_progress_bar, create_spinner};
use chrono::Utc;
use indicatif::MultiProgress;
use log::{error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Everything a single run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub project_ids: Vec<String>,
    pub request_delay: Duration,
    pub download_workers: usize,
    pub manifest_file: Option<PathBuf>,
    pub dry_run_mode: DryRunMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub file_key: String,
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedFile>,
}

impl RunReport {
    fn empty(run_id: Uuid, selected: usize) -> Self {
        Self {
            run_id,
            selected,
            succeeded: 0,
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sync the given projects and select this run's files. Writes the manifest
/// to `manifest_file` when one is given.
pub fn prepare_manifest<S: MetadataSource + ?Sized>(
    ledger: &Ledger,
    source: &S,
    plan: &RunPlan,
    progress: Option<&MultiProgress>,
) -> Result<SelectionManifest> {
    let spinner = progress.map(|mp| {
        mp.add(create_spinner(&format!(
            "{}[1/2] Fetching file metadata...",
            plan.dry_run_mode.progress_prefix()
        )))
    });

    let fetched = sync_projects(
        ledger,
        source,
        &plan.project_ids,
        plan.request_delay,
        spinner.as_ref(),
    )?;
    let manifest = select(ledger, &fetched, Utc::now())?;

    if let Some(spinner) = spinner {
        spinner.finish_with_message(format!(
            "{}[1/2] Selected {} of {} files",
            plan.dry_run_mode.progress_prefix(),
            manifest.len(),
            fetched.iter().map(|p| p.files.len()).sum::<usize>()
        ));
    }

    if let Some(path) = &plan.manifest_file {
        manifest.save(path)?;
        info!("Wrote selection manifest to {}", path.display());
    }

    Ok(manifest)
}

/// Download every manifest entry on a pool of `workers` threads and record
/// each outcome as it arrives.
///
/// Per-file failures are collected in the report. A ledger error is fatal:
/// entries not yet started are skipped, and the first such error is returned
/// once the downloads already running have finished.
pub fn execute_manifest<D: Downloader + ?Sized>(
    ledger: &Ledger,
    downloader: &D,
    manifest: &SelectionManifest,
    workers: usize,
    progress: Option<&MultiProgress>,
) -> Result<RunReport> {
    let mut report = RunReport::empty(manifest.run_id, manifest.len());
    if manifest.is_empty() {
        info!("Nothing to back up");
        return Ok(report);
    }

    let entries = manifest.entries();
    let bar = progress.map(|mp| mp.add(create_progress_bar(entries.len() as u64, "[2/2] Downloading")));
    let recorder = OutcomeRecorder::new(ledger);
    let aborted = AtomicBool::new(false);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;

    let outcomes: Vec<_> = pool.install(|| {
        entries
            .par_iter()
            .filter_map(|(project, file)| {
                if aborted.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(bar) = &bar {
                    bar.set_message(file.name.clone());
                }
                let outcome = downloader
                    .download(project, file)
                    .map_err(|e| e.to_string());
                let result = recorder.record(&file.key, Utc::now(), outcome);
                if matches!(&result, Err(e) if !e.is_file_level()) {
                    aborted.store(true, Ordering::SeqCst);
                }
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                Some((*file, result))
            })
            .collect()
    });

    if let Some(bar) = bar {
        bar.finish_with_message("done");
    }

    let mut fatal: Option<BackupError> = None;
    for (file, result) in outcomes {
        match result {
            Ok(()) => report.succeeded += 1,
            Err(e) if e.is_file_level() => {
                error!("{} ({}): {}", file.name, file.key, e);
                report.failed.push(FailedFile {
                    file_key: file.key.clone(),
                    file_name: file.name.clone(),
                    reason: failure_reason(e),
                });
            }
            Err(other) => {
                error!("Ledger error while recording {}: {}", file.key, other);
                fatal.get_or_insert(other);
            }
        }
    }

    if let Some(error) = fatal {
        return Err(error);
    }

    info!(
        "Run {} finished: {} succeeded, {} failed",
        report.run_id,
        report.succeeded,
        report.failed.len()
    );
    Ok(report)
}

fn failure_reason(error: BackupError) -> String {
    match error {
        BackupError::BackupFailure { reason, .. } => reason,
        other => other.to_string(),
    }
}

/// Sync, select and, unless dry-running, download.
pub fn run_backup<S: MetadataSource + ?Sized, D: Downloader + ?Sized>(
    ledger: &Ledger,
    source: &S,
    downloader: &D,
    plan: &RunPlan,
    progress: Option<&MultiProgress>,
) -> Result<(SelectionManifest, RunReport)> {
    let manifest = prepare_manifest(ledger, source, plan, progress)?;

    if !plan.dry_run_mode.should_download() {
        info!(
            "DRY RUN - {} files would be downloaded, ledger backup state untouched",
            manifest.len()
        );
        let report = RunReport::empty(manifest.run_id, manifest.len());
        return Ok((manifest, report));
    }

    let report = execute_manifest(ledger, downloader, &manifest, plan.download_workers, progress)?;
    if !report.is_success() {
        warn!(
            "{} of {} files failed and will be retried after the backoff window",
            report.failed.len(),
            report.selected
        );
    }
    Ok((manifest, report))
}
