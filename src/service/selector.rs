use crate::models::backup_record::{BackupRecord, BackupState};
use crate::models::error::Result;
use crate::models::manifest::{ManifestFile, ManifestProject, SelectionManifest};
use crate::models::project_files::{ProjectFiles, RemoteFile};
use crate::repo::sqlite::Ledger;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;

/// Hard cap on files handed to the downloader in one run.
pub const MAX_FILES_PER_RUN: usize = 45;

/// Pick the files to back up this run.
///
/// Due and eligible ledger records, in priority order, that the latest sync
/// still lists, capped at [`MAX_FILES_PER_RUN`].
pub fn select(
    ledger: &Ledger,
    fetched: &[ProjectFiles],
    now: DateTime<Utc>,
) -> Result<SelectionManifest> {
    let candidates = ledger.due_candidates(now)?;
    let never_backed_up = candidates
        .iter()
        .filter(|record| record.state(now) == BackupState::New)
        .count();
    info!(
        "Found {} files potentially needing backup in the ledger ({} never backed up, {} changed)",
        candidates.len(),
        never_backed_up,
        candidates.len() - never_backed_up
    );
    Ok(build_manifest(&candidates, fetched, now))
}

/// Group prioritized candidates into a manifest. Projects appear in the order
/// of their highest-priority file, files keep priority order within a project,
/// and projects with nothing selected are left out.
pub fn build_manifest(
    candidates: &[BackupRecord],
    fetched: &[ProjectFiles],
    now: DateTime<Utc>,
) -> SelectionManifest {
    let mut locations: HashMap<&str, (usize, &RemoteFile)> = HashMap::new();
    for (project_idx, project) in fetched.iter().enumerate() {
        for file in &project.files {
            locations
                .entry(file.key.as_str())
                .or_insert((project_idx, file));
        }
    }

    let existing: Vec<(usize, &RemoteFile)> = candidates
        .iter()
        .filter_map(|record| {
            let location = locations.get(record.file_key.as_str()).copied();
            if location.is_none() {
                debug!(
                    "Skipping {} ({}): no longer listed by the source",
                    record.file_key, record.file_name
                );
            }
            location
        })
        .collect();
    info!(
        "Found {} files that still exist and need backup",
        existing.len()
    );

    let mut projects: Vec<ManifestProject> = Vec::new();
    let mut slots: HashMap<usize, usize> = HashMap::new();

    for (project_idx, file) in existing.into_iter().take(MAX_FILES_PER_RUN) {
        let slot = *slots.entry(project_idx).or_insert_with(|| {
            let project = &fetched[project_idx];
            projects.push(ManifestProject {
                id: project.id.clone(),
                name: project.name.clone(),
                team_id: project.team_id.clone(),
                files: Vec::new(),
            });
            projects.len() - 1
        });
        projects[slot].files.push(ManifestFile {
            key: file.key.clone(),
            name: file.name.clone(),
        });
    }

    let manifest = SelectionManifest::new(now, projects);
    info!(
        "Selected {} files in {} projects for this run",
        manifest.len(),
        manifest.projects.len()
    );
    manifest
}
