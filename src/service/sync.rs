use crate::models::error::Result;
use crate::models::project_files::ProjectFiles;
use crate::repo::sqlite::Ledger;
use crate::service::metadata::MetadataSource;
use indicatif::ProgressBar;
use log::{debug, info};
use std::thread;
use std::time::Duration;

/// Default pause between project fetches; 30 requests per minute.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 2000;

/// Fetch each project's file listing in order and upsert it into the ledger.
///
/// Requests are sequential with `delay` between consecutive calls. The first
/// failed fetch aborts the sync; projects fetched before it stay upserted.
/// Returns everything fetched, for the selector's existence filter.
pub fn sync_projects<S: MetadataSource + ?Sized>(
    ledger: &Ledger,
    source: &S,
    project_ids: &[String],
    delay: Duration,
    progress: Option<&ProgressBar>,
) -> Result<Vec<ProjectFiles>> {
    info!(
        "Fetching file metadata for {} projects ({} ms between requests)",
        project_ids.len(),
        delay.as_millis()
    );

    let mut fetched = Vec::with_capacity(project_ids.len());

    for (idx, project_id) in project_ids.iter().enumerate() {
        if let Some(pb) = progress {
            pb.set_message(format!(
                "Fetching project {} ({}/{})",
                project_id,
                idx + 1,
                project_ids.len()
            ));
        }

        let project = source.project_files(project_id)?;
        let upserted = ledger.upsert_batch(&project.name, &project.files)?;
        debug!(
            "Project {} ({}): {} files upserted",
            project.name, project.id, upserted
        );
        fetched.push(project);

        if idx + 1 < project_ids.len() && !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    info!(
        "Fetched metadata for {} files across {} projects",
        fetched.iter().map(|p| p.files.len()).sum::<usize>(),
        fetched.len()
    );
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error::BackupError;
    use crate::models::project_files::RemoteFile;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::time::Instant;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeSource {
        projects: HashMap<String, ProjectFiles>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeSource {
        fn with_project(mut self, id: &str, keys: &[&str]) -> Self {
            let files = keys
                .iter()
                .map(|key| RemoteFile {
                    key: key.to_string(),
                    name: format!("File {}", key),
                    last_modified: Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap(),
                })
                .collect();
            self.projects.insert(
                id.to_string(),
                ProjectFiles {
                    id: id.to_string(),
                    name: format!("Project {}", id),
                    team_id: None,
                    files,
                },
            );
            self
        }
    }

    impl MetadataSource for FakeSource {
        fn project_files(&self, project_id: &str) -> Result<ProjectFiles> {
            self.calls.borrow_mut().push(project_id.to_string());
            self.projects
                .get(project_id)
                .cloned()
                .ok_or_else(|| BackupError::SyncFailure {
                    project_id: project_id.to_string(),
                    reason: "HTTP status 404 Not Found".to_string(),
                })
        }
    }

    fn test_ledger() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
        (dir, ledger)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_sync_upserts_every_fetched_file() {
        let (_dir, ledger) = test_ledger();
        let source = FakeSource::default()
            .with_project("1", &["a", "b"])
            .with_project("2", &["c"]);

        let fetched =
            sync_projects(&ledger, &source, &ids(&["1", "2"]), Duration::ZERO, None).unwrap();

        assert_eq!(fetched.len(), 2);
        assert_eq!(*source.calls.borrow(), ids(&["1", "2"]));
        for key in ["a", "b", "c"] {
            assert!(ledger.get(key).unwrap().is_some());
        }
        assert_eq!(ledger.get("c").unwrap().unwrap().project_name, "Project 2");
    }

    #[test]
    fn test_sync_stops_at_first_failure() {
        let (_dir, ledger) = test_ledger();
        let source = FakeSource::default()
            .with_project("1", &["a"])
            .with_project("3", &["c"]);

        let result = sync_projects(&ledger, &source, &ids(&["1", "2", "3"]), Duration::ZERO, None);

        assert!(matches!(result, Err(BackupError::SyncFailure { .. })));
        assert_eq!(*source.calls.borrow(), ids(&["1", "2"]));
        assert!(ledger.get("a").unwrap().is_some());
        assert!(ledger.get("c").unwrap().is_none());
    }

    #[test]
    fn test_sync_pauses_between_requests_only() {
        let (_dir, ledger) = test_ledger();
        let source = FakeSource::default()
            .with_project("1", &["a"])
            .with_project("2", &["b"])
            .with_project("3", &["c"]);

        let started = Instant::now();
        sync_projects(
            &ledger,
            &source,
            &ids(&["1", "2", "3"]),
            Duration::from_millis(60),
            None,
        )
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));

        let started = Instant::now();
        sync_projects(&ledger, &source, &ids(&["1"]), Duration::from_millis(500), None).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_resync_is_idempotent() {
        let (_dir, ledger) = test_ledger();
        let source = FakeSource::default().with_project("1", &["a", "b"]);
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        sync_projects(&ledger, &source, &ids(&["1"]), Duration::ZERO, None).unwrap();
        ledger.mark_success("a", now).unwrap();
        let once = (ledger.get("a").unwrap(), ledger.get("b").unwrap());

        sync_projects(&ledger, &source, &ids(&["1"]), Duration::ZERO, None).unwrap();
        let twice = (ledger.get("a").unwrap(), ledger.get("b").unwrap());

        assert_eq!(once, twice);
    }
}
