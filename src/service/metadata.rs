use crate::models::error::{BackupError, Result};
use crate::models::project_files::{ProjectFiles, RemoteFile};
use crate::utils::time::parse_timestamp;
use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;

/// Name Figma shows for files that live outside any named project.
pub const DRAFTS_PROJECT_NAME: &str = "Drafts";

/// Source of truth for which files exist and when they last changed.
pub trait MetadataSource {
    fn project_files(&self, project_id: &str) -> Result<ProjectFiles>;
}

#[derive(Debug, Deserialize)]
struct ProjectFilesResponse {
    #[serde(default)]
    name: String,
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    key: String,
    name: String,
    last_modified: String,
}

/// Blocking client for `GET /v1/projects/:id/files`.
pub struct FigmaClient {
    client: Client,
    base_url: String,
    token: String,
    team_id: Option<String>,
}

impl FigmaClient {
    pub fn new(base_url: &str, token: &str, team_id: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BackupError::ConfigInvalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            team_id,
        })
    }
}

impl MetadataSource for FigmaClient {
    fn project_files(&self, project_id: &str) -> Result<ProjectFiles> {
        let url = format!("{}/v1/projects/{}/files", self.base_url, project_id);
        debug!("GET {}", url);

        let sync_failure = |reason: String| BackupError::SyncFailure {
            project_id: project_id.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .header("X-Figma-Token", &self.token)
            .send()
            .map_err(|e| sync_failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(sync_failure(format!("HTTP status {}", status)));
        }

        let body = response.text().map_err(|e| sync_failure(e.to_string()))?;
        parse_project_files(project_id, self.team_id.clone(), &body)
    }
}

fn parse_project_files(project_id: &str, team_id: Option<String>, body: &str) -> Result<ProjectFiles> {
    let response: ProjectFilesResponse = serde_json::from_str(body).map_err(|e| {
        BackupError::ManifestValidation(format!(
            "malformed file listing for project '{}': {}",
            project_id, e
        ))
    })?;

    let files = response
        .files
        .into_iter()
        .map(|entry| {
            if entry.key.trim().is_empty() {
                return Err(BackupError::ManifestValidation(format!(
                    "file '{}' in project '{}' has no key",
                    entry.name, project_id
                )));
            }
            let last_modified = parse_timestamp(&entry.last_modified).map_err(|e| {
                BackupError::ManifestValidation(format!(
                    "file '{}' in project '{}' has invalid last_modified '{}': {}",
                    entry.key, project_id, entry.last_modified, e
                ))
            })?;
            Ok(RemoteFile {
                key: entry.key,
                name: entry.name,
                last_modified,
            })
        })
        .collect::<Result<Vec<RemoteFile>>>()?;

    let name = if response.name.trim().is_empty() {
        DRAFTS_PROJECT_NAME.to_string()
    } else {
        response.name
    };

    Ok(ProjectFiles {
        id: project_id.to_string(),
        name,
        team_id,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parses_listing_and_attaches_ids() {
        let body = r#"{
            "name": "Marketing",
            "files": [
                {
                    "key": "aBcD123",
                    "name": "Landing page",
                    "thumbnail_url": "https://example.invalid/thumb.png",
                    "last_modified": "2024-01-05T10:20:30.123Z"
                }
            ]
        }"#;

        let project = parse_project_files("100", Some("team-1".to_string()), body).unwrap();

        assert_eq!(project.id, "100");
        assert_eq!(project.name, "Marketing");
        assert_eq!(project.team_id.as_deref(), Some("team-1"));
        assert_eq!(
            project.files,
            vec![RemoteFile {
                key: "aBcD123".to_string(),
                name: "Landing page".to_string(),
                last_modified: Utc.with_ymd_and_hms(2024, 1, 5, 10, 20, 30).unwrap(),
            }]
        );
    }

    #[test]
    fn test_unnamed_project_is_drafts() {
        let project = parse_project_files("7", None, r#"{ "files": [] }"#).unwrap();
        assert_eq!(project.name, DRAFTS_PROJECT_NAME);
        assert!(project.files.is_empty());
    }

    #[test]
    fn test_missing_files_array_is_a_validation_error() {
        let result = parse_project_files("7", None, r#"{ "name": "Marketing" }"#);
        assert!(matches!(result, Err(BackupError::ManifestValidation(_))));
    }

    #[test]
    fn test_missing_file_key_is_a_validation_error() {
        let body = r#"{ "name": "P", "files": [
            { "name": "No key", "last_modified": "2024-01-05T10:20:30Z" }
        ] }"#;
        assert!(matches!(
            parse_project_files("7", None, body),
            Err(BackupError::ManifestValidation(_))
        ));
    }

    #[test]
    fn test_bad_timestamp_is_a_validation_error() {
        let body = r#"{ "name": "P", "files": [
            { "key": "k", "name": "F", "last_modified": "last tuesday" }
        ] }"#;
        let error = parse_project_files("7", None, body).unwrap_err();
        assert!(error.to_string().contains("last tuesday"));
    }

    #[test]
    fn test_unreachable_host_is_a_sync_failure() {
        let client = FigmaClient::new("http://127.0.0.1:9", "token", None).unwrap();
        match client.project_files("100") {
            Err(BackupError::SyncFailure { project_id, .. }) => assert_eq!(project_id, "100"),
            other => panic!("Expected SyncFailure, got {:?}", other),
        }
    }
}
