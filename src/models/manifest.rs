use crate::models::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Current manifest format. Bump when the JSON layout changes.
pub const MANIFEST_VERSION: u32 = 1;

/// Files chosen for one run, grouped by project, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionManifest {
    pub version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub projects: Vec<ManifestProject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestProject {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub key: String,
    pub name: String,
}

impl SelectionManifest {
    pub fn new(generated_at: DateTime<Utc>, projects: Vec<ManifestProject>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            run_id: Uuid::new_v4(),
            generated_at,
            projects,
        }
    }

    /// Number of files across all projects.
    pub fn len(&self) -> usize {
        self.projects.iter().map(|p| p.files.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every (project, file) pair in manifest order.
    pub fn entries(&self) -> Vec<(&ManifestProject, &ManifestFile)> {
        self.projects
            .iter()
            .flat_map(|project| project.files.iter().map(move |file| (project, file)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(BackupError::ManifestValidation(format!(
                "unsupported manifest version {} (expected {})",
                self.version, MANIFEST_VERSION
            )));
        }

        for (idx, project) in self.projects.iter().enumerate() {
            if project.id.trim().is_empty() {
                return Err(BackupError::ManifestValidation(format!(
                    "project #{} has no id",
                    idx + 1
                )));
            }
            if let Some(file) = project.files.iter().find(|f| f.key.trim().is_empty()) {
                return Err(BackupError::ManifestValidation(format!(
                    "project '{}' contains a file without a key (name: '{}')",
                    project.id, file.name
                )));
            }
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::ManifestValidation(e.to_string()))?;
        fs::write(path, json).map_err(|cause| BackupError::ManifestWrite {
            path: path.to_path_buf(),
            cause,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let manifest: SelectionManifest = serde_json::from_str(&contents).map_err(|e| {
            BackupError::ManifestValidation(format!("{}: {}", path.display(), e))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }
}
