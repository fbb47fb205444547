use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to read config file '{path}': {cause}")]
    ConfigRead { path: PathBuf, cause: io::Error },

    #[error("Failed to parse config file '{path}': {cause}")]
    ConfigParse {
        path: PathBuf,
        cause: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Failed to open or create database file '{path}': {cause}")]
    DatabaseConnection {
        path: String,
        cause: rusqlite::Error,
    },

    #[error("Database connection pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    #[error("Database query failed for '{operation}': {cause}")]
    DatabaseQuery {
        operation: String,
        cause: rusqlite::Error,
    },

    #[error("Failed to update {table} for {key}: {cause}")]
    DatabaseUpdate {
        table: String,
        key: String,
        cause: rusqlite::Error,
    },

    #[error("Failed to insert into {table} for {key}: {cause}")]
    DatabaseInsert {
        table: String,
        key: String,
        cause: rusqlite::Error,
    },

    #[error("WAL checkpoint of '{path}' did not complete; another connection is still reading")]
    CheckpointIncomplete { path: String },

    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    #[error("Failed to fetch files for project '{project_id}': {reason}")]
    SyncFailure { project_id: String, reason: String },

    #[error("Backup of file '{file_key}' failed: {reason}")]
    BackupFailure { file_key: String, reason: String },

    #[error("Invalid selection manifest: {0}")]
    ManifestValidation(String),

    #[error("Failed to write selection manifest '{path}': {cause}")]
    ManifestWrite { path: PathBuf, cause: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl BackupError {
    /// True for failures scoped to a single file. These are recorded with a
    /// backoff and collected, everything else aborts the run.
    pub fn is_file_level(&self) -> bool {
        matches!(self, BackupError::BackupFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backup_failure_is_file_level() {
        let file_failure = BackupError::BackupFailure {
            file_key: "abc".to_string(),
            reason: "Save As menu item not found".to_string(),
        };
        let sync_failure = BackupError::SyncFailure {
            project_id: "42".to_string(),
            reason: "HTTP 429".to_string(),
        };

        assert!(file_failure.is_file_level());
        assert!(!sync_failure.is_file_level());
        assert!(!BackupError::ManifestValidation("x".to_string()).is_file_level());
    }

    #[test]
    fn test_messages_name_the_subject() {
        let error = BackupError::SyncFailure {
            project_id: "1446837479148090378".to_string(),
            reason: "HTTP status 403 Forbidden".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to fetch files for project '1446837479148090378': HTTP status 403 Forbidden"
        );
    }
}
