use chrono::{DateTime, Utc};

/// A project listing as returned by the metadata source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFiles {
    pub id: String,
    pub name: String,
    pub team_id: Option<String>,
    pub files: Vec<RemoteFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub key: String,
    pub name: String,
    pub last_modified: DateTime<Utc>,
}
