/// Defines the dry-run behavior mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunMode {
    /// Normal operation - sync metadata, download selected files, record outcomes
    None,

    /// Preview - sync metadata and build the selection manifest, but never
    /// run the downloader or touch backup/backoff state
    Preview,
}

impl DryRunMode {
    pub fn from_flag(dry_run: bool) -> Self {
        if dry_run {
            DryRunMode::Preview
        } else {
            DryRunMode::None
        }
    }

    /// Returns true if this is a dry run
    pub fn is_dry_run(&self) -> bool {
        matches!(self, DryRunMode::Preview)
    }

    /// Returns true if selected files should be handed to the downloader
    pub fn should_download(&self) -> bool {
        matches!(self, DryRunMode::None)
    }

    /// Get display string for progress bars
    pub fn progress_prefix(&self) -> &'static str {
        match self {
            DryRunMode::None => "",
            DryRunMode::Preview => "[DRY RUN] ",
        }
    }
}
