use crate::models::error::{BackupError, Result};
use crate::models::manifest::{ManifestFile, ManifestProject};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("failed to start '{program}': {cause}")]
    Spawn { program: String, cause: io::Error },

    #[error("downloader exited with {status}: {detail}")]
    Exit { status: ExitStatus, detail: String },
}

/// Saves one design file. Called from worker threads.
pub trait Downloader: Sync {
    fn download(
        &self,
        project: &ManifestProject,
        file: &ManifestFile,
    ) -> std::result::Result<(), DownloadError>;
}

/// Runs an external command once per file, passing the file through
/// environment variables. Exit status 0 is success.
///
/// The command's stdout goes straight to ours; only stderr is kept, for the
/// failure reason.
#[derive(Debug, Clone)]
pub struct CommandDownloader {
    program: String,
    args: Vec<String>,
    download_path: Option<PathBuf>,
}

impl CommandDownloader {
    pub fn new(command: &[String], download_path: Option<PathBuf>) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            BackupError::ConfigInvalid(
                "download_command must name a program to run for each file".to_string(),
            )
        })?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            download_path,
        })
    }
}

impl Downloader for CommandDownloader {
    fn download(
        &self,
        project: &ManifestProject,
        file: &ManifestFile,
    ) -> std::result::Result<(), DownloadError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("FIGMA_FILE_KEY", &file.key)
            .env("FIGMA_FILE_NAME", &file.name)
            .env("FIGMA_PROJECT_ID", &project.id)
            .env("FIGMA_PROJECT_NAME", &project.name)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());

        if let Some(team_id) = &project.team_id {
            command.env("FIGMA_TEAM_ID", team_id);
        }
        if let Some(path) = &self.download_path {
            command.env("DOWNLOAD_PATH", path);
        }

        debug!("Running {} for {} ({})", self.program, file.name, file.key);
        let output = command.output().map_err(|cause| DownloadError::Spawn {
            program: self.program.clone(),
            cause,
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no error output")
            .trim()
            .to_string();
        Err(DownloadError::Exit {
            status: output.status,
            detail,
        })
    }
}
