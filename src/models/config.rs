use crate::models::config_validator::validate_config;
use crate::models::error::{BackupError, Result};
use crate::service::sync::DEFAULT_REQUEST_DELAY_MS;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "vec_default")]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "vec_default")]
    pub download_command: Vec<String>,
    #[serde(default)]
    pub download_path: Option<String>,
    #[serde(default = "usize_one")]
    pub download_workers: usize,
    #[serde(default)]
    pub manifest_file: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "bool_true")]
    pub run_on_startup: bool,
}

fn default_database_file() -> String {
    "figma_backups.db".to_string()
}
fn default_api_base_url() -> String {
    "https://api.figma.com".to_string()
}
const fn vec_default() -> Vec<String> {
    Vec::new()
}
const fn default_request_delay_ms() -> u64 {
    DEFAULT_REQUEST_DELAY_MS
}
const fn usize_one() -> usize {
    1
}
const fn bool_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            project_ids: Vec::new(),
            team_id: None,
            api_base_url: default_api_base_url(),
            api_token: None,
            request_delay_ms: default_request_delay_ms(),
            download_command: Vec::new(),
            download_path: None,
            download_workers: usize_one(),
            manifest_file: None,
            schedule: None,
            run_on_startup: bool_true(),
        }
    }
}

impl Config {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn download_path(&self) -> Option<PathBuf> {
        self.download_path.as_ref().map(PathBuf::from)
    }

    pub fn manifest_file(&self) -> Option<PathBuf> {
        self.manifest_file.as_ref().map(PathBuf::from)
    }

    /// Projects named on the command line win over the configured list.
    pub fn resolve_project_ids(&self, cli_project_ids: &[String]) -> Result<Vec<String>> {
        let ids = if cli_project_ids.is_empty() {
            self.project_ids.clone()
        } else {
            cli_project_ids.to_vec()
        };
        if ids.is_empty() {
            return Err(BackupError::ConfigInvalid(
                "No project ids given. Pass them as arguments or set project_ids in the config file"
                    .to_string(),
            ));
        }
        Ok(ids)
    }

    pub fn require_api_token(&self) -> Result<&str> {
        self.api_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                BackupError::ConfigInvalid(
                    "No Figma access token. Set FIGMA_ACCESS_TOKEN or pass --token".to_string(),
                )
            })
    }
}

/// Values from the command line or environment that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub request_delay_ms: Option<u64>,
    pub api_token: Option<String>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(delay) = self.request_delay_ms {
            config.request_delay_ms = delay;
        }
        if let Some(token) = self.api_token {
            config.api_token = Some(token);
        }
    }
}

/// Load the config file, or start from defaults when `optional` and the file
/// does not exist, apply `overrides`, then validate the result.
pub fn setup_config(
    config_file: String,
    optional: bool,
    overrides: ConfigOverrides,
) -> Result<Config> {
    let config_path = PathBuf::from(config_file);

    let mut config = if optional && !config_path.exists() {
        info!(
            "No config file at {}, using defaults",
            config_path.display()
        );
        Config::default()
    } else {
        info!("Loading config from: {}", config_path.display());

        let config_str = fs::read_to_string(&config_path).map_err(|cause| {
            BackupError::ConfigRead {
                path: config_path.clone(),
                cause,
            }
        })?;

        serde_json::from_str(&config_str).map_err(|cause| BackupError::ConfigParse {
            path: config_path,
            cause,
        })?
    };

    overrides.apply(&mut config);
    validate_config(&config)?;

    Ok(config)
}
