use crate::models::config::Config;
use crate::models::error::{BackupError, Result};
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Validates the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    info!("Validating configuration...");

    validate_numeric_values(config)?;

    validate_api_base_url(&config.api_base_url)?;

    validate_api_token(config.api_token.as_deref())?;

    validate_database_path(&config.database_file)?;

    if let Some(download_path) = &config.download_path {
        validate_download_path(download_path)?;
    }

    validate_schedule(config)?;

    check_download_command(config);

    info!("Configuration validation passed");
    Ok(())
}

/// Validate numeric configuration values
fn validate_numeric_values(config: &Config) -> Result<()> {
    if config.download_workers == 0 {
        return Err(BackupError::ConfigInvalid(
            "download_workers must be greater than 0".to_string(),
        ));
    }

    let cpu_count = num_cpus::get_physical();
    if config.download_workers > cpu_count {
        warn!(
            "download_workers ({}) is more than the number of physical CPUs ({}). Each worker drives a browser.",
            config.download_workers, cpu_count
        );
    }

    if config.request_delay_ms < 1000 {
        warn!(
            "request_delay_ms is {} ms; the Figma API may start rejecting requests below 1000 ms",
            config.request_delay_ms
        );
    }

    Ok(())
}

fn validate_api_base_url(url: &str) -> Result<()> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(BackupError::ConfigInvalid(format!(
            "api_base_url must start with http:// or https://, got '{}'",
            url
        )));
    }
    Ok(())
}

/// A token is optional until the API is called, but a blank one is a mistake.
fn validate_api_token(token: Option<&str>) -> Result<()> {
    match token {
        Some(token) if token.trim().is_empty() => Err(BackupError::ConfigInvalid(
            "api_token is set but blank".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Validate database file path
fn validate_database_path(db_file: &str) -> Result<()> {
    if db_file.is_empty() {
        return Err(BackupError::ConfigInvalid(
            "database_file cannot be empty".to_string(),
        ));
    }

    if db_file == ":memory:" {
        warn!("Using an in-memory ledger; backup state is lost when the process exits");
        return Ok(());
    }

    let path = Path::new(db_file);

    if path.exists() {
        if !path.is_file() {
            return Err(BackupError::ConfigInvalid(format!(
                "Database path exists but is not a file: {}",
                db_file
            )));
        }

        if let Err(e) = fs::OpenOptions::new().read(true).write(true).open(path) {
            return Err(BackupError::ConfigInvalid(format!(
                "Database file is not readable/writable: {}\nError: {}",
                db_file, e
            )));
        }
    } else {
        let parent = writable_parent(path)?;
        if let Err(e) = check_writable(parent) {
            return Err(BackupError::ConfigInvalid(format!(
                "Database parent directory is not writable: {}\nError: {}",
                db_file, e
            )));
        }
    }

    Ok(())
}

/// The downloader creates the directory itself; its parent has to exist.
fn validate_download_path(download_path: &str) -> Result<()> {
    let path = Path::new(download_path);

    if path.exists() {
        if !path.is_dir() {
            return Err(BackupError::ConfigInvalid(format!(
                "download_path exists but is not a directory: {}",
                download_path
            )));
        }
        return Ok(());
    }

    writable_parent(path)?;
    warn!(
        "download_path does not exist yet and will need to be created: {}",
        download_path
    );
    Ok(())
}

fn writable_parent(path: &Path) -> Result<&Path> {
    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => {
            return Err(BackupError::ConfigInvalid(format!(
                "Path has no parent directory: {}",
                path.display()
            )))
        }
    };

    if !parent.exists() {
        #[cfg(windows)]
        let suggestion = format!("mkdir \"{}\"", parent.display());
        #[cfg(not(windows))]
        let suggestion = format!("mkdir -p \"{}\"", parent.display());

        return Err(BackupError::ConfigInvalid(format!(
            "Parent directory does not exist: {}\nSuggestion: Create the directory with: {}",
            path.display(),
            suggestion
        )));
    }

    Ok(parent)
}

/// Validate schedule configuration
fn validate_schedule(config: &Config) -> Result<()> {
    if let Some(schedule_str) = &config.schedule {
        match cron::Schedule::from_str(schedule_str) {
            Ok(_) => {
                info!("Schedule validated: {}", schedule_str);
            }
            Err(e) => {
                return Err(BackupError::ConfigInvalid(format!(
                    "Invalid cron expression in schedule: {}\nError: {}\nExample: '0 0 3 * * *' for daily at 3am",
                    schedule_str, e
                )));
            }
        }
    }
    Ok(())
}

/// A missing command only matters once something is due, so warn here and
/// fail when the downloader is built.
fn check_download_command(config: &Config) {
    if config.download_command.is_empty() {
        warn!("download_command is not set; only dry runs and manifest export will work");
    }
}

/// Check if a directory is writable by attempting to create a temporary file
fn check_writable(path: &Path) -> std::io::Result<()> {
    let test_file = path.join(".figma_backup_write_test");

    fs::write(&test_file, b"test")?;

    fs::remove_file(&test_file)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> Config {
        Config {
            database_file: dir.path().join("ledger.db").to_str().unwrap().to_string(),
            download_command: vec!["true".to_string()],
            ..Config::default()
        }
    }

    #[test]
    fn test_check_writable_temp_dir() {
        let temp_dir = std::env::temp_dir();
        assert!(check_writable(&temp_dir).is_ok());
    }

    #[test]
    fn test_validate_config_passes_for_valid_config() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.download_workers = 0;

        let result = validate_numeric_values(&config);
        assert!(result.unwrap_err().to_string().contains("download_workers"));
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.api_base_url = "api.figma.com".to_string();

        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("api_base_url"));
    }

    #[test]
    fn test_rejects_blank_token() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.api_token = Some(" ".to_string());

        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("api_token"));
    }

    #[test]
    fn test_rejects_database_in_missing_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.database_file = "/this/does/not/exist/ledger.db".to_string();

        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("does not exist"));
    }

    #[test]
    fn test_rejects_database_path_that_is_a_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.database_file = dir.path().to_str().unwrap().to_string();

        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("not a file"));
    }

    #[test]
    fn test_rejects_download_path_that_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let mut config = create_test_config(&dir);
        config.download_path = Some(file.to_str().unwrap().to_string());

        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_accepts_download_path_with_existing_parent() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.download_path = Some(dir.path().join("downloads").to_str().unwrap().to_string());

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_rejects_invalid_cron_expression() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.schedule = Some("every tuesday".to_string());

        assert!(validate_config(&config)
            .unwrap_err()
            .to_string()
            .contains("Invalid cron expression"));
    }

    #[test]
    fn test_accepts_valid_cron_expression() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&dir);
        config.schedule = Some("0 0 */6 * * *".to_string());

        assert!(validate_config(&config).is_ok());
    }
}
