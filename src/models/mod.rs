pub mod backup_record;
pub mod config;
pub mod config_validator;
pub mod dry_run_mode;
pub mod error;
pub mod manifest;
pub mod project_files;
