use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Hours a file stays ineligible after a failed backup. Fixed window, no
/// growth and no retry cap.
pub const BACKOFF_HOURS: i64 = 72;

pub fn backoff_window() -> Duration {
    Duration::hours(BACKOFF_HOURS)
}

/// One row of the `backups` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub file_key: String,
    pub project_name: String,
    pub file_name: String,
    pub last_modified_date: Option<DateTime<Utc>>,
    pub last_backup_date: Option<DateTime<Utc>>,
    pub next_attempt_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    /// Never backed up
    New,
    /// Backed up and unchanged since
    Current,
    /// Modified after the last backup
    Stale,
    /// Inside the window set by a failed attempt
    Backoff,
}

impl BackupRecord {
    pub fn is_due(&self) -> bool {
        match (self.last_backup_date, self.last_modified_date) {
            (None, _) => true,
            (Some(backup), Some(modified)) => modified > backup,
            (Some(_), None) => false,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_date.map_or(true, |next| next <= now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> BackupState {
        if !self.is_eligible(now) {
            BackupState::Backoff
        } else if self.last_backup_date.is_none() {
            BackupState::New
        } else if self.is_due() {
            BackupState::Stale
        } else {
            BackupState::Current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn record() -> BackupRecord {
        BackupRecord {
            file_key: "key".to_string(),
            project_name: "Design System".to_string(),
            file_name: "Buttons".to_string(),
            last_modified_date: Some(at(5)),
            last_backup_date: None,
            next_attempt_date: None,
        }
    }

    #[test]
    fn test_never_backed_up_is_new_and_due() {
        let record = record();
        assert!(record.is_due());
        assert_eq!(record.state(at(6)), BackupState::New);
    }

    #[test]
    fn test_modified_after_backup_is_stale() {
        let record = BackupRecord {
            last_backup_date: Some(at(1)),
            ..record()
        };
        assert!(record.is_due());
        assert_eq!(record.state(at(6)), BackupState::Stale);
    }

    #[test]
    fn test_unchanged_since_backup_is_current() {
        let record = BackupRecord {
            last_backup_date: Some(at(5)),
            ..record()
        };
        assert!(!record.is_due());
        assert_eq!(record.state(at(6)), BackupState::Current);
    }

    #[test]
    fn test_backoff_until_next_attempt_passes() {
        let record = BackupRecord {
            next_attempt_date: Some(at(8)),
            ..record()
        };
        assert_eq!(record.state(at(7)), BackupState::Backoff);
        assert!(record.is_eligible(at(8)));
        assert_eq!(record.state(at(9)), BackupState::New);
    }

    #[test]
    fn test_backoff_window_is_three_days() {
        assert_eq!(backoff_window(), Duration::days(3));
    }
}
