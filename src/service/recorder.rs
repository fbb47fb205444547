use crate::models::error::{BackupError, Result};
use crate::repo::sqlite::Ledger;
use chrono::{DateTime, Utc};
use log::{info, warn};

/// Applies downloader outcomes to the ledger.
pub struct OutcomeRecorder<'a> {
    ledger: &'a Ledger,
}

impl<'a> OutcomeRecorder<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn record_success(&self, file_key: &str, now: DateTime<Utc>) -> Result<()> {
        self.ledger.mark_success(file_key, now)?;
        info!("Backed up {}", file_key);
        Ok(())
    }

    /// Start the backoff window for `file_key` and hand back the error the
    /// caller should propagate: the `BackupFailure`, or the ledger error if the
    /// backoff could not be written.
    pub fn record_failure(&self, file_key: &str, now: DateTime<Utc>, reason: &str) -> BackupError {
        if let Err(ledger_error) = self.ledger.mark_failure(file_key, now) {
            return ledger_error;
        }
        warn!("Backup of {} failed, retrying after backoff: {}", file_key, reason);
        BackupError::BackupFailure {
            file_key: file_key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Record either outcome and return it as a `Result`.
    pub fn record(
        &self,
        file_key: &str,
        now: DateTime<Utc>,
        outcome: std::result::Result<(), String>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => self.record_success(file_key, now),
            Err(reason) => Err(self.record_failure(file_key, now, &reason)),
        }
    }
}
