use crate::models::backup_record::{backoff_window, BackupRecord};
use crate::models::error::{BackupError, Result};
use crate::models::project_files::RemoteFile;
use crate::utils::time::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

type DbPool = Pool<SqliteConnectionManager>;

/// Bump together with a new arm in `migrate_to_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "BEGIN;
    PRAGMA ENCODING = 'UTF-8';

    CREATE TABLE IF NOT EXISTS backups (
        file_key           TEXT PRIMARY KEY,
        project_name       TEXT,
        file_name          TEXT,
        last_backup_date   TEXT,
        last_modified_date TEXT,
        next_attempt_date  TEXT
    );

    CREATE INDEX IF NOT EXISTS backups_last_backup_date_index
            on backups (last_backup_date);

    COMMIT;";

/// Databases written before timestamps were normalized may carry
/// milliseconds. Cut them back to `YYYY-MM-DDTHH:MM:SSZ`.
const NORMALIZE_LEGACY_TIMESTAMPS: &str = "
    UPDATE backups SET last_backup_date = substr(last_backup_date, 1, 19) || 'Z'
        WHERE last_backup_date LIKE '%.%';
    UPDATE backups SET last_modified_date = substr(last_modified_date, 1, 19) || 'Z'
        WHERE last_modified_date LIKE '%.%';
    UPDATE backups SET next_attempt_date = substr(next_attempt_date, 1, 19) || 'Z'
        WHERE next_attempt_date LIKE '%.%';";

const RECORD_COLUMNS: &str = "file_key, project_name, file_name,
    last_modified_date, last_backup_date, next_attempt_date";

/// Counts reported by the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: u64,
    pub never_backed_up: u64,
    pub due: u64,
    pub in_backoff: u64,
}

/// Persistent per-file backup state.
///
/// Owns its connection pool. Open once at startup and hand it around by
/// reference; `close` makes every write durable in the main database file.
pub struct Ledger {
    pool: DbPool,
    path: String,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn open(db_file: &str) -> Result<Self> {
        if db_file.is_empty() {
            return Err(BackupError::ConfigInvalid(
                "Database file path cannot be empty".to_string(),
            ));
        }

        info!("Opening backup ledger: {}", db_file);

        let is_in_memory = db_file == ":memory:" || db_file.starts_with("file::memory:");
        let use_wal = !is_in_memory;

        let manager = SqliteConnectionManager::file(db_file).with_init(move |conn| {
            let mut pragmas = String::from(
                "PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            );

            if use_wal {
                pragmas.push_str(" PRAGMA journal_mode = WAL;");
            }

            conn.execute_batch(&pragmas)
        });

        // Downloads record outcomes from worker threads, one connection each.
        // Every in-memory connection is its own database, so those get one.
        let pool_size = if is_in_memory {
            1
        } else {
            num_cpus::get_physical() + 2
        };
        let pool = Pool::builder()
            .max_size(pool_size as u32)
            .build(manager)?;

        let ledger = Self {
            pool,
            path: db_file.to_string(),
        };

        let conn = ledger.connection()?;
        migrate(&conn).map_err(|cause| match cause {
            BackupError::DatabaseQuery { cause, .. } => BackupError::DatabaseConnection {
                path: db_file.to_string(),
                cause,
            },
            other => other,
        })?;
        drop(conn);

        debug!("Ledger pool created with {} connections", pool_size);
        Ok(ledger)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Single-file form of `upsert_batch`.
    #[cfg(test)]
    pub fn upsert(
        &self,
        file_key: &str,
        modified_date: DateTime<Utc>,
        project_name: &str,
        file_name: &str,
    ) -> Result<()> {
        let conn = self.connection()?;
        upsert_row(&conn, file_key, modified_date, project_name, file_name)
    }

    /// Insert each file seen by the metadata source, or refresh its metadata,
    /// in a single transaction. Backup and backoff columns of an existing row
    /// are left alone.
    pub fn upsert_batch(&self, project_name: &str, files: &[RemoteFile]) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(|cause| BackupError::DatabaseQuery {
            operation: "begin upsert batch".to_string(),
            cause,
        })?;

        for file in files {
            upsert_row(&tx, &file.key, file.last_modified, project_name, &file.name)?;
        }

        tx.commit().map_err(|cause| BackupError::DatabaseQuery {
            operation: "commit upsert batch".to_string(),
            cause,
        })?;
        Ok(files.len())
    }

    /// Returns false when no record exists for `file_key`.
    pub fn mark_success(&self, file_key: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn
            .execute(
                "UPDATE backups
                    SET last_backup_date = ?1,
                        next_attempt_date = NULL
                  WHERE file_key = ?2",
                (format_timestamp(now), file_key),
            )
            .map_err(|cause| BackupError::DatabaseUpdate {
                table: "backups".to_string(),
                key: file_key.to_string(),
                cause,
            })?;

        if updated == 0 {
            warn!("No ledger record for {}, success not recorded", file_key);
        }
        Ok(updated > 0)
    }

    /// Push the next attempt out by the backoff window. Returns false when no
    /// record exists for `file_key`.
    pub fn mark_failure(&self, file_key: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.connection()?;
        let next_attempt = now + backoff_window();
        let updated = conn
            .execute(
                "UPDATE backups SET next_attempt_date = ?1 WHERE file_key = ?2",
                (format_timestamp(next_attempt), file_key),
            )
            .map_err(|cause| BackupError::DatabaseUpdate {
                table: "backups".to_string(),
                key: file_key.to_string(),
                cause,
            })?;

        if updated == 0 {
            warn!("No ledger record for {}, failure not recorded", file_key);
        }
        Ok(updated > 0)
    }

    /// Records that are due and outside their backoff window at `now`.
    /// Never backed up first, then oldest backup first.
    pub fn due_candidates(&self, now: DateTime<Utc>) -> Result<Vec<BackupRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS}
                   FROM backups
                  WHERE (last_backup_date IS NULL OR last_modified_date > last_backup_date)
                    AND (next_attempt_date IS NULL OR next_attempt_date <= ?1)
                  ORDER BY
                    CASE WHEN last_backup_date IS NULL THEN 0 ELSE 1 END,
                    last_backup_date ASC,
                    file_key ASC"
            ))
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "due candidates".to_string(),
                cause,
            })?;

        let rows = stmt
            .query_map([format_timestamp(now)], record_from_row)
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "due candidates".to_string(),
                cause,
            })?;

        rows.collect::<rusqlite::Result<Vec<BackupRecord>>>()
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "collect due candidates".to_string(),
                cause,
            })
    }

    pub fn get(&self, file_key: &str) -> Result<Option<BackupRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM backups WHERE file_key = ?1"),
            [file_key],
            record_from_row,
        )
        .optional()
        .map_err(|cause| BackupError::DatabaseQuery {
            operation: format!("select {}", file_key),
            cause,
        })
    }

    pub fn summary(&self, now: DateTime<Utc>) -> Result<LedgerSummary> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN last_backup_date IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE
                        WHEN (last_backup_date IS NULL OR last_modified_date > last_backup_date)
                         AND (next_attempt_date IS NULL OR next_attempt_date <= ?1)
                        THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN next_attempt_date > ?1 THEN 1 ELSE 0 END), 0)
               FROM backups",
            [format_timestamp(now)],
            |row| {
                Ok(LedgerSummary {
                    total: row.get(0)?,
                    never_backed_up: row.get(1)?,
                    due: row.get(2)?,
                    in_backoff: row.get(3)?,
                })
            },
        )
        .map_err(|cause| BackupError::DatabaseQuery {
            operation: "ledger summary".to_string(),
            cause,
        })
    }

    /// Checkpoint the WAL into the main file and release the pool. Fails when
    /// another connection keeps the checkpoint from completing.
    pub fn close(self) -> Result<()> {
        let conn = self.connection()?;
        let busy: i64 = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "wal checkpoint".to_string(),
                cause,
            })?;
        drop(conn);

        if busy != 0 {
            warn!("WAL checkpoint of {} did not complete", self.path);
            return Err(BackupError::CheckpointIncomplete {
                path: self.path.clone(),
            });
        }

        info!("Ledger closed: {}", self.path);
        Ok(())
    }
}

fn upsert_row(
    conn: &Connection,
    file_key: &str,
    modified_date: DateTime<Utc>,
    project_name: &str,
    file_name: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO backups (file_key, last_modified_date, project_name, file_name)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (file_key) DO UPDATE SET
             last_modified_date = excluded.last_modified_date,
             project_name = excluded.project_name,
             file_name = excluded.file_name",
        (file_key, format_timestamp(modified_date), project_name, file_name),
    )
    .map_err(|cause| BackupError::DatabaseInsert {
        table: "backups".to_string(),
        key: file_key.to_string(),
        cause,
    })?;
    debug!("Upserted ledger record: {} ({})", file_key, file_name);
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        file_key: row.get(0)?,
        project_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        file_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        last_modified_date: timestamp_column(row, 3)?,
        last_backup_date: timestamp_column(row, 4)?,
        next_attempt_date: timestamp_column(row, 5)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(value) => parse_timestamp(&value)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|cause| BackupError::DatabaseQuery {
            operation: "read schema version".to_string(),
            cause,
        })?;

    if current_version > SCHEMA_VERSION {
        return Err(BackupError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        migrate_to_version(conn, version)?;
        conn.pragma_update(None, "user_version", version)
            .map_err(|cause| BackupError::DatabaseQuery {
                operation: "set schema version".to_string(),
                cause,
            })?;
        info!("Ledger schema migrated to version {}", version);
    }
    Ok(())
}

fn migrate_to_version(conn: &Connection, version: i32) -> Result<()> {
    let batch = match version {
        1 => format!("{SCHEMA_V1}\n{NORMALIZE_LEGACY_TIMESTAMPS}"),
        _ => {
            return Err(BackupError::UnsupportedSchemaVersion {
                found: version,
                expected: SCHEMA_VERSION,
            })
        }
    };
    conn.execute_batch(&batch)
        .map_err(|cause| BackupError::DatabaseQuery {
            operation: format!("migrate to schema version {}", version),
            cause,
        })
}
