use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};

use super::models::*;

/// Async-safe handle to the migration database.
///
/// Wraps `MigrationDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MigrationDb>>,
}

impl DbHandle {
    pub fn new(db: MigrationDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MigrationDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MigrationDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct MigrationDb {
    conn: Connection,
}

/// Timestamps are stored as RFC 3339 with microseconds so that string order
/// matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

impl MigrationDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS migrations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    svn_group TEXT NOT NULL,
                    svn_project TEXT NOT NULL,
                    gitlab_group TEXT NOT NULL,
                    user TEXT NOT NULL,
                    password TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS migration_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    migration_id INTEGER NOT NULL REFERENCES migrations(id) ON DELETE CASCADE,
                    step TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'RUNNING',
                    date TEXT NOT NULL,
                    data TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_migrations_status ON migrations(status);
                CREATE INDEX IF NOT EXISTS idx_history_migration ON migration_history(migration_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Migrations ────────────────────────────────────────────────────

    pub fn create_migration(&self, new: &NewMigration) -> Result<Migration> {
        self.conn
            .execute(
                "INSERT INTO migrations (svn_group, svn_project, gitlab_group, user, password) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.svn_group,
                    new.svn_project,
                    new.gitlab_group,
                    new.user,
                    new.password
                ],
            )
            .context("Failed to insert migration")?;
        let id = self.conn.last_insert_rowid();
        self.get_migration(id)?
            .context("Migration not found after insert")
    }

    pub fn get_migration(&self, id: i64) -> Result<Option<Migration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, svn_group, svn_project, gitlab_group, user, password, status, created_at, updated_at
                 FROM migrations WHERE id = ?1",
            )
            .context("Failed to prepare get_migration")?;
        let mut rows = stmt
            .query_map(params![id], MigrationRow::from_row)
            .context("Failed to query migration")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read migration row")?;
                Ok(Some(r.into_migration()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_migrations(&self) -> Result<Vec<Migration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, svn_group, svn_project, gitlab_group, user, password, status, created_at, updated_at
                 FROM migrations ORDER BY id",
            )
            .context("Failed to prepare list_migrations")?;
        let rows = stmt
            .query_map([], MigrationRow::from_row)
            .context("Failed to query migrations")?;
        let mut migrations = Vec::new();
        for row in rows {
            let r = row.context("Failed to read migration row")?;
            migrations.push(r.into_migration()?);
        }
        Ok(migrations)
    }

    /// Persist the migration's current status. A single-row write; it is not
    /// coupled to any history write.
    ///
    /// The write only lands when the stored status may move to the new one
    /// (see `Status::saved_over`), so a job never goes backwards, e.g. from a
    /// reconciled FAILED to DONE.
    pub fn save_migration(&self, migration: &Migration) -> Result<Migration> {
        let status = migration.status;
        let from = status.saved_over();
        if from.is_empty() {
            anyhow::bail!("Migration {} cannot be saved as {}", migration.id, status);
        }
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE migrations SET status = ?1, updated_at = datetime('now') WHERE id = ?2 AND status IN ({})",
            allowed
        );
        let changed = self
            .conn
            .execute(&sql, params![status.as_str(), migration.id])
            .context("Failed to update migration")?;
        if changed == 0 {
            match self.get_migration(migration.id)? {
                None => anyhow::bail!("Migration {} not found", migration.id),
                Some(current) => anyhow::bail!(
                    "Migration {} is {}; refusing to save it as {}",
                    migration.id,
                    current.status,
                    status
                ),
            }
        }
        self.get_migration(migration.id)?
            .context("Migration not found after update")
    }

    // ── History ───────────────────────────────────────────────────────

    /// Insert a new RUNNING history record.
    pub fn insert_history(&self, new: &NewHistory) -> Result<MigrationHistory> {
        self.conn
            .execute(
                "INSERT INTO migration_history (migration_id, step, status, date, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.migration_id,
                    new.step.as_str(),
                    Status::Running.as_str(),
                    format_timestamp(&new.date),
                    new.data
                ],
            )
            .context("Failed to insert history record")?;
        let id = self.conn.last_insert_rowid();
        self.get_history(id)?
            .context("History record not found after insert")
    }

    /// Move a RUNNING record to a terminal status. Records already terminal
    /// are left untouched; returns whether a row changed.
    pub fn update_history_status(&self, id: i64, status: Status) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE migration_history SET status = ?1 WHERE id = ?2 AND status = 'RUNNING'",
                params![status.as_str(), id],
            )
            .context("Failed to update history record")?;
        Ok(changed > 0)
    }

    pub fn get_history(&self, id: i64) -> Result<Option<MigrationHistory>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, migration_id, step, status, date, data FROM migration_history WHERE id = ?1",
            )
            .context("Failed to prepare get_history")?;
        let mut rows = stmt
            .query_map(params![id], HistoryRow::from_row)
            .context("Failed to query history record")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read history row")?.into_history()?,
            )),
            None => Ok(None),
        }
    }

    /// All step records of a migration, oldest first.
    pub fn list_history(&self, migration_id: i64) -> Result<Vec<MigrationHistory>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, migration_id, step, status, date, data FROM migration_history
                 WHERE migration_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_history")?;
        let rows = stmt
            .query_map(params![migration_id], HistoryRow::from_row)
            .context("Failed to query history")?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.context("Failed to read history row")?.into_history()?);
        }
        Ok(history)
    }

    pub fn get_migration_detail(&self, id: i64) -> Result<Option<MigrationDetail>> {
        let Some(migration) = self.get_migration(id)? else {
            return Ok(None);
        };
        let history = self.list_history(id)?;
        Ok(Some(MigrationDetail { migration, history }))
    }

    /// Mark every RUNNING migration and RUNNING history record FAILED.
    ///
    /// Only valid when no migration can be executing, i.e. at process start.
    /// Returns the number of migrations that were reconciled.
    pub fn fail_interrupted(&self) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin reconciliation")?;
        tx.execute(
            "UPDATE migration_history SET status = 'FAILED' WHERE status = 'RUNNING'",
            [],
        )
        .context("Failed to reconcile history records")?;
        let migrations = tx
            .execute(
                "UPDATE migrations SET status = 'FAILED', updated_at = datetime('now') WHERE status = 'RUNNING'",
                [],
            )
            .context("Failed to reconcile migrations")?;
        tx.commit().context("Failed to commit reconciliation")?;
        Ok(migrations)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

/// Intermediate row struct for migrations.
struct MigrationRow {
    id: i64,
    svn_group: String,
    svn_project: String,
    gitlab_group: String,
    user: String,
    password: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl MigrationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            svn_group: row.get(1)?,
            svn_project: row.get(2)?,
            gitlab_group: row.get(3)?,
            user: row.get(4)?,
            password: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_migration(self) -> Result<Migration> {
        let status = Status::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse migration status")?;
        Ok(Migration {
            id: self.id,
            svn_group: self.svn_group,
            svn_project: self.svn_project,
            gitlab_group: self.gitlab_group,
            user: self.user,
            password: self.password,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for migration_history.
struct HistoryRow {
    id: i64,
    migration_id: i64,
    step: String,
    status: String,
    date: String,
    data: Option<String>,
}

impl HistoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            migration_id: row.get(1)?,
            step: row.get(2)?,
            status: row.get(3)?,
            date: row.get(4)?,
            data: row.get(5)?,
        })
    }

    fn into_history(self) -> Result<MigrationHistory> {
        let step = Step::from_str(&self.step)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse history step")?;
        let status = Status::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse history status")?;
        Ok(MigrationHistory {
            id: self.id,
            migration_id: self.migration_id,
            step,
            status,
            date: parse_timestamp(&self.date)?,
            data: self.data,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
