use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Serialize;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Generation stamped on records retired by a change-feed tombstone.
/// Real generations start at 1 and only grow, so 0 is never current.
const RETIRED_GENERATION: i64 = 0;

const RECORD_COLUMNS: &str = "user_id, id, name, is_folder, size, parent_id, remote_path, local_path, content_tag, created_at, modified_at, generation_mark";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid sync state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Running,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Running => "running",
            SyncState::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<Self, IndexError> {
        match value {
            "idle" => Ok(SyncState::Idle),
            "running" => Ok(SyncState::Running),
            "error" => Ok(SyncState::Error),
            other => Err(IndexError::InvalidState(other.to_string())),
        }
    }
}

/// What a pass writes for one observed remote item.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInput {
    pub user_id: String,
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub size: Option<i64>,
    pub parent_id: Option<String>,
    pub remote_path: Option<String>,
    pub local_path: PathBuf,
    pub content_tag: Option<String>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub user_id: String,
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub size: Option<i64>,
    pub parent_id: Option<String>,
    pub remote_path: Option<String>,
    pub local_path: PathBuf,
    pub content_tag: Option<String>,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub generation_mark: i64,
}

impl IndexRecord {
    pub fn to_input(&self) -> RecordInput {
        RecordInput {
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            name: self.name.clone(),
            is_folder: self.is_folder,
            size: self.size,
            parent_id: self.parent_id.clone(),
            remote_path: self.remote_path.clone(),
            local_path: self.local_path.clone(),
            content_tag: self.content_tag.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub user_id: String,
    pub state: SyncState,
    pub last_error: Option<String>,
    pub last_full_sync_at: Option<i64>,
    pub last_incremental_sync_at: Option<i64>,
    pub resume_cursor: Option<String>,
    pub started_at: Option<i64>,
}

impl SyncStatus {
    fn idle(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            state: SyncState::Idle,
            last_error: None,
            last_full_sync_at: None,
            last_incremental_sync_at: None,
            resume_cursor: None,
            started_at: None,
        }
    }
}

/// Partial status write: `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: Option<SyncState>,
    pub last_error: Option<Option<String>>,
    pub resume_cursor: Option<Option<String>>,
    pub last_full_sync_at: Option<i64>,
    pub last_incremental_sync_at: Option<i64>,
}

impl StatusUpdate {
    pub fn state(state: SyncState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Records removed by a sweep. `local_paths` only lists paths that no
/// current record still owns, so callers may delete them from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub ids: Vec<String>,
    pub local_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub display_name: Option<String>,
    pub item_count: i64,
    pub state: Option<SyncState>,
    pub last_full_sync_at: Option<i64>,
    pub last_incremental_sync_at: Option<i64>,
}

/// Persisted table of previously observed remote items, one status row per
/// user, and the generation counter that drives mark and sweep.
#[derive(Clone)]
pub struct SyncIndex {
    pool: SqlitePool,
}

impl SyncIndex {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let index = Self { pool };
        index.init().await?;
        Ok(index)
    }

    pub async fn open_in_memory() -> Result<Self, IndexError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let index = Self { pool };
        index.init().await?;
        Ok(index)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_status_row(&self, user_id: &str) -> Result<(), IndexError> {
        sqlx::query("INSERT INTO sync_status (user_id) VALUES (?1) ON CONFLICT(user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Starts a new generation for `user_id`. Records not upserted (or
    /// carried forward) afterwards are collected by the next `sweep`.
    pub async fn begin_generation(&self, user_id: &str) -> Result<i64, IndexError> {
        self.ensure_status_row(user_id).await?;
        let row = sqlx::query(
            "UPDATE sync_status SET generation = generation + 1 WHERE user_id = ?1 RETURNING generation",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("generation")?)
    }

    pub async fn current_generation(&self, user_id: &str) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT generation FROM sync_status WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("generation")?),
            None => Ok(1),
        }
    }

    /// Inserts or updates a record by id and stamps the current generation.
    /// Returns the previously stored local path when it differs from the new
    /// one, which signals a move.
    pub async fn upsert(&self, record: &RecordInput) -> Result<Option<PathBuf>, IndexError> {
        let local_path = record.local_path.to_string_lossy().into_owned();
        let mut tx = self.pool.begin().await?;

        // The first statement is a write so the transaction holds the write
        // lock before it reads the previous path.
        sqlx::query("INSERT INTO sync_status (user_id) VALUES (?1) ON CONFLICT(user_id) DO NOTHING")
            .bind(&record.user_id)
            .execute(&mut *tx)
            .await?;
        let generation: i64 = sqlx::query("SELECT generation FROM sync_status WHERE user_id = ?1")
            .bind(&record.user_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("generation")?;
        let previous: Option<String> =
            sqlx::query("SELECT local_path FROM drive_items WHERE user_id = ?1 AND id = ?2")
                .bind(&record.user_id)
                .bind(&record.id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("local_path"))
                .transpose()?;

        sqlx::query(
            "INSERT INTO drive_items (
                user_id, id, name, is_folder, size, parent_id, remote_path,
                local_path, content_tag, created_at, modified_at, generation_mark
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(user_id, id) DO UPDATE SET
                name = excluded.name,
                is_folder = excluded.is_folder,
                size = excluded.size,
                parent_id = excluded.parent_id,
                remote_path = excluded.remote_path,
                local_path = excluded.local_path,
                content_tag = excluded.content_tag,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                generation_mark = excluded.generation_mark",
        )
        .bind(&record.user_id)
        .bind(&record.id)
        .bind(&record.name)
        .bind(if record.is_folder { 1 } else { 0 })
        .bind(record.size)
        .bind(&record.parent_id)
        .bind(&record.remote_path)
        .bind(&local_path)
        .bind(&record.content_tag)
        .bind(record.created_at)
        .bind(record.modified_at)
        .bind(generation)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous
            .filter(|old| *old != local_path)
            .map(PathBuf::from))
    }

    /// Puts back a record exactly as it was before a failed materialization,
    /// stamped with the current generation so the sweep keeps it.
    pub async fn restore(&self, prior: &IndexRecord) -> Result<(), IndexError> {
        self.upsert(&prior.to_input()).await?;
        Ok(())
    }

    /// Clears the content tag so the next pass re-fetches the item.
    pub async fn unconfirm(&self, user_id: &str, id: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE drive_items SET content_tag = NULL WHERE user_id = ?1 AND id = ?2")
            .bind(user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks a record as unobserved so the next sweep collects it even if
    /// the rest of the generation is carried forward.
    pub async fn retire(&self, user_id: &str, id: &str) -> Result<bool, IndexError> {
        let result =
            sqlx::query("UPDATE drive_items SET generation_mark = ?1 WHERE user_id = ?2 AND id = ?3")
                .bind(RETIRED_GENERATION)
                .bind(user_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamps every record from an earlier generation with the current one,
    /// except retired records. Used when enumeration did not see the whole
    /// drive (change feed, deadline) so unreported items survive the sweep.
    pub async fn carry_forward(&self, user_id: &str) -> Result<u64, IndexError> {
        let result = sqlx::query(
            "UPDATE drive_items
             SET generation_mark = (SELECT generation FROM sync_status WHERE user_id = ?1)
             WHERE user_id = ?1
                AND generation_mark <> ?2
                AND generation_mark < (SELECT generation FROM sync_status WHERE user_id = ?1)",
        )
        .bind(user_id)
        .bind(RETIRED_GENERATION)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes and returns every record of `user_id` not stamped with the
    /// current generation. This is the only path that removes records.
    pub async fn sweep(&self, user_id: &str) -> Result<SweepResult, IndexError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "DELETE FROM drive_items
             WHERE user_id = ?1
                AND generation_mark < COALESCE((SELECT generation FROM sync_status WHERE user_id = ?1), 1)
             RETURNING id, local_path",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut result = SweepResult::default();
        for row in rows {
            let id: String = row.try_get("id")?;
            let local_path: String = row.try_get("local_path")?;
            // Only current records remain, so any match is a newer owner.
            let claimed = sqlx::query(
                "SELECT 1 FROM drive_items WHERE user_id = ?1 AND local_path = ?2 LIMIT 1",
            )
            .bind(user_id)
            .bind(&local_path)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            result.ids.push(id);
            if !claimed {
                result.local_paths.push(PathBuf::from(local_path));
            }
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Whether a current-generation record other than `except_id` owns `path`.
    pub async fn path_claimed(
        &self,
        user_id: &str,
        path: &Path,
        except_id: &str,
    ) -> Result<bool, IndexError> {
        let row = sqlx::query(
            "SELECT 1 FROM drive_items
             WHERE user_id = ?1
                AND local_path = ?2
                AND id <> ?3
                AND generation_mark = (SELECT generation FROM sync_status WHERE user_id = ?1)
             LIMIT 1",
        )
        .bind(user_id)
        .bind(path.to_string_lossy().as_ref())
        .bind(except_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn get_record(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<IndexRecord>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM drive_items WHERE user_id = ?1 AND id = ?2"
        ))
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_records(&self, user_id: &str) -> Result<Vec<IndexRecord>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM drive_items WHERE user_id = ?1 ORDER BY local_path ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get_status(&self, user_id: &str) -> Result<SyncStatus, IndexError> {
        let row = sqlx::query(
            "SELECT user_id, state, last_error, last_full_sync_at, last_incremental_sync_at, resume_cursor, started_at
             FROM sync_status WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncStatus::idle(user_id));
        };
        let state: String = row.try_get("state")?;
        Ok(SyncStatus {
            user_id: row.try_get("user_id")?,
            state: SyncState::parse(&state)?,
            last_error: row.try_get("last_error")?,
            last_full_sync_at: row.try_get("last_full_sync_at")?,
            last_incremental_sync_at: row.try_get("last_incremental_sync_at")?,
            resume_cursor: row.try_get("resume_cursor")?,
            started_at: row.try_get("started_at")?,
        })
    }

    pub async fn set_status(&self, user_id: &str, update: &StatusUpdate) -> Result<(), IndexError> {
        self.ensure_status_row(user_id).await?;
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE sync_status SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(state) = update.state {
                fields.push("state = ");
                fields.push_bind_unseparated(state.as_str());
            }
            if let Some(last_error) = &update.last_error {
                fields.push("last_error = ");
                fields.push_bind_unseparated(last_error.clone());
            }
            if let Some(cursor) = &update.resume_cursor {
                fields.push("resume_cursor = ");
                fields.push_bind_unseparated(cursor.clone());
            }
            if let Some(at) = update.last_full_sync_at {
                fields.push("last_full_sync_at = ");
                fields.push_bind_unseparated(at);
            }
            if let Some(at) = update.last_incremental_sync_at {
                fields.push("last_incremental_sync_at = ");
                fields.push_bind_unseparated(at);
            }
        }
        builder.push(" WHERE user_id = ");
        builder.push_bind(user_id);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Atomically moves the user's status to `Running`.
    ///
    /// Returns `false` when another pass already holds it, unless that pass
    /// started more than `stale_after` ago (it is presumed dead).
    pub async fn try_begin_pass(
        &self,
        user_id: &str,
        now: i64,
        stale_after: Duration,
    ) -> Result<bool, IndexError> {
        self.ensure_status_row(user_id).await?;
        let threshold = now.saturating_sub(stale_after.as_secs() as i64);
        let result = sqlx::query(
            "UPDATE sync_status
             SET state = 'running', started_at = ?1
             WHERE user_id = ?2
                AND (state <> 'running' OR started_at IS NULL OR started_at <= ?3)",
        )
        .bind(now)
        .bind(user_id)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn display_name(&self, user_id: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT display_name FROM accounts WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("display_name")?),
            None => Ok(None),
        }
    }

    pub async fn list_user_summaries(&self) -> Result<Vec<UserSummary>, IndexError> {
        let rows = sqlx::query(
            "SELECT
                a.id AS user_id,
                a.display_name AS display_name,
                (SELECT COUNT(*) FROM drive_items d WHERE d.user_id = a.id) AS item_count,
                s.state AS state,
                s.last_full_sync_at AS last_full_sync_at,
                s.last_incremental_sync_at AS last_incremental_sync_at
             FROM accounts a
             LEFT JOIN sync_status s ON s.user_id = a.id
             ORDER BY a.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state: Option<String> = row.try_get("state")?;
            out.push(UserSummary {
                user_id: row.try_get("user_id")?,
                display_name: row.try_get("display_name")?,
                item_count: row.try_get("item_count")?,
                state: state.as_deref().map(SyncState::parse).transpose()?,
                last_full_sync_at: row.try_get("last_full_sync_at")?,
                last_incremental_sync_at: row.try_get("last_incremental_sync_at")?,
            });
        }
        Ok(out)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord, IndexError> {
    let is_folder: i64 = row.try_get("is_folder")?;
    let local_path: String = row.try_get("local_path")?;
    Ok(IndexRecord {
        user_id: row.try_get("user_id")?,
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_folder: is_folder != 0,
        size: row.try_get("size")?,
        parent_id: row.try_get("parent_id")?,
        remote_path: row.try_get("remote_path")?,
        local_path: PathBuf::from(local_path),
        content_tag: row.try_get("content_tag")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        generation_mark: row.try_get("generation_mark")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("onedrive-mirror");
    path.push("sync.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
