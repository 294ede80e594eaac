//! Component G: index store (spec §4.7).
//!
//! Backed by `rusqlite` (bundled SQLite) behind an `r2d2` connection pool,
//! run off the async executor via `spawn_blocking` — the idiomatic bridge
//! for a synchronous embedded database inside a `tokio` service. WAL
//! journaling is set at connection-open time; a custom `regexp` predicate
//! and a `mime_for_filename` helper are registered per connection.

mod schema;

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{functions::FunctionFlags, params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::model::FileRecord;

const MAX_RETRIES: u32 = 5;
const RETRY_BACKOFF_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub filter: Option<Filter>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub items: Vec<FileRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PendingCounts {
    pub info: u64,
    pub exif: u64,
    pub thumbnails: u64,
}

#[derive(Clone)]
pub struct IndexStore {
    pool: Pool<SqliteConnectionManager>,
}

impl IndexStore {
    /// Opens (creating if absent) the store at `db_path`, verifies the root
    /// pin against `media_root` (clearing the index if it changed),
    /// ensures the schema, and backfills any legacy rows missing a MIME
    /// type.
    pub async fn open(db_path: std::path::PathBuf, media_root: std::path::PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            register_functions(conn)?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| Error::Store(e.to_string()))?;

        let root_str = media_root.to_string_lossy().to_string();
        let pool_for_init = pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool_for_init.get().map_err(|e| Error::Store(e.to_string()))?;
            schema::ensure_schema(&conn)?;
            let cleared = schema::verify_or_set_root_pin(&mut conn, &root_str)?;
            if cleared {
                warn!(root = %root_str, "media root changed; index cleared and repinned");
            }
            schema::populate_missing_mimes(&conn)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))??;

        info!(db = %db_path.display(), "index store opened");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| Error::Store(e.to_string()))
    }

    /// Merges `partial` into the existing row for `relative_path`, creating
    /// it if absent (MIME inferred from the filename for new rows). Retries
    /// with linear backoff on transient lock contention.
    pub async fn add_or_update_file_data(&self, relative_path: String, partial: FileRecord) -> Result<()> {
        let (folder, file_name) = crate::path::split(&relative_path);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
                schema::upsert(&conn, &folder, &file_name, &partial)
            })
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Atomically renames a row's identity, preserving attributes and
    /// watermarks (spec §3.2 move semantics).
    pub async fn move_file(&self, old_relative: String, new_relative: String) -> Result<()> {
        let (old_folder, old_file_name) = crate::path::split(&old_relative);
        let (new_folder, new_file_name) = crate::path::split(&new_relative);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let mut conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
                schema::move_file(&mut conn, &old_folder, &old_file_name, &new_folder, &new_file_name)
            })
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Clears every watermark on a row without touching its other fields,
    /// via a direct `UPDATE` rather than the upsert's `COALESCE` merge
    /// (spec §3.3's `change` event — see `schema::clear_watermarks`).
    pub async fn clear_watermarks(&self, relative_path: String) -> Result<()> {
        let (folder, file_name) = crate::path::split(&relative_path);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
                schema::clear_watermarks(&conn, &folder, &file_name)
            })
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn delete_file(&self, relative_path: String) -> Result<()> {
        let (folder, file_name) = crate::path::split(&relative_path);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
                conn.execute(
                    "DELETE FROM file_records WHERE folder = ?1 AND file_name = ?2",
                    params![folder, file_name],
                )
                .map_err(|e| Error::Store(e.to_string()))?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Bulk `INSERT OR IGNORE` of bare discovery rows in one transaction;
    /// returns the number of rows actually inserted (pre-existing rows are
    /// left untouched).
    pub async fn insert_bare_paths(
        &self,
        entries: Vec<(String, String, Option<String>)>,
    ) -> Result<usize> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
            schema::insert_bare_paths(&mut conn, &entries)
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn get(&self, relative_path: String) -> Result<Option<FileRecord>> {
        let (folder, file_name) = crate::path::split(&relative_path);
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
            conn.query_row(
                &format!("SELECT {} FROM file_records WHERE folder = ?1 AND file_name = ?2", schema::SELECT_COLUMNS),
                params![folder, file_name],
                schema::row_to_record,
            )
            .optional()
            .map_err(|e| Error::Store(e.to_string()))
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn query(&self, options: QueryOptions) -> Result<QueryResult> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::query(&pool, options))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn count(&self, filter: Option<Filter>) -> Result<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::count(&pool, filter))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Direct child folder names at `folder`, root-aware (spec §4.6).
    pub async fn folders(&self, folder: String) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::direct_child_folders(&pool, &folder))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn batch_missing_info(&self, limit: u32) -> Result<Vec<FileRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            schema::batch_missing_watermark(&pool, "info_processed_at", limit)
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn batch_missing_exif(&self, limit: u32) -> Result<Vec<FileRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            schema::batch_missing_watermark(&pool, "exif_processed_at", limit)
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Videos whose EXIF group is processed, ordered the same way other
    /// batches are, for the HLS pre-encode stage to walk.
    pub async fn batch_video_exif_done(&self, limit: u32) -> Result<Vec<FileRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::batch_video_exif_done(&pool, limit))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn row_count(&self) -> Result<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
            conn.query_row("SELECT COUNT(*) FROM file_records", [], |r| r.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(|e| Error::Store(e.to_string()))
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }

    /// Newest row carrying a given watermark, for `/api/status`'s `recent`
    /// section (spec §4.10). `column` is always a hardcoded literal at call
    /// sites, never user input.
    pub async fn most_recent_by_watermark(&self, column: &'static str) -> Result<Option<FileRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::most_recent_by_watermark(&pool, column))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn video_count(&self) -> Result<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || schema::count_videos(&pool))
            .await
            .map_err(|e| Error::Store(e.to_string()))?
    }

    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
            let info = conn
                .query_row(
                    "SELECT COUNT(*) FROM file_records WHERE info_processed_at IS NULL",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .map_err(|e| Error::Store(e.to_string()))? as u64;
            let exif = conn
                .query_row(
                    "SELECT COUNT(*) FROM file_records WHERE exif_processed_at IS NULL",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .map_err(|e| Error::Store(e.to_string()))? as u64;
            let thumbnails = conn
                .query_row(
                    "SELECT COUNT(*) FROM file_records \
                     WHERE exif_processed_at IS NOT NULL AND hls_processed_at IS NULL \
                     AND mime_type LIKE 'video/%'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .map_err(|e| Error::Store(e.to_string()))? as u64;
            Ok(PendingCounts { info, exif, thumbnails })
        })
        .await
        .map_err(|e| Error::Store(e.to_string()))?
    }
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: String = ctx.get(1)?;
            let re = regex::Regex::new(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(re.is_match(&text))
        },
    )?;

    conn.create_scalar_function(
        "mime_for_filename",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let name: String = ctx.get(0)?;
            Ok(media_file_ext::mime_for_filename(&name).map(|s| s.to_string()))
        },
    )?;

    Ok(())
}

/// Retries a transient-lock-prone operation with linear backoff
/// (10 ms × attempt, up to `MAX_RETRIES`), per spec §4.7.
fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(Error::Store(msg))
                if attempt < MAX_RETRIES && (msg.contains("locked") || msg.contains("busy")) =>
            {
                attempt += 1;
                debug!(attempt, "index store contention; retrying");
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64));
            }
            Err(other) => return Err(other),
        }
    }
}

