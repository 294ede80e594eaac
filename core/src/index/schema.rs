//! Schema definition, migrations, and the row-level SQL for `IndexStore`.
//! Kept separate from the pool/async-bridge plumbing in `mod.rs`.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::model::FileRecord;

use super::{QueryOptions, QueryResult};

pub(super) const SELECT_COLUMNS: &str = "folder, file_name, mime_type, size_in_bytes, created, modified, \
    date_taken, dimension_width, dimension_height, location_latitude, location_longitude, camera_make, \
    camera_model, exposure_time, aperture, iso, focal_length, lens, video_duration_secs, video_framerate, \
    video_codec, audio_codec, rating, tags_joined, orientation, ai_description, ai_tags_joined, \
    info_processed_at, exif_processed_at, hls_processed_at";

const SCHEMA_VERSION: &str = "1";

pub(super) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS file_records (
            folder TEXT NOT NULL,
            file_name TEXT NOT NULL,
            mime_type TEXT,
            size_in_bytes INTEGER,
            created INTEGER,
            modified INTEGER,
            date_taken INTEGER,
            dimension_width INTEGER,
            dimension_height INTEGER,
            location_latitude REAL,
            location_longitude REAL,
            camera_make TEXT,
            camera_model TEXT,
            exposure_time TEXT,
            aperture REAL,
            iso INTEGER,
            focal_length REAL,
            lens TEXT,
            video_duration_secs REAL,
            video_framerate REAL,
            video_codec TEXT,
            audio_codec TEXT,
            rating INTEGER,
            tags_joined TEXT NOT NULL DEFAULT '',
            orientation INTEGER,
            ai_description TEXT,
            ai_tags_joined TEXT NOT NULL DEFAULT '',
            info_processed_at INTEGER,
            exif_processed_at INTEGER,
            hls_processed_at INTEGER,
            PRIMARY KEY (folder, file_name)
        );
        CREATE INDEX IF NOT EXISTS idx_file_records_date_taken ON file_records(date_taken DESC);
        CREATE INDEX IF NOT EXISTS idx_file_records_mime_type ON file_records(mime_type);
        CREATE INDEX IF NOT EXISTS idx_file_records_folder ON file_records(folder);
        CREATE INDEX IF NOT EXISTS idx_file_records_info_watermark ON file_records(info_processed_at);
        CREATE INDEX IF NOT EXISTS idx_file_records_exif_watermark ON file_records(exif_processed_at);
        CREATE INDEX IF NOT EXISTS idx_file_records_hls_watermark ON file_records(hls_processed_at);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
    .map_err(|e| Error::Store(e.to_string()))?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )
    .map_err(|e| Error::Store(e.to_string()))?;

    Ok(())
}

/// Returns `true` if the pin differed and the index was cleared.
pub(super) fn verify_or_set_root_pin(conn: &mut Connection, root: &str) -> Result<bool> {
    let existing: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'root_path'", [], |r| r.get(0))
        .optional()
        .map_err(|e| Error::Store(e.to_string()))?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('root_path', ?1)",
                params![root],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
            Ok(false)
        }
        Some(prev) if prev == root => Ok(false),
        Some(_) => {
            let tx = conn.transaction().map_err(|e| Error::Store(e.to_string()))?;
            tx.execute("DELETE FROM file_records", [])
                .map_err(|e| Error::Store(e.to_string()))?;
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('root_path', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![root],
            )
            .map_err(|e| Error::Store(e.to_string()))?;
            tx.commit().map_err(|e| Error::Store(e.to_string()))?;
            Ok(true)
        }
    }
}

pub(super) fn populate_missing_mimes(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE file_records SET mime_type = mime_for_filename(file_name) WHERE mime_type IS NULL",
        [],
    )
    .map_err(|e| Error::Store(e.to_string()))?;
    Ok(())
}

const UPSERT_SQL: &str = "INSERT INTO file_records (
        folder, file_name, mime_type, size_in_bytes, created, modified, date_taken, dimension_width,
        dimension_height, location_latitude, location_longitude, camera_make, camera_model, exposure_time,
        aperture, iso, focal_length, lens, video_duration_secs, video_framerate, video_codec, audio_codec,
        rating, tags_joined, orientation, ai_description, ai_tags_joined, info_processed_at, exif_processed_at,
        hls_processed_at
    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30)
    ON CONFLICT(folder, file_name) DO UPDATE SET
        mime_type = COALESCE(excluded.mime_type, file_records.mime_type),
        size_in_bytes = COALESCE(excluded.size_in_bytes, file_records.size_in_bytes),
        created = COALESCE(excluded.created, file_records.created),
        modified = COALESCE(excluded.modified, file_records.modified),
        date_taken = COALESCE(excluded.date_taken, file_records.date_taken),
        dimension_width = COALESCE(excluded.dimension_width, file_records.dimension_width),
        dimension_height = COALESCE(excluded.dimension_height, file_records.dimension_height),
        location_latitude = COALESCE(excluded.location_latitude, file_records.location_latitude),
        location_longitude = COALESCE(excluded.location_longitude, file_records.location_longitude),
        camera_make = COALESCE(excluded.camera_make, file_records.camera_make),
        camera_model = COALESCE(excluded.camera_model, file_records.camera_model),
        exposure_time = COALESCE(excluded.exposure_time, file_records.exposure_time),
        aperture = COALESCE(excluded.aperture, file_records.aperture),
        iso = COALESCE(excluded.iso, file_records.iso),
        focal_length = COALESCE(excluded.focal_length, file_records.focal_length),
        lens = COALESCE(excluded.lens, file_records.lens),
        video_duration_secs = COALESCE(excluded.video_duration_secs, file_records.video_duration_secs),
        video_framerate = COALESCE(excluded.video_framerate, file_records.video_framerate),
        video_codec = COALESCE(excluded.video_codec, file_records.video_codec),
        audio_codec = COALESCE(excluded.audio_codec, file_records.audio_codec),
        rating = COALESCE(excluded.rating, file_records.rating),
        tags_joined = CASE WHEN excluded.tags_joined = '' THEN file_records.tags_joined ELSE excluded.tags_joined END,
        orientation = COALESCE(excluded.orientation, file_records.orientation),
        ai_description = COALESCE(excluded.ai_description, file_records.ai_description),
        ai_tags_joined = CASE WHEN excluded.ai_tags_joined = '' THEN file_records.ai_tags_joined ELSE excluded.ai_tags_joined END,
        info_processed_at = COALESCE(excluded.info_processed_at, file_records.info_processed_at),
        exif_processed_at = COALESCE(excluded.exif_processed_at, file_records.exif_processed_at),
        hls_processed_at = COALESCE(excluded.hls_processed_at, file_records.hls_processed_at)";

pub(super) fn upsert(conn: &Connection, folder: &str, file_name: &str, partial: &FileRecord) -> Result<()> {
    let mime_type = partial
        .mime_type
        .clone()
        .or_else(|| media_file_ext::mime_for_filename(file_name).map(str::to_string));

    conn.execute(
        UPSERT_SQL,
        params![
            folder,
            file_name,
            mime_type,
            partial.size_in_bytes,
            partial.created,
            partial.modified,
            partial.date_taken,
            partial.dimension_width,
            partial.dimension_height,
            partial.location_latitude,
            partial.location_longitude,
            partial.camera_make,
            partial.camera_model,
            partial.exposure_time,
            partial.aperture,
            partial.iso,
            partial.focal_length,
            partial.lens,
            partial.video_duration_secs,
            partial.video_framerate,
            partial.video_codec,
            partial.audio_codec,
            partial.rating,
            filter::join_tags(&partial.tags),
            partial.orientation,
            partial.ai_description,
            filter::join_tags(&partial.ai_tags),
            partial.info_processed_at,
            partial.exif_processed_at,
            partial.hls_processed_at,
        ],
    )
    .map_err(|e| Error::Store(e.to_string()))?;
    Ok(())
}

/// Explicitly clears every watermark column for a row, bypassing
/// `UPSERT_SQL`'s `COALESCE` merge (which can never turn a set column back
/// to `NULL`). Used when a file's contents change on disk: spec §3.3's
/// `change` event must force the row back through every enrichment stage.
pub(super) fn clear_watermarks(conn: &Connection, folder: &str, file_name: &str) -> Result<()> {
    conn.execute(
        "UPDATE file_records SET info_processed_at = NULL, exif_processed_at = NULL, hls_processed_at = NULL \
         WHERE folder = ?1 AND file_name = ?2",
        params![folder, file_name],
    )
    .map_err(|e| Error::Store(e.to_string()))?;
    Ok(())
}

pub(super) fn move_file(
    conn: &mut Connection,
    old_folder: &str,
    old_file_name: &str,
    new_folder: &str,
    new_file_name: &str,
) -> Result<()> {
    let tx = conn.transaction().map_err(|e| Error::Store(e.to_string()))?;

    let existing = tx
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM file_records WHERE folder = ?1 AND file_name = ?2"),
            params![old_folder, old_file_name],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Store(e.to_string()))?;

    let Some(mut record) = existing else {
        return Err(Error::NotFound(format!("{old_folder}{old_file_name}")));
    };

    tx.execute(
        "DELETE FROM file_records WHERE folder = ?1 AND file_name = ?2",
        params![old_folder, old_file_name],
    )
    .map_err(|e| Error::Store(e.to_string()))?;

    record.folder = new_folder.to_string();
    record.file_name = new_file_name.to_string();
    upsert(&tx, new_folder, new_file_name, &record)?;

    tx.commit().map_err(|e| Error::Store(e.to_string()))?;
    Ok(())
}

pub(super) fn insert_bare_paths(
    conn: &mut Connection,
    entries: &[(String, String, Option<String>)],
) -> Result<usize> {
    let tx = conn.transaction().map_err(|e| Error::Store(e.to_string()))?;
    let mut inserted = 0usize;
    {
        let mut stmt = tx
            .prepare(
                "INSERT OR IGNORE INTO file_records (folder, file_name, mime_type, tags_joined, ai_tags_joined) \
                 VALUES (?1, ?2, ?3, '', '')",
            )
            .map_err(|e| Error::Store(e.to_string()))?;
        for (folder, file_name, mime_type) in entries {
            let mime_type = mime_type
                .clone()
                .or_else(|| media_file_ext::mime_for_filename(file_name).map(str::to_string));
            let changed = stmt
                .execute(params![folder, file_name, mime_type])
                .map_err(|e| Error::Store(e.to_string()))?;
            inserted += changed;
        }
    }
    tx.commit().map_err(|e| Error::Store(e.to_string()))?;
    Ok(inserted)
}

pub(super) fn row_to_record(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        folder: row.get(0)?,
        file_name: row.get(1)?,
        mime_type: row.get(2)?,
        size_in_bytes: row.get(3)?,
        created: row.get(4)?,
        modified: row.get(5)?,
        date_taken: row.get(6)?,
        dimension_width: row.get(7)?,
        dimension_height: row.get(8)?,
        location_latitude: row.get(9)?,
        location_longitude: row.get(10)?,
        camera_make: row.get(11)?,
        camera_model: row.get(12)?,
        exposure_time: row.get(13)?,
        aperture: row.get(14)?,
        iso: row.get(15)?,
        focal_length: row.get(16)?,
        lens: row.get(17)?,
        video_duration_secs: row.get(18)?,
        video_framerate: row.get(19)?,
        video_codec: row.get(20)?,
        audio_codec: row.get(21)?,
        rating: row.get(22)?,
        tags: split_tags(row.get(23)?),
        orientation: row.get(24)?,
        ai_description: row.get(25)?,
        ai_tags: split_tags(row.get(26)?),
        faces: Vec::new(),
        info_processed_at: row.get(27)?,
        exif_processed_at: row.get(28)?,
        hls_processed_at: row.get(29)?,
    })
}

fn split_tags(joined: String) -> Vec<String> {
    joined
        .split(filter::TAG_DELIM)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

const SORT_CLAUSE: &str = "ORDER BY (date_taken IS NULL) ASC, date_taken DESC, folder ASC, file_name ASC";

pub(super) fn query(pool: &Pool<SqliteConnectionManager>, options: QueryOptions) -> Result<QueryResult> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;

    let (where_clause, params_vec) = match &options.filter {
        Some(f) => filter::to_sql(f)?,
        None => ("1=1".to_string(), Vec::new()),
    };

    let total = count_with_where(&conn, &where_clause, &params_vec)?;

    let page = options.page.max(1);
    let page_size = options.page_size.max(1);
    let offset = (page - 1) as i64 * page_size as i64;

    // Anonymous `?` placeholders throughout (matching `filter::to_sql`'s
    // style) rather than mixing with numbered `?N` ones, which SQLite does
    // not guarantee to interleave consistently in one statement.
    let sql = format!("SELECT {SELECT_COLUMNS} FROM file_records WHERE {where_clause} {SORT_CLAUSE} LIMIT ? OFFSET ?");

    let mut bound = params_vec.clone();
    bound.push(SqlValue::Integer(page_size as i64));
    bound.push(SqlValue::Integer(offset));

    let mut stmt = conn.prepare(&sql).map_err(|e| Error::Store(e.to_string()))?;
    let items = stmt
        .query_map(params_from_iter(bound.iter()), row_to_record)
        .map_err(|e| Error::Store(e.to_string()))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::Store(e.to_string()))?;

    Ok(QueryResult { items, total, page, page_size })
}

pub(super) fn count(pool: &Pool<SqliteConnectionManager>, filter: Option<Filter>) -> Result<u64> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    let (where_clause, params_vec) = match &filter {
        Some(f) => filter::to_sql(f)?,
        None => ("1=1".to_string(), Vec::new()),
    };
    count_with_where(&conn, &where_clause, &params_vec)
}

fn count_with_where(conn: &Connection, where_clause: &str, params_vec: &[SqlValue]) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM file_records WHERE {where_clause}");
    conn.query_row(&sql, params_from_iter(params_vec.iter()), |r| r.get::<_, i64>(0))
        .map(|n| n as u64)
        .map_err(|e| Error::Store(e.to_string()))
}

pub(super) fn direct_child_folders(pool: &Pool<SqliteConnectionManager>, folder: &str) -> Result<Vec<String>> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    let folder = crate::path::normalize_folder(folder);

    let mut stmt = conn
        .prepare("SELECT DISTINCT folder FROM file_records WHERE folder LIKE ?1")
        .map_err(|e| Error::Store(e.to_string()))?;
    let rows = stmt
        .query_map(params![format!("{folder}%")], |r| r.get::<_, String>(0))
        .map_err(|e| Error::Store(e.to_string()))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::Store(e.to_string()))?;

    let mut children = std::collections::BTreeSet::new();
    for candidate in rows {
        let Some(rest) = candidate.strip_prefix(&folder) else { continue };
        if rest.is_empty() {
            continue;
        }
        if let Some((first_segment, _)) = rest.split_once('/') {
            if !first_segment.is_empty() {
                children.insert(first_segment.to_string());
            }
        }
    }
    Ok(children.into_iter().collect())
}

pub(super) fn batch_missing_watermark(
    pool: &Pool<SqliteConnectionManager>,
    watermark_column: &str,
    limit: u32,
) -> Result<Vec<FileRecord>> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM file_records WHERE {watermark_column} IS NULL \
         ORDER BY created DESC, folder DESC, file_name DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| Error::Store(e.to_string()))?;
    stmt.query_map(params![limit], row_to_record)
        .map_err(|e| Error::Store(e.to_string()))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::Store(e.to_string()))
}

/// Newest row where `column` is set, for `/api/status`'s `recent` section.
pub(super) fn most_recent_by_watermark(
    pool: &Pool<SqliteConnectionManager>,
    column: &str,
) -> Result<Option<FileRecord>> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM file_records WHERE {column} IS NOT NULL ORDER BY {column} DESC LIMIT 1"
    );
    conn.query_row(&sql, [], row_to_record)
        .optional()
        .map_err(|e| Error::Store(e.to_string()))
}

pub(super) fn count_videos(pool: &Pool<SqliteConnectionManager>) -> Result<u64> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    conn.query_row(
        "SELECT COUNT(*) FROM file_records WHERE mime_type LIKE 'video/%'",
        [],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(|e| Error::Store(e.to_string()))
}

pub(super) fn batch_video_exif_done(
    pool: &Pool<SqliteConnectionManager>,
    limit: u32,
) -> Result<Vec<FileRecord>> {
    let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM file_records \
         WHERE exif_processed_at IS NOT NULL AND hls_processed_at IS NULL AND mime_type LIKE 'video/%' \
         ORDER BY created DESC, folder DESC, file_name DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| Error::Store(e.to_string()))?;
    stmt.query_map(params![limit], row_to_record)
        .map_err(|e| Error::Store(e.to_string()))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::Store(e.to_string()))
}
