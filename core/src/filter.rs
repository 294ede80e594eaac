//! Component F: filter compiler and query interface (spec §4.6).
//!
//! The AST mirrors the teacher's tagged-enum style: constraints are a
//! closed sum type parsed once at the HTTP boundary from the `filter=`
//! query parameter's JSON. Two backends consume the same AST: `to_sql`
//! (used by `core::index`) and `matches` (a reference in-memory matcher
//! used by tests and by endpoints that must evaluate a filter against a
//! single record), per the design notes in spec §9.

use std::collections::HashMap;

use chrono::Datelike;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::model::FileRecord;

/// Delimiter wrapping each tag in the index's `tags_joined` column, so a
/// `LIKE` substring test can implement exact tag membership without a
/// separate join table.
pub const TAG_DELIM: &str = "\u{1}";

/// Serialises a tag list into the index's `tags_joined` column format.
pub fn join_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!("{TAG_DELIM}{}{TAG_DELIM}", tags.join(TAG_DELIM))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Filter {
    Condition(FilterCondition),
    Logical(LogicalFilter),
}

#[derive(Debug, Clone)]
pub struct LogicalFilter {
    pub operation: LogicalOp,
    pub conditions: Vec<Filter>,
}

/// A mapping `field → constraint`; multiple fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct FilterCondition {
    pub fields: Vec<(String, Constraint)>,
}

#[derive(Debug, Clone)]
pub struct StringMatch {
    pub includes: Option<String>,
    pub glob: Option<String>,
    pub regex: Option<String>,
    pub starts_with: Option<String>,
    pub direct_child_of: Option<String>,
    pub root_only: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum Constraint {
    StringExact(String),
    StringSet(Vec<String>),
    StringMatch(StringMatch),
    NumberSet(Vec<f64>),
    Range { min: Option<f64>, max: Option<f64> },
    Bool(bool),
    Null,
    Folder { folder: String, recursive: bool },
}

/// Parses the `filter=` query parameter's JSON into a `Filter` AST.
pub fn parse(json_text: &str) -> Result<Filter> {
    let value: Json =
        serde_json::from_str(json_text).map_err(|e| Error::BadRequest(format!("invalid filter JSON: {e}")))?;
    parse_value(&value)
}

fn parse_value(value: &Json) -> Result<Filter> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadRequest("filter must be a JSON object".to_string()))?;

    if let Some(op) = obj.get("operation") {
        let operation = match op.as_str() {
            Some("and") => LogicalOp::And,
            Some("or") => LogicalOp::Or,
            _ => return Err(Error::BadRequest("operation must be \"and\" or \"or\"".to_string())),
        };
        let conditions = obj
            .get("conditions")
            .and_then(|c| c.as_array())
            .ok_or_else(|| Error::BadRequest("logical filter requires \"conditions\"".to_string()))?
            .iter()
            .map(parse_value)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Filter::Logical(LogicalFilter { operation, conditions }));
    }

    let mut fields = Vec::with_capacity(obj.len());
    for (field_name, constraint_value) in obj {
        fields.push((field_name.clone(), parse_constraint(field_name, constraint_value)?));
    }
    Ok(Filter::Condition(FilterCondition { fields }))
}

fn parse_constraint(field_name: &str, value: &Json) -> Result<Constraint> {
    if value.is_null() {
        return Ok(Constraint::Null);
    }
    if let Some(s) = value.as_str() {
        return Ok(Constraint::StringExact(s.to_string()));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Constraint::Bool(b));
    }
    if let Some(n) = value.as_f64() {
        return Ok(Constraint::NumberSet(vec![n]));
    }
    if let Some(arr) = value.as_array() {
        if arr.iter().all(|v| v.is_string()) {
            return Ok(Constraint::StringSet(
                arr.iter().map(|v| v.as_str().unwrap().to_string()).collect(),
            ));
        }
        if arr.iter().all(|v| v.is_number()) {
            return Ok(Constraint::NumberSet(arr.iter().map(|v| v.as_f64().unwrap()).collect()));
        }
        return Err(Error::BadRequest(format!(
            "unsupported array constraint for field `{field_name}`"
        )));
    }

    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadRequest(format!("unsupported constraint for field `{field_name}`")))?;

    if field_name == "folder" && obj.contains_key("folder") {
        let folder = obj
            .get("folder")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::BadRequest("folder constraint requires a string \"folder\"".to_string()))?
            .to_string();
        let recursive = obj.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
        return Ok(Constraint::Folder { folder, recursive });
    }

    if obj.contains_key("min") || obj.contains_key("max") {
        let min = obj.get("min").and_then(json_to_f64);
        let max = obj.get("max").and_then(json_to_f64);
        return Ok(Constraint::Range { min, max });
    }

    if obj.contains_key("includes")
        || obj.contains_key("glob")
        || obj.contains_key("regex")
        || obj.contains_key("startsWith")
        || obj.contains_key("directChildOf")
        || obj.contains_key("rootOnly")
    {
        return Ok(Constraint::StringMatch(StringMatch {
            includes: str_field(obj, "includes"),
            glob: str_field(obj, "glob"),
            regex: str_field(obj, "regex"),
            starts_with: str_field(obj, "startsWith"),
            direct_child_of: str_field(obj, "directChildOf"),
            root_only: obj.get("rootOnly").and_then(|v| v.as_bool()),
        }));
    }

    Err(Error::BadRequest(format!(
        "unrecognised constraint shape for field `{field_name}`"
    )))
}

fn str_field(obj: &serde_json::Map<String, Json>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Timestamps are accepted either as epoch milliseconds or RFC 3339
/// strings; dates-only strings are accepted at midnight UTC.
fn json_to_f64(value: &Json) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let s = value.as_str()?;
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis() as f64);
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis() as f64)
}

/// Maps a JSON field name to its SQL column and whether it is a
/// newline-joined string-list column (`tags`) requiring substring-based
/// containment rather than equality.
fn column_for(field_name: &str) -> Option<(&'static str, bool)> {
    Some(match field_name {
        "folder" => ("folder", false),
        "fileName" => ("file_name", false),
        "mimeType" => ("mime_type", false),
        "sizeInBytes" => ("size_in_bytes", false),
        "created" => ("created", false),
        "modified" => ("modified", false),
        "dateTaken" => ("date_taken", false),
        "dimensionWidth" => ("dimension_width", false),
        "dimensionHeight" => ("dimension_height", false),
        "locationLatitude" => ("location_latitude", false),
        "locationLongitude" => ("location_longitude", false),
        "cameraMake" => ("camera_make", false),
        "cameraModel" => ("camera_model", false),
        "rating" => ("rating", false),
        "orientation" => ("orientation", false),
        "videoCodec" => ("video_codec", false),
        "audioCodec" => ("audio_codec", false),
        "infoProcessedAt" => ("info_processed_at", false),
        "exifProcessedAt" => ("exif_processed_at", false),
        "tags" => ("tags_joined", true),
        _ => return None,
    })
}

/// Lowers a `Filter` into a parenthesised SQL boolean expression plus its
/// bound parameters, for `core::index`'s query builder.
pub fn to_sql(filter: &Filter) -> Result<(String, Vec<SqlValue>)> {
    let mut params = Vec::new();
    let sql = to_sql_inner(filter, &mut params)?;
    Ok((sql, params))
}

fn to_sql_inner(filter: &Filter, params: &mut Vec<SqlValue>) -> Result<String> {
    match filter {
        Filter::Logical(l) => {
            if l.conditions.is_empty() {
                // An empty branch short-circuits: AND → always true,
                // OR → always false.
                return Ok(match l.operation {
                    LogicalOp::And => "1=1".to_string(),
                    LogicalOp::Or => "1=0".to_string(),
                });
            }
            let op = match l.operation {
                LogicalOp::And => " AND ",
                LogicalOp::Or => " OR ",
            };
            let parts = l
                .conditions
                .iter()
                .map(|c| to_sql_inner(c, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(op)))
        }
        Filter::Condition(cond) => {
            if cond.fields.is_empty() {
                return Ok("1=1".to_string());
            }
            let parts = cond
                .fields
                .iter()
                .map(|(field, constraint)| constraint_to_sql(field, constraint, params))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
    }
}

fn constraint_to_sql(field: &str, constraint: &Constraint, params: &mut Vec<SqlValue>) -> Result<String> {
    if let Constraint::Folder { folder, recursive } = constraint {
        params.push(SqlValue::Text(folder.clone()));
        return Ok(if *recursive {
            params.push(SqlValue::Text(format!("{folder}%")));
            "(folder = ? OR folder LIKE ?)".to_string()
        } else {
            "folder = ?".to_string()
        });
    }

    let (column, is_list) = column_for(field)
        .ok_or_else(|| Error::BadRequest(format!("unknown filter field `{field}`")))?;

    match constraint {
        Constraint::StringExact(s) if is_list => {
            params.push(SqlValue::Text(format!("%{TAG_DELIM}{}{TAG_DELIM}%", escape_like(s))));
            Ok(format!("{column} LIKE ? ESCAPE '\\'"))
        }
        Constraint::StringExact(s) => {
            params.push(SqlValue::Text(s.clone()));
            Ok(format!("{column} = ?"))
        }
        Constraint::StringSet(values) if is_list => {
            let clauses = values
                .iter()
                .map(|v| {
                    params.push(SqlValue::Text(format!("%{TAG_DELIM}{}{TAG_DELIM}%", escape_like(v))));
                    format!("{column} LIKE ? ESCAPE '\\'")
                })
                .collect::<Vec<_>>();
            Ok(format!("({})", clauses.join(" OR ")))
        }
        Constraint::StringSet(values) => {
            let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            for v in values {
                params.push(SqlValue::Text(v.clone()));
            }
            Ok(format!("{column} IN ({placeholders})"))
        }
        Constraint::NumberSet(values) => {
            let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            for v in values {
                params.push(SqlValue::Real(*v));
            }
            Ok(format!("{column} IN ({placeholders})"))
        }
        Constraint::Range { min, max } => {
            let mut clauses = Vec::new();
            if let Some(min) = min {
                params.push(SqlValue::Real(*min));
                clauses.push(format!("{column} >= ?"));
            }
            if let Some(max) = max {
                params.push(SqlValue::Real(*max));
                clauses.push(format!("{column} <= ?"));
            }
            if clauses.is_empty() {
                Ok("1=1".to_string())
            } else {
                Ok(format!("({})", clauses.join(" AND ")))
            }
        }
        Constraint::Bool(b) => {
            params.push(SqlValue::Integer(if *b { 1 } else { 0 }));
            Ok(format!("{column} = ?"))
        }
        Constraint::Null => Ok(format!("{column} IS NULL")),
        Constraint::StringMatch(m) => string_match_to_sql(column, is_list, m, params),
        Constraint::Folder { .. } => unreachable!("handled above"),
    }
}

fn string_match_to_sql(
    column: &str,
    is_list: bool,
    m: &StringMatch,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    let mut clauses = Vec::new();

    if let Some(includes) = &m.includes {
        params.push(SqlValue::Text(format!("%{}%", escape_like(includes))));
        clauses.push(format!("{column} LIKE ? ESCAPE '\\'"));
    }
    if let Some(glob) = &m.glob {
        // Conservative lowering: a glob becomes a substring test over its
        // non-wildcard segments, per spec §4.6.
        let literal = glob.replace('*', "").replace('?', "");
        params.push(SqlValue::Text(format!("%{}%", escape_like(&literal))));
        clauses.push(format!("{column} LIKE ? ESCAPE '\\'"));
    }
    if let Some(regex) = &m.regex {
        Regex::new(regex).map_err(|e| Error::BadRequest(format!("invalid regex: {e}")))?;
        params.push(SqlValue::Text(regex.clone()));
        clauses.push(format!("regexp(?, {column})"));
    }
    if let Some(prefix) = &m.starts_with {
        params.push(SqlValue::Text(format!("{}%", escape_like(prefix))));
        clauses.push(format!("{column} LIKE ? ESCAPE '\\'"));
    }
    if let Some(prefix) = &m.direct_child_of {
        let prefix = prefix.trim_end_matches('/');
        params.push(SqlValue::Text(format!("{prefix}/%")));
        clauses.push(format!("{column} LIKE ? ESCAPE '\\' AND {column} NOT LIKE '{prefix}/%/%'"));
    }
    if m.root_only == Some(true) {
        clauses.push(format!("{column} NOT LIKE '%/%'"));
    }
    let _ = is_list;

    if clauses.is_empty() {
        Ok("1=1".to_string())
    } else {
        Ok(format!("({})", clauses.join(" AND ")))
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Reference in-memory matcher: an independent oracle for the SQL
/// lowering, and the only evaluation path for endpoints checking a single
/// record without a round-trip through the store.
pub fn matches(filter: &Filter, record: &FileRecord) -> bool {
    match filter {
        Filter::Logical(l) => match l.operation {
            LogicalOp::And => l.conditions.is_empty() || l.conditions.iter().all(|c| matches(c, record)),
            LogicalOp::Or => !l.conditions.is_empty() && l.conditions.iter().any(|c| matches(c, record)),
        },
        Filter::Condition(cond) => cond
            .fields
            .iter()
            .all(|(field, constraint)| constraint_matches(field, constraint, record)),
    }
}

enum FieldValue<'a> {
    Str(Option<&'a str>),
    StrList(&'a [String]),
    Num(Option<f64>),
    Bool(Option<bool>),
}

fn field_value<'a>(field: &str, record: &'a FileRecord) -> FieldValue<'a> {
    match field {
        "folder" => FieldValue::Str(Some(record.folder.as_str())),
        "fileName" => FieldValue::Str(Some(record.file_name.as_str())),
        "mimeType" => FieldValue::Str(record.mime_type.as_deref()),
        "cameraMake" => FieldValue::Str(record.camera_make.as_deref()),
        "cameraModel" => FieldValue::Str(record.camera_model.as_deref()),
        "videoCodec" => FieldValue::Str(record.video_codec.as_deref()),
        "audioCodec" => FieldValue::Str(record.audio_codec.as_deref()),
        "tags" => FieldValue::StrList(&record.tags),
        "sizeInBytes" => FieldValue::Num(record.size_in_bytes.map(|v| v as f64)),
        "created" => FieldValue::Num(record.created.map(|v| v as f64)),
        "modified" => FieldValue::Num(record.modified.map(|v| v as f64)),
        "dateTaken" => FieldValue::Num(record.date_taken.map(|v| v as f64)),
        "dimensionWidth" => FieldValue::Num(record.dimension_width.map(|v| v as f64)),
        "dimensionHeight" => FieldValue::Num(record.dimension_height.map(|v| v as f64)),
        "locationLatitude" => FieldValue::Num(record.location_latitude),
        "locationLongitude" => FieldValue::Num(record.location_longitude),
        "rating" => FieldValue::Num(record.rating.map(|v| v as f64)),
        "orientation" => FieldValue::Num(record.orientation.map(|v| v as f64)),
        "infoProcessedAt" => FieldValue::Num(record.info_processed_at.map(|v| v as f64)),
        "exifProcessedAt" => FieldValue::Num(record.exif_processed_at.map(|v| v as f64)),
        _ => FieldValue::Bool(None),
    }
}

fn constraint_matches(field: &str, constraint: &Constraint, record: &FileRecord) -> bool {
    if let Constraint::Folder { folder, recursive } = constraint {
        return if *recursive {
            record.folder == *folder || record.folder.starts_with(folder.as_str())
        } else {
            record.folder == *folder
        };
    }

    if matches!(constraint, Constraint::Null) {
        return match field_value(field, record) {
            FieldValue::Str(v) => v.is_none(),
            FieldValue::Num(v) => v.is_none(),
            FieldValue::Bool(v) => v.is_none(),
            FieldValue::StrList(list) => list.is_empty(),
        };
    }

    match (field_value(field, record), constraint) {
        (FieldValue::Str(Some(v)), Constraint::StringExact(s)) => v == s,
        (FieldValue::Str(Some(v)), Constraint::StringSet(set)) => set.iter().any(|s| s == v),
        (FieldValue::Str(value), Constraint::StringMatch(m)) => string_match_eval(value, m),
        (FieldValue::StrList(list), Constraint::StringExact(s)) => list.iter().any(|t| t == s),
        (FieldValue::StrList(list), Constraint::StringSet(set)) => {
            list.iter().any(|t| set.contains(t))
        }
        (FieldValue::StrList(list), Constraint::StringMatch(m)) => {
            list.iter().any(|t| string_match_eval(Some(t), m))
        }
        (FieldValue::Num(Some(v)), Constraint::NumberSet(set)) => set.contains(&v),
        (FieldValue::Num(Some(v)), Constraint::Range { min, max }) => {
            min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
        }
        (FieldValue::Bool(Some(v)), Constraint::Bool(b)) => v == *b,
        _ => false,
    }
}

fn string_match_eval(value: Option<&str>, m: &StringMatch) -> bool {
    let Some(v) = value else { return false };

    if let Some(includes) = &m.includes {
        if !v.contains(includes.as_str()) {
            return false;
        }
    }
    if let Some(glob) = &m.glob {
        if !glob_match(glob, v) {
            return false;
        }
    }
    if let Some(pattern) = &m.regex {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(v) => {}
            _ => return false,
        }
    }
    if let Some(prefix) = &m.starts_with {
        if !v.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if let Some(prefix) = &m.direct_child_of {
        let prefix = prefix.trim_end_matches('/');
        match v.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
            Some(rest) if !rest.is_empty() && !rest.contains('/') => {}
            _ => return false,
        }
    }
    if m.root_only == Some(true) && v.contains('/') {
        return false;
    }
    true
}

/// Minimal glob matcher (`*` = any run, `?` = one char), used by the
/// reference matcher to mirror the conservative SQL lowering's semantics
/// closely enough for test parity.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &t[1..]),
            (Some(&pc), Some(&tc)) if pc == tc => helper(&p[1..], &t[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DateRange {
    pub min_date: Option<i64>,
    pub max_date: Option<i64>,
}

pub fn date_range(records: &[FileRecord]) -> DateRange {
    let mut range = DateRange::default();
    for r in records {
        if let Some(dt) = r.date_taken {
            range.min_date = Some(range.min_date.map_or(dt, |m| m.min(dt)));
            range.max_date = Some(range.max_date.map_or(dt, |m| m.max(dt)));
        }
    }
    range
}

/// A single bucket of a date histogram (spec §4.6): `[start, end)` in UTC
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct DateBucket {
    pub start_ms: i64,
    pub end_ms: i64,
    pub count: u64,
}

const DAY_MS: i64 = 86_400_000;
const HISTOGRAM_DAY_THRESHOLD_MS: i64 = 120 * DAY_MS;

/// Buckets `dateTaken` values by day if the span is ≤ ~120 days or ≤ 2
/// calendar months, else by month.
pub fn date_histogram(mut dates_ms: Vec<i64>) -> Vec<DateBucket> {
    dates_ms.sort_unstable();
    let Some((&min, &max)) = dates_ms.first().zip(dates_ms.last()) else {
        return Vec::new();
    };

    let use_daily = (max - min) <= HISTOGRAM_DAY_THRESHOLD_MS || months_between(min, max) <= 2;

    let mut buckets: HashMap<i64, u64> = HashMap::new();
    for d in &dates_ms {
        let key = if use_daily {
            day_start(*d)
        } else {
            month_start(*d)
        };
        *buckets.entry(key).or_insert(0) += 1;
    }

    let mut result: Vec<DateBucket> = buckets
        .into_iter()
        .map(|(start_ms, count)| {
            let end_ms = if use_daily {
                start_ms + DAY_MS
            } else {
                month_start(start_ms + 32 * DAY_MS)
            };
            DateBucket { start_ms, end_ms, count }
        })
        .collect();
    result.sort_by_key(|b| b.start_ms);
    result
}

fn day_start(ms: i64) -> i64 {
    ms.div_euclid(DAY_MS) * DAY_MS
}

fn month_start(ms: i64) -> i64 {
    let dt = chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default();
    let naive = dt.date_naive();
    chrono::NaiveDate::from_ymd_opt(naive.year(), naive.month(), 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

fn months_between(a_ms: i64, b_ms: i64) -> i64 {
    let a = chrono::DateTime::from_timestamp_millis(a_ms).unwrap_or_default().date_naive();
    let b = chrono::DateTime::from_timestamp_millis(b_ms).unwrap_or_default().date_naive();
    ((b.year() - a.year()) as i64) * 12 + (b.month() as i64 - a.month() as i64)
}

#[derive(Debug, Clone, Copy)]
pub struct GeoBounds {
    pub south: f64,
    pub west: f64,
}

#[derive(Debug, Clone)]
pub struct GeoCluster {
    pub center_lat: f64,
    pub center_lon: f64,
    pub count: u64,
    pub sample: FileRecord,
}

/// Quantises `(lat, lon)` to a grid of `cluster_size_deg` degrees aligned
/// to `bounds`'s south-west corner (default origin `(0, 0)`), counting per
/// cell and picking one deterministic sample member ordered by
/// `(folder, fileName)` (spec §4.6).
pub fn geo_clusters(
    records: &[FileRecord],
    cluster_size_deg: f64,
    bounds: Option<GeoBounds>,
) -> Vec<GeoCluster> {
    let origin = bounds.unwrap_or(GeoBounds { south: 0.0, west: 0.0 });
    let mut cells: HashMap<(i64, i64), (u64, Option<FileRecord>)> = HashMap::new();

    for record in records {
        let (Some(lat), Some(lon)) = (record.location_latitude, record.location_longitude) else {
            continue;
        };
        let cell_y = ((lat - origin.south) / cluster_size_deg).floor() as i64;
        let cell_x = ((lon - origin.west) / cluster_size_deg).floor() as i64;
        let entry = cells.entry((cell_y, cell_x)).or_insert((0, None));
        entry.0 += 1;
        let is_better_sample = match &entry.1 {
            None => true,
            Some(current) => {
                (record.folder.as_str(), record.file_name.as_str())
                    < (current.folder.as_str(), current.file_name.as_str())
            }
        };
        if is_better_sample {
            entry.1 = Some(record.clone());
        }
    }

    let mut clusters: Vec<GeoCluster> = cells
        .into_iter()
        .map(|((cell_y, cell_x), (count, sample))| GeoCluster {
            center_lat: origin.south + (cell_y as f64 + 0.5) * cluster_size_deg,
            center_lon: origin.west + (cell_x as f64 + 0.5) * cluster_size_deg,
            count,
            sample: sample.expect("cell populated with at least one record"),
        })
        .collect();
    clusters.sort_by(|a, b| {
        a.center_lat
            .partial_cmp(&b.center_lat)
            .unwrap()
            .then(a.center_lon.partial_cmp(&b.center_lon).unwrap())
    });
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(field: &str, constraint: Constraint) -> Filter {
        Filter::Condition(FilterCondition {
            fields: vec![(field.to_string(), constraint)],
        })
    }

    #[test]
    fn parses_simple_and_filter() {
        let json = r#"{"operation":"and","conditions":[{"mimeType":"image/jpeg"},{"dateTaken":{"min":1,"max":2}}]}"#;
        let filter = parse(json).unwrap();
        match filter {
            Filter::Logical(l) => assert_eq!(l.conditions.len(), 2),
            _ => panic!("expected logical filter"),
        }
    }

    #[test]
    fn matches_mime_exact() {
        let mut record = FileRecord::default();
        record.mime_type = Some("image/jpeg".to_string());
        let filter = cond("mimeType", Constraint::StringExact("image/jpeg".to_string()));
        assert!(matches(&filter, &record));

        let filter = cond("mimeType", Constraint::StringExact("image/png".to_string()));
        assert!(!matches(&filter, &record));
    }

    #[test]
    fn folder_recursive_matches_descendants() {
        let mut record = FileRecord::default();
        record.folder = "/a/b/".to_string();
        let filter = cond(
            "folder",
            Constraint::Folder { folder: "/a/".to_string(), recursive: true },
        );
        assert!(matches(&filter, &record));

        let filter = cond(
            "folder",
            Constraint::Folder { folder: "/a/".to_string(), recursive: false },
        );
        assert!(!matches(&filter, &record));
    }

    #[test]
    fn root_only_rejects_nested_paths() {
        let m = StringMatch {
            includes: None,
            glob: None,
            regex: None,
            starts_with: None,
            direct_child_of: None,
            root_only: Some(true),
        };
        assert!(string_match_eval(Some("photo.jpg"), &m));
        assert!(!string_match_eval(Some("a/photo.jpg"), &m));
    }

    #[test]
    fn to_sql_combines_and_branches() {
        let filter = Filter::Logical(LogicalFilter {
            operation: LogicalOp::And,
            conditions: vec![
                cond("mimeType", Constraint::StringExact("image/jpeg".to_string())),
                cond("rating", Constraint::Range { min: Some(3.0), max: None }),
            ],
        });
        let (sql, params) = to_sql(&filter).unwrap();
        assert!(sql.contains("mime_type = ?"));
        assert!(sql.contains("rating >= ?"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn date_histogram_uses_daily_buckets_for_short_span() {
        let base = 1_600_000_000_000i64;
        let buckets = date_histogram(vec![base, base + DAY_MS]);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].end_ms - buckets[0].start_ms, DAY_MS);
    }

    #[test]
    fn glob_matches_wildcards() {
        assert!(glob_match("*.jpg", "photo.jpg"));
        assert!(!glob_match("*.png", "photo.jpg"));
        assert!(glob_match("IMG_????.jpg", "IMG_1234.jpg"));
    }

    #[test]
    fn geo_clusters_groups_nearby_points() {
        let mut a = FileRecord::default();
        a.folder = "/".to_string();
        a.file_name = "a.jpg".to_string();
        a.location_latitude = Some(35.01);
        a.location_longitude = Some(139.01);

        let mut b = FileRecord::default();
        b.folder = "/".to_string();
        b.file_name = "b.jpg".to_string();
        b.location_latitude = Some(35.02);
        b.location_longitude = Some(139.02);

        let mut far = FileRecord::default();
        far.folder = "/".to_string();
        far.file_name = "c.jpg".to_string();
        far.location_latitude = Some(50.0);
        far.location_longitude = Some(10.0);

        let clusters = geo_clusters(&[a, b, far], 1.0, None);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters.iter().map(|c| c.count).sum::<u64>(), 3);
    }
}
