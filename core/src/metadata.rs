//! Component E: metadata extractor (spec §4.5).
//!
//! Image EXIF uses the teacher's own `kamadak-exif` dependency against a
//! declarative `field → apply` table (mirroring `bleemesser-photosort`'s
//! exif-extraction-and-normalise shape); XMP fields not covered by the EXIF
//! crate (rating percent, hierarchical tags) are pulled from the embedded
//! XMP packet with `regex`, already a dependency for the filter compiler.
//! Video metadata defers entirely to `media_encoders::VideoTool::probe`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDateTime;
use exif::{In, Tag, Value};
use once_cell::sync::Lazy;
use regex::Regex;

use media_encoders::VideoTool;

use crate::error::{Error, Result};
use crate::model::FileRecord;

/// Stats the path and fills the file-info group. Fails with a descriptive
/// error (surfaced by the caller as `NotAFile`) if the path isn't a regular
/// file.
pub async fn get_file_info(path: &Path) -> Result<FileRecord> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(Error::BadRequest(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let mut record = FileRecord::default();
    record.size_in_bytes = Some(meta.len() as i64);
    record.modified = meta.modified().ok().and_then(system_time_to_ms);
    record.created = meta
        .created()
        .ok()
        .and_then(system_time_to_ms)
        .or(record.modified);
    Ok(record)
}

fn system_time_to_ms(t: std::time::SystemTime) -> Option<i64> {
    t.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

/// Dispatches by MIME and returns the fields extracted for the EXIF group.
/// Never fails for a corrupt/unreadable source: callers set the watermark
/// regardless (spec §4.8), absorbing the error by logging it upstream.
pub async fn get_exif(
    path: &Path,
    mime_type: Option<&str>,
    video_tool: &VideoTool,
) -> Result<FileRecord> {
    match mime_type {
        Some(m) if media_file_ext::is_video_mime(m) => extract_video(path, video_tool).await,
        Some(m) if media_file_ext::is_image_mime(m) => match extract_image(path) {
            Ok(record) => Ok(record),
            Err(err) if looks_like_quicktime_brand(path).unwrap_or(false) => {
                tracing::debug!(path = %path.display(), "image exif failed and QuickTime brand detected; retrying as video");
                let _ = err;
                extract_video(path, video_tool).await
            }
            Err(err) => Err(sniff_corrupt_input(path, err)),
        },
        _ => Ok(FileRecord::default()),
    }
}

/// QuickTime container files are sometimes misnamed with an image
/// extension. A bare `moov` box (no leading `ftyp`) is a raw QuickTime
/// movie; an `ftyp` box's major_brand — the four bytes at offset 8, not
/// the box-type field at offset 4 — reading `qt  ` is the same signal
/// wrapped in an ISO-BMFF shell.
fn looks_like_quicktime_brand(path: &Path) -> std::io::Result<bool> {
    use std::io::Read;
    let mut buf = [0u8; 12];
    let mut f = File::open(path)?;
    let n = f.read(&mut buf)?;
    if n < 12 {
        return Ok(false);
    }
    match &buf[4..8] {
        b"moov" => Ok(true),
        b"ftyp" => Ok(&buf[8..12] == b"qt  "),
        _ => Ok(false),
    }
}

/// On EXIF decode failure, sniffs the file's lead bytes to tell a genuinely
/// corrupt image from a non-image file mislabeled with an image extension
/// (a `.jpg` that's actually a text log, say), so the error surfaced to the
/// enrichment loop says which it was instead of just echoing the EXIF
/// crate's parse error.
fn sniff_corrupt_input(path: &Path, original: Error) -> Error {
    let Ok(bytes) = std::fs::read(path) else { return original };
    let probe_len = bytes.len().min(512);
    match media_file_ext::sniff_text_charset(&bytes[..probe_len]) {
        Some(_) => Error::CorruptInput(format!("{} looks like text, not image data", path.display())),
        None => original,
    }
}

async fn extract_video(path: &Path, video_tool: &VideoTool) -> Result<FileRecord> {
    let probe = video_tool.probe(path).await?;
    let mut record = FileRecord::default();

    record.date_taken = probe
        .format
        .tags
        .get("creation_time")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis());

    record.video_duration_secs = probe.format.duration.as_deref().and_then(|s| s.parse().ok());

    let mut rotation_deg: i64 = probe
        .primary_video_stream()
        .and_then(|s| s.tags.get("rotate"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if rotation_deg == 0 {
        if let Some(side_data) = probe
            .primary_video_stream()
            .map(|s| &s.side_data_list)
        {
            for entry in side_data {
                if let Some(r) = entry.get("rotation").and_then(|v| v.as_i64()) {
                    rotation_deg = r;
                    break;
                }
            }
        }
    }
    let normalized = ((rotation_deg % 360) + 360) % 360;
    let (orientation, swap_dims) = match normalized {
        90 => (Some(6), true),
        180 => (Some(3), false),
        270 => (Some(8), true),
        _ => (None, false),
    };
    record.orientation = orientation;

    if let Some(stream) = probe.primary_video_stream() {
        record.video_codec = stream.codec_name.clone();
        let (w, h) = (stream.width, stream.height);
        record.dimension_width = if swap_dims { h } else { w };
        record.dimension_height = if swap_dims { w } else { h };
        record.video_framerate = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate_fraction);
    }
    if let Some(audio) = probe.primary_audio_stream() {
        record.audio_codec = audio.codec_name.clone();
    }

    Ok(record)
}

fn parse_frame_rate_fraction(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

type ApplyFn = fn(&exif::Exif, &mut FileRecord);

/// Declared in priority order: later entries win on conflict (spec §4.5:
/// "the last non-empty wins"). EXIF fields run first; the XMP pass (applied
/// separately, see `apply_xmp`) runs after so sidecar-style rating/tag
/// edits can override camera-written EXIF values.
const IMAGE_FIELD_MAPPINGS: &[ApplyFn] = &[
    apply_date_taken,
    apply_dimensions,
    apply_orientation,
    apply_gps,
    apply_camera,
    apply_exposure,
    apply_rating_exif,
];

fn extract_image(path: &Path) -> Result<FileRecord> {
    let mut record = FileRecord::default();

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| Error::CorruptInput(format!("invalid input: {e}")))?;

    for apply in IMAGE_FIELD_MAPPINGS {
        apply(&exif, &mut record);
    }

    if let Ok(bytes) = std::fs::read(path) {
        apply_xmp(&bytes, &mut record);
    }

    Ok(record)
}

fn ascii_string(field: &exif::Field) -> Option<String> {
    match &field.value {
        Value::Ascii(v) => v
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_matches('\0').trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn rational_f64(field: &exif::Field) -> Option<f64> {
    match &field.value {
        Value::Rational(v) => v.first().map(|r| r.to_f64()),
        Value::SRational(v) => v.first().map(|r| r.to_f64()),
        _ => None,
    }
}

fn short_i64(field: &exif::Field) -> Option<i64> {
    match &field.value {
        Value::Short(v) => v.first().map(|&x| x as i64),
        Value::Long(v) => v.first().map(|&x| x as i64),
        _ => None,
    }
}

fn apply_date_taken(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY) {
        if let Some(s) = ascii_string(field) {
            if let Ok(dt) = NaiveDateTime::parse_from_str(&s, "%Y:%m:%d %H:%M:%S") {
                record.date_taken = Some(dt.and_utc().timestamp_millis());
            }
        }
    }
}

fn apply_dimensions(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::PixelXDimension, In::PRIMARY) {
        if let Some(w) = short_i64(field) {
            record.dimension_width = Some(w);
        }
    }
    if let Some(field) = exif.get_field(Tag::PixelYDimension, In::PRIMARY) {
        if let Some(h) = short_i64(field) {
            record.dimension_height = Some(h);
        }
    }
}

fn apply_orientation(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::Orientation, In::PRIMARY) {
        if let Some(o) = short_i64(field) {
            record.orientation = Some(o);
        }
    }
}

/// DMS (degrees/minutes/seconds) → signed decimal degrees, applying the
/// N/S and E/W reference tags.
fn apply_gps(exif: &exif::Exif, record: &mut FileRecord) {
    if let (Some(lat_field), Some(lat_ref)) = (
        exif.get_field(Tag::GPSLatitude, In::PRIMARY),
        exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY).and_then(ascii_string),
    ) {
        if let Some(deg) = dms_to_decimal(lat_field) {
            record.location_latitude = Some(if lat_ref.starts_with('S') { -deg } else { deg });
        }
    }
    if let (Some(lon_field), Some(lon_ref)) = (
        exif.get_field(Tag::GPSLongitude, In::PRIMARY),
        exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY).and_then(ascii_string),
    ) {
        if let Some(deg) = dms_to_decimal(lon_field) {
            record.location_longitude = Some(if lon_ref.starts_with('W') { -deg } else { deg });
        }
    }
}

fn dms_to_decimal(field: &exif::Field) -> Option<f64> {
    match &field.value {
        Value::Rational(v) if v.len() == 3 => {
            let deg = v[0].to_f64();
            let min = v[1].to_f64();
            let sec = v[2].to_f64();
            Some(deg + min / 60.0 + sec / 3600.0)
        }
        _ => None,
    }
}

fn apply_camera(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::Make, In::PRIMARY).and_then(ascii_string_field) {
        record.camera_make = Some(field);
    }
    if let Some(field) = exif.get_field(Tag::Model, In::PRIMARY).and_then(ascii_string_field) {
        record.camera_model = Some(field);
    }
    if let Some(field) = exif.get_field(Tag::LensModel, In::PRIMARY).and_then(ascii_string_field) {
        record.lens = Some(field);
    }
}

fn ascii_string_field(field: &exif::Field) -> Option<String> {
    ascii_string(field)
}

fn apply_exposure(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::ExposureTime, In::PRIMARY) {
        if let Value::Rational(v) = &field.value {
            if let Some(r) = v.first() {
                record.exposure_time = Some(format!("{}/{}", r.num, r.denom));
            }
        }
    }
    if let Some(field) = exif.get_field(Tag::FNumber, In::PRIMARY) {
        if let Some(v) = rational_f64(field) {
            record.aperture = Some(v);
        }
    }
    if let Some(field) = exif.get_field(Tag::PhotographicSensitivity, In::PRIMARY) {
        if let Some(v) = short_i64(field) {
            record.iso = Some(v);
        }
    }
    if let Some(field) = exif.get_field(Tag::FocalLength, In::PRIMARY) {
        if let Some(v) = rational_f64(field) {
            record.focal_length = Some(v);
        }
    }
}

/// Windows `Rating` EXIF tag is a 0–100 percent value; normalise to a 0–5
/// star integer.
fn apply_rating_exif(exif: &exif::Exif, record: &mut FileRecord) {
    if let Some(field) = exif.get_field(Tag::Rating, In::PRIMARY) {
        if let Some(percent) = short_i64(field) {
            record.rating = Some(rating_percent_to_stars(percent));
        }
    }
}

fn rating_percent_to_stars(percent: i64) -> i64 {
    ((percent as f64 / 20.0).round() as i64).clamp(0, 5)
}

static XMP_RATING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:xmp|xap):Rating[="]*>?\s*(\d+)"#).unwrap());
static XMP_HIERARCHICAL_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<rdf:li[^>]*>([^<]+)</rdf:li>").unwrap());

fn apply_xmp(raw: &[u8], record: &mut FileRecord) {
    let Some(packet) = extract_xmp_packet(raw) else {
        return;
    };

    if let Some(caps) = XMP_RATING_RE.captures(&packet) {
        if let Ok(percent) = caps[1].parse::<i64>() {
            // XMP ratings are already 0-5 in most writers; only rescale
            // values that look like a percent.
            record.rating = Some(if percent > 5 {
                rating_percent_to_stars(percent)
            } else {
                percent
            });
        }
    }

    let mut tags = Vec::new();
    for caps in XMP_HIERARCHICAL_TAG_RE.captures_iter(&packet) {
        let full = caps[1].trim().to_string();
        if full.is_empty() {
            continue;
        }
        if let Some((_, leaf)) = full.rsplit_once('|') {
            tags.push(leaf.to_string());
        }
        tags.push(full);
    }
    if !tags.is_empty() {
        tags.sort();
        tags.dedup();
        record.tags = tags;
    }
}

fn extract_xmp_packet(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let start = text.find("<x:xmpmeta")?;
    let end = text[start..].find("</x:xmpmeta>")? + start + "</x:xmpmeta>".len();
    Some(text[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_percent_converts_to_stars() {
        assert_eq!(rating_percent_to_stars(0), 0);
        assert_eq!(rating_percent_to_stars(50), 3);
        assert_eq!(rating_percent_to_stars(99), 5);
    }

    #[test]
    fn parses_frame_rate_fraction() {
        assert_eq!(parse_frame_rate_fraction("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate_fraction("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_frame_rate_fraction("0/0"), None);
    }

    #[test]
    fn extracts_xmp_rating_and_hierarchical_tags() {
        let xmp = br#"<x:xmpmeta xmlns:x="adobe:ns:meta/">
            <rdf:RDF>
              <rdf:Description xmp:Rating="4">
                <lr:hierarchicalSubject>
                  <rdf:Bag>
                    <rdf:li>Trips|2020|Japan</rdf:li>
                  </rdf:Bag>
                </lr:hierarchicalSubject>
              </rdf:Description>
            </rdf:RDF>
          </x:xmpmeta>"#;
        let mut record = FileRecord::default();
        apply_xmp(xmp, &mut record);
        assert_eq!(record.rating, Some(4));
        assert!(record.tags.contains(&"Japan".to_string()));
        assert!(record.tags.contains(&"Trips|2020|Japan".to_string()));
    }

    #[test]
    fn quicktime_brand_detection_requires_min_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.jpg");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(looks_like_quicktime_brand(&path).unwrap(), false);
    }

    #[test]
    fn quicktime_brand_detected_via_ftyp_major_brand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.jpg");
        // box size (unused), "ftyp", major_brand "qt  "
        std::fs::write(&path, b"\x00\x00\x00\x14ftypqt  ").unwrap();
        assert_eq!(looks_like_quicktime_brand(&path).unwrap(), true);
    }

    #[test]
    fn bare_moov_box_is_detected_without_an_ftyp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie2.jpg");
        std::fs::write(&path, b"\x00\x00\x00\x08moov\x00\x00\x00\x00").unwrap();
        assert_eq!(looks_like_quicktime_brand(&path).unwrap(), true);
    }

    #[test]
    fn ftyp_with_a_different_major_brand_is_not_quicktime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generic.jpg");
        std::fs::write(&path, b"\x00\x00\x00\x14ftypisom").unwrap();
        assert_eq!(looks_like_quicktime_brand(&path).unwrap(), false);
    }
}
