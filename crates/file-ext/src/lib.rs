//! Deterministic extension → MIME mapping and text/binary sniffing.
//!
//! Mirrors the teacher's `infer_the_mime_type` table in
//! `core/src/custom_uri/mod.rs`, but as a static lookup keyed on the longest
//! matching trailing extension chain (so `.tar.gz` wins over `.gz`) rather
//! than content sniffing. Content sniffing is reserved for encoder-failure
//! recovery, not the index path (spec §9 design notes).

/// A single recognised extension chain and the MIME type it maps to.
///
/// `ext` is compared case-insensitively against the filename's trailing
/// dot-segments, longest chain first, so multi-part extensions like
/// `tar.gz` are preferred over their shorter suffix `gz`.
struct ExtEntry {
    ext: &'static str,
    mime: &'static str,
}

// Ordered so longer / more specific chains appear before their suffixes;
// `mime_for_filename` independently sorts by segment count to make this
// non-load-bearing, but keeping it tidy here helps readability.
const TABLE: &[ExtEntry] = &[
    // Images
    ExtEntry { ext: "jpg", mime: "image/jpeg" },
    ExtEntry { ext: "jpeg", mime: "image/jpeg" },
    ExtEntry { ext: "png", mime: "image/png" },
    ExtEntry { ext: "gif", mime: "image/gif" },
    ExtEntry { ext: "bmp", mime: "image/bmp" },
    ExtEntry { ext: "webp", mime: "image/webp" },
    ExtEntry { ext: "tif", mime: "image/tiff" },
    ExtEntry { ext: "tiff", mime: "image/tiff" },
    ExtEntry { ext: "ico", mime: "image/vnd.microsoft.icon" },
    ExtEntry { ext: "svg", mime: "image/svg+xml" },
    ExtEntry { ext: "heif", mime: "image/heif" },
    ExtEntry { ext: "heic", mime: "image/heic" },
    ExtEntry { ext: "avif", mime: "image/avif" },
    ExtEntry { ext: "raw", mime: "image/x-raw" },
    ExtEntry { ext: "cr2", mime: "image/x-canon-cr2" },
    ExtEntry { ext: "nef", mime: "image/x-nikon-nef" },
    ExtEntry { ext: "dng", mime: "image/x-adobe-dng" },
    // Video
    ExtEntry { ext: "mp4", mime: "video/mp4" },
    ExtEntry { ext: "m4v", mime: "video/mp4" },
    ExtEntry { ext: "mov", mime: "video/quicktime" },
    ExtEntry { ext: "avi", mime: "video/x-msvideo" },
    ExtEntry { ext: "mkv", mime: "video/x-matroska" },
    ExtEntry { ext: "webm", mime: "video/webm" },
    ExtEntry { ext: "mpeg", mime: "video/mpeg" },
    ExtEntry { ext: "mpg", mime: "video/mpeg" },
    ExtEntry { ext: "ogv", mime: "video/ogg" },
    ExtEntry { ext: "3gp", mime: "video/3gpp" },
    ExtEntry { ext: "3g2", mime: "video/3gpp2" },
    ExtEntry { ext: "ts", mime: "video/mp2t" },
    ExtEntry { ext: "m3u8", mime: "application/vnd.apple.mpegurl" },
    // Audio
    ExtEntry { ext: "mp3", mime: "audio/mpeg" },
    ExtEntry { ext: "m4a", mime: "audio/mp4" },
    ExtEntry { ext: "aac", mime: "audio/aac" },
    ExtEntry { ext: "wav", mime: "audio/wav" },
    ExtEntry { ext: "oga", mime: "audio/ogg" },
    ExtEntry { ext: "opus", mime: "audio/opus" },
    ExtEntry { ext: "flac", mime: "audio/flac" },
    ExtEntry { ext: "weba", mime: "audio/webm" },
    ExtEntry { ext: "mid", mime: "audio/midi" },
    ExtEntry { ext: "midi", mime: "audio/midi" },
    // Archives
    ExtEntry { ext: "zip", mime: "application/zip" },
    ExtEntry { ext: "tar", mime: "application/x-tar" },
    ExtEntry { ext: "gz", mime: "application/gzip" },
    ExtEntry { ext: "tar.gz", mime: "application/gzip" },
    ExtEntry { ext: "tgz", mime: "application/gzip" },
    ExtEntry { ext: "bz2", mime: "application/x-bzip2" },
    ExtEntry { ext: "tar.bz2", mime: "application/x-bzip2" },
    ExtEntry { ext: "7z", mime: "application/x-7z-compressed" },
    ExtEntry { ext: "rar", mime: "application/vnd.rar" },
    // Documents
    ExtEntry { ext: "pdf", mime: "application/pdf" },
    ExtEntry { ext: "doc", mime: "application/msword" },
    ExtEntry {
        ext: "docx",
        mime: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    },
    ExtEntry { ext: "txt", mime: "text/plain" },
    ExtEntry { ext: "md", mime: "text/markdown" },
    ExtEntry { ext: "markdown", mime: "text/markdown" },
    ExtEntry { ext: "csv", mime: "text/csv" },
    ExtEntry { ext: "rtf", mime: "text/rtf" },
    ExtEntry { ext: "html", mime: "text/html" },
    ExtEntry { ext: "htm", mime: "text/html" },
    ExtEntry { ext: "xml", mime: "text/xml" },
    ExtEntry { ext: "json", mime: "application/json" },
    // Source
    ExtEntry { ext: "rs", mime: "text/x-rust" },
    ExtEntry { ext: "py", mime: "text/x-python" },
    ExtEntry { ext: "js", mime: "text/javascript" },
    ExtEntry { ext: "mjs", mime: "text/javascript" },
    ExtEntry { ext: "ts.txt", mime: "text/plain" },
    ExtEntry { ext: "css", mime: "text/css" },
];

/// Map a filename to its MIME type by matching the longest recognised
/// trailing extension chain (e.g. `photo.tar.gz` resolves via `tar.gz`
/// before falling back to `gz`). Returns `None` when no suffix matches.
pub fn mime_for_filename(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    let segments: Vec<&str> = lower.split('.').collect();
    if segments.len() < 2 {
        return None;
    }

    // Try progressively shorter trailing chains: full suffix-from-i first.
    for start in 1..segments.len() {
        let candidate = segments[start..].join(".");
        if let Some(entry) = TABLE.iter().find(|e| e.ext == candidate) {
            return Some(entry.mime);
        }
    }
    None
}

pub fn is_video_mime(mime: &str) -> bool {
    mime.starts_with("video/")
}

pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

/// Whether a MIME type is considered "media" for EXIF/derivative purposes.
pub fn is_media_mime(mime: &str) -> bool {
    is_image_mime(mime) || is_video_mime(mime)
}

/// Best-effort text/binary + charset sniff, used only to diagnose an EXIF
/// decode failure (telling a mislabeled non-image file from a genuinely
/// corrupt one) — never on the index hot path (spec §9).
///
/// Returns `Some(charset)` (currently always `"utf-8"` when text is
/// detected) or `None` if the buffer looks binary.
pub fn sniff_text_charset(buf: &[u8]) -> Option<&'static str> {
    if buf.is_empty() {
        return Some("utf-8");
    }
    // A conservative heuristic: no NUL bytes, and the buffer decodes as
    // valid (possibly truncated) UTF-8 on a byte-prefix basis.
    if buf.contains(&0) {
        return None;
    }
    match std::str::from_utf8(buf) {
        Ok(_) => Some("utf-8"),
        Err(e) => {
            // Accept a buffer that is valid UTF-8 up to a multi-byte
            // sequence truncated at the end (common when reading a fixed
            // prefix of a larger file).
            if e.valid_up_to() > buf.len().saturating_sub(4) {
                Some("utf-8")
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_longest_chain() {
        assert_eq!(mime_for_filename("archive.tar.gz"), Some("application/gzip"));
        assert_eq!(mime_for_filename("archive.gz"), Some("application/gzip"));
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(mime_for_filename("PHOTO.JPG"), Some("image/jpeg"));
    }

    #[test]
    fn unknown_extension_is_none() {
        assert_eq!(mime_for_filename("mystery.xyzabc"), None);
    }

    #[test]
    fn no_extension_is_none() {
        assert_eq!(mime_for_filename("README"), None);
    }

    #[test]
    fn media_classification() {
        assert!(is_media_mime("image/jpeg"));
        assert!(is_media_mime("video/mp4"));
        assert!(!is_media_mime("application/pdf"));
    }

    #[test]
    fn video_and_image_classification_are_disjoint() {
        assert!(is_video_mime("video/mp4"));
        assert!(!is_image_mime("video/mp4"));
        assert!(is_image_mime("image/jpeg"));
        assert!(!is_video_mime("image/jpeg"));
    }

    #[test]
    fn text_sniff_detects_binary() {
        assert_eq!(sniff_text_charset(&[0, 1, 2, 255]), None);
        assert_eq!(sniff_text_charset(b"hello world"), Some("utf-8"));
    }
}
