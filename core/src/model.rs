//! Shared attribute model (spec §3.1): the flat `FileRecord` row and the
//! small sum types parsed once at the HTTP boundary (spec §9 design notes
//! call for tagged variants over stringly-typed representations).

use serde::{Deserialize, Serialize};

/// One row per indexed path. Optional fields mean "unknown"; a watermark's
/// presence means "an extraction attempt completed", independent of whether
/// it produced any data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Canonical: leading and trailing `/`; root is exactly `/`.
    pub folder: String,
    pub file_name: String,

    pub mime_type: Option<String>,

    pub size_in_bytes: Option<i64>,
    pub created: Option<i64>,
    pub modified: Option<i64>,

    pub date_taken: Option<i64>,
    pub dimension_width: Option<i64>,
    pub dimension_height: Option<i64>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub exposure_time: Option<String>,
    pub aperture: Option<f64>,
    pub iso: Option<i64>,
    pub focal_length: Option<f64>,
    pub lens: Option<String>,
    pub video_duration_secs: Option<f64>,
    pub video_framerate: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub rating: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub orientation: Option<i64>,

    // Reserved groups: no extraction pipeline populates these yet, but the
    // columns exist so a future stage can without a schema migration.
    pub ai_description: Option<String>,
    #[serde(default)]
    pub ai_tags: Vec<String>,
    #[serde(default)]
    pub faces: Vec<FaceTag>,

    pub info_processed_at: Option<i64>,
    pub exif_processed_at: Option<i64>,
    /// Set once this row's HLS ladder has been generated (or found already
    /// cached) by the pre-encode stage; distinct from `exif_processed_at`
    /// so `/api/status`'s `pending.thumbnails` can be a plain watermark
    /// count rather than a filesystem walk.
    pub hls_processed_at: Option<i64>,
}

impl FileRecord {
    pub fn relative_path(&self) -> String {
        crate::path::join(&self.folder, &self.file_name)
    }

    pub fn is_media(&self) -> bool {
        self.mime_type.as_deref().is_some_and(media_file_ext::is_media_mime)
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.as_deref().is_some_and(media_file_ext::is_video_mime)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.as_deref().is_some_and(media_file_ext::is_image_mime)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaceTag {
    pub bbox: [f64; 4],
    pub descriptor: Vec<u8>,
    pub person_id: Option<String>,
    pub verified: bool,
}

/// The abstract output form a client requests for a file (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Representation {
    Original,
    WebSafe,
    Resize,
    Metadata,
    Hls,
    Preview,
}

impl Default for Representation {
    fn default() -> Self {
        Representation::Original
    }
}

impl Representation {
    /// Still-thumbnail derivatives (spec §4.9 file-mode rules 3 and 4):
    /// everything except the original stream, raw metadata, and HLS.
    pub fn is_still_derivative(self) -> bool {
        matches!(self, Representation::WebSafe | Representation::Resize | Representation::Preview)
    }
}

impl std::str::FromStr for Representation {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" | "" => Ok(Representation::Original),
            "webSafe" => Ok(Representation::WebSafe),
            "resize" => Ok(Representation::Resize),
            "metadata" => Ok(Representation::Metadata),
            "hls" => Ok(Representation::Hls),
            "preview" => Ok(Representation::Preview),
            other => Err(crate::error::Error::BadRequest(format!(
                "unknown representation `{other}`"
            ))),
        }
    }
}
