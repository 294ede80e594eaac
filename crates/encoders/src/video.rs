use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::info;

use crate::error::EncoderError;
use crate::process_runner::run_and_collect_stdout;
use crate::progress::{ProgressAccumulator, ProgressUpdate};

/// A single HLS ladder rung (spec §4.4 fixed ladder).
#[derive(Debug, Clone, Copy)]
pub struct HlsRung {
    pub label: &'static str,
    pub height: u32,
    pub bitrate_bps: u32,
}

/// Default fixed ladder: 360p @ 800 kbps, 720p @ 2.5 Mbps.
pub const DEFAULT_LADDER: &[HlsRung] = &[
    HlsRung {
        label: "360p",
        height: 360,
        bitrate_bps: 800_000,
    },
    HlsRung {
        label: "720p",
        height: 720,
        bitrate_bps: 2_500_000,
    },
];

const SEGMENT_TARGET_SECS: u32 = 2;

/// Raw (ffprobe-shaped) probe output. Rotation/dimension/codec
/// normalisation into the attribute model happens in `core::metadata`
/// (spec §4.5); this adapter only surfaces what the tool reports.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeOutput {
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub codec_type: String,
    pub codec_name: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub side_data_list: Vec<HashMap<String, serde_json::Value>>,
}

impl ProbeOutput {
    pub fn primary_video_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.codec_type == "video")
    }

    pub fn primary_audio_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.codec_type == "audio")
    }
}

/// Video tooling adapter: probe, still-thumbnail, webSafe transcode, and
/// HLS ladder generation, all via an external ffmpeg/ffprobe subprocess
/// (spec §4.4).
#[derive(Clone)]
pub struct VideoTool {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl VideoTool {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    pub fn default_tools() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }

    /// Runs ffprobe and returns the normalised-by-ffprobe (but not yet
    /// spec-normalised) metadata JSON.
    pub async fn probe(&self, input: &Path) -> Result<ProbeOutput, EncoderError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .stdin(Stdio::null());

        let stdout = run_and_collect_stdout(cmd, |_| {}).await?;
        serde_json::from_str(&stdout).map_err(|e| EncoderError::Failed {
            status: None,
            stderr_tail: format!("failed to parse ffprobe output: {e}"),
        })
    }

    /// One JPEG frame at t=0.5s, scaled to `height`, preserving aspect ratio.
    pub async fn thumbnail(
        &self,
        input: &Path,
        output: &Path,
        height: u32,
    ) -> Result<(), EncoderError> {
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-y", "-ss", "0.5", "-i"])
            .arg(input)
            .args(["-frames:v", "1", "-vf", &format!("scale=-2:{height}")])
            .arg(output)
            .stdin(Stdio::null());

        info!(input = %input.display(), height, "generating video still thumbnail");
        run_and_collect_stdout(cmd, |_| {}).await?;
        Ok(())
    }

    /// Produces the fixed HLS ladder under `out_dir`: one subdirectory per
    /// rung (`360p/`, `720p/`) holding `playlist.m3u8` + TS segments, plus a
    /// `master.m3u8` referencing both (spec §4.2, §4.4, §6.4).
    pub async fn hls(
        &self,
        input: &Path,
        out_dir: &Path,
        ladder: &[HlsRung],
        mut on_progress: impl FnMut(&str, ProgressUpdate) + Send,
    ) -> Result<(), EncoderError> {
        fs::create_dir_all(out_dir).await.map_err(EncoderError::Io)?;

        for rung in ladder {
            let rung_dir = out_dir.join(rung.label);
            fs::create_dir_all(&rung_dir).await.map_err(EncoderError::Io)?;

            let playlist = rung_dir.join("playlist.m3u8");
            let segment_pattern = rung_dir.join("segment_%03d.ts");

            let mut cmd = Command::new(&self.ffmpeg_bin);
            cmd.args(["-y", "-i"])
                .arg(input)
                .args([
                    "-vf",
                    &format!("scale=-2:{}", rung.height),
                    "-c:v",
                    "libx264",
                    "-b:v",
                    &rung.bitrate_bps.to_string(),
                    "-c:a",
                    "aac",
                    "-hls_time",
                    &SEGMENT_TARGET_SECS.to_string(),
                    "-hls_playlist_type",
                    "vod",
                    "-hls_flags",
                    "independent_segments",
                    "-hls_segment_filename",
                ])
                .arg(&segment_pattern)
                .args(["-progress", "pipe:1", "-nostats"])
                .arg(&playlist)
                .stdin(Stdio::null());

            info!(rung = rung.label, height = rung.height, "encoding HLS rung");

            let mut accumulator = ProgressAccumulator::default();
            run_and_collect_stdout(cmd, |line| {
                if let Some(update) = accumulator.feed_line(line) {
                    on_progress(rung.label, update);
                }
            })
            .await?;
        }

        write_master_playlist(out_dir, ladder).await?;
        Ok(())
    }
}

/// Nearest even 16:9 width for a given height, for the master playlist's
/// advisory `RESOLUTION` attribute (the actual encode uses `scale=-2:h`,
/// which lets ffmpeg pick the real width from the source aspect ratio).
fn advisory_width_16_9(height: u32) -> u32 {
    let width = height * 16 / 9;
    width - (width % 2)
}

async fn write_master_playlist(out_dir: &Path, ladder: &[HlsRung]) -> Result<(), EncoderError> {
    let mut contents = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rung in ladder {
        contents.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}/playlist.m3u8\n",
            rung.bitrate_bps,
            advisory_width_16_9(rung.height),
            rung.height,
            rung.label,
        ));
    }

    let final_path = out_dir.join("master.m3u8");
    let part_path = out_dir.join("master.m3u8.part");
    fs::write(&part_path, contents).await.map_err(EncoderError::Io)?;
    fs::rename(&part_path, &final_path).await.map_err(EncoderError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_360_then_720() {
        assert_eq!(DEFAULT_LADDER[0].height, 360);
        assert_eq!(DEFAULT_LADDER[1].height, 720);
    }

    #[test]
    fn probe_output_parses_ffprobe_shape() {
        let json = r#"{
            "format": {"duration": "12.5", "tags": {"creation_time": "2020-01-01T00:00:00Z"}},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "30/1"},
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(probe.primary_video_stream().unwrap().codec_name.as_deref(), Some("h264"));
        assert_eq!(probe.primary_audio_stream().unwrap().codec_name.as_deref(), Some("aac"));
    }
}
