use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, trace};

use crate::error::{classify, EncoderError};
use crate::ring_tail::{RingTail, STDERR_TAIL_CAP};

/// Runs a child process to completion, logging every stdout/stderr line at
/// `trace!`, capturing the full stdout (adapters that need structured
/// output, e.g. the video probe, parse it themselves), retaining only the
/// last 64 KiB of stderr for error reporting, and routing each stdout line
/// through `on_stdout_line` as it arrives (used for ffmpeg-style progress).
///
/// Resolves with the captured stdout on exit code 0; otherwise rejects with
/// a classified `EncoderError` (spec §4.4).
pub async fn run_and_collect_stdout(
    mut cmd: Command,
    mut on_stdout_line: impl FnMut(&str) + Send,
) -> Result<String, EncoderError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(EncoderError::Spawn)?;

    let mut stdout = child
        .stdout
        .take()
        .map(BufReader::new)
        .expect("stdout was piped");
    let mut stderr = child
        .stderr
        .take()
        .map(BufReader::new)
        .expect("stderr was piped");

    let mut stdout_text = String::new();
    let mut stderr_tail = RingTail::new(STDERR_TAIL_CAP);

    let mut stdout_line = String::new();
    let mut stderr_line = String::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        stdout_line.clear();
        stderr_line.clear();
        tokio::select! {
            n = stdout.read_line(&mut stdout_line), if !stdout_done => {
                match n {
                    Ok(0) => stdout_done = true,
                    Ok(_) => {
                        trace!(target: "encoder.stdout", line = %stdout_line.trim_end());
                        stdout_text.push_str(&stdout_line);
                        on_stdout_line(stdout_line.trim_end());
                    }
                    Err(e) => return Err(EncoderError::Io(e)),
                }
            }
            n = stderr.read_line(&mut stderr_line), if !stderr_done => {
                match n {
                    Ok(0) => stderr_done = true,
                    Ok(_) => {
                        trace!(target: "encoder.stderr", line = %stderr_line.trim_end());
                        stderr_tail.push_line(stderr_line.trim_end());
                    }
                    Err(e) => return Err(EncoderError::Io(e)),
                }
            }
        }
    }

    let status = child.wait().await.map_err(EncoderError::Io)?;
    if status.success() {
        info!(code = status.code(), "encoder exited successfully");
        Ok(stdout_text)
    } else {
        Err(classify(&stderr_tail.as_string(), status.code()))
    }
}
