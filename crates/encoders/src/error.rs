use std::time::Duration;

/// Errors surfaced by the external encoder adapters (spec §4.4, §7).
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn encoder subprocess: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no usable interpreter found (tried py, python3, python)")]
    InterpreterNotFound,

    #[error("encoder exited with status {status:?}: {stderr_tail}")]
    Failed {
        status: Option<i32>,
        stderr_tail: String,
    },

    #[error("source media is corrupt or unreadable: {stderr_tail}")]
    CorruptInput { stderr_tail: String },

    #[error("encoder did not exit within {0:?}")]
    Timeout(Duration),

    #[error("io error communicating with encoder: {0}")]
    Io(#[source] std::io::Error),
}

/// Stderr substrings that indicate corrupt/unreadable source media rather
/// than a generic tool failure, per spec §4.4.
const CORRUPT_INPUT_MARKERS: &[&str] = &[
    "unexpected end of file",
    "invalid input",
    "unknown file format",
];

pub(crate) fn classify(stderr_tail: &str, exit_code: Option<i32>) -> EncoderError {
    let lower = stderr_tail.to_ascii_lowercase();
    if CORRUPT_INPUT_MARKERS.iter().any(|m| lower.contains(m)) {
        EncoderError::CorruptInput {
            stderr_tail: stderr_tail.to_string(),
        }
    } else {
        EncoderError::Failed {
            status: exit_code,
            stderr_tail: stderr_tail.to_string(),
        }
    }
}
