//! Crate-wide error type (spec §7). Maps to the HTTP status table in
//! `core::http`; enrichment callers match on specific variants to decide
//! whether to retry, absorb, or propagate.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("path `{path}` escapes media root `{root}`")]
    PathEscape { root: PathBuf, path: PathBuf },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("row `{0}` missing required watermark")]
    NotIndexed(String),

    #[error("corrupt source media: {0}")]
    CorruptInput(String),

    #[error("encoder failed: {0}")]
    Encoder(#[from] media_encoders::EncoderError),

    #[error("store contention exhausted retries")]
    ContentionRetry,

    #[error("failed to initialise cache directories: {0}")]
    CacheInit(String),

    #[error("response too large: {0}")]
    ResponseTooLarge(String),

    #[error("unsatisfiable byte range")]
    RangeUnsatisfiable,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("index store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;
