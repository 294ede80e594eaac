//! Component D: external encoder adapters (spec §4.4).
//!
//! Encoders are treated as opaque subprocesses: we spawn them, stream and
//! log their output, retain a bounded tail of stderr for error reports, and
//! classify known "corrupt input" stderr substrings distinctly from generic
//! failures. Interpreter discovery (for the Python-based still resizer) is
//! cached process-wide.

mod error;
mod interpreter;
mod process_runner;
mod progress;
mod ring_tail;
mod still;
mod video;

pub use error::EncoderError;
pub use progress::{ProgressAccumulator, ProgressUpdate};
pub use still::{StillOutput, StillResizer};
pub use video::{HlsRung, ProbeFormat, ProbeOutput, ProbeStream, VideoTool, DEFAULT_LADDER};
