use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::info;

use crate::error::EncoderError;
use crate::interpreter::InterpreterProbe;
use crate::process_runner::run_and_collect_stdout;

/// One requested output of a still-resize invocation.
#[derive(Debug, Clone)]
pub struct StillOutput {
    pub path: PathBuf,
    pub target_height: u32,
}

#[derive(Serialize)]
struct ResizeRequest<'a> {
    input: &'a Path,
    outputs: Vec<ResizeRequestOutput<'a>>,
}

#[derive(Serialize)]
struct ResizeRequestOutput<'a> {
    path: &'a Path,
    height: u32,
}

/// Still-image resizer adapter (spec §4.4). Amortises interpreter startup
/// by accepting every output for a given source in one invocation.
pub struct StillResizer {
    probe: InterpreterProbe,
    script_path: PathBuf,
}

impl StillResizer {
    pub fn new(script_path: PathBuf) -> Self {
        Self {
            probe: InterpreterProbe::new(),
            script_path,
        }
    }

    pub async fn resize(
        &self,
        input: &Path,
        outputs: &[StillOutput],
    ) -> Result<(), EncoderError> {
        if outputs.is_empty() {
            return Ok(());
        }

        let interpreter = self.probe.resolve().await?;

        let request = ResizeRequest {
            input,
            outputs: outputs
                .iter()
                .map(|o| ResizeRequestOutput {
                    path: &o.path,
                    height: o.target_height,
                })
                .collect(),
        };
        let args_json = serde_json::to_string(&request)
            .expect("ResizeRequest serialises without failure");

        let mut cmd = Command::new(interpreter);
        cmd.arg(&self.script_path)
            .arg(args_json)
            .stdin(Stdio::null());

        info!(
            input = %input.display(),
            outputs = outputs.len(),
            "invoking still resizer"
        );

        run_and_collect_stdout(cmd, |_line| {}).await?;
        Ok(())
    }
}
