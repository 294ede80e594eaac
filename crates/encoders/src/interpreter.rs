use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::EncoderError;

/// Candidate interpreter binaries, tried in order, per spec §4.4.
const CANDIDATES: &[&str] = &["py", "python3", "python"];

/// The Windows Store's stub `python.exe`/`python3.exe` re-exec into the
/// Store listing instead of running a real interpreter. It reports an empty
/// (or `WindowsApps`-rooted) `sys.executable`, so we treat that as "not a
/// real interpreter" and move on to the next candidate.
fn looks_like_windows_store_stub(sys_executable: &str) -> bool {
    cfg!(target_os = "windows")
        && (sys_executable.is_empty() || sys_executable.to_ascii_lowercase().contains("windowsapps"))
}

async fn probe_candidate(bin: &str) -> Option<String> {
    let output = Command::new(bin)
        .arg("-c")
        .arg("import sys; print(sys.executable)")
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let sys_executable = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if looks_like_windows_store_stub(&sys_executable) {
        debug!(bin, "skipping Windows Store python stub");
        return None;
    }

    Some(bin.to_string())
}

async fn discover() -> Result<String, EncoderError> {
    for candidate in CANDIDATES {
        if let Some(bin) = probe_candidate(candidate).await {
            debug!(bin, "resolved python interpreter");
            return Ok(bin);
        }
    }
    warn!("no usable python interpreter found among {:?}", CANDIDATES);
    Err(EncoderError::InterpreterNotFound)
}

/// Process-wide, lazily-initialised interpreter binary name, safe to share
/// across tasks (spec §5: "process-wide state... lazily initialised,
/// process-lifetime, and safe to share across tasks").
pub struct InterpreterProbe {
    cell: OnceCell<String>,
}

impl InterpreterProbe {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn resolve(&self) -> Result<&str, EncoderError> {
        self.cell
            .get_or_try_init(discover)
            .await
            .map(String::as_str)
    }
}

impl Default for InterpreterProbe {
    fn default() -> Self {
        Self::new()
    }
}
