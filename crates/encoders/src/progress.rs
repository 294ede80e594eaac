use std::collections::HashMap;

/// A single ffmpeg-style `key=value` progress line, parsed best-effort.
///
/// ffmpeg's `-progress pipe:1` protocol emits blocks of `key=value` lines
/// terminated by a `progress=continue|end` line; we surface each raw
/// key/value pair and let callers pick out what they need (`out_time_ms`,
/// `frame`, …).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub fields: HashMap<String, String>,
}

impl ProgressUpdate {
    pub fn is_end(&self) -> bool {
        self.fields.get("progress").map(String::as_str) == Some("end")
    }

    pub fn out_time_ms(&self) -> Option<i64> {
        self.fields.get("out_time_ms").and_then(|v| v.parse().ok())
    }
}

/// Parse a single `key=value` line. Non-conforming lines are ignored by the
/// caller (returns `None`).
pub fn parse_progress_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let (key, value) = line.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Accumulates `key=value` lines into `ProgressUpdate`s, flushing whenever a
/// `progress=` line is seen (ffmpeg emits exactly one such line per block).
#[derive(Default)]
pub struct ProgressAccumulator {
    current: ProgressUpdate,
}

impl ProgressAccumulator {
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let (key, value) = parse_progress_line(line)?;
        let is_progress_key = key == "progress";
        self.current.fields.insert(key, value);
        if is_progress_key {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_block() {
        let mut acc = ProgressAccumulator::default();
        assert!(acc.feed_line("frame=10").is_none());
        assert!(acc.feed_line("out_time_ms=500000").is_none());
        let update = acc.feed_line("progress=continue").expect("block flushed");
        assert_eq!(update.fields.get("frame").map(String::as_str), Some("10"));
        assert_eq!(update.out_time_ms(), Some(500_000));
        assert!(!update.is_end());
    }

    #[test]
    fn ignores_malformed_lines() {
        assert_eq!(parse_progress_line("not a kv line"), None);
        assert_eq!(parse_progress_line(""), None);
    }
}
