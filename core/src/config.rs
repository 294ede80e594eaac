//! Process-wide configuration, built once at startup from the environment
//! (spec §6.3). Mirrors the teacher's single typed config object pattern.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub media_root: PathBuf,
    pub port: u16,
    pub index_db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub scheduler_concurrency: usize,
    pub auto_pause: Duration,
    /// Honoured by test harnesses to skip discovery/watcher kickoff at
    /// startup so tests can drive the index directly.
    pub no_auto_start: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let media_root = std::env::var("MEDIA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./exampleFolder"));

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./cache"));

        let index_db_path = std::env::var("INDEX_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cache_dir.join("index.db"));

        let scheduler_concurrency = std::env::var("SCHEDULER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let auto_pause_secs: u64 = std::env::var("AUTO_PAUSE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let no_auto_start = std::env::var("MEDIA_SERVICE_NO_AUTO_START")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            media_root,
            port,
            index_db_path,
            cache_dir,
            scheduler_concurrency,
            auto_pause: Duration::from_secs(auto_pause_secs),
            no_auto_start,
        }
    }

    #[cfg(test)]
    pub fn for_test(media_root: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            index_db_path: cache_dir.join("index.db"),
            media_root,
            cache_dir,
            port: 0,
            scheduler_concurrency: 2,
            auto_pause: Duration::from_secs(60),
            no_auto_start: true,
        }
    }
}
