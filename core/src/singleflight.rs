//! Request coalescing for the derivative cache (spec §8 scenario 4): when
//! two requests for the same `(sourceHash, variant)` miss the cache at the
//! same time, only one should run the encoder. Thin wrapper around
//! `async_singleflight::Group` so callers deal in this crate's `Error`
//! rather than the library's generic, `Clone`-bound error type.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::Error;

/// Coalesces concurrent async work under a key: the first caller for a key
/// runs `fut`, later callers for the same key while it's in flight await
/// that same run instead of starting their own.
pub struct SingleFlight<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    group: Arc<async_singleflight::Group<K, (), String>>,
}

impl<K> SingleFlight<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { group: Arc::new(async_singleflight::Group::new()) }
    }

    /// Runs `fut` for `key`, or waits for an already-running call for the
    /// same key. The leader's error is stringified so it can be replayed to
    /// every waiter; a dropped leader surfaces as `Error::Store`.
    pub async fn work<Fut>(&self, key: K, fut: Fut) -> Result<(), Error>
    where
        Fut: std::future::Future<Output = Result<(), Error>> + Send,
    {
        self.group
            .work(&key, async move { fut.await.map_err(|e| e.to_string()) })
            .await
            .map_err(|opt_err| match opt_err {
                Some(msg) => Error::Store(msg),
                None => Error::Store("encode task dropped".to_string()),
            })
    }
}

impl<K> Default for SingleFlight<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn deduplicates_concurrent_calls_for_the_same_key() {
        let sf: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                sf.work("same-hash:640".to_string(), async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let sf: SingleFlight<String> = SingleFlight::new();
        let runs = Arc::new(AtomicU32::new(0));

        let r1 = runs.clone();
        sf.work("a".to_string(), async move {
            r1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        let r2 = runs.clone();
        sf.work("b".to_string(), async move {
            r2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
