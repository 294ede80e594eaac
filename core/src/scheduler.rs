//! Component C: priority scheduler (spec §4.3).
//!
//! A single bounded-concurrency queue, generalised from the teacher's
//! `Jobs::pause`/`resume` switch (`core/src/api/jobs.rs`) into the full
//! priority × mediaType × pause contract. The scheduler is independent of
//! the async runtime's own task scheduling: it holds a `VecDeque` per
//! `(priority, mediaType)` bucket behind a plain `Mutex` (the critical
//! section is pure data-structure bookkeeping, never an `.await`), and
//! admits picked tasks under a `Semaphore`-backed concurrency gate.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, trace};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    UserBlocked,
    UserImplicit,
    Background,
}

impl Priority {
    fn rank(self) -> usize {
        match self {
            Priority::UserBlocked => 0,
            Priority::UserImplicit => 1,
            Priority::Background => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    fn rank(self) -> usize {
        match self {
            MediaType::Image => 0,
            MediaType::Video => 1,
        }
    }
}

/// Strict total order the dispatcher walks when a slot frees: priority
/// first, then mediaType (images before videos within the same priority).
const ORDER: [(Priority, MediaType); 6] = [
    (Priority::UserBlocked, MediaType::Image),
    (Priority::UserBlocked, MediaType::Video),
    (Priority::UserImplicit, MediaType::Image),
    (Priority::UserImplicit, MediaType::Video),
    (Priority::Background, MediaType::Image),
    (Priority::Background, MediaType::Video),
];

fn bucket_index(priority: Priority, media_type: MediaType) -> usize {
    priority.rank() * 2 + media_type.rank()
}

struct State {
    buckets: [VecDeque<BoxFuture>; 6],
    pause_until: Option<Instant>,
}

impl State {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            pause_until: None,
        }
    }

    fn is_paused(&self, now: Instant) -> bool {
        self.pause_until.is_some_and(|until| now < until)
    }

    /// Pops the highest-ranked pending job, skipping `background` buckets
    /// while paused. LIFO within a bucket.
    fn pick(&mut self) -> Option<BoxFuture> {
        let now = Instant::now();
        let paused = self.is_paused(now);
        for &(priority, media_type) in &ORDER {
            if paused && priority == Priority::Background {
                continue;
            }
            let bucket = &mut self.buckets[bucket_index(priority, media_type)];
            if let Some(job) = bucket.pop_back() {
                return Some(job);
            }
        }
        None
    }
}

/// Bounded-concurrency priority queue. Cheap to clone (an `Arc` handle); the
/// dispatch loop runs as a single background task spawned by `new`.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        let scheduler = Self {
            state: Arc::new(Mutex::new(State::new())),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            notify: Arc::new(Notify::new()),
        };
        scheduler.clone().spawn_dispatcher();
        scheduler
    }

    fn spawn_dispatcher(self) {
        tokio::spawn(async move {
            loop {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return, // semaphore closed: scheduler dropped
                };

                let job = loop {
                    if let Some(job) = self.state.lock().expect("scheduler mutex poisoned").pick()
                    {
                        break job;
                    }
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                };

                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
        });
    }

    /// Enqueues `fut` under `(priority, media_type)` and returns a handle
    /// resolving to its output once run. The handle resolves with `Err` if
    /// the task panics; otherwise with `Ok(T)` regardless of whether `fut`
    /// itself returned a success or failure value (task-level failures are
    /// the caller's concern, not the scheduler's).
    pub fn enqueue<F, T>(
        &self,
        priority: Priority,
        media_type: MediaType,
        fut: F,
    ) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: BoxFuture = Box::pin(async move {
            let result = fut.await;
            let _ = tx.send(result);
        });

        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            state.buckets[bucket_index(priority, media_type)].push_back(job);
        }
        trace!(?priority, ?media_type, "enqueued task");
        self.notify.notify_one();
        rx
    }

    /// Marks the queue paused until `now + duration`; while paused, only
    /// `background` work is withheld. Idempotent: repeated calls simply
    /// move the pause horizon forward, matching "each inbound request
    /// refreshes the grace period" (spec §4.3 auto-pause).
    pub fn pause(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.pause_until = Some(until);
        debug!(?duration, "scheduler paused");
    }

    pub fn is_paused(&self) -> bool {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .is_paused(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[tokio::test]
    async fn runs_at_most_concurrency_tasks() {
        let scheduler = Scheduler::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            let rx = scheduler.enqueue(Priority::Background, MediaType::Image, async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            handles.push(rx);
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn bucket_order_is_lifo() {
        let scheduler = Scheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Block the single slot first so all three enqueues land before
        // any of them run.
        let block_rx = scheduler.enqueue(Priority::Background, MediaType::Image, async {
            sleep(Duration::from_millis(50)).await;
        });

        let mut receivers = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let rx = scheduler.enqueue(Priority::Background, MediaType::Image, async move {
                order.lock().unwrap().push(i);
            });
            receivers.push(rx);
        }

        block_rx.await.unwrap();
        for rx in receivers {
            rx.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn pause_withholds_background_only() {
        let scheduler = Scheduler::new(1);
        scheduler.pause(Duration::from_millis(200));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let bg_rx = scheduler.enqueue(Priority::Background, MediaType::Image, async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        let ran3 = ran.clone();
        let user_rx = scheduler.enqueue(Priority::UserBlocked, MediaType::Image, async move {
            ran3.fetch_add(10, Ordering::SeqCst);
        });

        user_rx.await.unwrap();
        // Background must not have run yet: only user-priority work was
        // eligible while paused.
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        bg_rx.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }
}
