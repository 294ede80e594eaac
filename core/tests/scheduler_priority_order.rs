//! Cross-bucket ordering for component C (spec §4.3): priority first,
//! mediaType second. The scheduler's own inline tests cover same-bucket
//! LIFO and the concurrency cap; this covers the full total order across
//! every `(priority, mediaType)` combination together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use media_core::scheduler::{MediaType, Priority, Scheduler};

#[tokio::test]
async fn priority_outranks_media_type_which_outranks_enqueue_order() {
    let scheduler = Scheduler::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Hold the single slot so every enqueue below lands before dispatch starts.
    let block_rx = scheduler.enqueue(Priority::Background, MediaType::Image, async {
        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    let combos = [
        (Priority::Background, MediaType::Video, "background-video"),
        (Priority::Background, MediaType::Image, "background-image"),
        (Priority::UserImplicit, MediaType::Video, "implicit-video"),
        (Priority::UserImplicit, MediaType::Image, "implicit-image"),
        (Priority::UserBlocked, MediaType::Video, "blocked-video"),
        (Priority::UserBlocked, MediaType::Image, "blocked-image"),
    ];

    let mut receivers = Vec::new();
    for (priority, media_type, label) in combos {
        let order = order.clone();
        let rx = scheduler.enqueue(priority, media_type, async move {
            order.lock().unwrap().push(label);
        });
        receivers.push(rx);
    }

    block_rx.await.unwrap();
    for rx in receivers {
        rx.await.unwrap();
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec![
            "blocked-image",
            "blocked-video",
            "implicit-image",
            "implicit-video",
            "background-image",
            "background-video",
        ]
    );
}

#[tokio::test]
async fn paused_scheduler_still_drains_user_work() {
    let scheduler = Scheduler::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let block_rx = scheduler.enqueue(Priority::Background, MediaType::Image, async {
        tokio::time::sleep(Duration::from_millis(20)).await;
    });
    scheduler.pause(Duration::from_millis(200));
    assert!(scheduler.is_paused());

    let bg_order = order.clone();
    let bg_rx = scheduler.enqueue(Priority::Background, MediaType::Image, async move {
        bg_order.lock().unwrap().push("background");
    });
    let user_order = order.clone();
    let user_rx = scheduler.enqueue(Priority::UserBlocked, MediaType::Image, async move {
        user_order.lock().unwrap().push("user");
    });

    block_rx.await.unwrap();
    user_rx.await.unwrap();

    // The paused background task must not have run yet.
    assert_eq!(*order.lock().unwrap(), vec!["user"]);

    bg_rx.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["user", "background"]);
}
