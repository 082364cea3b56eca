#![forbid(unsafe_code)]

use std::time::Duration;

use rulesync_core::Event;
use rulesync_queue::{Backoff, WorkQueue};
use tokio::time::timeout;

fn fast_queue() -> WorkQueue<Event> {
    WorkQueue::with_backoff(Backoff { base: Duration::from_millis(1), max: Duration::from_millis(20) })
}

#[tokio::test]
async fn duplicate_pending_events_coalesce() {
    let q = fast_queue();
    q.add(Event::resource_changed("monitoring/api"));
    assert_eq!(q.len(), 1);
    q.add(Event::resource_changed("monitoring/api"));
    assert_eq!(q.len(), 1);

    assert_eq!(q.get().await, Some(Event::resource_changed("monitoring/api")));
    q.done(&Event::resource_changed("monitoring/api"));
    assert!(q.is_empty());
    assert!(timeout(Duration::from_millis(50), q.get()).await.is_err(), "second pass must not happen");
}

#[tokio::test]
async fn distinct_events_keep_fifo_order() {
    let q = fast_queue();
    q.add(Event::resource_changed("a/x"));
    q.add(Event::sync_ruler());
    q.add(Event::resource_changed("a/y"));
    q.add(Event::resource_changed("a/x"));
    assert_eq!(q.len(), 3);
    assert_eq!(q.get().await, Some(Event::resource_changed("a/x")));
    assert_eq!(q.get().await, Some(Event::sync_ruler()));
    assert_eq!(q.get().await, Some(Event::resource_changed("a/y")));
}

#[tokio::test]
async fn in_flight_event_is_requeued_once_done() {
    let q = fast_queue();
    let e = Event::resource_changed("monitoring/api");
    q.add(e.clone());
    let got = q.get().await.unwrap();

    // Changes that arrive while the event is being processed collapse into one requeue.
    q.add(e.clone());
    q.add(e.clone());
    assert_eq!(q.len(), 0);

    q.done(&got);
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await, Some(e.clone()));
    q.done(&e);
    assert!(q.is_empty());
}

#[tokio::test]
async fn rate_limited_add_comes_back_after_backoff() {
    let q = fast_queue();
    let e = Event::sync_ruler();
    q.add(e.clone());
    let got = q.get().await.unwrap();
    q.add_rate_limited(got.clone());
    q.done(&got);
    assert_eq!(q.num_requeues(&e), 1);

    let again = timeout(Duration::from_secs(2), q.get()).await.expect("requeued").unwrap();
    assert_eq!(again, e);
    q.forget(&again);
    q.done(&again);
    assert_eq!(q.num_requeues(&e), 0);
}

#[tokio::test]
async fn shutdown_releases_waiters_and_drops_work() {
    let q = fast_queue();
    let waiter = tokio::spawn({
        let q = q.clone();
        async move { q.get().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.shutdown();
    assert_eq!(timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap(), None);

    q.add(Event::resource_changed("a/x"));
    q.add_rate_limited(Event::resource_changed("a/y"));
    assert!(q.is_shutting_down());
    assert!(q.is_empty());
    assert_eq!(q.get().await, None);
}

#[tokio::test]
async fn shutdown_discards_pending_events() {
    let q = fast_queue();
    q.add(Event::resource_changed("a/x"));
    q.add(Event::resource_changed("a/y"));
    q.shutdown();
    assert!(q.is_empty());
    assert_eq!(q.get().await, None);
}
