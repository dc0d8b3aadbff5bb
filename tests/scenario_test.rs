//! End-to-end lifecycle scenarios.
//!
//! - Broadcast before the timer fires
//! - Timer fires with no broadcast
//! - Disconnect racing a broadcast
//! - Broadcast skips a subscriber that is not suspended
//! - Writing to a destroyed resource
//! - Destroy racing a broadcast or an expiry timer

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{wait_for, TestClient};
use parkline::{
    Broadcaster, BroadcasterConfig, Error, Event, EventKind, InvalidState, ListenerFn,
    ManualScheduler, ResourceState, TokioScheduler, Transport,
};
use tokio_test::{assert_err, assert_ok};

fn topic(id: &str) -> Broadcaster<String> {
    Broadcaster::new(id, BroadcasterConfig::default())
}

/// Counts events dispatched after the resource lost its broadcaster.
fn watch_owner(client: &TestClient) -> Arc<AtomicUsize> {
    let orphaned = Arc::new(AtomicUsize::new(0));
    let handle = client.resource.clone();
    let counter = Arc::clone(&orphaned);
    client
        .resource
        .add_listener(ListenerFn::arc("owner-watch", move |_ev: &Event<String>| {
            if handle.broadcaster().is_none() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }))
        .unwrap();
    orphaned
}

#[test]
fn broadcast_before_timeout_resumes_and_disarms() {
    let timers = Arc::new(ManualScheduler::new());
    let client = TestClient::new(Transport::LongPolling, timers.clone());
    let news = topic("news");

    client.resource.suspend(Duration::from_millis(100)).unwrap();
    news.subscribe(&client.resource).unwrap();

    timers.advance(Duration::from_millis(50));
    let outcome = assert_ok!(news.broadcast("hi".to_string()));
    assert_eq!(outcome.resumed, 1);

    let last = client.recorder.last().unwrap();
    assert_eq!(last.kind, EventKind::Resumed);
    assert_eq!(last.message.as_deref(), Some("hi"));
    assert!(!last.cancelled);
    assert_eq!(timers.pending(), 0);

    assert_eq!(timers.advance(Duration::from_millis(50)), 0);
    assert_eq!(client.resource.state(), ResourceState::Resumed);
    assert_eq!(client.recorder.count(EventKind::TimedOut), 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_before_timeout_on_tokio_timers() {
    let scheduler = Arc::new(TokioScheduler::current().unwrap());
    let client = TestClient::new(Transport::LongPolling, scheduler.clone());
    let news = topic("news");

    client.resource.suspend(Duration::from_millis(100)).unwrap();
    news.subscribe(&client.resource).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(news.broadcast("hi".to_string()).unwrap().resumed, 1);
    assert_eq!(scheduler.pending(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.resource.state(), ResourceState::Resumed);
    assert_eq!(
        client.recorder.kinds(),
        vec![EventKind::Suspended, EventKind::Resumed]
    );
}

#[test]
fn timeout_without_broadcast() {
    let timers = Arc::new(ManualScheduler::new());
    let client = TestClient::new(Transport::LongPolling, timers.clone());

    client.resource.suspend(Duration::from_millis(50)).unwrap();
    assert_eq!(timers.advance(Duration::from_millis(50)), 1);

    let last = client.recorder.last().unwrap();
    assert_eq!(last.kind, EventKind::TimedOut);
    assert!(last.resumed_on_timeout);
    assert!(!last.cancelled);
    assert!(client.resource.current_event().is_resumed_on_timeout());
    assert!(client.sink.is_closed());
}

#[tokio::test(start_paused = true)]
async fn timeout_on_tokio_timers() {
    let scheduler = Arc::new(TokioScheduler::current().unwrap());
    let client = TestClient::new(Transport::Streaming, scheduler);

    client.resource.suspend(Duration::from_millis(50)).unwrap();
    let timed_out = wait_for(Duration::from_secs(2), || {
        client.resource.state() == ResourceState::TimedOut
    })
    .await;

    assert!(timed_out);
    assert!(
        wait_for(Duration::from_secs(1), || {
            client.recorder.count(EventKind::TimedOut) == 1
        })
        .await
    );
}

#[test]
fn cancel_racing_broadcast_has_one_winner() {
    for _ in 0..200 {
        let client = TestClient::new(Transport::LongPolling, Arc::new(ManualScheduler::new()));
        let news = topic("news");
        client.resource.suspend(Duration::from_secs(10)).unwrap();
        news.subscribe(&client.resource).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let canceller = {
            let resource = client.resource.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                resource.cancel().unwrap()
            })
        };
        barrier.wait();
        let outcome = news.broadcast("hi".to_string()).unwrap();
        let cancelled = canceller.join().unwrap();

        let resumed = outcome.resumed == 1;
        assert!(resumed ^ cancelled);

        let events = client.recorder.events();
        assert_eq!(events.len(), 2);
        let exit = &events[1];
        if resumed {
            assert_eq!(exit.kind, EventKind::Resumed);
            assert_eq!(exit.message.as_deref(), Some("hi"));
            assert_eq!(client.resource.state(), ResourceState::Resumed);
        } else {
            assert_eq!(exit.kind, EventKind::Cancelled);
            assert_eq!(outcome.skipped, 1);
            assert!(client.sink.messages().is_empty());
            assert_eq!(client.resource.state(), ResourceState::Cancelled);
        }
        for event in &events {
            assert!(!(event.cancelled && event.message.is_some()));
        }
    }
}

#[test]
fn racing_exits_from_one_cycle_are_exclusive() {
    for _ in 0..200 {
        let client = TestClient::new(Transport::LongPolling, Arc::new(ManualScheduler::new()));
        client.resource.suspend(Duration::from_secs(10)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let resumer = {
            let resource = client.resource.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                resource.resume().is_ok()
            })
        };
        barrier.wait();
        let timed_out = client.resource.timeout().unwrap();
        let resumed = resumer.join().unwrap();

        assert!(resumed ^ timed_out);
        let exits = client.recorder.count(EventKind::Resumed)
            + client.recorder.count(EventKind::TimedOut);
        assert_eq!(exits, 1);
    }
}

#[test]
fn broadcast_skips_subscriber_not_suspended() {
    let timers = Arc::new(ManualScheduler::new());
    let news = topic("news");
    let clients: Vec<TestClient> = (0..3)
        .map(|_| TestClient::new(Transport::LongPolling, timers.clone()))
        .collect();

    for client in &clients {
        news.subscribe(&client.resource).unwrap();
    }
    clients[0].resource.suspend(Duration::from_secs(1)).unwrap();
    clients[1].resource.suspend(Duration::from_secs(1)).unwrap();

    let outcome = news.broadcast("hello".to_string()).unwrap();
    assert_eq!(outcome.resumed, 2);
    assert_eq!(outcome.skipped, 1);

    for client in &clients[..2] {
        assert_eq!(client.resource.state(), ResourceState::Resumed);
        assert_eq!(client.sink.messages(), vec!["hello".to_string()]);
    }
    let idle = &clients[2];
    assert_eq!(idle.resource.state(), ResourceState::Created);
    assert!(idle.sink.messages().is_empty());
    assert!(idle.recorder.events().is_empty());
}

#[test]
fn write_after_destroy_is_recycled() {
    let client = TestClient::new(Transport::Streaming, Arc::new(ManualScheduler::new()));
    let event = client.resource.current_event();
    client.resource.destroy();

    let err = assert_err!(client.resource.write(b"late"));
    assert_eq!(err.to_string(), "Recycled");
    assert!(matches!(err, Error::InvalidState(InvalidState::Recycled)));

    let err = assert_err!(event.write(b"late"));
    assert!(err.is_recycled());
}

#[test]
fn destroy_waits_for_in_flight_broadcast() {
    for _ in 0..200 {
        let client = TestClient::new(Transport::Streaming, Arc::new(ManualScheduler::new()));
        let news = topic("news");
        client.resource.suspend(Duration::ZERO).unwrap();
        news.subscribe(&client.resource).unwrap();
        let orphaned = watch_owner(&client);

        let barrier = Arc::new(Barrier::new(2));
        let publisher = {
            let news = news.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                news.broadcast("hi".to_string()).unwrap()
            })
        };
        barrier.wait();
        client.resource.destroy();
        let seen = client.recorder.events().len();
        let outcome = publisher.join().unwrap();

        assert_eq!(client.recorder.events().len(), seen);
        assert_eq!(orphaned.load(Ordering::SeqCst), 0);
        assert!(outcome.resumed + outcome.skipped <= 1);
        assert_eq!(client.sink.messages().len(), outcome.resumed);
        assert!(client.resource.is_destroyed());
        assert!(client.resource.broadcaster().is_none());
        assert!(news.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_racing_expiry_leaves_no_late_events() {
    let scheduler = Arc::new(TokioScheduler::current().unwrap());
    for round in 0..50u64 {
        let client = TestClient::new(Transport::LongPolling, scheduler.clone());
        let news = topic("news");
        client.resource.suspend(Duration::from_millis(2)).unwrap();
        news.subscribe(&client.resource).unwrap();
        let orphaned = watch_owner(&client);

        tokio::time::sleep(Duration::from_micros(500 * (round % 5))).await;
        let resource = client.resource.clone();
        tokio::task::spawn_blocking(move || resource.destroy())
            .await
            .unwrap();
        let seen = client.recorder.events().len();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(client.recorder.events().len(), seen);
        assert_eq!(orphaned.load(Ordering::SeqCst), 0);
        assert!(client.recorder.count(EventKind::TimedOut) <= 1);
        assert_eq!(scheduler.pending(), 0);
        assert!(client.resource.is_destroyed());
        assert!(news.is_empty());
    }
}
