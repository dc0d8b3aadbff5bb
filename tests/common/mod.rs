//! Test utilities shared by the integration tests.
//!
//! Provides:
//! - [`RecordingListener`] capturing event snapshots
//! - Client builders over `MemorySink`
//! - An async polling helper

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parkline::observability::tracing::init_test_tracing;
use parkline::{
    Event, EventKind, ExpiryScheduler, Listener, ListenerError, MemorySink, Resource, Transport,
    TransportError,
};

/// What a listener saw for one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub kind: EventKind,
    pub message: Option<String>,
    pub cancelled: bool,
    pub resumed_on_timeout: bool,
    pub throwable: Option<TransportError>,
}

/// Listener that copies every event it receives.
#[derive(Debug)]
pub struct RecordingListener {
    name: String,
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|r| r.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|r| r.kind == kind).count()
    }

    pub fn last(&self) -> Option<Recorded> {
        self.events().last().cloned()
    }
}

impl Listener<String> for RecordingListener {
    fn on_event(&self, event: &Event<String>) -> Result<(), ListenerError> {
        self.events.lock().unwrap().push(Recorded {
            kind: event.kind(),
            message: event.message().cloned(),
            cancelled: event.is_cancelled(),
            resumed_on_timeout: event.is_resumed_on_timeout(),
            throwable: event.throwable().cloned(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A resource over an in-memory sink, with a recorder attached.
pub struct TestClient {
    pub resource: Resource<String>,
    pub sink: Arc<MemorySink<String>>,
    pub recorder: Arc<RecordingListener>,
}

impl TestClient {
    pub fn new(transport: Transport, scheduler: Arc<dyn ExpiryScheduler>) -> Self {
        init_test_tracing();
        let sink = Arc::new(MemorySink::<String>::new());
        let resource = Resource::<String>::new(transport, sink.clone(), scheduler);
        let recorder = RecordingListener::new("recorder");
        resource
            .add_listener(recorder.clone())
            .expect("fresh resource accepts listeners");
        Self {
            resource,
            sink,
            recorder,
        }
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
