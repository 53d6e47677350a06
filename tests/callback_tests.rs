mod common;

use common::{client_config, closed_port, start_server};
use ethrs::{Client, ProgressCallback, ProgressEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_callback_struct() {
    let (server, port) = start_server().await;

    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let client = Client::new(client_config(port))
        .unwrap()
        .with_callback(callback);
    client.run().await.unwrap();

    let events = events_ref.lock().unwrap();
    assert!(matches!(events.first(), Some(ProgressEvent::TestStarted { .. })));
    match events.last() {
        Some(ProgressEvent::TestCompleted { summary, .. }) => {
            assert_eq!(Some(summary.clone()), client.summary());
            assert_eq!(summary.workers, 1);
        }
        other => panic!("expected TestCompleted last, got {:?}", other),
    }

    let results = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Result(_)))
        .count();
    assert!(results > 0);
    assert_eq!(results, client.results().len());
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Error(_))));
    server.shutdown_token().cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_closure_callback_counts_results() {
    let (server, port) = start_server().await;

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    let client = Client::new(client_config(port))
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::Result(_) = event {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
    client.run().await.unwrap();

    assert!(counter.load(Ordering::SeqCst) > 0);
    server.shutdown_token().cancel();
}

#[tokio::test]
async fn test_error_event_when_server_is_down() {
    let port = closed_port().await;
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let client = Client::new(client_config(port))
        .unwrap()
        .with_callback(callback);
    assert!(client.run().await.is_err());

    let events = events_ref.lock().unwrap();
    assert!(matches!(events.last(), Some(ProgressEvent::Error(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::TestCompleted { .. })));
}
