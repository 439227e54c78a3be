//! Shared utilities for integration tests.
//!
//! Members are bound under a per-test temporary directory so tests can run
//! in parallel without sharing a namespace.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipsee::{Bus, BusEvent, BusOptions, Message, Uid};
use tokio::sync::broadcast;

/// Namespace used by the integration tests.
pub const NAMESPACE: &str = "ns";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Options placing a member with `uid` under `dir`.
pub fn options(dir: &Path, uid: impl Into<Uid>) -> BusOptions {
    BusOptions::default()
        .with_uid(uid)
        .with_path(dir)
        .with_connect_timeout(Duration::from_millis(500))
}

/// Bind a listening member of [`NAMESPACE`].
pub async fn member(dir: &Path, uid: impl Into<Uid>) -> Bus {
    Bus::bind(NAMESPACE, options(dir, uid))
        .await
        .expect("Failed to bind member")
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until `bus` has exactly `count` connected peers.
pub async fn wait_for_peers(bus: &Bus, count: usize) {
    let reached = wait_until(|| bus.peers().len() == count).await;
    assert!(
        reached,
        "expected {count} peers, have {}",
        bus.peers().len()
    );
}

/// Receive events until one named `name` arrives.
pub async fn next_named(rx: &mut broadcast::Receiver<BusEvent>, name: &str) -> BusEvent {
    within(async {
        loop {
            match rx.recv().await {
                Ok(event) if event.name() == name => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
}

/// Run `fut`, failing the test if it takes longer than [`WAIT`].
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("Timed out waiting")
}

/// Messages named `event` received by `bus`, recorded by a handler.
pub fn record(bus: &Bus, event: &str) -> Arc<Mutex<Vec<Message>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    bus.on(event, move |ev| {
        if let BusEvent::Message(msg) = ev {
            sink.lock().unwrap().push(msg.clone());
        }
    });
    log
}

/// Count of events named `event` observed by `bus`.
pub fn count(bus: &Bus, event: &str) -> Arc<Mutex<usize>> {
    let counter = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&counter);
    bus.on(event, move |_| *sink.lock().unwrap() += 1);
    counter
}

/// Leave a stale socket file at `path`: bound once, listener gone.
pub fn stale_socket(path: &Path) {
    drop(std::os::unix::net::UnixListener::bind(path).expect("Failed to bind stale socket"));
}
