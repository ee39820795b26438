//! Shared utilities for integration tests.
//!
//! Helpers for driving clients against the in-process broker.

#![allow(dead_code)]

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amqp_ipc::{ClientEvent, CompletionBarrier};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(2);

/// Window in which an absent event is taken as never arriving.
pub const QUIET: Duration = Duration::from_millis(50);

/// Wait for a barrier to settle successfully.
pub async fn settled<T, E>(barrier: &CompletionBarrier<T, E>) -> Vec<T>
where
    T: Clone,
    E: Clone + Debug,
{
    timeout(WAIT, barrier.await_all())
        .await
        .expect("timed out waiting for barrier")
        .expect("barrier rejected")
}

/// Next client event, skipping any the receiver lagged behind on.
pub async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => return event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

/// Assert no event arrives within [`QUIET`].
pub async fn assert_no_event(events: &mut broadcast::Receiver<ClientEvent>) {
    if let Ok(Ok(event)) = timeout(QUIET, events.recv()).await {
        panic!("unexpected client event: {:?}", event);
    }
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Thread-safe log of received messages.
#[derive(Clone, Default)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    /// Append and return the new length.
    pub fn push(&self, value: T) -> usize {
        let mut values = self.0.lock().unwrap();
        values.push(value);
        values.len()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}
