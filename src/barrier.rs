//! Async completion barrier.
//!
//! Coordinates a fixed number of asynchronous outcomes: the barrier holds N
//! slots, each settled exactly once by [`CompletionBarrier::resolve`] or
//! [`CompletionBarrier::reject`], and [`CompletionBarrier::await_all`]
//! completes once every slot resolved or as soon as one was rejected.
//!
//! ```ignore
//! // Wait for a handler to run five times.
//! let barrier = CompletionBarrier::<(), String>::new(5);
//! let signal = barrier.clone();
//! pubsub.subscribe("topic", move |_: Value| {
//!     let signal = signal.clone();
//!     async move { signal.resolve(()).map_err(Into::into) }
//! }).await?;
//! barrier.await_all().await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;

/// Errors raised by the barrier itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    #[error("Barrier exhausted: all {slots} slots are already settled")]
    Exhausted { slots: usize },
}

#[derive(Debug)]
struct Slots<T, E> {
    capacity: usize,
    settled: usize,
    values: Vec<T>,
    outcome: Option<Result<Vec<T>, E>>,
}

/// N-of-N asynchronous join with first-failure-wins semantics.
///
/// Cloning yields another handle onto the same slots.
#[derive(Debug)]
pub struct CompletionBarrier<T, E> {
    slots: Arc<watch::Sender<Slots<T, E>>>,
}

impl<T, E> Clone for CompletionBarrier<T, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T, E> CompletionBarrier<T, E> {
    /// Create a barrier with `capacity` pending slots.
    ///
    /// A barrier without slots is complete from the start.
    pub fn new(capacity: usize) -> Self {
        let outcome = (capacity == 0).then(|| Ok(Vec::new()));
        let (slots, _) = watch::channel(Slots {
            capacity,
            settled: 0,
            values: Vec::with_capacity(capacity),
            outcome,
        });
        Self {
            slots: Arc::new(slots),
        }
    }

    /// Number of slots this barrier was created with.
    pub fn capacity(&self) -> usize {
        self.slots.borrow().capacity
    }

    /// Number of slots still waiting to be settled.
    pub fn remaining(&self) -> usize {
        let slots = self.slots.borrow();
        slots.capacity - slots.settled
    }

    /// Settle the next slot successfully.
    pub fn resolve(&self, value: T) -> Result<(), BarrierError> {
        self.settle(Ok(value))
    }

    /// Settle the next slot as failed.
    ///
    /// The first rejection completes the barrier; later settlements still
    /// consume slots but no longer change the outcome.
    pub fn reject(&self, error: E) -> Result<(), BarrierError> {
        self.settle(Err(error))
    }

    fn settle(&self, result: Result<T, E>) -> Result<(), BarrierError> {
        let mut exhausted = None;
        self.slots.send_if_modified(|slots| {
            if slots.settled == slots.capacity {
                exhausted = Some(BarrierError::Exhausted {
                    slots: slots.capacity,
                });
                return false;
            }
            slots.settled += 1;
            if slots.outcome.is_some() {
                return false;
            }
            match result {
                Ok(value) => {
                    slots.values.push(value);
                    if slots.settled == slots.capacity {
                        slots.outcome = Some(Ok(std::mem::take(&mut slots.values)));
                        return true;
                    }
                    false
                }
                Err(error) => {
                    slots.values.clear();
                    slots.outcome = Some(Err(error));
                    true
                }
            }
        });
        match exhausted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<T: Clone, E: Clone> CompletionBarrier<T, E> {
    /// Wait until every slot resolved, returning the values in settlement
    /// order, or until the first rejection.
    pub async fn await_all(&self) -> Result<Vec<T>, E> {
        let mut rx = self.slots.subscribe();
        loop {
            if let Some(outcome) = &rx.borrow_and_update().outcome {
                return outcome.clone();
            }
            // `self` keeps the sender alive, so this only returns on a settlement.
            let _ = rx.changed().await;
        }
    }
}
