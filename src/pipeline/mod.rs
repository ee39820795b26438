//! Delivery pipeline.
//!
//! Turns a consumer's delivery stream into handler invocations. Each delivery
//! is decoded, handed to the handler, then acknowledged when the handler
//! succeeds or rejected (and requeued) when decoding or the handler fails.
//! Deliveries are processed concurrently; the channel's prefetch limit bounds
//! how many are in flight.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::error::{BoxError, ClientError, Result};
use crate::lifecycle::Lifecycle;
use crate::transport::{ConsumerEvent, Delivery};

/// Processes decoded messages.
///
/// Implemented for any `Fn(M) -> impl Future<Output = Result<(), BoxError>>`,
/// so closures work directly:
///
/// ```ignore
/// pubsub.subscribe("orders", |order: Order| async move {
///     println!("{:?}", order);
///     Ok(())
/// }).await?;
/// ```
pub trait MessageHandler<M>: Send + Sync + 'static {
    fn handle(&self, message: M) -> BoxFuture<'static, std::result::Result<(), BoxError>>;
}

impl<M, F, Fut> MessageHandler<M> for F
where
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    fn handle(&self, message: M) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        Box::pin((self)(message))
    }
}

/// Where a subscription is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    /// Cancellation requested, broker confirmation pending.
    Cancelling,
    Cancelled,
}

struct Shared {
    tag: String,
    queue: String,
    state: watch::Sender<SubscriptionState>,
    /// Set when the broker ended the subscription on its own.
    remote: AtomicBool,
}

impl Shared {
    fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    fn set(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }
}

/// Handle to an active consumer.
pub struct Subscription {
    shared: Arc<Shared>,
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("tag", &self.shared.tag)
            .field("queue", &self.shared.queue)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Subscription {
    /// Consumer tag assigned by the broker.
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Queue the subscription consumes from.
    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Stop deliveries for this subscription.
    ///
    /// Returns once the broker confirmed. Deliveries that arrive afterwards
    /// are rejected back to the queue without reaching the handler.
    /// Cancelling twice is a no-op, unless the broker already ended the
    /// subscription, in which case [`ClientError::RemoteCancellation`] is
    /// returned.
    pub async fn cancel(&self) -> Result<()> {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == SubscriptionState::Active {
                *state = SubscriptionState::Cancelling;
                true
            } else {
                false
            }
        });
        if !started {
            if self.shared.remote.load(Ordering::SeqCst) {
                return Err(ClientError::RemoteCancellation {
                    tag: self.shared.tag.clone(),
                });
            }
            return Ok(());
        }

        let result = match self.lifecycle.channel().await {
            Ok(channel) => channel
                .cancel(&self.shared.tag)
                .await
                .map_err(ClientError::Channel),
            Err(err) => Err(err),
        };
        self.shared.set(SubscriptionState::Cancelled);
        result?;

        info!(tag = %self.shared.tag, queue = %self.shared.queue, "Subscription cancelled");
        Ok(())
    }

    /// Wait until the subscription is cancelled, locally or by the broker.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow_and_update() == SubscriptionState::Cancelled {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Start consuming `queue`, dispatching decoded messages to `handler`.
///
/// Returns once the broker registered the consumer.
pub(crate) async fn start<M, C, H>(
    lifecycle: Arc<Lifecycle>,
    codec: Arc<C>,
    queue: &str,
    handler: H,
) -> Result<Subscription>
where
    M: DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<M>,
{
    let channel = lifecycle.channel().await?;
    let consumer = channel
        .consume(queue, &lifecycle.config().consume_options)
        .await
        .map_err(ClientError::Channel)?;

    let (state, _) = watch::channel(SubscriptionState::Active);
    let shared = Arc::new(Shared {
        tag: consumer.tag,
        queue: queue.to_string(),
        state,
        remote: AtomicBool::new(false),
    });

    info!(tag = %shared.tag, queue = %queue, "Subscription started");

    tokio::spawn(run(
        Arc::clone(&lifecycle),
        codec,
        handler,
        Arc::clone(&shared),
        consumer.deliveries,
    ));

    Ok(Subscription { shared, lifecycle })
}

async fn run<M, C, H>(
    lifecycle: Arc<Lifecycle>,
    codec: Arc<C>,
    handler: H,
    shared: Arc<Shared>,
    deliveries: BoxStream<'static, ConsumerEvent>,
) where
    M: DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<M>,
{
    let cancelled_by_broker = AtomicBool::new(false);
    deliveries
        .take_while(|event| {
            let cancelled = matches!(event, ConsumerEvent::Cancelled);
            if cancelled {
                cancelled_by_broker.store(true, Ordering::SeqCst);
            }
            future::ready(!cancelled)
        })
        .filter_map(|event| future::ready(event.into_delivery()))
        .for_each_concurrent(None, |delivery| {
            process::<M, C, H>(&lifecycle, codec.as_ref(), &handler, &shared, delivery)
        })
        .await;

    // A stream that just ends belongs to a local cancel or a channel that went
    // away; the lifecycle reports the latter.
    if cancelled_by_broker.load(Ordering::SeqCst)
        && shared.state() == SubscriptionState::Active
        && lifecycle.is_connected().await
    {
        shared.remote.store(true, Ordering::SeqCst);
        shared.set(SubscriptionState::Cancelled);
        warn!(
            tag = %shared.tag,
            queue = %shared.queue,
            "Subscription cancelled by broker, closing client"
        );
        lifecycle.close().await;
    } else {
        shared.set(SubscriptionState::Cancelled);
        debug!(tag = %shared.tag, "Delivery stream ended");
    }
}

async fn process<M, C, H>(
    lifecycle: &Lifecycle,
    codec: &C,
    handler: &H,
    shared: &Shared,
    delivery: Delivery,
) where
    M: DeserializeOwned + Send + 'static,
    C: Codec,
    H: MessageHandler<M>,
{
    let delivery_tag = delivery.delivery_tag;

    if shared.state() == SubscriptionState::Cancelled {
        debug!(tag = %shared.tag, delivery_tag, "Delivery after cancellation, requeueing");
        if let Err(err) = lifecycle.nack(delivery_tag).await {
            lifecycle.emit_error(err);
        }
        return;
    }

    debug!(
        tag = %shared.tag,
        delivery_tag,
        routing_key = %delivery.routing_key,
        redelivered = delivery.redelivered,
        "Processing delivery"
    );

    let outcome = match codec.decode::<M>(&delivery.payload) {
        Ok(message) => AssertUnwindSafe(async move { handler.handle(message).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)))
            .map_err(ClientError::Handler),
        Err(err) => Err(ClientError::Decode(err)),
    };

    let settled = match outcome {
        Ok(()) => lifecycle.ack(delivery_tag).await,
        Err(err) => {
            lifecycle.emit_error(err);
            lifecycle.nack(delivery_tag).await
        }
    };
    if let Err(err) = settled {
        lifecycle.emit_error(err);
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> BoxError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {}", message).into()
}
