//! Publish/subscribe router.
//!
//! Messages are published to a named exchange under a topic (routing key).
//! Every subscription gets its own server-named exclusive queue bound to the
//! exchange for one topic, so each subscriber sees every matching message.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::codec::{Codec, JsonCodec};
use crate::config::{ClientConfig, ClientOptions};
use crate::error::{ClientError, ClientEvent, Result};
use crate::lifecycle::Lifecycle;
use crate::pipeline::{self, MessageHandler, Subscription};
use crate::transport::{BrokerChannel, Confirmation, PublishOptions, Transport};

/// Publish/subscribe client over one exchange.
pub struct PubSub<C: Codec = JsonCodec> {
    lifecycle: Arc<Lifecycle>,
    codec: Arc<C>,
}

impl PubSub {
    /// Create a client using the JSON codec. Nothing is opened until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self::with_codec(transport, options, JsonCodec)
    }
}

impl<C: Codec> PubSub<C> {
    pub fn with_codec(transport: Arc<dyn Transport>, options: ClientOptions, codec: C) -> Self {
        let config = ClientConfig::pubsub(&options);
        Self {
            lifecycle: Arc::new(Lifecycle::new(transport, config)),
            codec: Arc::new(codec),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.lifecycle.config()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Subscribe to `Closed`/`Errored` notifications.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.lifecycle.events()
    }

    /// Connect and assert the exchange.
    ///
    /// `address` overrides the configured url.
    pub async fn connect(&self, address: Option<&str>) -> Result<()> {
        self.lifecycle.connect(address).await?;

        let config = self.lifecycle.config();
        let asserted = match self.lifecycle.channel().await {
            Ok(channel) => channel
                .assert_exchange(&config.exchange, &config.exchange_options)
                .await
                .map_err(ClientError::Channel),
            Err(err) => Err(err),
        };
        if let Err(err) = asserted {
            self.lifecycle.close().await;
            return Err(err);
        }

        info!(
            exchange = %config.exchange,
            kind = config.exchange_options.kind.as_str(),
            durable = config.exchange_options.durable,
            "Pub/sub exchange ready"
        );
        Ok(())
    }

    /// Publish `message` under `topic`; returns once the broker confirmed it.
    pub async fn publish<M: Serialize + ?Sized>(&self, topic: &str, message: &M) -> Result<()> {
        let payload = self.codec.encode(message)?;
        let config = self.lifecycle.config();
        let options = PublishOptions {
            content_type: Some(self.codec.content_type().to_string()),
            ..config.publish_options.clone()
        };

        let confirmation = self
            .lifecycle
            .channel()
            .await?
            .publish(&config.exchange, topic, payload, &options)
            .await
            .map_err(ClientError::Channel)?;

        match confirmation {
            Confirmation::Ack => {
                debug!(exchange = %config.exchange, topic = %topic, "Published message");
                Ok(())
            }
            Confirmation::Nack => Err(ClientError::PublishRejected {
                exchange: config.exchange.clone(),
                topic: topic.to_string(),
            }),
        }
    }

    /// Receive every message published under `topic` from now on.
    ///
    /// Returns once the subscription's queue is bound and the consumer is
    /// registered.
    pub async fn subscribe<M, H>(&self, topic: &str, handler: H) -> Result<Subscription>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        let config = self.lifecycle.config();
        let channel = self.lifecycle.channel().await?;

        let queue = channel
            .assert_queue("", &config.queue_options)
            .await
            .map_err(ClientError::Channel)?;
        if let Err(err) = channel.bind_queue(&queue, &config.exchange, topic).await {
            discard_queue(channel.as_ref(), &queue).await;
            return Err(ClientError::Channel(err));
        }
        debug!(queue = %queue, exchange = %config.exchange, topic = %topic, "Bound subscription queue");

        let subscription = pipeline::start(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.codec),
            &queue,
            handler,
        )
        .await;
        if subscription.is_err() {
            discard_queue(channel.as_ref(), &queue).await;
        }
        subscription
    }

    /// Delete the exchange.
    pub async fn delete(&self) -> Result<()> {
        let exchange = &self.lifecycle.config().exchange;
        self.lifecycle
            .channel()
            .await?
            .delete_exchange(exchange)
            .await
            .map_err(ClientError::Channel)?;
        info!(exchange = %exchange, "Deleted exchange");
        Ok(())
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    /// Acknowledge a delivery by tag. A no-op in no-ack mode (the default here).
    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.lifecycle.ack(delivery_tag).await
    }

    /// Reject and requeue a delivery by tag. A no-op in no-ack mode.
    pub async fn nack(&self, delivery_tag: u64) -> Result<()> {
        self.lifecycle.nack(delivery_tag).await
    }
}

/// Best-effort removal of a subscription queue that never got a consumer.
///
/// A failed bind or consume usually closes the channel first; an exclusive
/// queue then goes away with the connection instead.
async fn discard_queue(channel: &dyn BrokerChannel, queue: &str) {
    if let Err(err) = channel.delete_queue(queue).await {
        debug!(queue = %queue, error = %err, "Could not delete unused subscription queue");
    }
}
