//! Work-queue router.
//!
//! Tasks are sent straight to one named, durable queue. Consumers share the
//! queue and the broker distributes tasks among them round robin, bounded by
//! each channel's prefetch limit. A task is only removed once a handler
//! acknowledged it.

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
use crate::transport::{Confirmation, PublishOptions, Transport};

/// Work-queue client over one queue.
pub struct WorkQueue<C: Codec = JsonCodec> {
    lifecycle: Arc<Lifecycle>,
    codec: Arc<C>,
}

impl WorkQueue {
    /// Create a client using the JSON codec. Nothing is opened until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self::with_codec(transport, options, JsonCodec)
    }
}

impl<C: Codec> WorkQueue<C> {
    pub fn with_codec(transport: Arc<dyn Transport>, options: ClientOptions, codec: C) -> Self {
        let config = ClientConfig::work_queue(&options);
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

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.lifecycle.events()
    }

    /// Connect and assert the queue.
    pub async fn connect(&self, address: Option<&str>) -> Result<()> {
        self.lifecycle.connect(address).await?;

        let config = self.lifecycle.config();
        let asserted = match self.lifecycle.channel().await {
            Ok(channel) => channel
                .assert_queue(&config.queue, &config.queue_options)
                .await
                .map_err(ClientError::Channel),
            Err(err) => Err(err),
        };
        if let Err(err) = asserted {
            self.lifecycle.close().await;
            return Err(err);
        }

        info!(
            queue = %config.queue,
            durable = config.queue_options.durable,
            prefetch = config.prefetch,
            "Work queue ready"
        );
        Ok(())
    }

    /// Add a task to the queue; returns once the broker confirmed it.
    pub async fn enqueue<M: Serialize + ?Sized>(&self, task: &M) -> Result<()> {
        let payload = self.codec.encode(task)?;
        let config = self.lifecycle.config();
        let options = PublishOptions {
            content_type: Some(self.codec.content_type().to_string()),
            ..config.publish_options.clone()
        };

        let confirmation = self
            .lifecycle
            .channel()
            .await?
            .send_to_queue(&config.queue, payload, &options)
            .await
            .map_err(ClientError::Channel)?;

        match confirmation {
            Confirmation::Ack => {
                debug!(queue = %config.queue, "Enqueued task");
                Ok(())
            }
            Confirmation::Nack => Err(ClientError::EnqueueRejected {
                queue: config.queue.clone(),
            }),
        }
    }

    /// Start taking tasks from the queue.
    ///
    /// A task is acknowledged when `handler` succeeds and requeued when it fails.
    pub async fn consume<M, H>(&self, handler: H) -> Result<Subscription>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        pipeline::start(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.codec),
            &self.lifecycle.config().queue,
            handler,
        )
        .await
    }

    /// Delete the queue, dropping any tasks still in it.
    pub async fn delete(&self) -> Result<()> {
        let queue = &self.lifecycle.config().queue;
        self.lifecycle
            .channel()
            .await?
            .delete_queue(queue)
            .await
            .map_err(ClientError::Channel)?;
        info!(queue = %queue, "Deleted queue");
        Ok(())
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.lifecycle.ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64) -> Result<()> {
        self.lifecycle.nack(delivery_tag).await
    }
}
