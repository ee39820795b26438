//! AMQP (RabbitMQ) transport.
//!
//! Adapts lapin's connection and channel to the broker-protocol seam. Every
//! call is awaited to the broker's reply; publishes additionally wait for the
//! publisher confirm. lapin error callbacks are turned into
//! [`TransportEvent`]s on the connection's sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, Consumer, ConsumerEvent,
    Delivery, EventSink, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, Result, SocketOptions, Transport,
    TransportEvent,
};
use crate::error::TransportError;

/// Reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;
/// Delivery mode flag for messages that survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Opens lapin connections.
#[derive(Clone, Default)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (executor, client name, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(
        &self,
        address: &str,
        options: &SocketOptions,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut uri: AMQPUri = address
            .parse()
            .map_err(|reason: String| TransportError::Unreachable {
                address: address.to_string(),
                reason,
            })?;
        uri.query.heartbeat = Some(options.heartbeat);

        let connection = Connection::connect_uri(uri, self.properties.clone())
            .await
            .map_err(|e| TransportError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let sink = events.clone();
        connection.on_error(move |err| {
            let _ = sink.send(TransportEvent::ConnectionError(TransportError::Amqp(
                err.clone(),
            )));
            let _ = sink.send(TransportEvent::ConnectionClosed(Some(TransportError::Amqp(
                err,
            ))));
        });

        debug!(address = %address, heartbeat = options.heartbeat, "Opened AMQP connection");
        Ok(Arc::new(AmqpConnection { connection, events }))
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    connection: Connection,
    events: EventSink,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let sink = self.events.clone();
        channel.on_error(move |err| {
            let _ = sink.send(TransportEvent::ChannelError(TransportError::Amqp(err)));
            let _ = sink.send(TransportEvent::ChannelClosed);
        });

        Ok(Arc::new(AmqpChannel {
            channel,
            events: self.events.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(REPLY_SUCCESS, "closing").await?;
        let _ = self.events.send(TransportEvent::ConnectionClosed(None));
        Ok(())
    }
}

/// A lapin channel in confirm mode.
pub struct AmqpChannel {
    channel: Channel,
    events: EventSink,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn properties(options: &PublishOptions) -> BasicProperties {
    let mode = if options.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };
    let properties = BasicProperties::default().with_delivery_mode(mode);
    match &options.content_type {
        Some(content_type) => properties.with_content_type(content_type.as_str().into()),
        None => properties,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // Global: the limit applies to the channel as a whole.
        self.channel
            .basic_qos(count, BasicQosOptions { global: true })
            .await?;
        Ok(())
    }

    async fn assert_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(options.kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<Confirmation> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties(options),
            )
            .await?
            .await?;

        if confirm.is_nack() {
            Ok(Confirmation::Nack)
        } else {
            Ok(Confirmation::Ack)
        }
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<Confirmation> {
        self.publish("", queue, payload, options).await
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or(""),
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().as_str().to_string();

        // lapin yields an error when the channel fails and simply ends the
        // stream once the consumer is cancelled.
        let failed = Arc::new(AtomicBool::new(false));
        let stream_failed = Arc::clone(&failed);
        let stream_tag = tag.clone();
        let deliveries = consumer
            .take_while(move |delivery| {
                if let Err(err) = delivery {
                    warn!(tag = %stream_tag, error = %err, "Consumer stream failed");
                    stream_failed.store(true, Ordering::SeqCst);
                }
                future::ready(delivery.is_ok())
            })
            .filter_map(|delivery| future::ready(delivery.ok()))
            .map(|delivery| {
                ConsumerEvent::Delivery(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    payload: Bytes::from(delivery.data),
                })
            })
            .chain(
                stream::once(async move { failed.load(Ordering::SeqCst) }).filter_map(
                    |failed| future::ready((!failed).then_some(ConsumerEvent::Cancelled)),
                ),
            )
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "closing").await?;
        let _ = self.events.send(TransportEvent::ChannelClosed);
        Ok(())
    }
}
