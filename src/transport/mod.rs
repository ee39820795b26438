//! Broker-protocol seam.
//!
//! This module contains:
//! - `Transport`, `BrokerConnection`, `BrokerChannel` traits: the operations
//!   the client needs from a broker, each presented as an awaitable call
//! - `TransportEvent`: close/error notifications pushed by connections and channels
//! - Option types handed to the broker when declaring topology and consuming
//! - Implementations: in-process (`memory`), RabbitMQ (`amqp`)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::TransportError;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::MemoryBroker;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Events
// ============================================================================

/// Close/error notification from the broker side of a session.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is gone. Carries the error if it closed because of one.
    ConnectionClosed(Option<TransportError>),
    /// The connection hit an error; a `ConnectionClosed` follows.
    ConnectionError(TransportError),
    /// The channel is gone.
    ChannelClosed,
    /// The server rejected an operation on the channel; a `ChannelClosed` follows.
    ChannelError(TransportError),
}

/// Where a connection and its channels push their notifications.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// Options
// ============================================================================

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on exact routing-key equality.
    #[default]
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Routes on dotted patterns with `*` and `#` wildcards.
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

/// Connection-level options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Heartbeat interval in seconds. A dead connection errors and closes.
    pub heartbeat: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Only usable by the declaring connection, deleted when it closes.
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Message survives broker restarts.
    pub persistent: bool,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker won't expect acknowledgements.
    pub no_ack: bool,
    /// Tag the broker uses to distinguish deliveries. Generated when `None`.
    pub consumer_tag: Option<String>,
}

// ============================================================================
// Deliveries
// ============================================================================

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// One inbound message.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped identifier used to ack or nack this delivery.
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Bytes,
}

/// Item of a consumer's stream.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Delivery(Delivery),
    /// The consumer was cancelled and nothing follows. Sent when the broker
    /// cancels on its own (queue deleted, node failover, ...); a transport
    /// that can't tell that apart from a local `cancel` may send it then
    /// too. Never sent because the channel went away.
    Cancelled,
}

impl ConsumerEvent {
    pub fn into_delivery(self) -> Option<Delivery> {
        match self {
            Self::Delivery(delivery) => Some(delivery),
            Self::Cancelled => None,
        }
    }
}

/// An active consumer on a queue.
///
/// The stream ends without a [`ConsumerEvent::Cancelled`] when the consumer
/// was cancelled locally or its channel went away.
pub struct Consumer {
    pub tag: String,
    pub deliveries: BoxStream<'static, ConsumerEvent>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection. Close/error notifications of the connection
    /// and of every channel opened on it are pushed into `events`.
    async fn open(
        &self,
        address: &str,
        options: &SocketOptions,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>>;
}

/// A transport-level session to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel in publisher-confirm mode.
    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A session multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Bound the number of unacknowledged deliveries on this channel (0 = no limit).
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn assert_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()>;

    /// Declare a queue, returning its name (server-generated when `name` is empty).
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Publish to an exchange and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<Confirmation>;

    /// Send straight to a queue and wait for the broker's confirmation.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<Confirmation>;

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<Consumer>;

    /// Stop deliveries for a consumer; returns once the broker confirmed.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery and requeue it.
    async fn nack(&self, delivery_tag: u64) -> Result<()>;

    /// Requeue every unacknowledged delivery on this channel.
    async fn recover(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
