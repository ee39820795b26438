//! In-process broker.
//!
//! Implements the transport traits entirely in memory: exchanges, bindings,
//! queues, consumers, per-channel delivery tags and unacknowledged-delivery
//! tracking with prefetch. Ideal for local development and testing without
//! a RabbitMQ server; several clients share one [`MemoryBroker`] to talk to
//! each other.
//!
//! Fault injection helpers (`set_reachable`, `set_nack_publishes`,
//! `cancel_consumers`, `fail_connections`, ...) let tests drive the failure
//! paths a real broker produces.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnection, Confirmation, ConsumeOptions, Consumer, ConsumerEvent,
    Delivery, EventSink, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, Result, SocketOptions,
    Transport, TransportEvent,
};
use crate::error::TransportError;

/// Name of the default exchange, which routes straight to the queue named by the routing key.
const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    routing_key: String,
    payload: Bytes,
    redelivered: bool,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<ConsumerEvent>,
}

impl ConsumerEntry {
    /// End the consumer's stream with a broker-side cancellation.
    fn cancel_remotely(self) {
        let _ = self.sender.send(ConsumerEvent::Cancelled);
    }
}

#[derive(Debug, Default)]
struct Queue {
    durable: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<Message>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: Message,
}

#[derive(Debug)]
struct ChannelEntry {
    connection: u64,
    prefetch: u16,
    last_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    events: EventSink,
    channels: Vec<u64>,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    nack_publishes: bool,
    next_id: u64,
    next_seq: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            nack_publishes: false,
            next_id: 0,
            next_seq: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
        }
    }
}

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules:
/// - Words are separated by dots
/// - "*" matches exactly one word
/// - "#" matches zero or more words
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn unknown_delivery_tag(tag: u64) -> TransportError {
    TransportError::server_closed(
        TransportError::PRECONDITION_FAILED,
        format!("PRECONDITION_FAILED - unknown delivery tag {}", tag),
    )
}

fn not_found(kind: &str, name: &str) -> TransportError {
    TransportError::server_closed(
        TransportError::NOT_FOUND,
        format!("NOT_FOUND - no {} '{}'", kind, name),
    )
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_channel(&self, channel: u64) -> Result<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    /// Close a channel because the server rejected an operation, returning the
    /// error for the caller. The channel reports the error, then closes.
    fn fail_channel(&mut self, channel: u64, error: impl Fn() -> TransportError) -> TransportError {
        self.close_channel(channel, Some(error()));
        error()
    }

    /// Queue names a routed message ends up in.
    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_string())
                    .into_iter()
                    .collect(),
            );
        }
        let exchange = self.exchanges.get(exchange)?;
        let mut targets: Vec<String> = Vec::new();
        for binding in &exchange.bindings {
            let matched = match exchange.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Some(targets)
    }

    /// Store a message in every target queue and hand it to consumers.
    fn enqueue(&mut self, targets: &[String], routing_key: &str, payload: &Bytes) {
        for name in targets {
            self.next_seq += 1;
            let message = Message {
                seq: self.next_seq,
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
                redelivered: false,
            };
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(message);
            }
            self.dispatch(name);
        }
    }

    /// Hand ready messages of a queue to consumers with spare capacity, round robin.
    fn dispatch(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    consumer.no_ack
                        || self
                            .channels
                            .get(&consumer.channel)
                            .is_some_and(ChannelEntry::has_capacity)
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            let consumer = &queue.consumers[idx];
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            };

            channel.last_delivery_tag += 1;
            let delivery_tag = channel.last_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                payload: message.payload.clone(),
            };

            if consumer.sender.send(ConsumerEvent::Delivery(delivery)).is_err() {
                // Receiver dropped without cancelling.
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    /// Put an unacknowledged message back at its original queue position.
    fn requeue(&mut self, unacked: Unacked) {
        let Some(queue) = self.queues.get_mut(&unacked.queue) else {
            return;
        };
        let mut message = unacked.message;
        message.redelivered = true;
        let position = queue
            .messages
            .iter()
            .position(|m| m.seq > message.seq)
            .unwrap_or(queue.messages.len());
        queue.messages.insert(position, message);
    }

    fn remove_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.queues.remove(name) else {
            return false;
        };
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != name);
        }
        queue
            .consumers
            .into_iter()
            .for_each(ConsumerEntry::cancel_remotely);
        true
    }

    fn close_channel(&mut self, id: u64, error: Option<TransportError>) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != id);
        }
        for (_, unacked) in channel.unacked {
            self.requeue(unacked);
        }

        if let Some(connection) = self.connections.get_mut(&channel.connection) {
            connection.channels.retain(|c| *c != id);
            if let Some(error) = error {
                let _ = connection.events.send(TransportEvent::ChannelError(error));
            }
            let _ = connection.events.send(TransportEvent::ChannelClosed);
        }

        self.dispatch_all();
        debug!(channel = id, "Channel closed");
        true
    }

    fn close_connection(&mut self, id: u64, reason: Option<&str>) -> bool {
        let Some(connection) = self.connections.get(&id) else {
            return false;
        };
        for channel in connection.channels.clone() {
            self.close_channel(channel, None);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        if let Some(connection) = self.connections.remove(&id) {
            let error = reason.map(|r| TransportError::Io(r.to_string()));
            if let Some(reason) = reason {
                let _ = connection
                    .events
                    .send(TransportEvent::ConnectionError(TransportError::Io(
                        reason.to_string(),
                    )));
            }
            let _ = connection.events.send(TransportEvent::ConnectionClosed(error));
        }

        debug!(connection = id, "Connection closed");
        true
    }
}

/// In-memory broker shared by any number of clients.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Negatively confirm every publish instead of routing it.
    pub async fn set_nack_publishes(&self, nack: bool) {
        self.state.lock().await.nack_publishes = nack;
    }

    /// Cancel every consumer of a queue from the broker side.
    ///
    /// Returns the number of consumers cancelled.
    pub async fn cancel_consumers(&self, queue: &str) -> usize {
        let mut state = self.state.lock().await;
        let consumers = state
            .queues
            .get_mut(queue)
            .map(|q| std::mem::take(&mut q.consumers))
            .unwrap_or_default();
        let cancelled = consumers.len();
        consumers.into_iter().for_each(ConsumerEntry::cancel_remotely);
        info!(queue = %queue, cancelled, "Cancelled consumers remotely");
        cancelled
    }

    /// Drop every open connection with an error, as a missed heartbeat would.
    pub async fn fail_connections(&self, reason: &str) {
        let mut state = self.state.lock().await;
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, Some(reason));
        }
    }

    /// Push a notification to every open connection without changing any state.
    pub async fn notify_connections(&self, event: impl Fn() -> TransportEvent) {
        let state = self.state.lock().await;
        for connection in state.connections.values() {
            let _ = connection.events.send(event());
        }
    }

    /// Route raw bytes through an exchange, bypassing any codec.
    ///
    /// Returns the number of queues the message reached.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> usize {
        let mut state = self.state.lock().await;
        let targets = state.route(exchange, routing_key).unwrap_or_default();
        state.enqueue(&targets, routing_key, &payload.into());
        targets.len()
    }

    /// Ready (undelivered) messages in a queue, `None` if it doesn't exist.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    /// Names of every existing queue, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    pub async fn queue_is_durable(&self, queue: &str) -> Option<bool> {
        self.state.lock().await.queues.get(queue).map(|q| q.durable)
    }

    pub async fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(exchange)
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries awaiting acknowledgement across all channels.
    pub async fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn open_channels(&self) -> usize {
        self.state.lock().await.channels.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(
        &self,
        address: &str,
        options: &SocketOptions,
        events: EventSink,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(TransportError::Unreachable {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                events,
                channels: Vec::new(),
            },
        );
        debug!(
            connection = id,
            address = %address,
            heartbeat = options.heartbeat,
            "Opened in-memory connection"
        );

        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::ConnectionClosed);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
                last_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(id);
        }

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.state.lock().await.close_connection(self.id, None) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

/// Channel on a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        channel.prefetch = count;
        state.dispatch_all();
        Ok(())
    }

    async fn assert_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;
        state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind: options.kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let owner = options.exclusive.then_some(self.connection);
        state.queues.entry(name.clone()).or_insert_with(|| Queue {
            durable: options.durable,
            exclusive_owner: owner,
            ..Default::default()
        });
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(state.fail_channel(self.id, || not_found("queue", queue)));
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            return Err(state.fail_channel(self.id, || not_found("exchange", exchange)));
        };
        let exists = target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;
        state.exchanges.remove(name);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;
        state.remove_queue(name);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        _options: &PublishOptions,
    ) -> Result<Confirmation> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        if state.nack_publishes {
            return Ok(Confirmation::Nack);
        }
        let Some(targets) = state.route(exchange, routing_key) else {
            return Err(state.fail_channel(self.id, || not_found("exchange", exchange)));
        };
        state.enqueue(&targets, routing_key, &payload);
        Ok(Confirmation::Ack)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<Confirmation> {
        self.publish(DEFAULT_EXCHANGE, queue, payload, options).await
    }

    async fn consume(&self, queue: &str, options: &ConsumeOptions) -> Result<Consumer> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("amq.ctag-{}", uuid::Uuid::new_v4().simple()));
        let (sender, receiver) = mpsc::unbounded_channel();

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(state.fail_channel(self.id, || not_found("queue", queue)));
        };
        target.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel: self.id,
            no_ack: options.no_ack,
            sender,
        });
        state.dispatch(queue);

        Ok(Consumer {
            tag,
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
        }
        state.dispatch_all();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        if channel.unacked.remove(&delivery_tag).is_none() {
            return Err(state.fail_channel(self.id, || unknown_delivery_tag(delivery_tag)));
        }
        state.dispatch_all();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        let Some(unacked) = channel.unacked.remove(&delivery_tag) else {
            return Err(state.fail_channel(self.id, || unknown_delivery_tag(delivery_tag)));
        };
        state.requeue(unacked);
        state.dispatch_all();
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        let unacked = std::mem::take(&mut channel.unacked);
        for (_, entry) in unacked {
            state.requeue(entry);
        }
        state.dispatch_all();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.state.lock().await.close_channel(self.id, None) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}
