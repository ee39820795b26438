//! Connection/channel lifecycle.
//!
//! A [`Lifecycle`] owns the one connection and the one confirm channel a
//! client uses. Close and error notifications from the transport are folded
//! through [`Link::apply`], an explicit state machine whose guards make late
//! or duplicate notifications no-ops, and surface to observers as
//! [`ClientEvent`]s.
//!
//! Cascade rules:
//! - connection closed: ignored once the connection reference is cleared,
//!   otherwise emits `Closed(reason)` and clears both references
//! - connection error: forwarded as `Errored`; the close follows separately
//! - channel closed: ignored once either reference is cleared, otherwise
//!   emits `Closed(None)`, clears both references and closes the connection
//! - channel error: forwarded as `Errored`

use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientEvent, Result};
use crate::transport::{BrokerChannel, BrokerConnection, Transport, TransportEvent};

/// Capacity of the notification fan-out.
const EVENT_CAPACITY: usize = 64;

/// References to the live connection/channel pair.
///
/// `generation` increases on every successful connect so notifications from a
/// previous connection can't tear down the current one.
#[derive(Default)]
pub(crate) struct Link {
    pub(crate) generation: u64,
    pub(crate) connection: Option<Arc<dyn BrokerConnection>>,
    pub(crate) channel: Option<Arc<dyn BrokerChannel>>,
}

/// Side effects of one state-machine step.
#[derive(Default)]
pub(crate) struct Transition {
    pub(crate) notify: Option<ClientEvent>,
    pub(crate) close_connection: Option<Arc<dyn BrokerConnection>>,
}

impl Transition {
    fn notify(event: ClientEvent) -> Self {
        Self {
            notify: Some(event),
            close_connection: None,
        }
    }
}

impl Link {
    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_some() && self.channel.is_some()
    }

    pub(crate) fn apply(&mut self, event: TransportEvent) -> Transition {
        match event {
            TransportEvent::ConnectionClosed(reason) => {
                if self.connection.is_none() {
                    return Transition::default();
                }
                self.connection = None;
                self.channel = None;
                Transition::notify(ClientEvent::Closed(reason.map(Arc::new)))
            }
            TransportEvent::ConnectionError(err) => {
                Transition::notify(ClientEvent::Errored(Arc::new(ClientError::Connection(err))))
            }
            TransportEvent::ChannelClosed => {
                if self.connection.is_none() || self.channel.is_none() {
                    return Transition::default();
                }
                self.channel = None;
                Transition {
                    notify: Some(ClientEvent::Closed(None)),
                    close_connection: self.connection.take(),
                }
            }
            TransportEvent::ChannelError(err) => {
                Transition::notify(ClientEvent::Errored(Arc::new(ClientError::Channel(err))))
            }
        }
    }
}

/// Owner of a client's connection and channel.
pub struct Lifecycle {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    link: Mutex<Link>,
    /// Held for the whole of `connect`, so concurrent calls open one connection.
    connecting: Mutex<()>,
    events: broadcast::Sender<ClientEvent>,
}

impl Lifecycle {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            config,
            link: Mutex::new(Link::default()),
            connecting: Mutex::new(()),
            events,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to `Closed`/`Errored` notifications.
    ///
    /// Only notifications emitted after this call are received.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_connected()
    }

    /// Open the connection and its confirm channel, then apply the prefetch limit.
    ///
    /// `address` overrides the configured url. Connecting an already
    /// connected lifecycle does nothing.
    pub async fn connect(self: &Arc<Self>, address: Option<&str>) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected().await {
            debug!("Already connected, ignoring connect");
            return Ok(());
        }

        let address = address.unwrap_or(&self.config.url);
        let (sink, notifications) = mpsc::unbounded_channel();

        let connection = self
            .transport
            .open(address, &self.config.socket, sink)
            .await
            .map_err(ClientError::Connection)?;

        let channel = match connection.open_confirm_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(ClientError::Connection(err));
            }
        };
        if let Err(err) = channel.set_prefetch(self.config.prefetch).await {
            let _ = connection.close().await;
            return Err(ClientError::Connection(err));
        }

        let generation = {
            let mut link = self.link.lock().await;
            link.generation += 1;
            link.connection = Some(connection);
            link.channel = Some(channel);
            link.generation
        };
        tokio::spawn(Self::watch(Arc::downgrade(self), generation, notifications));

        info!(
            address = %address,
            prefetch = self.config.prefetch,
            heartbeat = self.config.socket.heartbeat,
            "Connected to broker"
        );
        Ok(())
    }

    /// Tear down the channel and connection.
    ///
    /// Three best-effort steps: requeue unacknowledged deliveries, close the
    /// channel, close the connection. A step failing (typically because the
    /// broker already closed it) doesn't stop the next one.
    pub async fn close(&self) {
        // References are cleared before the broker is involved, so work racing
        // with close already sees a closed client and the broker's own
        // channel-close notification finds nothing to clear.
        let (connection, channel, transition) = {
            let mut link = self.link.lock().await;
            let connection = link.connection.clone();
            let channel = link.channel.clone();
            (connection, channel, link.apply(TransportEvent::ChannelClosed))
        };

        if let Some(channel) = &channel {
            if let Err(err) = channel.recover().await {
                debug!(error = %err, "Recover failed during close");
            }
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Channel close failed during close");
            }
        }

        if let Some(event) = transition.notify {
            self.emit(event);
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "Connection close failed during close");
            }
        }
    }

    /// The live channel.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.link
            .lock()
            .await
            .channel
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Acknowledge a delivery. A no-op in no-ack mode.
    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        if self.config.consume_options.no_ack {
            return Ok(());
        }
        self.channel()
            .await?
            .ack(delivery_tag)
            .await
            .map_err(ClientError::Channel)
    }

    /// Reject a delivery and requeue it. A no-op in no-ack mode.
    pub async fn nack(&self, delivery_tag: u64) -> Result<()> {
        if self.config.consume_options.no_ack {
            return Ok(());
        }
        self.channel()
            .await?
            .nack(delivery_tag)
            .await
            .map_err(ClientError::Channel)
    }

    /// Surface an asynchronous failure to observers.
    pub(crate) fn emit_error(&self, err: ClientError) {
        self.emit(ClientEvent::Errored(Arc::new(err)));
    }

    fn emit(&self, event: ClientEvent) {
        match &event {
            ClientEvent::Closed(Some(reason)) => info!(reason = %reason, "Client closed"),
            ClientEvent::Closed(None) => info!("Client closed"),
            ClientEvent::Errored(err) => error!(error = %err, "Client error"),
        }
        // No observers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn handle_event(&self, generation: u64, event: TransportEvent) {
        let transition = {
            let mut link = self.link.lock().await;
            if link.generation != generation {
                debug!(generation, ?event, "Ignoring notification from previous connection");
                return;
            }
            link.apply(event)
        };

        if let Some(event) = transition.notify {
            self.emit(event);
        }
        if let Some(connection) = transition.close_connection {
            tokio::spawn(async move {
                if let Err(err) = connection.close().await {
                    debug!(error = %err, "Connection close after channel close failed");
                }
            });
        }
    }

    async fn watch(
        lifecycle: Weak<Self>,
        generation: u64,
        mut notifications: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = notifications.recv().await {
            let Some(lifecycle) = lifecycle.upgrade() else {
                break;
            };
            lifecycle.handle_event(generation, event).await;
        }
    }
}
