//! Client configuration.
//!
//! Configuration is layered in three tiers, each a [`ClientOptions`] where
//! every field is optional. Later tiers override earlier ones field by field:
//!
//! 1. [`ClientOptions::base`]: connection defaults shared by every client
//! 2. pattern defaults ([`ClientOptions::pubsub`], [`ClientOptions::work_queue`])
//! 3. caller-supplied options
//!
//! [`ClientConfig::resolve`] folds the tiers into a fully specified config.

use serde::Deserialize;

use crate::transport::{
    ConsumeOptions, ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, SocketOptions,
};

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "AMQP_IPC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "AMQP_IPC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "AMQP_IPC_LOG";

/// Default broker address.
pub const DEFAULT_URL: &str = "amqp://localhost:5672";
/// Default number of unacknowledged deliveries in flight per channel.
pub const DEFAULT_PREFETCH: u16 = 1;
/// Default heartbeat in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u16 = 30;
/// Default exchange for publish/subscribe.
pub const DEFAULT_EXCHANGE: &str = "pubsub";
/// Default queue for work distribution.
pub const DEFAULT_QUEUE: &str = "workqueue";

/// Socket overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketOverrides {
    pub heartbeat: Option<u16>,
}

/// Exchange declaration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOverrides {
    pub durable: Option<bool>,
    pub kind: Option<ExchangeKind>,
}

/// Queue declaration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOverrides {
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
}

/// Publish overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublishOverrides {
    pub persistent: Option<bool>,
}

/// Consume overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumeOverrides {
    pub no_ack: Option<bool>,
    pub consumer_tag: Option<String>,
}

/// One configuration tier. Unset fields defer to lower tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Broker URL.
    pub url: Option<String>,
    /// Unacknowledged deliveries allowed in flight on the channel. 0 means no limit.
    pub prefetch: Option<u16>,
    pub socket: SocketOverrides,
    /// Exchange used by publish/subscribe.
    pub exchange: Option<String>,
    /// Queue used by work distribution.
    pub queue: Option<String>,
    pub exchange_options: ExchangeOverrides,
    pub queue_options: QueueOverrides,
    pub publish_options: PublishOverrides,
    pub consume_options: ConsumeOverrides,
}

impl ClientOptions {
    /// Defaults shared by every client.
    pub fn base() -> Self {
        Self {
            url: Some(DEFAULT_URL.to_string()),
            prefetch: Some(DEFAULT_PREFETCH),
            socket: SocketOverrides {
                heartbeat: Some(DEFAULT_HEARTBEAT_SECS),
            },
            consume_options: ConsumeOverrides {
                no_ack: Some(false),
                consumer_tag: None,
            },
            ..Default::default()
        }
    }

    /// Publish/subscribe defaults: ephemeral topology, fire-and-forget delivery.
    pub fn pubsub() -> Self {
        Self {
            exchange: Some(DEFAULT_EXCHANGE.to_string()),
            exchange_options: ExchangeOverrides {
                durable: Some(false),
                kind: Some(ExchangeKind::Direct),
            },
            queue_options: QueueOverrides {
                durable: Some(false),
                exclusive: Some(true),
            },
            publish_options: PublishOverrides {
                persistent: Some(false),
            },
            consume_options: ConsumeOverrides {
                no_ack: Some(true),
                consumer_tag: None,
            },
            ..Default::default()
        }
    }

    /// Work-queue defaults: durable queue, persistent tasks, acknowledgements required.
    pub fn work_queue() -> Self {
        Self {
            queue: Some(DEFAULT_QUEUE.to_string()),
            queue_options: QueueOverrides {
                durable: Some(true),
                exclusive: Some(false),
            },
            publish_options: PublishOverrides {
                persistent: Some(true),
            },
            consume_options: ConsumeOverrides {
                no_ack: Some(false),
                consumer_tag: None,
            },
            ..Default::default()
        }
    }

    /// Load caller options from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. File specified by `path` argument (if provided)
    /// 2. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 3. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `AMQP_IPC__PREFETCH=3` or `AMQP_IPC__CONSUME_OPTIONS__NO_ACK=false`
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder();

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Overlay `higher` on top of `self`; fields set in `higher` win.
    pub fn merge(self, higher: &ClientOptions) -> Self {
        let higher = higher.clone();
        Self {
            url: higher.url.or(self.url),
            prefetch: higher.prefetch.or(self.prefetch),
            socket: SocketOverrides {
                heartbeat: higher.socket.heartbeat.or(self.socket.heartbeat),
            },
            exchange: higher.exchange.or(self.exchange),
            queue: higher.queue.or(self.queue),
            exchange_options: ExchangeOverrides {
                durable: higher.exchange_options.durable.or(self.exchange_options.durable),
                kind: higher.exchange_options.kind.or(self.exchange_options.kind),
            },
            queue_options: QueueOverrides {
                durable: higher.queue_options.durable.or(self.queue_options.durable),
                exclusive: higher.queue_options.exclusive.or(self.queue_options.exclusive),
            },
            publish_options: PublishOverrides {
                persistent: higher
                    .publish_options
                    .persistent
                    .or(self.publish_options.persistent),
            },
            consume_options: ConsumeOverrides {
                no_ack: higher.consume_options.no_ack.or(self.consume_options.no_ack),
                consumer_tag: higher
                    .consume_options
                    .consumer_tag
                    .or(self.consume_options.consumer_tag),
            },
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.consume_options.no_ack = Some(no_ack);
        self
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: String,
    pub prefetch: u16,
    pub socket: SocketOptions,
    pub exchange: String,
    pub queue: String,
    pub exchange_options: ExchangeOptions,
    pub queue_options: QueueOptions,
    pub publish_options: PublishOptions,
    pub consume_options: ConsumeOptions,
}

impl ClientConfig {
    /// Fold configuration tiers, lowest precedence first.
    ///
    /// Fields no tier sets fall back to the base defaults.
    pub fn resolve(tiers: &[&ClientOptions]) -> Self {
        let merged = tiers
            .iter()
            .fold(ClientOptions::base(), |acc, tier| acc.merge(tier));

        Self {
            url: merged.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            prefetch: merged.prefetch.unwrap_or(DEFAULT_PREFETCH),
            socket: SocketOptions {
                heartbeat: merged.socket.heartbeat.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            },
            exchange: merged.exchange.unwrap_or_default(),
            queue: merged.queue.unwrap_or_default(),
            exchange_options: ExchangeOptions {
                durable: merged.exchange_options.durable.unwrap_or(false),
                kind: merged.exchange_options.kind.unwrap_or_default(),
            },
            queue_options: QueueOptions {
                durable: merged.queue_options.durable.unwrap_or(false),
                exclusive: merged.queue_options.exclusive.unwrap_or(false),
            },
            publish_options: PublishOptions {
                persistent: merged.publish_options.persistent.unwrap_or(false),
                content_type: None,
            },
            consume_options: ConsumeOptions {
                no_ack: merged.consume_options.no_ack.unwrap_or(false),
                consumer_tag: merged.consume_options.consumer_tag,
            },
        }
    }

    /// Base tier overlaid with caller options.
    pub fn client(options: &ClientOptions) -> Self {
        Self::resolve(&[options])
    }

    /// Publish/subscribe defaults overlaid with caller options.
    pub fn pubsub(options: &ClientOptions) -> Self {
        Self::resolve(&[&ClientOptions::pubsub(), options])
    }

    /// Work-queue defaults overlaid with caller options.
    pub fn work_queue(options: &ClientOptions) -> Self {
        Self::resolve(&[&ClientOptions::work_queue(), options])
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::client(&ClientOptions::default())
    }
}

#[cfg(test)]
mod tests;
