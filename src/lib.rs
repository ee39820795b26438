//! amqp-ipc - publish/subscribe and work queues over AMQP
//!
//! Two delivery patterns built on one connection/channel lifecycle:
//!
//! - [`PubSub`]: publish to an exchange under a topic; every subscriber bound
//!   to that topic receives a copy
//! - [`WorkQueue`]: enqueue tasks on a durable queue; consumers share them and
//!   acknowledge each one after processing
//!
//! The broker is reached through the [`transport`] seam: [`AmqpTransport`]
//! (feature `amqp`) talks to RabbitMQ, [`MemoryBroker`] runs in process.
//!
//! [`AmqpTransport`]: transport::AmqpTransport
//! [`MemoryBroker`]: transport::MemoryBroker

pub mod barrier;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod pubsub;
pub mod transport;
pub mod utils;
pub mod work_queue;

pub use barrier::{BarrierError, CompletionBarrier};
pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, ClientOptions};
pub use error::{BoxError, ClientError, ClientEvent, CodecError, Result, TransportError};
pub use lifecycle::Lifecycle;
pub use pipeline::{MessageHandler, Subscription, SubscriptionState};
pub use pubsub::PubSub;
pub use work_queue::WorkQueue;
