//! AMQP/RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

mod common;

use std::sync::Arc;
use std::time::Duration;

use amqp_ipc::transport::AmqpTransport;
use amqp_ipc::{
    ClientConfig, ClientEvent, ClientOptions, CompletionBarrier, Lifecycle, PubSub, WorkQueue,
};
use serde_json::{json, Value};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use common::{next_event, settled, Recorder};

const AMQP_PORT: u16 = 5672;

/// How long the broker gets to accept connections after its startup log line.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// A RabbitMQ container that lives as long as the test holds it.
struct RabbitMq {
    _container: ContainerAsync<GenericImage>,
    url: String,
}

impl RabbitMq {
    async fn start() -> Self {
        let container = GenericImage::new("rabbitmq", "3-management")
            .with_exposed_port(AMQP_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete"))
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start rabbitmq container");

        let host = container.get_host().await.expect("Failed to get container host");
        let port = container
            .get_host_port_ipv4(AMQP_PORT)
            .await
            .expect("Failed to get mapped port");
        let url = format!("amqp://guest:guest@{}:{}", host, port);

        wait_until_accepting(&url).await;
        println!("RabbitMQ available at: {}", url);

        Self {
            _container: container,
            url,
        }
    }

    fn options(&self) -> ClientOptions {
        ClientOptions::default().with_url(&self.url)
    }
}

/// The startup log line can precede the AMQP listener; poll until a client
/// gets through.
async fn wait_until_accepting(url: &str) {
    let config = ClientConfig::client(&ClientOptions::default().with_url(url));
    tokio::time::timeout(READY_TIMEOUT, async {
        loop {
            let lifecycle = Arc::new(Lifecycle::new(transport(), config.clone()));
            if lifecycle.connect(None).await.is_ok() {
                lifecycle.close().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("RabbitMQ never accepted connections");
}

fn transport() -> Arc<AmqpTransport> {
    Arc::new(AmqpTransport::new())
}

#[tokio::test]
async fn test_pubsub_round_trip() {
    println!("=== AMQP Pub/Sub Test ===");

    let rabbitmq = RabbitMq::start().await;
    let options = rabbitmq
        .options()
        .with_exchange(format!("ipc-test-{}", uuid::Uuid::new_v4()));

    let publisher = PubSub::new(transport(), options.clone());
    let subscriber = PubSub::new(transport(), options);
    publisher.connect(None).await.expect("Failed to connect publisher");
    subscriber.connect(None).await.expect("Failed to connect subscriber");

    let barrier: CompletionBarrier<Value, String> = CompletionBarrier::new(1);
    let handle = barrier.clone();
    subscriber
        .subscribe("testtopic", move |message: Value| {
            let _ = handle.resolve(message);
            async move { Ok(()) }
        })
        .await
        .expect("Failed to subscribe");

    let message = json!({ "Test": 123, "TestTest": "123", "t": [{ "a": "b" }] });
    publisher
        .publish("testtopic", &message)
        .await
        .expect("Failed to publish");

    assert_eq!(settled(&barrier).await, vec![message]);

    publisher.close().await;
    subscriber.delete().await.expect("Failed to delete exchange");
    subscriber.close().await;

    println!("=== AMQP Pub/Sub Test PASSED ===");
}

#[tokio::test]
async fn test_work_queue_redelivers_failed_task() {
    println!("=== AMQP Work Queue Redelivery Test ===");

    let rabbitmq = RabbitMq::start().await;
    let options = rabbitmq
        .options()
        .with_queue(format!("ipc-test-{}", uuid::Uuid::new_v4()));

    let producer = WorkQueue::new(transport(), options.clone());
    let consumer = WorkQueue::new(transport(), options);
    producer.connect(None).await.expect("Failed to connect producer");
    consumer.connect(None).await.expect("Failed to connect consumer");
    let mut events = consumer.events();

    let barrier: CompletionBarrier<(), String> = CompletionBarrier::new(2);
    let attempts = Recorder::new();
    let (record, handle) = (attempts.clone(), barrier.clone());
    consumer
        .consume(move |n: u32| {
            let first = record.push(n) == 1;
            let _ = handle.resolve(());
            async move {
                if first {
                    return Err("first attempt fails".into());
                }
                Ok(())
            }
        })
        .await
        .expect("Failed to consume");

    producer.enqueue(&7u32).await.expect("Failed to enqueue");

    settled(&barrier).await;
    assert_eq!(attempts.snapshot(), vec![7, 7]);
    assert!(next_event(&mut events).await.error().is_some());

    producer.close().await;
    consumer.delete().await.expect("Failed to delete queue");
    consumer.close().await;

    println!("=== AMQP Work Queue Redelivery Test PASSED ===");
}

#[tokio::test]
async fn test_close_emits_closed() {
    println!("=== AMQP Close Test ===");

    let rabbitmq = RabbitMq::start().await;
    let client = WorkQueue::new(
        transport(),
        rabbitmq
            .options()
            .with_queue(format!("ipc-test-{}", uuid::Uuid::new_v4())),
    );
    let mut events = client.events();
    client.connect(None).await.expect("Failed to connect");

    client.close().await;

    assert!(matches!(next_event(&mut events).await, ClientEvent::Closed(None)));
    assert!(!client.lifecycle().is_connected().await);

    println!("=== AMQP Close Test PASSED ===");
}
