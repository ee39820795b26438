//! Connection lifecycle as seen through a router.

mod common;

use std::sync::Arc;

use amqp_ipc::transport::{MemoryBroker, TransportEvent};
use amqp_ipc::{ClientError, ClientEvent, ClientOptions, TransportError, WorkQueue};

use common::{assert_no_event, eventually, next_event};

fn work_queue(broker: &MemoryBroker) -> WorkQueue {
    WorkQueue::new(
        Arc::new(broker.clone()),
        ClientOptions::default().with_queue("ipc-client-test"),
    )
}

#[tokio::test]
async fn test_connect_fails_when_broker_unreachable() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false).await;
    let client = work_queue(&broker);

    let result = client
        .connect(Some("amqp://nowaythisexistsamiright:12345"))
        .await;

    match result {
        Err(ClientError::Connection(TransportError::Unreachable { address, .. })) => {
            assert_eq!(address, "amqp://nowaythisexistsamiright:12345")
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(broker.open_connections().await, 0);
}

#[tokio::test]
async fn test_close_tears_down_connection_and_channel() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    client.connect(None).await.unwrap();
    assert_eq!(broker.open_connections().await, 1);
    assert_eq!(broker.open_channels().await, 1);

    client.close().await;

    assert!(!client.lifecycle().is_connected().await);
    assert_eq!(broker.open_connections().await, 0);
    assert_eq!(broker.open_channels().await, 0);
}

#[tokio::test]
async fn test_close_emits_closed_without_error() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    client.close().await;

    assert!(matches!(next_event(&mut events).await, ClientEvent::Closed(None)));
}

#[tokio::test]
async fn test_closing_twice_emits_once() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    client.close().await;
    assert!(next_event(&mut events).await.is_closed());
    client.close().await;

    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_server_rejection_emits_error_and_closes() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    // Unknown delivery tag: the server closes the channel.
    assert!(client.ack(1).await.is_err());

    assert!(matches!(
        next_event(&mut events).await.error(),
        Some(ClientError::Channel(TransportError::ServerClosed { code: 406, .. }))
    ));
    assert!(matches!(next_event(&mut events).await, ClientEvent::Closed(None)));
    assert!(!client.lifecycle().is_connected().await);
    eventually(|| async { broker.open_connections().await == 0 }).await;
}

#[tokio::test]
async fn test_connection_close_reason_is_forwarded() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    broker
        .notify_connections(|| {
            TransportEvent::ConnectionClosed(Some(TransportError::Io(
                "something went wrong!".into(),
            )))
        })
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Closed(Some(ref err)) if matches!(**err, TransportError::Io(_))
    ));
}

#[tokio::test]
async fn test_connection_error_is_forwarded() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    broker
        .notify_connections(|| {
            TransportEvent::ConnectionError(TransportError::Io("something went wrong!".into()))
        })
        .await;

    assert!(matches!(
        next_event(&mut events).await.error(),
        Some(ClientError::Connection(_))
    ));
    // An error alone doesn't tear anything down.
    assert!(client.lifecycle().is_connected().await);
    client.close().await;
}

#[tokio::test]
async fn test_dead_connection_surfaces_error_and_close() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    let mut events = client.events();
    client.connect(None).await.unwrap();

    broker.fail_connections("missed heartbeats").await;

    let mut closed = 0;
    let mut errored = 0;
    for _ in 0..2 {
        match next_event(&mut events).await {
            ClientEvent::Closed(_) => closed += 1,
            ClientEvent::Errored(_) => errored += 1,
        }
    }
    assert_eq!((closed, errored), (1, 1));
    assert_no_event(&mut events).await;
    assert!(!client.lifecycle().is_connected().await);
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let broker = MemoryBroker::new();
    let client = work_queue(&broker);
    client.connect(None).await.unwrap();
    client.close().await;

    client.connect(None).await.unwrap();

    assert!(client.lifecycle().is_connected().await);
    client.enqueue(&1u32).await.unwrap();
    assert_eq!(broker.queue_depth("ipc-client-test").await, Some(1));
    client.close().await;
}
