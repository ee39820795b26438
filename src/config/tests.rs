use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_client_config_default() {
    let config = ClientConfig::default();
    assert_eq!(config.url, "amqp://localhost:5672");
    assert_eq!(config.prefetch, 1);
    assert_eq!(config.socket.heartbeat, 30);
    assert!(!config.consume_options.no_ack);
}

#[test]
fn test_pubsub_defaults() {
    let config = ClientConfig::pubsub(&ClientOptions::default());
    assert_eq!(config.exchange, "pubsub");
    assert_eq!(config.exchange_options.kind, ExchangeKind::Direct);
    assert!(!config.exchange_options.durable);
    assert!(config.queue_options.exclusive);
    assert!(!config.publish_options.persistent);
    assert!(config.consume_options.no_ack);
}

#[test]
fn test_work_queue_defaults() {
    let config = ClientConfig::work_queue(&ClientOptions::default());
    assert_eq!(config.queue, "workqueue");
    assert!(config.queue_options.durable);
    assert!(!config.queue_options.exclusive);
    assert!(config.publish_options.persistent);
    assert!(!config.consume_options.no_ack);
}

#[test]
fn test_caller_options_win_over_pattern_defaults() {
    let options = ClientOptions::default()
        .with_exchange("ipc-test")
        .with_prefetch(3)
        .with_no_ack(false);

    let config = ClientConfig::pubsub(&options);

    assert_eq!(config.exchange, "ipc-test");
    assert_eq!(config.prefetch, 3);
    assert!(!config.consume_options.no_ack);
    // Untouched pattern defaults survive.
    assert!(config.queue_options.exclusive);
}

#[test]
fn test_merge_is_field_level() {
    // Overriding one queue option keeps the pattern's other queue options.
    let options = ClientOptions {
        queue_options: QueueOverrides {
            exclusive: Some(true),
            durable: None,
        },
        ..Default::default()
    };

    let config = ClientConfig::work_queue(&options);

    assert!(config.queue_options.exclusive);
    assert!(config.queue_options.durable);
}

#[test]
fn test_later_tiers_override_earlier() {
    let low = ClientOptions::default().with_queue("low").with_prefetch(2);
    let high = ClientOptions::default().with_queue("high");

    let config = ClientConfig::resolve(&[&low, &high]);

    assert_eq!(config.queue, "high");
    assert_eq!(config.prefetch, 2);
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "url: amqp://broker:5672\nprefetch: 5\nexchange_options:\n  kind: fanout\nconsume_options:\n  no_ack: false\n"
    )
    .unwrap();

    let options = ClientOptions::load(file.path().to_str()).unwrap();

    assert_eq!(options.url.as_deref(), Some("amqp://broker:5672"));
    assert_eq!(options.prefetch, Some(5));
    assert_eq!(options.exchange_options.kind, Some(ExchangeKind::Fanout));
    assert_eq!(options.consume_options.no_ack, Some(false));
    assert_eq!(options.queue, None);
}

#[test]
#[serial]
fn test_load_from_environment() {
    std::env::set_var("AMQP_IPC__PREFETCH", "7");
    std::env::set_var("AMQP_IPC__QUEUE", "tasks");

    let options = ClientOptions::load(None);

    std::env::remove_var("AMQP_IPC__PREFETCH");
    std::env::remove_var("AMQP_IPC__QUEUE");

    let options = options.unwrap();
    assert_eq!(options.prefetch, Some(7));
    assert_eq!(options.queue.as_deref(), Some("tasks"));
}

#[test]
#[serial]
fn test_load_missing_file_fails() {
    let result = ClientOptions::load(Some("/nonexistent/amqp-ipc.yaml"));
    assert!(result.is_err());
}
