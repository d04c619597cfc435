use std::sync::Arc;

use serde_json::json;
use streamline_ingest::contract::{ByteHandle, Metadata};
use streamline_ingest::error::{BoxError, IngestError};
use streamline_ingest::handle::MemoryHandle;
use streamline_ingest::kafka::{MockProducer, PublishKafka, PublishKafkaConfig, RequiredAcks};
use streamline_ingest::pubsub::{MockPubSubClient, PublishPubSub, PublishPubSubConfig};

fn kafka_config(acks: &str) -> PublishKafkaConfig {
    PublishKafkaConfig {
        bootstrap_servers: "broker-1:9092, broker-2:9092".into(),
        topic: "orders".into(),
        acks: acks.into(),
    }
}

fn pubsub_config(create_topic: bool) -> PublishPubSubConfig {
    PublishPubSubConfig {
        credentials: "token".into(),
        project: "proj".into(),
        topic: "orders".into(),
        create_topic,
        endpoint: None,
    }
}

async fn handle_with(contents: &[u8]) -> MemoryHandle {
    let handle = MemoryHandle::new();
    handle.write(contents).await.unwrap();
    handle
}

#[tokio::test]
async fn test_publish_kafka_records_partition_and_offset() {
    let mut producer = MockProducer::new();
    producer
        .expect_send()
        .withf(|topic, payload| topic == "orders" && payload == b"order-42")
        .times(1)
        .returning(|_, _| Ok((3, 1207)));
    let processor = PublishKafka::new(&kafka_config("all"), Arc::new(producer)).unwrap();
    let handle = handle_with(b"order-42").await;
    let mut metadata = Metadata::new();

    processor.execute(&mut metadata, &handle).await.unwrap();

    assert_eq!(metadata["PublishKafka.Topic"], json!("orders"));
    assert_eq!(metadata["PublishKafka.Partition"], json!(3));
    assert_eq!(metadata["PublishKafka.Offset"], json!(1207));
}

#[tokio::test]
async fn test_publish_kafka_send_failure_leaves_metadata_untouched() {
    let mut producer = MockProducer::new();
    producer
        .expect_send()
        .returning(|_, _| Err(BoxError::from("leader not available")));
    let processor = PublishKafka::new(&kafka_config("local"), Arc::new(producer)).unwrap();
    let handle = handle_with(b"x").await;
    let mut metadata = Metadata::new();

    let err = processor.execute(&mut metadata, &handle).await.unwrap_err();

    assert!(matches!(err, IngestError::Client(_)));
    assert!(metadata.is_empty());
}

#[test]
fn test_publish_kafka_config_validation() {
    let settings = kafka_config("ALL").validate().unwrap();
    assert_eq!(settings.acks, RequiredAcks::All);
    assert_eq!(settings.brokers, vec!["broker-1:9092", "broker-2:9092"]);
    assert_eq!(kafka_config("none").validate().unwrap().acks.as_setting(), "0");
    assert_eq!(kafka_config("local").validate().unwrap().acks.as_setting(), "1");

    let err = kafka_config("some").validate().unwrap_err();
    assert!(matches!(err, IngestError::Config(ref msg) if msg.contains("invalid acks value")));

    let mut missing_brokers = kafka_config("all");
    missing_brokers.bootstrap_servers = " , ".into();
    assert!(missing_brokers.validate().is_err());
}

#[tokio::test]
async fn test_publish_pubsub_creates_topic_and_publishes() {
    let mut client = MockPubSubClient::new();
    client.expect_topic_exists().returning(|_| Ok(false));
    client
        .expect_create_topic()
        .withf(|topic| topic == "orders")
        .times(1)
        .returning(|_| Ok(()));
    client
        .expect_publish()
        .withf(|topic, data| topic == "orders" && data == b"payload")
        .times(1)
        .returning(|_, _| Ok("m-1".to_string()));
    let processor = PublishPubSub::connect(pubsub_config(true), Arc::new(client))
        .await
        .unwrap();
    let handle = handle_with(b"payload").await;
    let mut metadata = Metadata::new();

    processor.execute(&mut metadata, &handle).await.unwrap();

    assert_eq!(metadata["PublishPubSub.Topic"], json!("orders"));
    assert_eq!(metadata["PublishPubSub.MessageID"], json!("m-1"));
}

#[tokio::test]
async fn test_publish_pubsub_missing_topic_fails_setup() {
    let mut client = MockPubSubClient::new();
    client.expect_topic_exists().returning(|_| Ok(false));
    client.expect_create_topic().never();

    let err = PublishPubSub::connect(pubsub_config(false), Arc::new(client))
        .await
        .err()
        .expect("missing topic is a setup error");
    assert!(matches!(err, IngestError::TopicMissing(ref topic) if topic == "orders"));
}
