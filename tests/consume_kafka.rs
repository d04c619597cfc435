use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use streamline_ingest::contract::{
    ByteHandle, CompletionNotice, CompletionNotifier, CorrelationToken, HandleFactory,
    MockByteHandle, ScheduleType, TriggerAdapter,
};
use streamline_ingest::error::{BoxError, IngestError};
use streamline_ingest::handle::MemoryHandleFactory;
use streamline_ingest::kafka::{
    BrokerMessage, ClaimSession, ConsumeKafka, ConsumeKafkaConfig, InitialOffset,
    MockConsumerGroup, ProtocolVersion, DEFAULT_PROTOCOL_VERSION,
};

/// Claim session replaying a fixed list of messages and recording marks.
struct ScriptedSession {
    messages: VecDeque<Result<BrokerMessage, String>>,
    marked: Arc<Mutex<Vec<i64>>>,
    hang_when_empty: bool,
}

#[async_trait]
impl ClaimSession for ScriptedSession {
    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BoxError>> {
        match self.messages.pop_front() {
            Some(next) => Some(next.map_err(BoxError::from)),
            None if self.hang_when_empty => {
                std::future::pending::<()>().await;
                None
            }
            None => None,
        }
    }

    fn mark_message(&mut self, message: &BrokerMessage) -> Result<(), BoxError> {
        self.marked.lock().unwrap().push(message.offset);
        Ok(())
    }
}

fn message(topic: &str, offset: i64, value: &[u8]) -> BrokerMessage {
    BrokerMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: None,
        value: value.to_vec(),
    }
}

fn config(topics: &str, group: &str) -> ConsumeKafkaConfig {
    ConsumeKafkaConfig {
        topic_names: topics.to_string(),
        bootstrap_servers: "localhost:9092".to_string(),
        consumer_group: group.to_string(),
        ..Default::default()
    }
}

fn group_with(
    script: Vec<Result<BrokerMessage, String>>,
    hang_when_empty: bool,
) -> (MockConsumerGroup, Arc<Mutex<Vec<i64>>>) {
    let marked = Arc::new(Mutex::new(Vec::new()));
    let mut group = MockConsumerGroup::new();
    let session_marks = Arc::clone(&marked);
    group
        .expect_join()
        .withf(|topics| topics.to_vec() == vec!["a".to_string(), "b".to_string()])
        .times(1)
        .returning(move |_| {
            Ok(Box::new(ScriptedSession {
                messages: script.clone().into(),
                marked: Arc::clone(&session_marks),
                hang_when_empty,
            }) as Box<dyn ClaimSession>)
        });
    (group, marked)
}

#[tokio::test]
async fn test_three_messages_become_three_marked_units() {
    let script = vec![
        Ok(message("a", 10, b"ten")),
        Ok(message("a", 11, b"eleven")),
        Ok(message("a", 12, b"twelve")),
    ];
    let (group, marked) = group_with(script, false);
    let adapter = ConsumeKafka::new(&config("a,b", "g1"), Arc::new(group)).expect("valid config");
    let factory = MemoryHandleFactory::new();

    let units = adapter.execute(&factory).await.expect("session drains");

    assert_eq!(units.len(), 3);
    for (unit, offset) in units.iter().zip([10i64, 11, 12]) {
        assert_eq!(unit.metadata["ConsumeKafka.Topic"], json!("a"));
        assert_eq!(unit.metadata["ConsumeKafka.Partition"], json!(0));
        assert_eq!(unit.metadata["ConsumeKafka.Offset"], json!(offset));
        assert!(unit.token.is_none(), "broker units are acknowledged at delivery");
    }
    assert_eq!(*marked.lock().unwrap(), vec![10, 11, 12]);

    let payloads: Vec<Vec<u8>> = factory.produced().iter().map(|h| h.contents()).collect();
    assert_eq!(
        payloads,
        vec![b"ten".to_vec(), b"eleven".to_vec(), b"twelve".to_vec()]
    );
}

#[tokio::test]
async fn test_write_failure_aborts_session_without_marking() {
    let script = vec![Ok(message("a", 10, b"ok")), Ok(message("a", 11, b"broken"))];
    let (group, marked) = group_with(script, false);
    let adapter = ConsumeKafka::new(&config("a,b", "g1"), Arc::new(group)).unwrap();

    let produced = Mutex::new(0usize);
    let factory = || -> Box<dyn ByteHandle> {
        let mut count = produced.lock().unwrap();
        *count += 1;
        let mut handle = MockByteHandle::new();
        if *count == 2 {
            handle
                .expect_write()
                .returning(|_| Err(io::Error::new(io::ErrorKind::StorageFull, "disk full")));
        } else {
            handle.expect_write().returning(|_| Ok(()));
        }
        Box::new(handle)
    };

    let err = adapter
        .execute(&factory as &dyn HandleFactory)
        .await
        .expect_err("write failure must abort");
    match err {
        IngestError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::StorageFull),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(*marked.lock().unwrap(), vec![10]);
}

#[tokio::test]
async fn test_session_error_is_fatal() {
    let script = vec![Ok(message("a", 10, b"ok")), Err("rebalance failed".to_string())];
    let (group, _marked) = group_with(script, false);
    let adapter = ConsumeKafka::new(&config("a,b", "g1"), Arc::new(group)).unwrap();

    let err = adapter
        .execute(&MemoryHandleFactory::new())
        .await
        .expect_err("session error surfaces");
    assert!(matches!(err, IngestError::Session { source_name: "ConsumeKafka", .. }));
    assert!(err.to_string().contains("rebalance failed"));
}

#[tokio::test]
async fn test_close_unblocks_pending_execute_and_keeps_produced_units() {
    let (mut group, marked) = group_with(vec![Ok(message("a", 10, b"first"))], true);
    group.expect_close().times(1).returning(|| Ok(()));
    let adapter = Arc::new(ConsumeKafka::new(&config("a,b", "g1"), Arc::new(group)).unwrap());

    let running = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.execute(&MemoryHandleFactory::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.close().await.expect("close succeeds");

    let units = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("execute returns after close")
        .unwrap()
        .unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(*marked.lock().unwrap(), vec![10]);

    let after_close = adapter.execute(&MemoryHandleFactory::new()).await.unwrap();
    assert!(after_close.is_empty());
}

#[tokio::test]
async fn test_completion_notices_are_ignored() {
    let group = MockConsumerGroup::new();
    let adapter = ConsumeKafka::new(&config("a,b", "g1"), Arc::new(group)).unwrap();
    assert_eq!(adapter.schedule_type(), ScheduleType::EventDriven);
    assert_eq!(adapter.name(), "ConsumeKafka");
    adapter.notify_completion(CompletionNotice::succeeded(CorrelationToken::new()));
    adapter.notify_completion(CompletionNotice::failed(CorrelationToken::new(), "boom"));
}

#[test]
fn test_config_validation_rejects_missing_fields() {
    let mut missing_group = config("a", "");
    missing_group.consumer_group = "  ".into();
    assert!(matches!(missing_group.validate(), Err(IngestError::Config(_))));

    let mut missing_servers = config("a", "g1");
    missing_servers.bootstrap_servers = String::new();
    assert!(matches!(missing_servers.validate(), Err(IngestError::Config(_))));

    let no_topics = config(" , ", "g1");
    assert!(matches!(no_topics.validate(), Err(IngestError::Config(_))));

    let mut bad_version = config("a", "g1");
    bad_version.kafka_version = Some("two.one".into());
    assert!(matches!(bad_version.validate(), Err(IngestError::InvalidVersion(_))));
}

#[test]
fn test_config_defaults_and_list_trimming() {
    let mut raw = config(" a , b ,, ", "g1");
    raw.bootstrap_servers = "k1:9092, k2:9092".into();
    let settings = raw.validate().expect("valid");

    assert_eq!(settings.topics, vec!["a", "b"]);
    assert_eq!(settings.brokers, vec!["k1:9092", "k2:9092"]);
    assert_eq!(settings.version, DEFAULT_PROTOCOL_VERSION);
    assert_eq!(settings.initial_offset, InitialOffset::Newest);

    raw.kafka_version = Some("3.6.1".into());
    raw.start_from_oldest = true;
    let settings = raw.validate().unwrap();
    assert_eq!(settings.version, "3.6.1".parse::<ProtocolVersion>().unwrap());
    assert_eq!(settings.version.to_string(), "3.6.1");
    assert_eq!(settings.initial_offset, InitialOffset::Oldest);
}
