use std::env;
use std::fs::write;
use std::path::PathBuf;

use serial_test::serial;
use streamline_ingest::load_config::{
    load_config, parse_config, AdapterConfig, PublishConfig, PUBSUB_CREDENTIALS_ENV,
};
use streamline_ingest::upload::SendFileType;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

/// Credentials are left out of the file and injected from the environment.
#[tokio::test]
#[serial]
async fn test_load_config_injects_pubsub_credentials_from_env() {
    let file = config_file(
        r#"
adapter:
  type: pubsub
  project: proj
  topic: orders
  subscription_name: orders-sub
  create_topic: true
  max_messages: 50
"#,
    );
    env::set_var(PUBSUB_CREDENTIALS_ENV, "env-token");

    let config = load_config(file.path()).expect("Config should load");
    env::remove_var(PUBSUB_CREDENTIALS_ENV);

    let Some(AdapterConfig::Pubsub(pubsub)) = config.adapter else {
        panic!("expected pubsub adapter");
    };
    assert_eq!(pubsub.credentials, "env-token");
    assert_eq!(pubsub.project, "proj");
    assert!(pubsub.create_topic);
    assert!(!pubsub.ack_immediately, "deferred acknowledgment is the default");
    assert_eq!(pubsub.max_messages, Some(50));
    assert!(config.upload.is_none());
}

#[tokio::test]
#[serial]
async fn test_load_config_keeps_file_credentials_without_env() {
    let file = config_file(
        r#"
adapter:
  type: pubsub
  credentials: file-token
  project: proj
  topic: orders
  subscription_name: orders-sub
"#,
    );
    env::remove_var(PUBSUB_CREDENTIALS_ENV);

    let config = load_config(file.path()).unwrap();
    match config.adapter {
        Some(AdapterConfig::Pubsub(pubsub)) => assert_eq!(pubsub.credentials, "file-token"),
        other => panic!("unexpected adapter: {other:?}"),
    }
}

#[test]
fn test_parse_kafka_read_dir_and_upload_sections() {
    let kafka = parse_config(
        r#"
adapter:
  type: kafka
  topic_names: "a,b"
  bootstrap_servers: "localhost:9092"
  consumer_group: g1
  start_from_oldest: true
upload:
  url: http://localhost:8080/upload
  type: base64
  base64_body_format: '{"data":"{{.Base64Contents}}"}'
  use_streaming: true
  extra_headers:
    x-api-key: secret
"#,
    )
    .unwrap();
    match kafka.adapter {
        Some(AdapterConfig::Kafka(k)) => {
            let settings = k.validate().unwrap();
            assert_eq!(settings.topics, vec!["a", "b"]);
            assert_eq!(settings.group, "g1");
        }
        other => panic!("unexpected adapter: {other:?}"),
    }
    let upload = kafka.upload.expect("upload section");
    assert_eq!(upload.send_type, SendFileType::Base64);
    assert!(upload.use_streaming);
    assert_eq!(upload.extra_headers["x-api-key"], "secret");

    let read_dir = parse_config(
        r#"
adapter:
  type: read_dir
  input: /var/spool/in
  recursive: true
  regex_filter: '\.json$'
"#,
    )
    .unwrap();
    match read_dir.adapter {
        Some(AdapterConfig::ReadDir(r)) => {
            assert_eq!(r.input, PathBuf::from("/var/spool/in"));
            assert!(r.recursive);
            assert!(!r.remove_source);
            assert_eq!(r.regex_filter.as_deref(), Some(r"\.json$"));
        }
        other => panic!("unexpected adapter: {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_publish_section_takes_pubsub_credentials_from_env() {
    let file = config_file(
        r#"
publish:
  type: pubsub
  project: proj
  topic: orders
  create_topic: true
"#,
    );
    env::set_var(PUBSUB_CREDENTIALS_ENV, "env-token");

    let config = load_config(file.path()).unwrap();
    env::remove_var(PUBSUB_CREDENTIALS_ENV);

    assert!(config.adapter.is_none());
    match config.publish {
        Some(PublishConfig::Pubsub(pubsub)) => {
            assert_eq!(pubsub.credentials, "env-token");
            assert!(pubsub.create_topic);
        }
        other => panic!("unexpected publish section: {other:?}"),
    }
}

#[test]
fn test_parse_kafka_publish_section() {
    let config = parse_config(
        r#"
publish:
  type: kafka
  bootstrap_servers: localhost:9092
  topic: orders
  acks: local
"#,
    )
    .unwrap();
    let Some(PublishConfig::Kafka(kafka)) = config.publish else {
        panic!("expected kafka publish section");
    };
    assert_eq!(kafka.acks, "local");
    assert_eq!(kafka.validate().unwrap().topic, "orders");
}

#[test]
fn test_unknown_adapter_type_is_rejected() {
    let err = parse_config("adapter:\n  type: carrier_pigeon\n").unwrap_err();
    assert!(err.to_string().contains("Failed to parse config YAML"));
}

/// A missing file reports the path it tried to read.
#[test]
fn test_load_config_errors_for_missing_file() {
    let err = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
