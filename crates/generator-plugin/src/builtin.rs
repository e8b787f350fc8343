//! Builtin generator registry.
//!
//! Builtins cover the common load shapes without requiring a plugin library:
//! a fixed greeting, an incrementing text payload, and a JSON event with a
//! timestamp. They are resolved by name through the `--generator` flag.

use crate::{DataSink, GeneratorError, MessageGenerator};
use async_trait::async_trait;
use chrono::Utc;

/// Names of all builtin generators, in registry order.
pub fn builtin_names() -> &'static [&'static str] {
    &["hello-world", "sequential-text", "timestamp-json"]
}

/// Instantiate a builtin generator by name.
pub fn instantiate(name: &str) -> Option<Box<dyn MessageGenerator>> {
    match name {
        "hello-world" => Some(Box::new(HelloWorldGenerator)),
        "sequential-text" => Some(Box::<SequentialTextGenerator>::default()),
        "timestamp-json" => Some(Box::<TimestampJsonGenerator>::default()),
        _ => None,
    }
}

/// Sends a fixed greeting payload every invocation.
pub struct HelloWorldGenerator;

#[async_trait]
impl MessageGenerator for HelloWorldGenerator {
    async fn generate_message(
        &mut self,
        producer: &mut dyn DataSink,
    ) -> Result<(), GeneratorError> {
        producer.send_data(b"Hello World from mq-loadgen").await?;
        Ok(())
    }
}

/// Sends a text payload embedding an incrementing counter.
#[derive(Default)]
pub struct SequentialTextGenerator {
    counter: u64,
}

#[async_trait]
impl MessageGenerator for SequentialTextGenerator {
    async fn generate_message(
        &mut self,
        producer: &mut dyn DataSink,
    ) -> Result<(), GeneratorError> {
        self.counter += 1;
        let payload = format!("message {}", self.counter);
        producer.send_data(payload.as_bytes()).await?;
        Ok(())
    }
}

/// Sends a JSON event with a sequence index and an RFC 3339 timestamp.
#[derive(Default)]
pub struct TimestampJsonGenerator {
    index: u64,
}

#[async_trait]
impl MessageGenerator for TimestampJsonGenerator {
    async fn generate_message(
        &mut self,
        producer: &mut dyn DataSink,
    ) -> Result<(), GeneratorError> {
        self.index += 1;
        let event = serde_json::json!({
            "index": self.index,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let payload = serde_json::to_vec(&event)
            .map_err(|e| GeneratorError::Recoverable(format!("event encoding failed: {e}")))?;
        producer.send_data(&payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_sink::VecSink;

    #[test]
    fn test_registry_names_resolve() {
        for name in builtin_names() {
            assert!(instantiate(name).is_some(), "builtin {name} missing");
        }
        assert!(instantiate("no-such-generator").is_none());
    }

    #[tokio::test]
    async fn test_hello_world_payload() {
        let mut generator = instantiate("hello-world").unwrap();
        let mut sink = VecSink::default();
        generator.generate_message(&mut sink).await.unwrap();
        assert_eq!(sink.payloads, vec![b"Hello World from mq-loadgen".to_vec()]);
    }

    #[tokio::test]
    async fn test_sequential_text_counts() {
        let mut generator = instantiate("sequential-text").unwrap();
        let mut sink = VecSink::default();
        for _ in 0..3 {
            generator.generate_message(&mut sink).await.unwrap();
        }
        assert_eq!(
            sink.payloads,
            vec![
                b"message 1".to_vec(),
                b"message 2".to_vec(),
                b"message 3".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_timestamp_json_shape() {
        let mut generator = instantiate("timestamp-json").unwrap();
        let mut sink = VecSink::default();
        generator.generate_message(&mut sink).await.unwrap();

        let event: serde_json::Value = serde_json::from_slice(&sink.payloads[0]).unwrap();
        assert_eq!(event["index"], 1);
        assert!(event["timestamp"].as_str().unwrap().contains('T'));
    }
}
