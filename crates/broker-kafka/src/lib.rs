//! Kafka backend for the mq-loadgen broker-client contract.
//!
//! Maps the narrow connection/session/producer traits onto `rdkafka`'s
//! `FutureProducer`. Topic destinations publish unkeyed; queue destinations
//! publish keyed by destination name so all messages land in one partition,
//! approximating queue ordering. Delivery mode maps to producer acks
//! (persistent -> `acks=all`), and TTL maps to `message.timeout.ms`.

use async_trait::async_trait;
use broker_client::{
    BrokerConnection, BrokerProducer, BrokerSession, ConnectError, DeliveryMode, Destination,
    Endpoint, Message, ProducerOpts, SendError,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Timeout for the metadata probe issued at connect time.
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to a Kafka cluster.
pub struct KafkaConnection {
    endpoint: Endpoint,
    closed: Arc<AtomicBool>,
}

impl KafkaConnection {
    /// Connect to the cluster named by `endpoint` (`kafka://host:port[,...]`).
    ///
    /// Issues a metadata probe so unreachable clusters fail here, at connect
    /// time, instead of on the first lane send.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, ConnectError> {
        let brokers = endpoint.address().to_string();
        let probe: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| connect_error(&endpoint, e))?;

        let probe_endpoint = endpoint.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            probe.client().fetch_metadata(None, CONNECT_PROBE_TIMEOUT)
        })
        .await
        .map_err(|e| {
            ConnectError::transient(probe_endpoint.to_string(), format!("probe task failed: {e}"))
        })?;

        match metadata {
            Ok(meta) => {
                info!(endpoint = %endpoint, brokers = meta.brokers().len(), "kafka connection established");
                Ok(KafkaConnection {
                    endpoint,
                    closed: Arc::new(AtomicBool::new(false)),
                })
            }
            Err(e) => Err(connect_error(&endpoint, e)),
        }
    }
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, ConnectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        Ok(Box::new(KafkaSession {
            endpoint: self.endpoint.clone(),
            connection_closed: self.closed.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(endpoint = %self.endpoint, "kafka connection closed");
    }
}

/// One session per lane; each session builds its own producer so lanes never
/// contend on a shared client handle.
struct KafkaSession {
    endpoint: Endpoint,
    connection_closed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for KafkaSession {
    async fn create_producer(
        &self,
        destination: Destination,
        opts: ProducerOpts,
    ) -> Result<Box<dyn BrokerProducer>, ConnectError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }

        let delivery_timeout = opts.ttl.unwrap_or(opts.send_timeout);
        let acks = match opts.delivery_mode {
            DeliveryMode::Persistent => "all",
            DeliveryMode::NonPersistent => "1",
        };
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", self.endpoint.address())
            .set("message.timeout.ms", delivery_timeout.as_millis().to_string())
            .set("acks", acks)
            .create()
            .map_err(|e| connect_error(&self.endpoint, e))?;

        // Queue destinations are keyed so every message maps to the same
        // partition; topics publish unkeyed.
        let key = match &destination {
            Destination::Queue(name) => Some(name.clone().into_bytes()),
            Destination::Topic(_) => None,
        };

        debug!(destination = %destination, acks, "kafka producer created");
        Ok(Box::new(KafkaProducer {
            producer,
            topic: destination.name().to_string(),
            key,
            send_timeout: opts.send_timeout,
            destination,
            connection_closed: self.connection_closed.clone(),
            session_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    key: Option<Vec<u8>>,
    send_timeout: Duration,
    destination: Destination,
    connection_closed: Arc<AtomicBool>,
    session_closed: Arc<AtomicBool>,
}

impl KafkaProducer {
    async fn produce(
        &self,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(), SendError> {
        if self.connection_closed.load(Ordering::SeqCst)
            || self.session_closed.load(Ordering::SeqCst)
        {
            return Err(SendError::Closed);
        }

        let result = match &self.key {
            Some(key) => {
                let mut record = FutureRecord::to(&self.topic).payload(payload).key(key);
                if let Some(h) = headers {
                    record = record.headers(h);
                }
                self.producer.send(record, self.send_timeout).await
            }
            None => {
                let mut record: FutureRecord<'_, (), _> =
                    FutureRecord::to(&self.topic).payload(payload);
                if let Some(h) = headers {
                    record = record.headers(h);
                }
                self.producer.send(record, self.send_timeout).await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err((err, _)) => Err(map_send_error(err)),
        }
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn send_data(&self, payload: &[u8]) -> Result<(), SendError> {
        self.produce(payload, None).await
    }

    async fn send(&self, message: Message) -> Result<(), SendError> {
        let headers = if message.headers.is_empty() {
            None
        } else {
            let mut owned = OwnedHeaders::new_with_capacity(message.headers.len());
            for (key, value) in &message.headers {
                owned = owned.insert(Header {
                    key,
                    value: Some(value),
                });
            }
            Some(owned)
        };
        self.produce(&message.payload, headers).await
    }
}

/// Map an rdkafka error onto the transient/fatal send taxonomy.
///
/// Timeouts, transport failures, and backpressure are worth retrying; auth
/// failures and invalid destinations are not. Unrecognized codes default to
/// transient so a novel broker hiccup gets the bounded retry path instead of
/// killing the lane outright.
fn map_send_error(err: KafkaError) -> SendError {
    match err.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => SendError::fatal(err.to_string()),
        Some(_) => SendError::transient(err.to_string()),
        None => SendError::transient(err.to_string()),
    }
}

fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::InvalidTopic
            | RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::PolicyViolation
            | RDKafkaErrorCode::InvalidRequiredAcks
    )
}

fn connect_error(endpoint: &Endpoint, err: KafkaError) -> ConnectError {
    match map_send_error(err) {
        SendError::Fatal { reason } => ConnectError::fatal(endpoint.to_string(), reason),
        SendError::Transient { reason } => ConnectError::transient(endpoint.to_string(), reason),
        SendError::Closed => ConnectError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes_map_transient() {
        for code in [
            RDKafkaErrorCode::QueueFull,
            RDKafkaErrorCode::MessageTimedOut,
            RDKafkaErrorCode::RequestTimedOut,
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::AllBrokersDown,
        ] {
            let err = map_send_error(KafkaError::MessageProduction(code));
            assert!(
                matches!(err, SendError::Transient { .. }),
                "{code:?} should be transient"
            );
        }
    }

    #[test]
    fn test_fatal_codes_map_fatal() {
        for code in [
            RDKafkaErrorCode::Authentication,
            RDKafkaErrorCode::TopicAuthorizationFailed,
            RDKafkaErrorCode::UnknownTopicOrPartition,
            RDKafkaErrorCode::InvalidTopic,
        ] {
            let err = map_send_error(KafkaError::MessageProduction(code));
            assert!(
                matches!(err, SendError::Fatal { .. }),
                "{code:?} should be fatal"
            );
        }
    }
}
