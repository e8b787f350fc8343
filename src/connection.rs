//! Connection pooling and lane producer creation.
//!
//! The manager owns every broker connection for a run. Connections are
//! pooled by endpoint identity and shared across lanes unless the plan asks
//! for exclusive connections; sessions and producers, once handed to a lane,
//! are exclusively owned by that lane for its lifetime.

use async_trait::async_trait;
use broker_client::{
    BrokerConnection, BrokerProducer, BrokerSession, ConnectError, Destination, Endpoint,
    HealthState, MemoryBroker, Message, ProducerOpts, Scheme, SendError,
};
use generator_plugin::DataSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::supervisor::{FailureSupervisor, FaultKind};

/// A pooled connection plus the health state the supervisor maintains for it.
pub struct ManagedConnection {
    id: Uuid,
    endpoint: Endpoint,
    inner: Box<dyn BrokerConnection>,
    health: StdMutex<HealthState>,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("health", &self.health)
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl ManagedConnection {
    fn new(endpoint: Endpoint, inner: Box<dyn BrokerConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            inner,
            health: StdMutex::new(HealthState::Healthy),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn health(&self) -> HealthState {
        *self.health.lock().expect("health lock poisoned")
    }

    pub fn is_failed(&self) -> bool {
        self.health() == HealthState::Failed
    }

    /// A successful send restores the connection to healthy.
    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut health = self.health.lock().expect("health lock poisoned");
        // A failed connection stays failed until reconnect.
        if *health == HealthState::Degraded {
            *health = HealthState::Healthy;
        }
    }

    /// A transient error degrades the connection; returns the consecutive
    /// failure count.
    pub(crate) fn record_transient(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut health = self.health.lock().expect("health lock poisoned");
        if *health == HealthState::Healthy {
            *health = HealthState::Degraded;
        }
        failures
    }

    pub(crate) fn mark_failed(&self) {
        *self.health.lock().expect("health lock poisoned") = HealthState::Failed;
    }
}

/// Owns the connection pool and creates lane producers.
pub struct ConnectionManager {
    pool: Mutex<HashMap<String, Arc<ManagedConnection>>>,
    /// Exclusive connections are not pooled but still torn down at run end.
    exclusive: Mutex<Vec<Arc<ManagedConnection>>>,
    memory: MemoryBroker,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_memory_broker(MemoryBroker::new())
    }

    /// Use the given memory broker for all `mem://` endpoints. Tests pass a
    /// handle here so delivered messages can be inspected after a run.
    pub fn with_memory_broker(memory: MemoryBroker) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            exclusive: Mutex::new(Vec::new()),
            memory,
        }
    }

    /// Connect to `endpoint`, reusing a pooled healthy connection unless
    /// `exclusive` is requested.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        exclusive: bool,
    ) -> Result<Arc<ManagedConnection>, ConnectError> {
        if !exclusive {
            let pool = self.pool.lock().await;
            if let Some(existing) = pool.get(&endpoint.to_string()) {
                if !existing.is_failed() {
                    debug!(endpoint = %endpoint, "reusing pooled connection");
                    return Ok(existing.clone());
                }
            }
        }

        let inner = self.dial(endpoint).await?;
        let connection = Arc::new(ManagedConnection::new(endpoint.clone(), inner));
        info!(endpoint = %endpoint, connection = %connection.id(), exclusive, "connection established");

        if exclusive {
            self.exclusive.lock().await.push(connection.clone());
        } else {
            self.pool
                .lock()
                .await
                .insert(endpoint.to_string(), connection.clone());
        }
        Ok(connection)
    }

    /// Connect with the supervisor's bounded backoff applied to transient
    /// connect failures.
    pub async fn connect_with_retry(
        &self,
        endpoint: &Endpoint,
        exclusive: bool,
        supervisor: &FailureSupervisor,
    ) -> Result<Arc<ManagedConnection>, ConnectError> {
        let policy = supervisor.policy();
        let mut attempt = 1;
        loop {
            match self.connect(endpoint, exclusive).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    if supervisor.classify_connect(&err) == FaultKind::Fatal
                        || attempt >= policy.max_attempts
                    {
                        return Err(err);
                    }
                    let delay = policy.backoff_for(attempt);
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        ?delay,
                        error = %err,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Create a producer for one lane: a dedicated session bound to
    /// `destination`. Safe to call once per lane; each call yields an
    /// independent producer.
    pub async fn create_producer(
        &self,
        connection: &Arc<ManagedConnection>,
        destination: Destination,
        opts: ProducerOpts,
    ) -> Result<LaneProducer, ConnectError> {
        if connection.is_failed() {
            return Err(ConnectError::Closed);
        }
        let session = connection.inner.open_session().await?;
        let producer = session.create_producer(destination, opts).await?;
        Ok(LaneProducer {
            connection: connection.clone(),
            session,
            producer,
        })
    }

    /// Close every connection; handles used afterwards fail with
    /// [`SendError::Closed`].
    pub async fn close_all(&self) {
        let mut pool = self.pool.lock().await;
        for (_, connection) in pool.drain() {
            connection.inner.close().await;
        }
        for connection in self.exclusive.lock().await.drain(..) {
            connection.inner.close().await;
        }
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Box<dyn BrokerConnection>, ConnectError> {
        match endpoint.scheme() {
            Scheme::Memory => {
                let connection = self.memory.connect(endpoint.clone())?;
                Ok(Box::new(connection))
            }
            Scheme::Kafka => {
                let connection = broker_kafka::KafkaConnection::connect(endpoint.clone()).await?;
                Ok(Box::new(connection))
            }
        }
    }
}

/// A (session, destination) pair exclusively owned by one lane.
///
/// Implements [`DataSink`], the facade plugins see: the lane hands the
/// generator `&mut LaneProducer`, never the session or connection.
pub struct LaneProducer {
    connection: Arc<ManagedConnection>,
    session: Box<dyn BrokerSession>,
    producer: Box<dyn BrokerProducer>,
}

impl LaneProducer {
    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.connection
    }

    pub fn destination(&self) -> &Destination {
        self.producer.destination()
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

#[async_trait]
impl DataSink for LaneProducer {
    async fn send_data(&mut self, payload: &[u8]) -> Result<(), SendError> {
        self.producer.send_data(payload).await
    }

    async fn send(&mut self, message: Message) -> Result<(), SendError> {
        self.producer.send(message).await
    }
}
