//! Narrow broker-client contract for mq-loadgen.
//!
//! The load-generation engine talks to messaging middleware exclusively
//! through the traits in this crate: a [`BrokerConnection`] owns sessions, a
//! [`BrokerSession`] creates producers, and a [`BrokerProducer`] sends
//! payloads to a single destination. Backends (Kafka, in-memory) implement
//! these traits; everything above them is backend-agnostic.
//!
//! The crate also ships the `mem://` backend (see [`memory`]), used for dry
//! runs and for deterministic failure-injection tests.

pub mod error;
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use error::{ConnectError, SendError};
pub use memory::{DeliveredMessage, FailureScript, InjectedFault, MemoryBroker};
pub use types::{
    DeliveryMode, Destination, Endpoint, EndpointParseError, HealthState, Message, ProducerOpts,
    Scheme, DEFAULT_SEND_TIMEOUT,
};

/// A live link to a broker endpoint.
///
/// A connection owns its sessions; closing the connection transitively
/// invalidates every session and producer created from it (subsequent use
/// fails with [`SendError::Closed`]).
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// The endpoint this connection is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Open a new session on this connection.
    ///
    /// Sessions are not safe to share across lanes; the engine opens one
    /// session per lane.
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, ConnectError>;

    /// Close the connection and invalidate all child sessions/producers.
    async fn close(&self);
}

/// A session scoped to one lane.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Create a producer bound to `destination`.
    async fn create_producer(
        &self,
        destination: Destination,
        opts: ProducerOpts,
    ) -> Result<Box<dyn BrokerProducer>, ConnectError>;

    /// Close the session and its producers.
    async fn close(&self);
}

/// A producer bound to a (session, destination) pair.
///
/// Sends are fail-fast: no internal buffering, batching, or retry. Retry
/// policy lives in the engine, which has the context to decide between a
/// lane-level retry and a reconnect. Each call is bounded by the per-call
/// timeout from [`ProducerOpts`]; expiry is a transient failure.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// The destination this producer is bound to.
    fn destination(&self) -> &Destination;

    /// Send a raw payload.
    async fn send_data(&self, payload: &[u8]) -> Result<(), SendError>;

    /// Send a message with headers.
    async fn send(&self, message: Message) -> Result<(), SendError>;
}
