//! In-process memory broker.
//!
//! Serves `mem://` endpoints. Every delivered message is recorded and can be
//! inspected after a run, which makes this backend the workhorse for dry runs
//! and for the engine's own tests. Failures can be injected deterministically
//! through per-producer scripts: scripts are assigned to producers in
//! creation order, and each script maps a 1-based send-attempt index to the
//! fault to raise on that attempt.

use crate::error::{ConnectError, SendError};
use crate::types::{Destination, Endpoint, Message, ProducerOpts};
use crate::{BrokerConnection, BrokerProducer, BrokerSession};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A fault injected by a failure script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Transient,
    Fatal,
}

/// Per-producer failure script: 1-based send-attempt index -> fault.
pub type FailureScript = HashMap<u64, InjectedFault>;

/// A message the memory broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    delivered: Mutex<Vec<DeliveredMessage>>,
    /// Scripts handed out to producers in creation order.
    producer_scripts: Mutex<VecDeque<FailureScript>>,
    /// Number of upcoming connect attempts to fail transiently.
    connect_faults: AtomicU32,
    /// Connections established and not yet closed.
    open_connections: AtomicU32,
}

/// Handle to an in-process broker. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to this broker. Fails transiently while injected connect
    /// faults remain.
    pub fn connect(&self, endpoint: Endpoint) -> Result<MemoryConnection, ConnectError> {
        let remaining = &self.state.connect_faults;
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectError::transient(
                endpoint.to_string(),
                "injected connect fault",
            ));
        }
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            state: self.state.clone(),
            endpoint,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a failure script for the next producer created on this broker.
    ///
    /// Scripts are consumed in producer-creation order, so with lanes set up
    /// sequentially the n-th pushed script lands on lane n's producer.
    pub fn push_producer_script(&self, script: FailureScript) {
        self.state
            .producer_scripts
            .lock()
            .expect("script lock poisoned")
            .push_back(script);
    }

    /// Fail the next `n` connect attempts with a transient error.
    pub fn inject_connect_faults(&self, n: u32) {
        self.state.connect_faults.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything delivered so far.
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.state
            .delivered
            .lock()
            .expect("delivered lock poisoned")
            .clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.state
            .delivered
            .lock()
            .expect("delivered lock poisoned")
            .len()
    }

    /// Connections currently open on this broker; teardown tests assert this
    /// drops back to zero.
    pub fn open_connections(&self) -> u32 {
        self.state.open_connections.load(Ordering::SeqCst)
    }
}

/// A connection to the memory broker.
pub struct MemoryConnection {
    state: Arc<BrokerState>,
    endpoint: Endpoint,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open_session(&self) -> Result<Box<dyn BrokerSession>, ConnectError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            connection_closed: self.closed.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) {
        // First close wins; repeated closes must not skew the gauge.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(endpoint = %self.endpoint, "memory connection closed");
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    connection_closed: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_producer(
        &self,
        destination: Destination,
        _opts: ProducerOpts,
    ) -> Result<Box<dyn BrokerProducer>, ConnectError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed);
        }
        let script = self
            .state
            .producer_scripts
            .lock()
            .expect("script lock poisoned")
            .pop_front();
        Ok(Box::new(MemoryProducer {
            state: self.state.clone(),
            destination,
            script,
            calls: AtomicU64::new(0),
            connection_closed: self.connection_closed.clone(),
            session_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryProducer {
    state: Arc<BrokerState>,
    destination: Destination,
    script: Option<FailureScript>,
    calls: AtomicU64,
    connection_closed: Arc<AtomicBool>,
    session_closed: Arc<AtomicBool>,
}

impl MemoryProducer {
    fn deliver(&self, payload: Vec<u8>, headers: Vec<(String, String)>) -> Result<(), SendError> {
        if self.connection_closed.load(Ordering::SeqCst)
            || self.session_closed.load(Ordering::SeqCst)
        {
            return Err(SendError::Closed);
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(fault) = self.script.as_ref().and_then(|s| s.get(&call)) {
            debug!(destination = %self.destination, call, ?fault, "raising injected fault");
            return Err(match fault {
                InjectedFault::Transient => SendError::transient("injected transient fault"),
                InjectedFault::Fatal => SendError::fatal("injected fatal fault"),
            });
        }

        self.state
            .delivered
            .lock()
            .expect("delivered lock poisoned")
            .push(DeliveredMessage {
                destination: self.destination.clone(),
                payload,
                headers,
            });
        Ok(())
    }
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn send_data(&self, payload: &[u8]) -> Result<(), SendError> {
        self.deliver(payload.to_vec(), Vec::new())
    }

    async fn send(&self, message: Message) -> Result<(), SendError> {
        self.deliver(message.payload, message.headers)
    }
}
