//! Core types shared by all broker backends.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default per-call send timeout (matches the usual broker-client default).
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend scheme of an endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// In-process memory broker (`mem://name`), for dry runs and tests.
    Memory,
    /// Kafka cluster (`kafka://host:port[,host:port]`).
    Kafka,
}

/// Error parsing an endpoint URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint has no scheme (expected mem:// or kafka://): {0}")]
    MissingScheme(String),

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("endpoint has empty address: {0}")]
    EmptyAddress(String),
}

/// A parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct Endpoint {
    scheme: Scheme,
    address: String,
}

impl Endpoint {
    /// Parse an endpoint URL such as `kafka://localhost:9092` or `mem://local`.
    pub fn parse(raw: &str) -> Result<Self, EndpointParseError> {
        let (scheme_str, address) = raw
            .split_once("://")
            .ok_or_else(|| EndpointParseError::MissingScheme(raw.to_string()))?;

        let scheme = match scheme_str {
            "mem" => Scheme::Memory,
            "kafka" => Scheme::Kafka,
            other => return Err(EndpointParseError::UnsupportedScheme(other.to_string())),
        };

        if address.is_empty() {
            return Err(EndpointParseError::EmptyAddress(raw.to_string()));
        }

        Ok(Endpoint {
            scheme,
            address: address.to_string(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The address part (broker list for Kafka, a label for memory).
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Memory => "mem",
            Scheme::Kafka => "kafka",
        };
        write!(f, "{}://{}", scheme, self.address)
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> String {
        e.to_string()
    }
}

impl std::str::FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Endpoint::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A named queue or topic a producer sends to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{name}"),
            Destination::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

/// Message delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    #[default]
    NonPersistent,
    Persistent,
}

/// Options applied to every producer created for a lane.
#[derive(Debug, Clone)]
pub struct ProducerOpts {
    pub delivery_mode: DeliveryMode,
    /// Message time-to-live, if the backend supports it.
    pub ttl: Option<Duration>,
    /// Per-call send timeout; expiry classifies as transient.
    pub send_timeout: Duration,
}

impl Default for ProducerOpts {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            ttl: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// An outbound message: payload plus optional string headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Message {
    pub fn from_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Connection health as observed by the engine.
///
/// A single transient error degrades a connection; repeated errors fail it.
/// A failed connection is never reused without going through reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}
