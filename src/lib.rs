//! mq-loadgen library
//!
//! A load-generation engine for message-oriented middleware: a user-supplied
//! generator plugin is driven repeatedly against live broker connections
//! across concurrent lanes to produce synthetic traffic for testing and
//! benchmarking.
//!
//! # Architecture
//!
//! - `generator-plugin`: the generator contract, builtin registry, and
//!   dynamic library loader
//! - `broker-client`: the narrow connection/session/producer contract plus
//!   the in-memory backend
//! - `broker-kafka`: the Kafka backend
//! - [`config`]: the immutable [`config::ExecutionPlan`]
//! - [`connection`]: connection pool and lane producers
//! - [`supervisor`]: fault classification and retry/reconnect policy
//! - [`scheduler`]: lane orchestration and pacing
//! - [`stats`]: shared counters and the final run report
//!
//! # CLI Usage
//!
//! ```bash
//! # 1000 hello-world messages against an in-memory broker
//! mq-loadgen run -I 1000
//!
//! # Four lanes at 50 msg/sec each against Kafka
//! mq-loadgen run --endpoint kafka://localhost:9092 \
//!   --destination events --lanes 4 --rate 50 -I 10000
//!
//! # Drive a custom generator library
//! mq-loadgen run -G custom -X ./target/release/libmy_generator.so -I 1000
//! ```

pub mod config;
pub mod connection;
pub mod scheduler;
pub mod stats;
pub mod supervisor;

pub use config::{ConfigurationError, ExecutionPlan};
pub use connection::{ConnectionManager, LaneProducer, ManagedConnection};
pub use scheduler::{ExecutionScheduler, RunError};
pub use stats::{LaneReport, LaneState, RunReport, RunStats};
pub use supervisor::{FailureSupervisor, FaultKind, ReconnectDecision, RetryPolicy};
