//! Failure classification and retry/reconnect policy.
//!
//! The supervisor is the one layer with enough context to decide what a
//! failure means: producers fail fast and never retry, lanes ask the
//! supervisor whether an error is worth retrying, and connection health is
//! tracked per connection so one broken endpoint never affects lanes on
//! healthy ones.

use crate::connection::ManagedConnection;
use broker_client::{ConnectError, SendError};
use generator_plugin::GeneratorError;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Classification of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail the owning lane.
    Fatal,
}

/// Decision after a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry after the given backoff delay.
    RetryAfter(Duration),
    /// The connection is done; it has been marked failed.
    GiveUp,
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum send attempts per iteration (first attempt included).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following failed attempt `attempt` (1-based):
    /// exponential, capped at `max_backoff`, with uniform jitter in the upper
    /// half of the window so concurrent lanes do not retry in lockstep.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let uncapped = self.base_backoff.saturating_mul(1u32 << exponent);
        let capped_ms = uncapped.min(self.max_backoff).as_millis() as u64;
        if capped_ms == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(capped_ms / 2..=capped_ms);
        Duration::from_millis(jittered)
    }
}

/// Consecutive transient failures on one connection before it is declared
/// failed outright.
pub const CONNECTION_FAILURE_THRESHOLD: u32 = 8;

/// Classifies faults and drives per-connection retry/reconnect decisions.
pub struct FailureSupervisor {
    policy: RetryPolicy,
    failure_threshold: u32,
}

impl FailureSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failure_threshold: CONNECTION_FAILURE_THRESHOLD,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify a send error.
    pub fn classify(&self, err: &SendError) -> FaultKind {
        match err {
            SendError::Transient { .. } => FaultKind::Transient,
            SendError::Fatal { .. } | SendError::Closed => FaultKind::Fatal,
        }
    }

    /// Classify a connect error.
    pub fn classify_connect(&self, err: &ConnectError) -> FaultKind {
        match err {
            ConnectError::Transient { .. } => FaultKind::Transient,
            ConnectError::Fatal { .. } | ConnectError::Closed => FaultKind::Fatal,
        }
    }

    /// Classify an error raised by a generator invocation.
    pub fn classify_generator(&self, err: &GeneratorError) -> FaultKind {
        match err {
            GeneratorError::Send(send) => self.classify(send),
            GeneratorError::Recoverable(_) => FaultKind::Transient,
            GeneratorError::Fatal(_) => FaultKind::Fatal,
        }
    }

    /// Record a failure against `connection` and decide what happens next.
    ///
    /// Transient failures degrade the connection and earn a backoff until the
    /// failure threshold is crossed. Fatal failures give up for the calling
    /// lane, but only faults that mean the link itself is dead (a closed
    /// connection, or threshold exhaustion) mark the connection failed: a
    /// message-scoped fatal such as an oversized payload must not take down
    /// sibling lanes sharing the connection.
    pub fn on_failure(&self, connection: &ManagedConnection, err: &SendError) -> ReconnectDecision {
        match self.classify(err) {
            FaultKind::Fatal => {
                if matches!(err, SendError::Closed) {
                    connection.mark_failed();
                }
                ReconnectDecision::GiveUp
            }
            FaultKind::Transient => {
                let failures = connection.record_transient();
                if failures >= self.failure_threshold {
                    warn!(
                        connection = %connection.id(),
                        failures,
                        "failure threshold exhausted, marking connection failed"
                    );
                    connection.mark_failed();
                    ReconnectDecision::GiveUp
                } else {
                    ReconnectDecision::RetryAfter(self.policy.backoff_for(failures))
                }
            }
        }
    }

    /// Record a successful send; restores the connection to healthy.
    pub fn on_success(&self, connection: &ManagedConnection) {
        connection.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let supervisor = FailureSupervisor::new(RetryPolicy::default());
        assert_eq!(
            supervisor.classify(&SendError::transient("blip")),
            FaultKind::Transient
        );
        assert_eq!(
            supervisor.classify(&SendError::fatal("bad destination")),
            FaultKind::Fatal
        );
        assert_eq!(supervisor.classify(&SendError::Closed), FaultKind::Fatal);
        assert_eq!(
            supervisor.classify_generator(&GeneratorError::Recoverable("hiccup".into())),
            FaultKind::Transient
        );
        assert_eq!(
            supervisor.classify_generator(&GeneratorError::Fatal("broken".into())),
            FaultKind::Fatal
        );
    }

    #[test]
    fn test_backoff_is_bounded_and_grows() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };

        for attempt in 1..=10 {
            let backoff = policy.backoff_for(attempt);
            assert!(backoff <= policy.max_backoff, "attempt {attempt} over cap");
        }
        // First attempt jitters within [base/2, base].
        let first = policy.backoff_for(1);
        assert!(first >= Duration::from_millis(50));
        assert!(first <= Duration::from_millis(100));
        // Deep attempts saturate at the cap window.
        let deep = policy.backoff_for(8);
        assert!(deep >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fatal_send_gives_up_without_failing_the_connection() {
        let manager = crate::connection::ConnectionManager::new();
        let endpoint = broker_client::Endpoint::parse("mem://supervisor-test").unwrap();
        let connection = manager.connect(&endpoint, false).await.unwrap();
        let supervisor = FailureSupervisor::new(RetryPolicy::default());

        // Message-scoped fatal: the lane gives up, siblings keep the link.
        assert_eq!(
            supervisor.on_failure(&connection, &SendError::fatal("payload too large")),
            ReconnectDecision::GiveUp
        );
        assert!(!connection.is_failed());

        // A closed connection is dead for everyone.
        assert_eq!(
            supervisor.on_failure(&connection, &SendError::Closed),
            ReconnectDecision::GiveUp
        );
        assert!(connection.is_failed());
    }

    #[tokio::test]
    async fn test_transient_threshold_fails_the_connection() {
        let manager = crate::connection::ConnectionManager::new();
        let endpoint = broker_client::Endpoint::parse("mem://supervisor-test").unwrap();
        let connection = manager.connect(&endpoint, false).await.unwrap();
        let supervisor = FailureSupervisor::new(RetryPolicy {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        });

        let err = SendError::transient("blip");
        for _ in 0..CONNECTION_FAILURE_THRESHOLD - 1 {
            assert!(matches!(
                supervisor.on_failure(&connection, &err),
                ReconnectDecision::RetryAfter(_)
            ));
        }
        assert_eq!(
            supervisor.on_failure(&connection, &err),
            ReconnectDecision::GiveUp
        );
        assert!(connection.is_failed());
    }

    #[test]
    fn test_zero_base_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
    }
}
