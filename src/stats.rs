//! Run statistics and the final report.
//!
//! [`RunStats`] is the only mutable state shared by every lane: plain atomic
//! counters updated from concurrent writers, plus a last-error slot behind a
//! mutex. The scheduler folds lane outcomes and a stats snapshot into the
//! serializable [`RunReport`] at run end.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Shared counters updated by all lanes.
#[derive(Default)]
pub struct RunStats {
    sent: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    lane_states: Mutex<Vec<LaneState>>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("last_error lock poisoned") = Some(message.to_string());
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("last_error lock poisoned")
            .clone()
    }

    /// Size the lane-state table at run start; every lane begins idle.
    pub fn init_lanes(&self, lanes: usize) {
        *self.lane_states.lock().expect("lane_states lock poisoned") =
            vec![LaneState::Idle; lanes];
    }

    pub fn set_lane_state(&self, lane: usize, state: LaneState) {
        if let Some(slot) = self
            .lane_states
            .lock()
            .expect("lane_states lock poisoned")
            .get_mut(lane)
        {
            *slot = state;
        }
    }

    /// Snapshot of per-lane states, observable while the run is in flight.
    pub fn lane_states(&self) -> Vec<LaneState> {
        self.lane_states
            .lock()
            .expect("lane_states lock poisoned")
            .clone()
    }
}

/// Terminal (and transient) states of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for LaneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LaneState::Idle => "idle",
            LaneState::Running => "running",
            LaneState::Completed => "completed",
            LaneState::Failed => "failed",
            LaneState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-lane outcome in the final report.
#[derive(Debug, Clone, Serialize)]
pub struct LaneReport {
    pub lane: usize,
    pub state: LaneState,
    pub sent: u64,
    pub errors: u64,
    /// Failure description when the lane ended `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Complete run report, written as JSON when `--report-output` is set.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generator: String,
    pub endpoint: String,
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub total_sent: u64,
    pub total_errors: u64,
    pub messages_per_second: f64,
    pub lanes: Vec<LaneReport>,
    /// True when no lane ended `failed`.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunReport {
    pub fn build(
        generator: String,
        endpoint: String,
        destination: String,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        stats: &RunStats,
        lanes: Vec<LaneReport>,
    ) -> Self {
        let total_sent = stats.sent();
        let messages_per_second = if elapsed.as_secs_f64() > 0.0 {
            total_sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let success = lanes.iter().all(|lane| lane.state != LaneState::Failed);
        Self {
            generator,
            endpoint,
            destination,
            started_at,
            completed_at: Utc::now(),
            elapsed_ms: elapsed.as_millis() as u64,
            total_sent,
            total_errors: stats.errors(),
            messages_per_second,
            lanes,
            success,
            last_error: stats.last_error(),
        }
    }

    /// Write the report as pretty-printed JSON to `path`.
    pub fn write_json(&self, path: &std::path::Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = RunStats::new();
        stats.record_sent();
        stats.record_sent();
        stats.record_error("boom");
        assert_eq!(stats.sent(), 2);
        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.last_error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_lane_state_table() {
        let stats = RunStats::new();
        assert!(stats.lane_states().is_empty());

        stats.init_lanes(2);
        assert_eq!(stats.lane_states(), vec![LaneState::Idle, LaneState::Idle]);

        stats.set_lane_state(1, LaneState::Running);
        assert_eq!(
            stats.lane_states(),
            vec![LaneState::Idle, LaneState::Running]
        );

        // Out-of-range lanes are ignored.
        stats.set_lane_state(5, LaneState::Failed);
        assert_eq!(stats.lane_states().len(), 2);
    }

    #[test]
    fn test_report_success_reflects_lane_states() {
        let stats = RunStats::new();
        stats.record_sent();
        let lanes = vec![
            LaneReport {
                lane: 0,
                state: LaneState::Completed,
                sent: 1,
                errors: 0,
                failure: None,
            },
            LaneReport {
                lane: 1,
                state: LaneState::Failed,
                sent: 0,
                errors: 1,
                failure: Some("fatal send failure".to_string()),
            },
        ];
        let report = RunReport::build(
            "builtin:hello-world".to_string(),
            "mem://local".to_string(),
            "topic:events".to_string(),
            Utc::now(),
            Duration::from_secs(2),
            &stats,
            lanes,
        );
        assert!(!report.success);
        assert_eq!(report.total_sent, 1);
        assert_eq!(report.messages_per_second, 0.5);
    }

    #[test]
    fn test_report_serializes() {
        let stats = RunStats::new();
        let report = RunReport::build(
            "builtin:hello-world".to_string(),
            "mem://local".to_string(),
            "topic:events".to_string(),
            Utc::now(),
            Duration::ZERO,
            &stats,
            Vec::new(),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["total_sent"], 0);
        assert_eq!(json["success"], true);
        // Empty last_error is omitted entirely.
        assert!(json.get("last_error").is_none());
    }
}
