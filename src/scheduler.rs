//! Lane orchestration: the execution scheduler.
//!
//! A run fans out into `lanes` concurrent workers, one tokio task per lane.
//! Each lane owns a producer and a generator handle and walks the iteration
//! loop: pace, invoke the generator, retry transient failures with bounded
//! backoff, stop on fatal ones. Lanes fail independently; the run completes
//! when every lane reaches a terminal state.

use crate::config::{ConfigurationError, ExecutionPlan};
use crate::connection::{ConnectionManager, LaneProducer};
use crate::stats::{LaneReport, LaneState, RunReport, RunStats};
use crate::supervisor::{FailureSupervisor, FaultKind, ReconnectDecision, RetryPolicy};
use broker_client::{ConnectError, MemoryBroker};
use chrono::Utc;
use generator_plugin::{
    GeneratorError, GeneratorHandle, LoadedGenerator, MessageGenerator, PluginError, PluginLoader,
    SharingPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that abort a run before or during lane execution.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Missed pacing ticks beyond this window are dropped instead of bursting.
const PACER_CATCH_UP_TICKS: u32 = 4;

/// Fixed-rate pacer.
///
/// Ticks are scheduled against an absolute timeline, so a slow iteration does
/// not shift the schedule (fixed-rate, not fixed-delay). After a stall longer
/// than the catch-up window the backlog is dropped and the schedule
/// re-anchors at now, so a stalled lane never bursts unboundedly.
pub(crate) struct Pacer {
    period: Duration,
    next: tokio::time::Instant,
}

impl Pacer {
    pub(crate) fn new(rate: f64) -> Self {
        let period = Duration::from_secs_f64(1.0 / rate);
        Self {
            period,
            next: tokio::time::Instant::now() + period,
        }
    }

    pub(crate) async fn tick(&mut self) {
        let now = tokio::time::Instant::now();
        if now >= self.next {
            if now.duration_since(self.next) > self.period * PACER_CATCH_UP_TICKS {
                self.next = now;
            }
            self.next += self.period;
            return;
        }
        tokio::time::sleep_until(self.next).await;
        self.next += self.period;
    }
}

/// Orchestrates one run of an [`ExecutionPlan`].
pub struct ExecutionScheduler {
    plan: ExecutionPlan,
    manager: Arc<ConnectionManager>,
    supervisor: Arc<FailureSupervisor>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

impl ExecutionScheduler {
    pub fn new(plan: ExecutionPlan) -> Self {
        let manager = Arc::new(ConnectionManager::new());
        Self::with_manager(plan, manager)
    }

    /// Run against a caller-owned memory broker, so delivered messages can be
    /// inspected afterwards.
    pub fn with_memory_broker(plan: ExecutionPlan, broker: MemoryBroker) -> Self {
        let manager = Arc::new(ConnectionManager::with_memory_broker(broker));
        Self::with_manager(plan, manager)
    }

    fn with_manager(plan: ExecutionPlan, manager: Arc<ConnectionManager>) -> Self {
        let supervisor = Arc::new(FailureSupervisor::new(plan.retry.clone()));
        Self {
            plan,
            manager,
            supervisor,
            stats: Arc::new(RunStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the run cooperatively: running lanes stop at the
    /// next iteration boundary, in-flight sends are allowed to finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live counters, observable while the run is in flight.
    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    /// Execute the plan to completion and produce the final report.
    pub async fn run(self) -> Result<RunReport, RunError> {
        self.plan.validate()?;

        // Resolve the generator before touching the broker: a contract
        // violation must surface before any producer exists.
        let loaded = PluginLoader::load(&self.plan.generator)?;
        let shared = match self.plan.sharing {
            SharingPolicy::Shared => {
                let instance = loaded.instantiate()?;
                Some(Arc::new(tokio::sync::Mutex::new(instance)))
            }
            SharingPolicy::PerLane => None,
        };

        info!(
            generator = loaded.identity(),
            endpoint = %self.plan.endpoint,
            destination = %self.plan.destination,
            lanes = self.plan.lanes,
            iterations = ?self.plan.iterations,
            rate = ?self.plan.rate,
            "run starting"
        );
        let started_at = Utc::now();
        let start = tokio::time::Instant::now();
        self.stats.init_lanes(self.plan.lanes);

        // Set up every lane before spawning any: producers are assigned to
        // lanes in index order, and a setup failure aborts the run whole.
        // Connections dialed for earlier lanes are torn down on that path.
        let lanes = match self.setup_lanes(&loaded, shared.as_ref()).await {
            Ok(lanes) => lanes,
            Err(err) => {
                self.manager.close_all().await;
                return Err(err);
            }
        };

        let handles: Vec<JoinHandle<LaneReport>> = lanes
            .into_iter()
            .map(|runtime| {
                let ctx = LaneContext {
                    iterations: self.plan.iterations,
                    duration: self.plan.duration,
                    rate: self.plan.rate,
                    retry: self.plan.retry.clone(),
                    supervisor: self.supervisor.clone(),
                    stats: self.stats.clone(),
                    cancel: self.cancel.clone(),
                };
                tokio::spawn(run_lane(runtime, ctx))
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (lane, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(join_err) => {
                    error!(lane, error = %join_err, "lane task aborted");
                    self.stats.set_lane_state(lane, LaneState::Failed);
                    reports.push(LaneReport {
                        lane,
                        state: LaneState::Failed,
                        sent: 0,
                        errors: 0,
                        failure: Some(format!("lane task aborted: {join_err}")),
                    });
                }
            }
        }

        self.manager.close_all().await;

        let elapsed = start.elapsed();
        let report = RunReport::build(
            loaded.identity().to_string(),
            self.plan.endpoint.to_string(),
            self.plan.destination.to_string(),
            started_at,
            elapsed,
            &self.stats,
            reports,
        );
        info!(
            sent = report.total_sent,
            errors = report.total_errors,
            elapsed_ms = report.elapsed_ms,
            rate = format!("{:.2} msg/sec", report.messages_per_second),
            success = report.success,
            "run complete"
        );
        Ok(report)
    }

    async fn setup_lanes(
        &self,
        loaded: &LoadedGenerator,
        shared: Option<&Arc<tokio::sync::Mutex<Box<dyn MessageGenerator>>>>,
    ) -> Result<Vec<LaneRuntime>, RunError> {
        let mut lanes = Vec::with_capacity(self.plan.lanes);
        for lane in 0..self.plan.lanes {
            let connection = self
                .manager
                .connect_with_retry(
                    &self.plan.endpoint,
                    self.plan.exclusive_connections,
                    &self.supervisor,
                )
                .await?;
            let producer = self
                .manager
                .create_producer(
                    &connection,
                    self.plan.destination.clone(),
                    self.plan.producer_opts(),
                )
                .await?;
            let generator = match shared {
                Some(instance) => GeneratorHandle::Shared(instance.clone()),
                None => GeneratorHandle::Exclusive(loaded.instantiate()?),
            };
            debug!(lane, connection = %connection.id(), "lane resources ready");
            lanes.push(LaneRuntime {
                lane,
                producer,
                generator,
            });
        }
        Ok(lanes)
    }
}

struct LaneRuntime {
    lane: usize,
    producer: LaneProducer,
    generator: GeneratorHandle,
}

struct LaneContext {
    iterations: Option<u64>,
    duration: Option<Duration>,
    rate: Option<f64>,
    retry: RetryPolicy,
    supervisor: Arc<FailureSupervisor>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
}

enum IterationOutcome {
    Sent,
    Errored,
    Fatal(String),
}

async fn run_lane(runtime: LaneRuntime, ctx: LaneContext) -> LaneReport {
    let LaneRuntime {
        lane,
        mut producer,
        mut generator,
    } = runtime;

    let mut sent = 0u64;
    let mut errors = 0u64;
    let mut remaining = ctx.iterations;
    let deadline = ctx.duration.map(|d| tokio::time::Instant::now() + d);
    let mut pacer = ctx.rate.map(Pacer::new);

    debug!(lane, "lane running");
    ctx.stats.set_lane_state(lane, LaneState::Running);
    let (state, failure) = loop {
        if ctx.cancel.is_cancelled() {
            break (LaneState::Cancelled, None);
        }
        if remaining == Some(0) {
            break (LaneState::Completed, None);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                break (LaneState::Completed, None);
            }
        }
        if producer.connection().is_failed() {
            // A sibling lane (or the supervisor) declared this connection
            // dead; the lane cannot make progress.
            break (
                LaneState::Failed,
                Some(format!(
                    "connection {} marked failed",
                    producer.connection().id()
                )),
            );
        }

        if let Some(pacer) = &mut pacer {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break (LaneState::Cancelled, None),
                _ = pacer.tick() => {}
            }
        }

        match run_iteration(lane, &mut producer, &mut generator, &ctx, &mut errors).await {
            IterationOutcome::Sent => {
                sent += 1;
                ctx.stats.record_sent();
                ctx.supervisor.on_success(producer.connection());
                if let Some(remaining) = &mut remaining {
                    *remaining -= 1;
                }
            }
            IterationOutcome::Errored => {
                if let Some(remaining) = &mut remaining {
                    *remaining -= 1;
                }
            }
            IterationOutcome::Fatal(reason) => {
                error!(lane, reason, "lane failed");
                break (LaneState::Failed, Some(reason));
            }
        }
    };

    producer.close().await;
    ctx.stats.set_lane_state(lane, state);
    info!(lane, state = %state, sent, errors, "lane finished");
    LaneReport {
        lane,
        state,
        sent,
        errors,
        failure,
    }
}

/// Drive one iteration: invoke the generator, retrying transient failures
/// with bounded exponential backoff.
async fn run_iteration(
    lane: usize,
    producer: &mut LaneProducer,
    generator: &mut GeneratorHandle,
    ctx: &LaneContext,
    errors: &mut u64,
) -> IterationOutcome {
    let mut attempt = 1u32;
    loop {
        let err = match generator.generate(producer).await {
            Ok(()) => return IterationOutcome::Sent,
            Err(err) => err,
        };

        match ctx.supervisor.classify_generator(&err) {
            FaultKind::Fatal => {
                if let GeneratorError::Send(send_err) = &err {
                    let _ = ctx.supervisor.on_failure(producer.connection(), send_err);
                }
                *errors += 1;
                ctx.stats.record_error(&err.to_string());
                return IterationOutcome::Fatal(err.to_string());
            }
            FaultKind::Transient => {
                *errors += 1;
                ctx.stats.record_error(&err.to_string());

                // Transient send errors also feed connection health; threshold
                // exhaustion there fails the lane like a fatal error would.
                if let GeneratorError::Send(send_err) = &err {
                    if let ReconnectDecision::GiveUp =
                        ctx.supervisor.on_failure(producer.connection(), send_err)
                    {
                        return IterationOutcome::Fatal(format!(
                            "connection gave up after repeated transient failures: {err}"
                        ));
                    }
                }

                if attempt >= ctx.retry.max_attempts {
                    warn!(lane, attempt, error = %err, "iteration retries exhausted");
                    return IterationOutcome::Errored;
                }
                let delay = ctx.retry.backoff_for(attempt);
                debug!(lane, attempt, ?delay, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_pacer_holds_fixed_rate() {
        let start = tokio::time::Instant::now();
        let mut pacer = Pacer::new(10.0); // 100ms period
        for _ in 0..5 {
            pacer.tick().await;
        }
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_pacer_catches_up_within_window() {
        let mut pacer = Pacer::new(10.0); // 100ms period
        // Stall for 250ms: two missed ticks, inside the catch-up window.
        tokio::time::advance(Duration::from_millis(250)).await;

        let before = tokio::time::Instant::now();
        pacer.tick().await;
        pacer.tick().await;
        // Both missed ticks fire immediately.
        assert_eq!(tokio::time::Instant::now(), before);

        // The third tick waits for the schedule again.
        pacer.tick().await;
        assert_eq!(
            tokio::time::Instant::now().duration_since(before),
            Duration::from_millis(50)
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_pacer_drops_backlog_after_long_stall() {
        let mut pacer = Pacer::new(10.0); // 100ms period, window = 400ms
        tokio::time::advance(Duration::from_secs(5)).await;

        let before = tokio::time::Instant::now();
        // The first tick after the stall fires immediately; the backlog is
        // dropped rather than burst.
        pacer.tick().await;
        assert_eq!(tokio::time::Instant::now(), before);
        pacer.tick().await;
        assert_eq!(
            tokio::time::Instant::now().duration_since(before),
            Duration::from_millis(100)
        );
    }
}
