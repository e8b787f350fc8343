//! Command-line interface for mq-loadgen
//!
//! # Usage Examples
//!
//! ```bash
//! # 1000 iterations of the builtin hello-world generator, in-memory broker
//! mq-loadgen run -I 1000
//!
//! # Sustained load against Kafka: 4 lanes, 50 msg/sec per lane
//! mq-loadgen run \
//!   --endpoint kafka://localhost:9092 \
//!   --destination events \
//!   --lanes 4 --rate 50 -I 10000
//!
//! # Time-bound run with a custom generator library
//! mq-loadgen run -G custom -X ./libmy_generator.so --duration-secs 60
//!
//! # Reproducible runs from a plan file, with a JSON report
//! mq-loadgen run --plan loadtest.yaml --report-output report.json
//! ```
//!
//! Exit status: 0 when every lane completed without fatal failure, 2 for
//! configuration/plugin errors (nothing ran), 1 for run-time failures.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mq_loadgen::config::resolve_generator_spec;
use mq_loadgen::{ConfigurationError, ExecutionPlan, ExecutionScheduler, RetryPolicy, RunError, RunReport};
use broker_client::{DeliveryMode, Destination, Endpoint, DEFAULT_SEND_TIMEOUT};
use generator_plugin::{PluginError, SharingPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "mq-loadgen")]
#[command(about = "A plugin-driven load generator for message brokers")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a load-generation run
    Run(Box<RunArgs>),

    /// List the builtin generators
    ListGenerators,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DestinationKind {
    Topic,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeliveryModeArg {
    NonPersistent,
    Persistent,
}

impl From<DeliveryModeArg> for DeliveryMode {
    fn from(mode: DeliveryModeArg) -> Self {
        match mode {
            DeliveryModeArg::NonPersistent => DeliveryMode::NonPersistent,
            DeliveryModeArg::Persistent => DeliveryMode::Persistent,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Broker endpoint URL (mem://name or kafka://host:port[,host:port])
    #[arg(long, default_value = "mem://local", env = "MQ_LOADGEN_ENDPOINT")]
    endpoint: String,

    /// Destination name
    #[arg(long, default_value = "loadtest")]
    destination: String,

    /// Destination type
    #[arg(long, value_enum, default_value_t = DestinationKind::Topic)]
    destination_type: DestinationKind,

    /// Iterations per lane; unbounded when omitted
    #[arg(short = 'I', long)]
    iterations: Option<u64>,

    /// Wall-clock bound per lane, in seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Number of concurrent lanes
    #[arg(long, default_value = "1")]
    lanes: usize,

    /// Target send rate per lane, in messages per second
    #[arg(long)]
    rate: Option<f64>,

    /// Builtin generator name (see list-generators)
    #[arg(short = 'G', long, default_value = "hello-world")]
    generator: String,

    /// Path to a generator plugin library; overrides --generator
    #[arg(short = 'X', long)]
    plugin_path: Option<PathBuf>,

    /// Entry symbol in the plugin library (default: mq_loadgen_generator_entry)
    #[arg(long)]
    plugin_symbol: Option<String>,

    /// Share one generator instance across all lanes instead of one per lane
    #[arg(long)]
    shared_generator: bool,

    /// Maximum send attempts per iteration
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Delivery mode
    #[arg(long, value_enum, default_value_t = DeliveryModeArg::NonPersistent)]
    delivery_mode: DeliveryModeArg,

    /// Message time-to-live in milliseconds
    #[arg(long)]
    ttl_ms: Option<u64>,

    /// Per-send timeout in milliseconds
    #[arg(long, default_value = "30000")]
    send_timeout_ms: u64,

    /// Give each lane a dedicated broker connection
    #[arg(long)]
    exclusive_connections: bool,

    /// YAML plan file; when set, the other flags are ignored
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Write the JSON run report to this path
    #[arg(long)]
    report_output: Option<PathBuf>,
}

impl RunArgs {
    fn to_plan(&self) -> Result<ExecutionPlan, ConfigurationError> {
        if let Some(path) = &self.plan {
            return ExecutionPlan::from_yaml_file(path);
        }
        let destination = match self.destination_type {
            DestinationKind::Topic => Destination::Topic(self.destination.clone()),
            DestinationKind::Queue => Destination::Queue(self.destination.clone()),
        };
        let defaults = RetryPolicy::default();
        Ok(ExecutionPlan {
            endpoint: Endpoint::parse(&self.endpoint)?,
            destination,
            delivery_mode: self.delivery_mode.into(),
            ttl: self.ttl_ms.map(Duration::from_millis),
            iterations: self.iterations,
            duration: self.duration_secs.map(Duration::from_secs),
            lanes: self.lanes,
            rate: self.rate,
            generator: resolve_generator_spec(
                &self.generator,
                self.plugin_path.clone(),
                self.plugin_symbol.clone(),
            ),
            sharing: if self.shared_generator {
                SharingPolicy::Shared
            } else {
                SharingPolicy::PerLane
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..defaults
            },
            send_timeout: if self.send_timeout_ms == 0 {
                DEFAULT_SEND_TIMEOUT
            } else {
                Duration::from_millis(self.send_timeout_ms)
            },
            exclusive_connections: self.exclusive_connections,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(&args).await,
        Commands::ListGenerators => {
            for name in generator_plugin::builtin::builtin_names() {
                println!("{name}");
            }
            EXIT_OK
        }
    };
    std::process::exit(code);
}

async fn run(args: &RunArgs) -> i32 {
    let plan = match args.to_plan() {
        Ok(plan) => plan,
        Err(e) => {
            error!("invalid configuration: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    if let Err(e) = plan.validate() {
        error!("invalid configuration: {e}");
        return EXIT_CONFIG_ERROR;
    }

    let scheduler = ExecutionScheduler::new(plan);
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    match scheduler.run().await {
        Ok(report) => {
            print_summary(&report);
            if let Some(path) = &args.report_output {
                if let Err(e) = write_report(&report, path) {
                    error!("failed to write report: {e:#}");
                    return EXIT_RUNTIME_FAILURE;
                }
                info!("report written to {}", path.display());
            }
            if report.success {
                EXIT_OK
            } else {
                EXIT_RUNTIME_FAILURE
            }
        }
        Err(RunError::Config(e)) => {
            error!("invalid configuration: {e}");
            EXIT_CONFIG_ERROR
        }
        Err(RunError::Plugin(e @ (PluginError::Contract { .. } | PluginError::Io(_)))) => {
            error!("generator could not be loaded: {e}");
            EXIT_CONFIG_ERROR
        }
        Err(e) => {
            error!("run failed: {e}");
            EXIT_RUNTIME_FAILURE
        }
    }
}

fn print_summary(report: &RunReport) {
    info!(
        "sent {} messages ({} errors) in {:.2}s ({:.2} msg/sec)",
        report.total_sent,
        report.total_errors,
        report.elapsed_ms as f64 / 1000.0,
        report.messages_per_second
    );
    for lane in &report.lanes {
        match &lane.failure {
            Some(failure) => warn!(
                "lane {}: {} (sent {}, errors {}): {failure}",
                lane.lane, lane.state, lane.sent, lane.errors
            ),
            None => info!(
                "lane {}: {} (sent {}, errors {})",
                lane.lane, lane.state, lane.sent, lane.errors
            ),
        }
    }
}

fn write_report(report: &RunReport, path: &std::path::Path) -> anyhow::Result<()> {
    report
        .write_json(path)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    Ok(())
}
