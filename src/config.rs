//! Execution plan: the immutable configuration a run is resolved from.
//!
//! A plan is built once, from CLI flags or a YAML plan file, validated before
//! any lane starts, and passed by reference into every component. There is no
//! ambient global configuration.

use crate::supervisor::RetryPolicy;
use broker_client::{
    DeliveryMode, Destination, Endpoint, EndpointParseError, ProducerOpts, DEFAULT_SEND_TIMEOUT,
};
use generator_plugin::{GeneratorSpec, SharingPolicy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid plan, surfaced before any work begins; aborts the whole run.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(transparent)]
    Endpoint(#[from] EndpointParseError),

    #[error("lane count must be at least 1")]
    ZeroLanes,

    #[error("rate must be positive, got {0}")]
    NonPositiveRate(f64),

    #[error("duration must be positive")]
    ZeroDuration,

    #[error("max attempts must be at least 1")]
    ZeroAttempts,

    #[error("base backoff {0:?} exceeds max backoff {1:?}")]
    BackoffRange(Duration, Duration),

    #[error("plugin path must not be empty")]
    EmptyPluginPath,

    #[error("destination name must not be empty")]
    EmptyDestination,

    #[error("failed to read plan file: {0}")]
    PlanRead(#[from] std::io::Error),

    #[error("failed to parse plan file: {0}")]
    PlanParse(#[from] serde_yaml::Error),
}

/// Immutable configuration resolved before a run starts.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub endpoint: Endpoint,
    pub destination: Destination,
    pub delivery_mode: DeliveryMode,
    pub ttl: Option<Duration>,
    /// Iterations per lane; `None` means unbounded.
    pub iterations: Option<u64>,
    /// Wall-clock bound per lane; whichever of iterations/duration is hit
    /// first terminates the lane.
    pub duration: Option<Duration>,
    pub lanes: usize,
    /// Target rate per lane in messages/second; `None` runs unpaced.
    pub rate: Option<f64>,
    pub generator: GeneratorSpec,
    pub sharing: SharingPolicy,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    /// Give each lane a dedicated connection instead of pooling by endpoint.
    pub exclusive_connections: bool,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::parse("mem://local").expect("default endpoint is valid"),
            destination: Destination::Topic("loadtest".to_string()),
            delivery_mode: DeliveryMode::default(),
            ttl: None,
            iterations: None,
            duration: None,
            lanes: 1,
            rate: None,
            generator: GeneratorSpec::Builtin {
                name: "hello-world".to_string(),
            },
            sharing: SharingPolicy::PerLane,
            retry: RetryPolicy::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            exclusive_connections: false,
        }
    }
}

impl ExecutionPlan {
    /// Load a plan from a YAML file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a plan from YAML.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        let file: PlanFile = serde_yaml::from_str(content)?;
        file.try_into()
    }

    /// Check the plan for contradictions before any lane starts.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lanes == 0 {
            return Err(ConfigurationError::ZeroLanes);
        }
        if let Some(rate) = self.rate {
            if rate <= 0.0 || !rate.is_finite() {
                return Err(ConfigurationError::NonPositiveRate(rate));
            }
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(ConfigurationError::ZeroDuration);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::ZeroAttempts);
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(ConfigurationError::BackoffRange(
                self.retry.base_backoff,
                self.retry.max_backoff,
            ));
        }
        if let GeneratorSpec::Dynamic { library, .. } = &self.generator {
            if library.as_os_str().is_empty() {
                return Err(ConfigurationError::EmptyPluginPath);
            }
        }
        if self.destination.name().is_empty() {
            return Err(ConfigurationError::EmptyDestination);
        }
        Ok(())
    }

    /// Producer options derived from the plan.
    pub fn producer_opts(&self) -> ProducerOpts {
        ProducerOpts {
            delivery_mode: self.delivery_mode,
            ttl: self.ttl,
            send_timeout: self.send_timeout,
        }
    }
}

/// YAML form of a plan; flat fields mirroring the CLI flags.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub endpoint: String,
    pub destination: Destination,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default = "default_generator")]
    pub generator: String,
    #[serde(default)]
    pub plugin_path: Option<PathBuf>,
    #[serde(default)]
    pub plugin_symbol: Option<String>,
    #[serde(default)]
    pub shared_generator: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub base_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,
    #[serde(default)]
    pub exclusive_connections: bool,
}

fn default_lanes() -> usize {
    1
}

fn default_generator() -> String {
    "hello-world".to_string()
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

impl TryFrom<PlanFile> for ExecutionPlan {
    type Error = ConfigurationError;

    fn try_from(file: PlanFile) -> Result<Self, Self::Error> {
        let defaults = RetryPolicy::default();
        let generator = resolve_generator_spec(
            &file.generator,
            file.plugin_path.clone(),
            file.plugin_symbol.clone(),
        );
        Ok(ExecutionPlan {
            endpoint: Endpoint::parse(&file.endpoint)?,
            destination: file.destination,
            delivery_mode: file.delivery_mode,
            ttl: file.ttl_ms.map(Duration::from_millis),
            iterations: file.iterations,
            duration: file.duration_secs.map(Duration::from_secs),
            lanes: file.lanes,
            rate: file.rate,
            generator,
            sharing: if file.shared_generator {
                SharingPolicy::Shared
            } else {
                SharingPolicy::PerLane
            },
            retry: RetryPolicy {
                max_attempts: file.max_attempts,
                base_backoff: file
                    .base_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_backoff),
                max_backoff: file
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
            },
            send_timeout: file
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
            exclusive_connections: file.exclusive_connections,
        })
    }
}

/// A plugin path selects a dynamic generator; otherwise the name resolves
/// against the builtin registry.
pub fn resolve_generator_spec(
    name: &str,
    plugin_path: Option<PathBuf>,
    plugin_symbol: Option<String>,
) -> GeneratorSpec {
    match plugin_path {
        Some(library) => GeneratorSpec::Dynamic {
            library,
            symbol: plugin_symbol,
        },
        None => GeneratorSpec::Builtin {
            name: name.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_valid() {
        assert!(ExecutionPlan::default().validate().is_ok());
    }

    #[test]
    fn test_zero_iterations_is_valid() {
        let plan = ExecutionPlan {
            iterations: Some(0),
            ..Default::default()
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let plan = ExecutionPlan {
            lanes: 0,
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigurationError::ZeroLanes)
        ));

        let plan = ExecutionPlan {
            rate: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigurationError::NonPositiveRate(_))
        ));

        let plan = ExecutionPlan {
            retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigurationError::ZeroAttempts)
        ));

        let plan = ExecutionPlan {
            generator: GeneratorSpec::Dynamic {
                library: PathBuf::new(),
                symbol: None,
            },
            ..Default::default()
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigurationError::EmptyPluginPath)
        ));
    }

    #[test]
    fn test_plan_from_yaml() {
        let yaml = r#"
endpoint: mem://local
destination:
  kind: topic
  name: events
iterations: 100
lanes: 4
rate: 50.0
generator: sequential-text
max_attempts: 5
shared_generator: true
"#;
        let plan = ExecutionPlan::from_yaml(yaml).unwrap();
        assert_eq!(plan.lanes, 4);
        assert_eq!(plan.iterations, Some(100));
        assert_eq!(plan.rate, Some(50.0));
        assert_eq!(plan.sharing, SharingPolicy::Shared);
        assert_eq!(plan.retry.max_attempts, 5);
        assert_eq!(
            plan.generator,
            GeneratorSpec::Builtin {
                name: "sequential-text".to_string()
            }
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_from_yaml_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"
endpoint: mem://local
destination:
  kind: queue
  name: jobs
iterations: 10
lanes: 2
"#,
        )
        .unwrap();

        let plan = ExecutionPlan::from_yaml_file(file.path()).unwrap();
        assert_eq!(plan.destination, Destination::Queue("jobs".to_string()));
        assert_eq!(plan.iterations, Some(10));
        assert_eq!(plan.lanes, 2);
    }

    #[test]
    fn test_missing_plan_file_is_read_error() {
        let err =
            ExecutionPlan::from_yaml_file(std::path::Path::new("/nonexistent/plan.yaml"))
                .unwrap_err();
        assert!(matches!(err, ConfigurationError::PlanRead(_)));
    }

    #[test]
    fn test_plan_from_yaml_rejects_unknown_fields() {
        let yaml = r#"
endpoint: mem://local
destination:
  kind: topic
  name: events
no_such_field: 1
"#;
        assert!(matches!(
            ExecutionPlan::from_yaml(yaml),
            Err(ConfigurationError::PlanParse(_))
        ));
    }

    #[test]
    fn test_plugin_path_selects_dynamic_spec() {
        let spec = resolve_generator_spec(
            "custom",
            Some(PathBuf::from("./libgen.so")),
            Some("entry".to_string()),
        );
        assert_eq!(
            spec,
            GeneratorSpec::Dynamic {
                library: PathBuf::from("./libgen.so"),
                symbol: Some("entry".to_string()),
            }
        );
    }
}
