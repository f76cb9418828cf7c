// Engine configuration
//
// Defaults come from each component's Default impl; `from_env` overlays
// SIMFLOW_* variables (after loading a .env file when present). Durations are
// integer milliseconds everywhere.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conductor::ConductorConfig;
use crate::error::ConfigError;
use crate::pipeline::{FailurePolicy, PipelineConfig};
use crate::reliability::{BackoffPolicy, CircuitBreakerConfig};
use crate::routing::WorkflowRouter;

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimflowConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub conductor: ConductorConfig,
}

impl SimflowConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `SIMFLOW_MAX_CONCURRENCY`: jobs running at once (default: 16)
    /// - `SIMFLOW_TASK_TIMEOUT_MS`: per-job limit (default: none)
    /// - `SIMFLOW_TASK_WAIT_TIMEOUT_MS`: performer wait budget (default: 3600000)
    /// - `SIMFLOW_MAX_RETRIES`: retries per node (default: 3)
    /// - `SIMFLOW_RETRY_BASE_MS` / `SIMFLOW_RETRY_MAX_MS`: backoff bounds (default: 1000 / 60000)
    /// - `SIMFLOW_RETRY_JITTER`: jitter factor 0.0-1.0 (default: 0)
    /// - `SIMFLOW_BREAKER_THRESHOLD`: failures before a breaker opens (default: 5)
    /// - `SIMFLOW_BREAKER_COOL_DOWN_MS`: open period before a probe (default: 30000)
    /// - `SIMFLOW_MAX_ITERATIONS`: refinement budget (default: 3)
    /// - `SIMFLOW_WORKFLOW_TIMEOUT_MS`: workflow limit (default: none)
    /// - `SIMFLOW_JOIN_POLICY`: `strict` or `tolerant` (default: strict)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let source = Lookup(lookup);

        if let Some(max) = source.parse("SIMFLOW_MAX_CONCURRENCY")? {
            config.pipeline.max_concurrency = max;
        }
        if let Some(ms) = source.parse("SIMFLOW_TASK_TIMEOUT_MS")? {
            config.pipeline.task_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = source.parse("SIMFLOW_TASK_WAIT_TIMEOUT_MS")? {
            config.conductor.task_wait_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = source.parse("SIMFLOW_MAX_RETRIES")? {
            config.backoff.max_retries = retries;
        }
        if let Some(ms) = source.parse("SIMFLOW_RETRY_BASE_MS")? {
            config.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = source.parse("SIMFLOW_RETRY_MAX_MS")? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = source.parse("SIMFLOW_RETRY_JITTER")? {
            config.backoff.jitter = jitter;
        }
        if let Some(threshold) = source.parse("SIMFLOW_BREAKER_THRESHOLD")? {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = source.parse("SIMFLOW_BREAKER_COOL_DOWN_MS")? {
            config.breaker.cool_down = Duration::from_millis(ms);
        }
        if let Some(max) = source.parse("SIMFLOW_MAX_ITERATIONS")? {
            config.conductor.max_iterations = max;
        }
        if let Some(ms) = source.parse("SIMFLOW_WORKFLOW_TIMEOUT_MS")? {
            config.conductor.workflow_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(policy) = source.get("SIMFLOW_JOIN_POLICY") {
            config.conductor.join_policy = match policy.to_lowercase().as_str() {
                "strict" => FailurePolicy::Strict,
                "tolerant" => FailurePolicy::Tolerant,
                _ => {
                    return Err(ConfigError::Parse {
                        var: "SIMFLOW_JOIN_POLICY".to_string(),
                        value: policy,
                        reason: "expected 'strict' or 'tolerant'".to_string(),
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be at least 1"));
        }
        if self.conductor.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be at least 1"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(ConfigError::invalid(
                "base_delay",
                format!(
                    "{:?} exceeds max_delay {:?}",
                    self.backoff.base_delay, self.backoff.max_delay
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::invalid("jitter", "must be within 0.0-1.0"));
        }
        Ok(())
    }

    /// Router built from the backoff and breaker settings
    pub fn router(&self) -> WorkflowRouter {
        WorkflowRouter::new(self.backoff.clone(), self.breaker.clone())
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Parse {
                    var: var.to_string(),
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = SimflowConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SimflowConfig::default());
        assert_eq!(config.conductor.max_iterations, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_overrides_from_variables() {
        let config = SimflowConfig::from_lookup(lookup(&[
            ("SIMFLOW_MAX_CONCURRENCY", "4"),
            ("SIMFLOW_TASK_TIMEOUT_MS", "90000"),
            ("SIMFLOW_MAX_RETRIES", "5"),
            ("SIMFLOW_RETRY_BASE_MS", "250"),
            ("SIMFLOW_RETRY_MAX_MS", "8000"),
            ("SIMFLOW_BREAKER_THRESHOLD", "2"),
            ("SIMFLOW_MAX_ITERATIONS", " 6 "),
            ("SIMFLOW_JOIN_POLICY", "Tolerant"),
        ]))
        .unwrap();

        assert_eq!(config.pipeline.max_concurrency, 4);
        assert_eq!(config.pipeline.task_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.conductor.max_iterations, 6);
        assert_eq!(config.conductor.join_policy, FailurePolicy::Tolerant);
        assert_eq!(config.router().backoff().max_retries, 5);
    }

    #[test]
    fn test_unparsable_value_names_variable() {
        let err = SimflowConfig::from_lookup(lookup(&[("SIMFLOW_MAX_RETRIES", "many")])).unwrap_err();
        match err {
            ConfigError::Parse { var, value, .. } => {
                assert_eq!(var, "SIMFLOW_MAX_RETRIES");
                assert_eq!(value, "many");
            }
            other => panic!("Expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_inconsistent_values_are_rejected() {
        let err = SimflowConfig::from_lookup(lookup(&[
            ("SIMFLOW_RETRY_BASE_MS", "5000"),
            ("SIMFLOW_RETRY_MAX_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "base_delay", .. }));

        let err = SimflowConfig::from_lookup(lookup(&[("SIMFLOW_MAX_ITERATIONS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "max_iterations", .. }));

        let err = SimflowConfig::from_lookup(lookup(&[("SIMFLOW_JOIN_POLICY", "lenient")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_deserialize_partial_document() {
        let config: SimflowConfig =
            serde_json::from_str(r#"{"breaker": {"failure_threshold": 3, "cool_down": 1500}}"#).unwrap();
        assert_eq!(config.breaker.cool_down, Duration::from_millis(1500));
        assert_eq!(config.pipeline, PipelineConfig::default());
    }
}
