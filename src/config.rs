//! Orchestrator configuration
//!
//! Defaults are plain constants so tests are deterministic. `from_env`
//! overlays environment variables (after loading a `.env` file if present)
//! and `from_yaml_str` reads a YAML document in which every duration is
//! given in whole seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{OrchestrationError, OrchestrationResult};

pub const ENV_MAX_SESSIONS: &str = "ORCH_MAX_SESSIONS";
pub const ENV_SESSION_TIMEOUT_SECS: &str = "ORCH_SESSION_TIMEOUT_SECS";
pub const ENV_GENERATION_TIMEOUT_SECS: &str = "ORCH_GENERATION_TIMEOUT_SECS";
pub const ENV_DISABLE_PARALLEL: &str = "ORCH_DISABLE_PARALLEL";

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_sessions: usize,
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
    pub enable_optimization: bool,
    pub enable_parallel_execution: bool,
    /// Longest allowed dependency chain, counted in edges
    pub max_domain_depth: usize,
    #[serde(with = "duration_secs")]
    pub context_propagation_ttl: Duration,
    /// Upper bound for one domain generation call; slower domains time out
    #[serde(with = "duration_secs")]
    pub generation_timeout: Duration,
    /// Base duration of a stage before complexity multipliers
    #[serde(with = "duration_secs")]
    pub base_stage_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            session_timeout: Duration::from_secs(24 * 60 * 60),
            enable_optimization: true,
            enable_parallel_execution: true,
            max_domain_depth: 5,
            context_propagation_ttl: Duration::from_secs(60 * 60),
            generation_timeout: Duration::from_secs(30),
            base_stage_duration: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_parallel_execution(mut self, enabled: bool) -> Self {
        self.enable_parallel_execution = enabled;
        self
    }

    pub fn with_max_domain_depth(mut self, depth: usize) -> Self {
        self.max_domain_depth = depth;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_base_stage_duration(mut self, duration: Duration) -> Self {
        self.base_stage_duration = duration;
        self
    }

    /// Defaults overlaid with `ORCH_*` environment variables
    pub fn from_env() -> OrchestrationResult<Self> {
        dotenvy::dotenv().ok();
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_str(yaml: &str) -> OrchestrationResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestrationError::Config(format!("invalid YAML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> OrchestrationResult<Self> {
        if let Some(raw) = lookup(ENV_MAX_SESSIONS) {
            self.max_concurrent_sessions = parse_env(ENV_MAX_SESSIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SESSION_TIMEOUT_SECS) {
            self.session_timeout = Duration::from_secs(parse_env(ENV_SESSION_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_GENERATION_TIMEOUT_SECS) {
            self.generation_timeout =
                Duration::from_secs(parse_env(ENV_GENERATION_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_DISABLE_PARALLEL) {
            let disabled = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
            self.enable_parallel_execution = !disabled;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(OrchestrationError::Config(
                "max_concurrent_sessions must be at least 1".to_string(),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(OrchestrationError::Config(
                "session_timeout must be positive".to_string(),
            ));
        }
        if self.max_domain_depth == 0 {
            warn!("max_domain_depth is 0; only dependency-free plans will be accepted");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> OrchestrationResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestrationError::Config(format!("{} has invalid value '{}'", key, raw)))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
