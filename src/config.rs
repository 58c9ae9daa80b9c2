//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Prefix for every environment variable read by [`RuntimeConfig::from_env`].
const ENV_PREFIX: &str = "AGENTIC_";

/// Primary-session loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent name for identification in logs.
    pub name: String,
    /// Maximum model turns per user message (`None` = unbounded).
    pub max_iterations: Option<u32>,
    /// System prompt prepended when the conversation has none.
    pub system_prompt: Option<String>,
    /// Message cap applied by the history-trim pass.
    pub max_history_messages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agentic-runtime".to_string(),
            max_iterations: Some(50),
            system_prompt: None,
            max_history_messages: 200,
        }
    }
}

/// Defaults applied to every spawned sub-agent.
#[derive(Debug, Clone)]
pub struct SubAgentDefaults {
    /// Iteration cap for a sub-agent run.
    pub max_iterations: u32,
    /// How long a finished sub-agent waits for follow-up input (zero = none).
    pub input_grace: Duration,
    /// Default timeout for synchronous message-and-wait calls.
    pub message_timeout: Duration,
}

impl Default for SubAgentDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            input_grace: Duration::ZERO,
            message_timeout: Duration::from_secs(120),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running sub-agents.
    pub capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { capacity: 3 }
    }
}

/// Model-call pacing configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between completed acquisitions.
    pub min_interval: Duration,
    /// Add up to 50% of the remaining wait as random jitter.
    pub jitter: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            jitter: true,
        }
    }
}

/// Tool failure classification and retry configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Recency window for recurring-failure counts.
    pub window: Duration,
    /// Occurrences within the window before an advisory line is emitted.
    pub advisory_threshold: u32,
    /// Retry attempts allowed for transient failures of allow-listed tools.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Idempotent / read-only tools that may be retried automatically.
    pub retry_allow_list: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            advisory_threshold: 3,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            retry_allow_list: [
                "read_file",
                "list_dir",
                "glob",
                "grep",
                "search",
                "web_fetch",
                "agent_status",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (defaults to `info`).
    pub default_filter: Option<String>,
    /// Directory for a daily-rolling log file, in addition to stderr.
    pub log_dir: Option<std::path::PathBuf>,
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub subagents: SubAgentDefaults,
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Build a configuration from `AGENTIC_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = get("NAME") {
            config.agent.name = v;
        }
        if let Some(v) = get("MAX_ITERATIONS") {
            // 0 means unbounded
            let n: u32 = parse_value("MAX_ITERATIONS", &v)?;
            config.agent.max_iterations = (n > 0).then_some(n);
        }
        if let Some(v) = get("SYSTEM_PROMPT") {
            config.agent.system_prompt = Some(v);
        }
        if let Some(v) = get("MAX_HISTORY_MESSAGES") {
            config.agent.max_history_messages = parse_value("MAX_HISTORY_MESSAGES", &v)?;
        }

        if let Some(v) = get("SUBAGENT_MAX_ITERATIONS") {
            config.subagents.max_iterations = parse_value("SUBAGENT_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = get("SUBAGENT_INPUT_GRACE_MS") {
            config.subagents.input_grace = parse_millis("SUBAGENT_INPUT_GRACE_MS", &v)?;
        }
        if let Some(v) = get("SUBAGENT_MESSAGE_TIMEOUT_MS") {
            config.subagents.message_timeout = parse_millis("SUBAGENT_MESSAGE_TIMEOUT_MS", &v)?;
        }

        if let Some(v) = get("MAX_CONCURRENT_AGENTS") {
            let capacity: usize = parse_value("MAX_CONCURRENT_AGENTS", &v)?;
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}MAX_CONCURRENT_AGENTS"),
                    message: "must be at least 1".to_string(),
                });
            }
            config.scheduler.capacity = capacity;
        }

        if let Some(v) = get("RATE_LIMIT_MS") {
            config.rate_limit.min_interval = parse_millis("RATE_LIMIT_MS", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_JITTER") {
            config.rate_limit.jitter = parse_value("RATE_LIMIT_JITTER", &v)?;
        }

        if let Some(v) = get("ERROR_WINDOW_SECS") {
            let secs: u64 = parse_value("ERROR_WINDOW_SECS", &v)?;
            config.recovery.window = Duration::from_secs(secs);
        }
        if let Some(v) = get("ADVISORY_THRESHOLD") {
            config.recovery.advisory_threshold = parse_value("ADVISORY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("TOOL_MAX_RETRIES") {
            config.recovery.max_retries = parse_value("TOOL_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_ALLOW_LIST") {
            config.recovery.retry_allow_list = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = get("LOG_FILTER") {
            config.logging.default_filter = Some(v);
        }
        if let Some(v) = get("LOG_DIR") {
            config.logging.log_dir = Some(v.into());
        }

        Ok(config)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            message: e.to_string(),
        })
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_value::<u64>(key, raw).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.scheduler.capacity, 3);
        assert_eq!(config.agent.max_iterations, Some(50));
        assert_eq!(config.recovery.advisory_threshold, 3);
        assert!(config.rate_limit.jitter);
    }

    #[test]
    fn overrides_from_env() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("AGENTIC_MAX_CONCURRENT_AGENTS", "5"),
            ("AGENTIC_MAX_ITERATIONS", "0"),
            ("AGENTIC_RATE_LIMIT_MS", "250"),
            ("AGENTIC_RETRY_ALLOW_LIST", "read_file, grep ,"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.capacity, 5);
        assert_eq!(config.agent.max_iterations, None);
        assert_eq!(config.rate_limit.min_interval, Duration::from_millis(250));
        assert_eq!(config.recovery.retry_allow_list, vec!["read_file", "grep"]);
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[("AGENTIC_MAX_CONCURRENT_AGENTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unparsable_value_rejected() {
        let err =
            RuntimeConfig::from_lookup(lookup(&[("AGENTIC_RATE_LIMIT_MS", "soon")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "AGENTIC_RATE_LIMIT_MS"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
