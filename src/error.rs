//! Error types for the agentic runtime.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Sub-agent error: {0}")]
    SubAgent(#[from] SubAgentError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Stream from {provider} ended before a finish reason was received")]
    StreamInterrupted { provider: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} blocked: {reason}")]
    Blocked { name: String, reason: String },
}

/// Sub-agent routing and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SubAgentError {
    #[error("Sub-agent {id} not found (never spawned or already completed)")]
    NotFound { id: Uuid },

    #[error("Sub-agent {id} did not answer within {timeout:?}")]
    Timeout { id: Uuid, timeout: Duration },

    #[error("Sub-agent {id} stopped before answering")]
    Closed { id: Uuid },

    #[error("Sub-agent {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

/// Scheduler errors. Only configuration and use-after-shutdown can fail.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    #[error("Scheduler is shutting down and no longer accepts work")]
    ShuttingDown,

    #[error("Scheduler task has stopped")]
    Stopped,
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
