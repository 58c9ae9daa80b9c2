//! LLM integration.
//!
//! The runtime does not ship an HTTP client. It talks to any backend through
//! the streaming [`LlmProvider`] trait, and paces every call through a shared
//! [`RateLimiter`] via [`RateLimitedProvider`].

pub mod provider;
pub mod rate_limiter;
pub mod turn;

pub use provider::*;
pub use rate_limiter::{RateLimitedProvider, RateLimiter};
pub use turn::{Turn, TurnAccumulator, request_turn};
