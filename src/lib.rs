//! Agentic runtime: a plan-act-observe loop with delegated sub-agents.

pub mod agent;
pub mod config;
pub mod error;
pub mod hooks;
pub mod llm;
pub mod logging;
pub mod tools;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
