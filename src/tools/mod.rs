//! Tool abstraction, dispatch, and failure recovery.

pub mod recovery;
pub mod registry;
pub mod tool;

pub use recovery::{ErrorCategory, ToolErrorRecovery, categorize_error};
pub use registry::ToolRegistry;
pub use tool::*;
