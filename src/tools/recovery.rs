//! Tool failure classification, retry eligibility and recurring-failure
//! advisories.
//!
//! Every failed dispatch is classified against an ordered taxonomy and
//! counted per `(category, tool)`. Counts live inside a recency window: an
//! entry idle for longer than the window restarts from one. Once a pair
//! reaches the threshold, [`ToolErrorRecovery::build_advisory`] emits a line
//! suggesting a behavior change, and all qualifying lines are aggregated into
//! one block for the next model prompt. Advisories are not deduplicated: a
//! pattern that recurs after its window expired fires again.

use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;

/// Failure taxonomy, in match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Parse,
    FileRead,
    FilePatch,
    Permissions,
    Dependencies,
    Policy,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Parse => "parse",
            Self::FileRead => "file_read",
            Self::FilePatch => "file_patch",
            Self::Permissions => "permissions",
            Self::Dependencies => "dependencies",
            Self::Policy => "policy",
            Self::Unknown => "unknown",
        }
    }

    fn suggestion(&self, tool: &str) -> String {
        match self {
            Self::Transient => format!(
                "{tool} keeps hitting timeouts or rate limits; slow down and batch work instead of repeating the call immediately."
            ),
            Self::Parse => format!(
                "arguments for {tool} keep failing to parse; emit strictly valid JSON that matches the tool schema."
            ),
            Self::FileRead => format!(
                "{tool} keeps failing to read files; list the directory or search for the path before reading it."
            ),
            Self::FilePatch => format!(
                "{tool} edits keep failing to apply; re-read the file for its exact current contents and use a smaller, unique search block."
            ),
            Self::Permissions => format!(
                "{tool} is hitting permission errors; stay inside the writable workspace and do not retry the same path."
            ),
            Self::Dependencies => format!(
                "{tool} reports missing dependencies; check the project manifest and install or import what is missing first."
            ),
            Self::Policy => format!(
                "{tool} calls are being blocked by policy; choose a different approach rather than repeating the blocked action."
            ),
            Self::Unknown => format!(
                "{tool} has failed repeatedly with unclassified errors; stop and reconsider the approach."
            ),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static PATTERNS: LazyLock<Vec<(ErrorCategory, Regex)>> = LazyLock::new(|| {
    let table: &[(ErrorCategory, &str)] = &[
        (
            ErrorCategory::Transient,
            // Status codes only count next to an HTTP/status marker or their
            // reason phrase; bare numbers show up in line/column positions.
            r"(?i)(timed? ?out|\btimeout\b|etimedout|rate.?limit|too many requests|\b(https?|status|code)\b(/\d(\.\d)?)?\W{0,3}(408|429|500|502|503|504)\b|\b(408|429|500|502|503|504)\s+(request timeout|too many requests|internal server error|bad gateway|service unavailable|gateway time-?out)|service unavailable|bad gateway|econnreset|econnrefused|connection (reset|refused|closed|aborted)|broken pipe|temporarily unavailable|socket hang up)",
        ),
        (
            ErrorCategory::Parse,
            r"(?i)(\bparse\b|parsing|failed to parse|invalid json|unexpected (token|end|eof)|syntax error|expected value|malformed)",
        ),
        (
            ErrorCategory::FileRead,
            r"(?i)(no such file|enoent|file not found|not a file|is a directory|(failed to|cannot|could not) read)",
        ),
        (
            ErrorCategory::FilePatch,
            r"(?i)(\bpatch\b|\bhunk\b|search (string|text|block) not found|old_string|could not find .* to replace|no match(es)? found|failed to apply|edit failed)",
        ),
        (
            ErrorCategory::Permissions,
            r"(?i)(permission denied|eacces|eperm|operation not permitted|access denied|read-only file system|unauthori[sz]ed|forbidden)",
        ),
        (
            ErrorCategory::Dependencies,
            r"(?i)(module not found|cannot find module|no module named|unresolved import|could not resolve|package .* not found|command not found|not installed|missing dependency|can't find crate|cannot find crate)",
        ),
        (
            ErrorCategory::Policy,
            r"(?i)(\bblocked\b|\bpolicy\b|not allowed|denied by|disallowed|requires approval)",
        ),
    ];
    table
        .iter()
        .filter_map(|(category, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*category, re)),
            Err(e) => {
                tracing::error!(category = %category, error = %e, "Invalid error pattern");
                None
            }
        })
        .collect()
});

/// Classify an error message. First matching category wins.
pub fn categorize_error(text: &str) -> ErrorCategory {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Occurrence count for one `(category, tool)` pair.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord {
    pub count: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Shared failure tracker used by the loop and every sub-agent.
pub struct ToolErrorRecovery {
    window: Duration,
    threshold: u32,
    max_retries: u32,
    retry_base_delay: Duration,
    allow_list: HashSet<String>,
    records: Mutex<HashMap<(ErrorCategory, String), ErrorRecord>>,
}

impl ToolErrorRecovery {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            window: config.window,
            threshold: config.advisory_threshold.max(1),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            allow_list: config.retry_allow_list.iter().cloned().collect(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failed call may be retried automatically.
    ///
    /// Requires remaining attempts, an allow-listed (read-only) tool and a
    /// transient error. Mutating tools are never retried here.
    pub fn should_retry(&self, tool: &str, error: &str, attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries
            && self.allow_list.contains(tool)
            && categorize_error(error) == ErrorCategory::Transient
    }

    /// Backoff before retry number `attempt` (0-based): exponential with up to
    /// 25% added jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        base + base.mul_f64(jitter)
    }

    /// Classify and count a failure.
    pub fn record_error(&self, tool: &str, error: &str) -> ErrorCategory {
        self.record_error_at(tool, error, Instant::now())
    }

    pub(crate) fn record_error_at(&self, tool: &str, error: &str, now: Instant) -> ErrorCategory {
        let category = categorize_error(error);
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;

        let record = records
            .entry((category, tool.to_string()))
            .or_insert(ErrorRecord {
                count: 0,
                first_seen: now,
                last_seen: now,
            });

        if record.count > 0 && now.saturating_duration_since(record.last_seen) > window {
            // Window expired: start a fresh count.
            record.count = 0;
            record.first_seen = now;
        }
        record.count += 1;
        record.last_seen = now;

        tracing::debug!(
            tool = %tool,
            category = %category,
            count = record.count,
            "Recorded tool failure"
        );
        category
    }

    /// Snapshot of the count for one pair, ignoring staleness.
    pub fn count(&self, category: ErrorCategory, tool: &str) -> u32 {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(category, tool.to_string()))
            .map(|r| r.count)
            .unwrap_or(0)
    }

    /// Prune stale entries and aggregate every pair at or above the threshold
    /// into one prompt block.
    pub fn build_advisory(&self) -> Option<String> {
        self.build_advisory_at(Instant::now())
    }

    pub(crate) fn build_advisory_at(&self, now: Instant) -> Option<String> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window;
        records.retain(|_, r| now.saturating_duration_since(r.last_seen) <= window);

        let mut qualifying: Vec<(&(ErrorCategory, String), &ErrorRecord)> = records
            .iter()
            .filter(|(_, r)| r.count >= self.threshold)
            .collect();
        if qualifying.is_empty() {
            return None;
        }
        qualifying.sort_by(|a, b| a.0.cmp(b.0));

        let mut block = String::from("## Recurring tool failures\n");
        for ((category, tool), record) in qualifying {
            block.push_str(&format!(
                "- [{category}] {tool} failed {}x recently: {}\n",
                record.count,
                category.suggestion(tool)
            ));
        }
        Some(block)
    }
}

impl Default for ToolErrorRecovery {
    fn default() -> Self {
        Self::new(&RecoveryConfig::default())
    }
}
