//! Accumulate a streamed model response into one logical turn.

use std::collections::BTreeMap;

use futures::StreamExt;

use crate::error::LlmError;
use crate::llm::provider::{FinishReason, LlmProvider, StreamDelta, ToolCall, TurnRequest};

/// One full assistant response: text plus ordered tool calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

impl Turn {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds deltas into a [`Turn`]. Tool calls are ordered by stream index.
#[derive(Default)]
pub struct TurnAccumulator {
    content: String,
    calls: BTreeMap<usize, PartialCall>,
    finish_reason: Option<FinishReason>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::Content(text) => self.content.push_str(&text),
            StreamDelta::ToolCallStart { index, id, name } => {
                let call = self.calls.entry(index).or_default();
                call.id = id;
                call.name = name;
            }
            StreamDelta::ToolCallArguments { index, fragment } => {
                self.calls
                    .entry(index)
                    .or_default()
                    .arguments
                    .push_str(&fragment);
            }
            StreamDelta::Finish(reason) => self.finish_reason = Some(reason),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Current accumulated text, for partial-output reporting.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn finish(self) -> Turn {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_values()
            .map(|c| ToolCall {
                id: c.id,
                name: c.name,
                arguments: if c.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    c.arguments
                },
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        });

        Turn {
            content: self.content,
            tool_calls,
            finish_reason,
        }
    }
}

/// Request one streamed turn and fold it.
///
/// A stream that closes without a `Finish` delta is an error: the turn may be
/// truncated and must not be treated as a natural end.
pub async fn request_turn(llm: &dyn LlmProvider, request: TurnRequest) -> Result<Turn, LlmError> {
    let mut stream = llm.stream_turn(request).await?;
    let mut acc = TurnAccumulator::new();

    while let Some(delta) = stream.next().await {
        acc.push(delta?);
        if acc.is_finished() {
            break;
        }
    }

    if !acc.is_finished() {
        return Err(LlmError::StreamInterrupted {
            provider: llm.model_name().to_string(),
        });
    }

    let turn = acc.finish();
    tracing::debug!(
        model = llm.model_name(),
        content_len = turn.content.len(),
        tool_calls = turn.tool_calls.len(),
        finish = ?turn.finish_reason,
        "Model turn received"
    );
    Ok(turn)
}
