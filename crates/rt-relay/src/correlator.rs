use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

/// A tool call whose arguments are complete and which has now been marked as
/// dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub call_id: String,
    pub tool_name: Option<String>,
    pub previous_item_id: Option<String>,
    pub arguments: String,
}

/// Completion for a call id that has already been dispatched, or that the
/// correlator has nothing for.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown call id '{call_id}'")]
pub struct UnknownCall {
    pub call_id: String,
    /// Tool the id was first dispatched to, so the error can be routed the
    /// same way.
    pub previous_tool: Option<String>,
}

#[derive(Debug, Default)]
struct CallRecord {
    tool_name: Option<String>,
    previous_item_id: Option<String>,
    arguments: String,
}

/// Per-session bookkeeping of in-flight tool calls.
///
/// Owned by the upstream pump, so no locking.
#[derive(Debug, Default)]
pub struct CallCorrelator {
    pending: HashMap<String, CallRecord>,
    /// call id -> tool name, for every id already dispatched.
    dispatched: HashMap<String, Option<String>>,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record metadata from the item announcement of a `function_call`.
    pub fn on_call_started(
        &mut self,
        call_id: &str,
        tool_name: Option<&str>,
        previous_item_id: Option<&str>,
    ) {
        if self.dispatched.contains_key(call_id) {
            warn!(%call_id, "call announced after dispatch, ignored");
            return;
        }
        let record = self.pending.entry(call_id.to_string()).or_default();
        if let Some(name) = tool_name {
            record.tool_name = Some(name.to_string());
        }
        if let Some(prev) = previous_item_id {
            record.previous_item_id = Some(prev.to_string());
        }
    }

    /// Append a streamed argument fragment. Returns `false` if the fragment
    /// was ignored because the call was already dispatched.
    pub fn on_argument_fragment(
        &mut self,
        call_id: &str,
        tool_name: Option<&str>,
        fragment: &str,
    ) -> bool {
        if self.dispatched.contains_key(call_id) {
            warn!(%call_id, "argument fragment after dispatch, ignored");
            return false;
        }
        let record = self.pending.entry(call_id.to_string()).or_default();
        if record.tool_name.is_none() {
            record.tool_name = tool_name.map(str::to_string);
        }
        record.arguments.push_str(fragment);
        true
    }

    /// Finalize a call. The buffered fragments win; `final_arguments` (as
    /// carried on the completion event) is only used when nothing was
    /// buffered. Each call id completes at most once.
    pub fn on_arguments_complete(
        &mut self,
        call_id: &str,
        final_arguments: Option<&str>,
        tool_name: Option<&str>,
    ) -> Result<CompletedCall, UnknownCall> {
        if let Some(previous_tool) = self.dispatched.get(call_id) {
            return Err(UnknownCall {
                call_id: call_id.to_string(),
                previous_tool: previous_tool.clone(),
            });
        }

        let record = match self.pending.remove(call_id) {
            Some(record) => record,
            None if final_arguments.is_some() => CallRecord::default(),
            None => {
                return Err(UnknownCall {
                    call_id: call_id.to_string(),
                    previous_tool: None,
                })
            }
        };

        let arguments = if record.arguments.is_empty() {
            final_arguments.unwrap_or_default().to_string()
        } else {
            record.arguments
        };
        let tool_name = record.tool_name.or_else(|| tool_name.map(str::to_string));

        self.dispatched.insert(call_id.to_string(), tool_name.clone());

        Ok(CompletedCall {
            call_id: call_id.to_string(),
            tool_name,
            previous_item_id: record.previous_item_id,
            arguments,
        })
    }

    /// Calls with a record but no completion yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn was_dispatched(&self, call_id: &str) -> bool {
        self.dispatched.contains_key(call_id)
    }
}
