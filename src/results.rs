//! Dashboard history of tool results.
//!
//! Keeps the last few structured results the assistant produced, plus the text
//! the live dashboard should show right now.

use crate::tools::ToolResult;

/// How many previous results the dashboard keeps.
pub const MAX_CONTEXT_CHATS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultHistory {
    entries: Vec<ToolResult>,
    live_prompt: String,
    dashboard_error: String,
}

impl ResultHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result and update the live dashboard text.
    ///
    /// - Error results set the dashboard error and clear the prompt
    /// - Results with a summary replace the prompt and clear the error
    /// - Anything else clears the prompt
    pub fn record(&mut self, result: ToolResult) {
        match &result {
            ToolResult::Error { error } => {
                self.dashboard_error = error.clone();
                self.live_prompt.clear();
            }
            other => {
                self.dashboard_error.clear();
                self.live_prompt = other.summary().unwrap_or_default();
            }
        }

        self.entries.push(result);
        if self.entries.len() > MAX_CONTEXT_CHATS {
            let overflow = self.entries.len() - MAX_CONTEXT_CHATS;
            self.entries.drain(..overflow);
        }
    }

    /// Oldest first.
    pub fn entries(&self) -> &[ToolResult] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&ToolResult> {
        self.entries.last()
    }

    pub fn live_prompt(&self) -> &str {
        &self.live_prompt
    }

    pub fn dashboard_error(&self) -> &str {
        &self.dashboard_error
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.live_prompt.clear();
        self.dashboard_error.clear();
    }
}
