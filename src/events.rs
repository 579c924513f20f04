//! UI-facing notifications.
//!
//! The session and the tool dispatcher never render anything themselves. They
//! report what happened through [`SessionEvents`] and let the host application
//! decide how to show it.

use crate::tools::ToolResult;
use serde::Serialize;
use tracing::{info, warn};

/// One grounding citation from a web search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub uri: String,
    pub title: String,
}

/// Busy indicator while a tool batch runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingState {
    pub active: bool,
    /// Name of the first tool in the batch, or "Tool"
    pub tool_name: Option<String>,
}

impl LoadingState {
    pub fn busy(tool_name: impl Into<String>) -> Self {
        Self {
            active: true,
            tool_name: Some(tool_name.into()),
        }
    }

    pub fn idle() -> Self {
        Self::default()
    }
}

/// Callbacks from the session bridge to the host UI.
///
/// Implementations are called from the session task and from tool tasks, so they
/// must be cheap and must not block.
pub trait SessionEvents: Send + Sync {
    fn update_status(&self, text: &str);

    fn update_error(&self, text: &str);

    /// Replace the citation list. An empty slice clears it.
    fn set_search_results(&self, results: &[SearchResult]);

    fn on_tool_result_received(&self, result: &ToolResult);

    fn set_loading(&self, state: LoadingState);

    /// A tool needs a photo. Answer with `complete_image_request(call_id, ..)`.
    fn on_image_requested(&self, call_id: &str) {
        let _ = call_id;
    }
}

/// Reports everything through `tracing`. Used by the command-line runner.
#[derive(Debug, Default)]
pub struct LoggingEvents;

impl SessionEvents for LoggingEvents {
    fn update_status(&self, text: &str) {
        info!(status = text, "Status");
    }

    fn update_error(&self, text: &str) {
        warn!(error = text, "Error");
    }

    fn set_search_results(&self, results: &[SearchResult]) {
        for result in results {
            info!(uri = %result.uri, title = %result.title, "Grounding source");
        }
    }

    fn on_tool_result_received(&self, result: &ToolResult) {
        if let Some(error) = result.error_message() {
            warn!(error, "Tool result is an error");
            return;
        }
        info!(
            kind = result.kind(),
            summary = result.summary().as_deref().unwrap_or_default(),
            "Tool result"
        );
    }

    fn set_loading(&self, state: LoadingState) {
        info!(
            active = state.active,
            tool = state.tool_name.as_deref().unwrap_or_default(),
            "Loading"
        );
    }

    fn on_image_requested(&self, call_id: &str) {
        warn!(call_id, "A tool asked for a crop photo but no camera is attached");
    }
}
