//! # Assistant
//!
//! Top-level orchestration: owns the playback graph between sessions, opens and
//! resets live sessions, drives the recording controller and keeps the dashboard
//! history of tool results.
//!
//! ## Opening a session requires:
//! - A playback graph attached with [`Assistant::attach_playback`]
//! - No other session running (an existing one is returned instead)
//!
//! The session borrows the playback graph while it runs and gives it back when
//! it closes, so the output device outlives any one conversation.

use crate::audio::capture::Microphone;
use crate::audio::pipeline::{GainNode, PlaybackGraph};
use crate::config::AppConfig;
use crate::error::{AppResult, AssistantError};
use crate::events::{LoadingState, SearchResult, SessionEvents};
use crate::instructions::system_instructions;
use crate::recording::RecordingController;
use crate::results::ResultHistory;
use crate::session::{LiveSession, SessionConfig, SessionHandle, SessionState, SessionStats};
use crate::tools::{ToolDispatcher, ToolRegistry, ToolResult};
use crate::websocket::Connector;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

pub const STATUS_RESETTING: &str = "Session cleared and re-initializing...";

/// Forwards UI events and records every forwarded tool result in the history.
struct DashboardEvents {
    inner: Arc<dyn SessionEvents>,
    history: Arc<Mutex<ResultHistory>>,
}

impl DashboardEvents {
    fn history(&self) -> MutexGuard<'_, ResultHistory> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionEvents for DashboardEvents {
    fn update_status(&self, text: &str) {
        self.inner.update_status(text);
    }

    fn update_error(&self, text: &str) {
        self.inner.update_error(text);
    }

    fn set_search_results(&self, results: &[SearchResult]) {
        self.inner.set_search_results(results);
    }

    fn on_tool_result_received(&self, result: &ToolResult) {
        self.history().record(result.clone());
        self.inner.on_tool_result_received(result);
    }

    fn set_loading(&self, state: LoadingState) {
        self.inner.set_loading(state);
    }

    fn on_image_requested(&self, call_id: &str) {
        self.inner.on_image_requested(call_id);
    }
}

pub struct Assistant {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    dispatcher: ToolDispatcher,
    events: Arc<dyn SessionEvents>,
    history: Arc<Mutex<ResultHistory>>,
    recorder: RecordingController,
    playback: Option<PlaybackGraph>,
    session: Option<LiveSession>,
}

impl Assistant {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        registry: ToolRegistry,
        microphone: Arc<dyn Microphone>,
        events: Arc<dyn SessionEvents>,
    ) -> Self {
        let history = Arc::new(Mutex::new(ResultHistory::new()));
        let events: Arc<dyn SessionEvents> = Arc::new(DashboardEvents {
            inner: events,
            history: history.clone(),
        });

        let recorder = RecordingController::new(
            microphone,
            events.clone(),
            config.audio.input_sample_rate,
            config.audio.capture_chunk_size,
            GainNode::new(config.audio.input_gain),
        );

        Self {
            dispatcher: ToolDispatcher::new(registry, events.clone()),
            config,
            connector,
            events,
            history,
            recorder,
            playback: None,
            session: None,
        }
    }

    /// Hand the assistant its output graph. Sessions cannot open before this.
    pub fn attach_playback(&mut self, graph: PlaybackGraph) {
        self.playback = Some(graph);
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().map(LiveSession::handle)
    }

    pub fn session_state(&self) -> SessionState {
        self.session()
            .map(SessionHandle::state)
            .unwrap_or(SessionState::Uninitialized)
    }

    fn session_config(&self) -> SessionConfig {
        let declarations = self.dispatcher.declarations();
        let system_instruction = match &self.config.session.system_instruction {
            Some(custom) => custom.clone(),
            None => system_instructions(&chrono::Local::now().naive_local(), &declarations),
        };

        SessionConfig {
            model: self.config.backend.model.clone(),
            voice: self.config.session.voice.clone(),
            language_code: self.config.session.language_code.clone(),
            system_instruction,
            declarations,
            input_sample_rate: self.config.audio.input_sample_rate,
            output_sample_rate: self.config.audio.output_sample_rate,
        }
    }

    /// Open a live session, or return the one already running.
    pub fn open_session(&mut self) -> AppResult<SessionHandle> {
        if let Some(session) = &self.session {
            if !session.is_finished() {
                return Ok(session.handle().clone());
            }
        }
        if self.session.is_some() {
            return Err(AssistantError::NotReady(
                "the previous session ended; reset it before opening a new one".to_string(),
            ));
        }

        let graph = self
            .playback
            .take()
            .ok_or_else(|| AssistantError::NotReady("playback audio graph is not attached".to_string()))?;

        let connecting = self.connector.connect(self.config.backend_url());
        let session = LiveSession::open(
            self.session_config(),
            connecting,
            graph,
            self.dispatcher.clone(),
            self.events.clone(),
        );
        let handle = session.handle().clone();
        self.session = Some(session);
        Ok(handle)
    }

    /// Stop recording and close the current session, reclaiming the playback graph.
    pub async fn close_session(&mut self) -> AppResult<Option<SessionStats>> {
        self.recorder.stop_recording();
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        let session_id = session.id();
        let outcome = session.close().await?;
        self.playback = Some(outcome.graph);
        info!(session_id = %session_id, stats = ?outcome.stats, "Session released");
        Ok(Some(outcome.stats))
    }

    /// Close the current session, clear citations and open a fresh one.
    pub async fn reset_session(&mut self) -> AppResult<SessionHandle> {
        self.close_session().await?;
        self.events.set_search_results(&[]);
        self.events.update_status(STATUS_RESETTING);
        self.open_session()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    /// Start streaming the microphone into the open session.
    pub fn start_recording(&mut self) -> bool {
        let Some(session) = self.session.as_ref().map(|s| s.handle().clone()) else {
            self.events.update_error("Error starting recording: no session is open");
            return false;
        };
        if !session.is_open() {
            self.events.update_error("Error starting recording: session is not open yet");
            return false;
        }
        self.recorder.start_recording(&session)
    }

    pub fn stop_recording(&mut self) {
        self.recorder.stop_recording();
    }

    /// Wait for the microphone input to run out.
    pub async fn wait_for_input_end(&mut self) -> Option<u64> {
        self.recorder.wait_for_input_end().await
    }

    pub fn complete_image_request(&self, call_id: &str, image: String) -> bool {
        self.dispatcher.complete_image_request(call_id, image)
    }

    pub fn cancel_image_request(&self, call_id: &str) -> bool {
        self.dispatcher.cancel_image_request(call_id)
    }

    /// Snapshot of the dashboard history.
    pub fn history(&self) -> ResultHistory {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop recording and forget every recorded result.
    pub fn clear_history(&mut self) {
        self.recorder.stop_recording();
        self.history.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Close everything and release the output device.
    pub async fn shutdown(mut self) -> AppResult<()> {
        if let Err(e) = self.close_session().await {
            warn!(error = %e, "Session did not close cleanly");
        }
        if let Some(mut graph) = self.playback.take() {
            graph.teardown()?;
        }
        info!("Assistant shut down");
        Ok(())
    }
}
