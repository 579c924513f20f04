//! # Streaming Session
//!
//! One live conversation with the backend, run as a single tokio task that owns
//! every piece of mutable session state: the playback cursor, the set of active
//! sources, the citation list and the lifecycle state.
//!
//! ## Session Lifecycle:
//! ```text
//! Uninitialized ─open─→ Opening ─Opened─→ Open ─close─→ Closing ─→ Closed
//!                          │                │
//!                          └──error/close───┴──────────────────────→ Closed
//! ```
//! `Closed` is terminal. A new conversation needs a new session.
//!
//! ## Inbound Routing (per backend message):
//! 1. Grounding citations replace (or clear) the displayed list
//! 2. A tool-call batch is dispatched; nothing else in that message is processed
//! 3. Every inline audio part is decoded and scheduled, in order
//! 4. An interruption stops all scheduled audio and resets the cursor
//!
//! Tool batches run on their own task and hand their single reply back through
//! the command channel, so slow tools never hold up audio. Batches still running
//! when the session ends are aborted and their parked requests cancelled.

use crate::audio::codec::{create_blob, decode_audio_data, decode_base64, parse_mime_rate, WireAudioBlob};
use crate::audio::pipeline::{ActiveSourceSet, PlaybackCursor, PlaybackGraph};
use crate::error::{AppResult, AssistantError};
use crate::events::{LoadingState, SearchResult, SessionEvents};
use crate::protocol::{
    ClientMessage, Content, FunctionCall, GenerationConfig, GoogleSearch, PrebuiltVoiceConfig, RealtimeInput,
    ServerMessage, SetupConfig, SpeechConfig, ToolResponse, ToolSpec, VoiceConfig,
};
use crate::tools::{FunctionDeclaration, ToolDispatcher};
use crate::websocket::{Transport, TransportEvent};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often finished playback sources are reaped.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of a [`LiveSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Everything fixed at session start.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub language_code: String,
    pub system_instruction: String,
    pub declarations: Vec<FunctionDeclaration>,
    pub input_sample_rate: u32,
    /// Used when an audio part's mime type carries no rate
    pub output_sample_rate: u32,
}

impl SessionConfig {
    /// The first frame sent on a new connection.
    pub fn setup_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        let mut tools = vec![ToolSpec::GoogleSearch(GoogleSearch::default())];
        if !self.declarations.is_empty() {
            tools.push(ToolSpec::FunctionDeclarations(self.declarations.clone()));
        }

        ClientMessage::Setup(SetupConfig {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                    language_code: self.language_code.clone(),
                },
            },
            system_instruction: Content::text(self.system_instruction.clone()),
            tools,
        })
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub messages_received: u64,
    pub chunks_sent: u64,
    /// Microphone chunks that arrived while the session was not open
    pub chunks_dropped: u64,
    pub buffers_scheduled: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub tool_batches: u64,
}

/// What a finished session hands back: the playback graph (so the next session
/// can reuse the output device) and its counters.
pub struct SessionOutcome {
    pub graph: PlaybackGraph,
    pub stats: SessionStats,
}

enum SessionCommand {
    RealtimeInput(WireAudioBlob),
    ToolReply(ToolResponse),
    PendingPlayback(oneshot::Sender<f64>),
    Close,
}

/// Cheap, clonable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    input_sample_rate: u32,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Encode a chunk of microphone samples and queue it for the backend.
    ///
    /// Chunks sent before the session is open are dropped by the session.
    pub fn send_realtime_input(&self, samples: &[f32]) -> AppResult<()> {
        let blob = create_blob(samples, self.input_sample_rate);
        self.commands
            .send(SessionCommand::RealtimeInput(blob))
            .map_err(|_| AssistantError::SessionClosed)
    }

    /// Resolve once the backend has acknowledged the connection.
    pub async fn wait_until_open(&self) -> AppResult<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, SessionState::Open | SessionState::Closed))
            .await
            .map(|s| *s);
        match reached {
            Ok(SessionState::Open) => Ok(()),
            _ => Err(AssistantError::SessionClosed),
        }
    }

    pub async fn wait_until_closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Seconds of synthesized speech still queued for playback.
    pub async fn pending_playback(&self) -> AppResult<f64> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::PendingPlayback(tx))
            .map_err(|_| AssistantError::SessionClosed)?;
        rx.await.map_err(|_| AssistantError::SessionClosed)
    }
}

/// Owner of a running session task.
pub struct LiveSession {
    handle: SessionHandle,
    task: JoinHandle<SessionOutcome>,
}

impl LiveSession {
    /// Start a session. Returns immediately in the `Opening` state; `connecting`
    /// is awaited on the session task.
    pub fn open(
        config: SessionConfig,
        connecting: BoxFuture<'static, AppResult<Transport>>,
        graph: PlaybackGraph,
        dispatcher: ToolDispatcher,
        events: Arc<dyn SessionEvents>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);

        let handle = SessionHandle {
            id,
            input_sample_rate: config.input_sample_rate,
            commands: commands_tx.clone(),
            state: state_rx,
        };

        let actor = SessionActor {
            id,
            config,
            current: SessionState::Uninitialized,
            state: state_tx,
            graph,
            cursor: PlaybackCursor::new(),
            sources: ActiveSourceSet::new(),
            citations: Vec::new(),
            dispatcher,
            events,
            replies: commands_tx.downgrade(),
            tool_batches: Vec::new(),
            stats: SessionStats::default(),
        };

        info!(session_id = %id, "Opening live session");
        let task = tokio::spawn(actor.run(connecting, commands_rx));
        Self { handle, task }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    /// True once the session task has stopped on its own or been closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the session and wait for it to release the playback graph.
    pub async fn close(self) -> AppResult<SessionOutcome> {
        let _ = self.handle.commands.send(SessionCommand::Close);
        self.task
            .await
            .map_err(|e| AssistantError::Internal(format!("session task failed: {}", e)))
    }
}

/// A tool batch running on its own task.
struct ToolBatch {
    task: JoinHandle<()>,
    call_ids: Vec<String>,
}

struct SessionActor {
    id: Uuid,
    config: SessionConfig,
    current: SessionState,
    state: watch::Sender<SessionState>,
    graph: PlaybackGraph,
    cursor: PlaybackCursor,
    sources: ActiveSourceSet,
    citations: Vec<SearchResult>,
    dispatcher: ToolDispatcher,
    events: Arc<dyn SessionEvents>,
    replies: mpsc::WeakUnboundedSender<SessionCommand>,
    tool_batches: Vec<ToolBatch>,
    stats: SessionStats,
}

impl SessionActor {
    async fn run(
        mut self,
        connecting: BoxFuture<'static, AppResult<Transport>>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> SessionOutcome {
        self.set_state(SessionState::Opening);

        let transport = tokio::select! {
            result = connecting => match result {
                Ok(transport) => transport,
                Err(e) => {
                    error!(session_id = %self.id, error = %e, "Session connection failed");
                    self.events.update_error(&format!("Session connection error: {}", e));
                    return self.finish();
                }
            },
            _ = wait_for_close(&mut commands) => {
                info!(session_id = %self.id, "Session closed before the connection was established");
                return self.finish();
            }
        };

        let Transport { outbound, mut inbound } = transport;
        if outbound.send(self.config.setup_message()).is_err() {
            self.events
                .update_error("Session connection error: transport closed before setup");
            return self.finish();
        }

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                event = inbound.recv() => match event {
                    Some(TransportEvent::Opened) => self.on_opened(),
                    Some(TransportEvent::Message(message)) => self.route(*message),
                    Some(TransportEvent::Error(message)) => {
                        error!(session_id = %self.id, error = %message, "Transport error");
                        self.events.update_error(&message);
                        break;
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        info!(session_id = %self.id, reason = %reason, "Backend closed the session");
                        self.events.update_status(&format!("Close:{}", reason));
                        break;
                    }
                    None => {
                        self.events.update_status("Close:connection ended");
                        break;
                    }
                },

                command = commands.recv() => match command {
                    Some(SessionCommand::RealtimeInput(blob)) => self.forward_input(&outbound, blob),
                    Some(SessionCommand::ToolReply(reply)) => {
                        debug!(session_id = %self.id, responses = reply.function_responses.len(), "Sending tool response");
                        if outbound.send(ClientMessage::ToolResponse(reply)).is_err() {
                            warn!(session_id = %self.id, "Tool response dropped, transport is gone");
                        }
                    }
                    Some(SessionCommand::PendingPlayback(reply)) => {
                        let _ = reply.send(self.graph.pending_seconds(&self.cursor));
                    }
                    Some(SessionCommand::Close) | None => {
                        self.set_state(SessionState::Closing);
                        self.events.update_status("Close:session closed");
                        break;
                    }
                },

                _ = housekeeping.tick() => {
                    let reaped = self.graph.reap_finished(&mut self.sources);
                    if reaped > 0 {
                        debug!(session_id = %self.id, reaped, active = self.sources.len(), "Playback sources finished");
                    }
                    self.tool_batches.retain(|batch| !batch.task.is_finished());
                }
            }
        }

        // Dropping the sender lets the writer close the socket
        drop(outbound);
        self.finish()
    }

    fn set_state(&mut self, next: SessionState) {
        if self.current == SessionState::Closed || self.current == next {
            return;
        }
        debug!(session_id = %self.id, from = ?self.current, to = ?next, "Session state change");
        self.current = next;
        self.state.send_replace(next);
    }

    fn on_opened(&mut self) {
        if self.current != SessionState::Opening {
            return;
        }
        self.set_state(SessionState::Open);
        info!(session_id = %self.id, "Live session open");
        self.events.update_status("Opened");
    }

    fn forward_input(&mut self, outbound: &mpsc::UnboundedSender<ClientMessage>, blob: WireAudioBlob) {
        if self.current != SessionState::Open {
            self.stats.chunks_dropped += 1;
            return;
        }
        let message = ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![blob],
        });
        if outbound.send(message).is_ok() {
            self.stats.chunks_sent += 1;
        } else {
            self.stats.chunks_dropped += 1;
        }
    }

    fn route(&mut self, mut message: ServerMessage) {
        self.stats.messages_received += 1;

        if message.setup_complete.is_some() {
            debug!(session_id = %self.id, "Backend acknowledged setup");
        }

        self.update_citations(message.search_results());

        if let Some(call) = message.tool_call.take() {
            self.dispatch_tools(call.function_calls);
            return;
        }

        for blob in message.audio_parts() {
            if let Err(e) = self.play_audio(blob) {
                self.stats.decode_errors += 1;
                warn!(session_id = %self.id, error = %e, mime_type = %blob.mime_type, "Dropping undecodable audio");
                self.events.update_error(&format!("Audio playback error: {}", e));
            }
        }

        if message.is_interrupted() {
            self.interrupt();
        }

        if let Some(cancellation) = &message.tool_call_cancellation {
            self.dispatcher.cancel_calls(&cancellation.ids);
        }

        if let Some(go_away) = &message.go_away {
            let time_left = go_away.time_left.as_deref().unwrap_or("unknown");
            warn!(session_id = %self.id, time_left, "Backend will disconnect soon");
            self.events
                .update_status(&format!("Backend will disconnect soon ({} left)", time_left));
        }
    }

    /// Notify only when the list actually changes.
    fn update_citations(&mut self, results: Vec<SearchResult>) {
        if results != self.citations {
            self.citations = results;
            self.events.set_search_results(&self.citations);
        }
    }

    fn dispatch_tools(&mut self, calls: Vec<FunctionCall>) {
        self.stats.tool_batches += 1;
        let dispatcher = self.dispatcher.clone();
        let language = self.config.language_code.clone();
        let replies = self.replies.clone();
        let session_id = self.id;
        let call_ids = calls.iter().map(|call| call.id.clone()).collect();

        let task = tokio::spawn(async move {
            let reply = dispatcher.dispatch(calls, &language).await;
            let delivered = replies
                .upgrade()
                .map(|tx| tx.send(SessionCommand::ToolReply(reply)).is_ok())
                .unwrap_or(false);
            if !delivered {
                debug!(session_id = %session_id, "Session ended before the tool reply was ready");
            }
        });
        self.tool_batches.push(ToolBatch { task, call_ids });
    }

    /// Stop every batch that is still running and release what it parked.
    fn abandon_tool_batches(&mut self) {
        let mut abandoned = 0;
        for batch in std::mem::take(&mut self.tool_batches) {
            if batch.task.is_finished() {
                continue;
            }
            batch.task.abort();
            self.dispatcher.cancel_calls(&batch.call_ids);
            abandoned += 1;
        }
        if abandoned > 0 {
            info!(session_id = %self.id, abandoned, "Abandoned unfinished tool batches");
            self.events.set_loading(LoadingState::idle());
        }
    }

    fn play_audio(&mut self, blob: &WireAudioBlob) -> AppResult<()> {
        let bytes = decode_base64(&blob.data)?;
        let rate = parse_mime_rate(&blob.mime_type).unwrap_or(self.config.output_sample_rate);
        let buffer = decode_audio_data(&bytes, rate, 1)?;
        if buffer.frames() == 0 {
            return Ok(());
        }
        self.graph.schedule_playback(&buffer, &mut self.cursor, &mut self.sources)?;
        self.stats.buffers_scheduled += 1;
        Ok(())
    }

    fn interrupt(&mut self) {
        let stopped = self.graph.cancel_all(&mut self.sources, &mut self.cursor);
        self.stats.interruptions += 1;
        info!(session_id = %self.id, stopped, "Playback interrupted");
    }

    fn finish(mut self) -> SessionOutcome {
        self.abandon_tool_batches();
        self.graph.cancel_all(&mut self.sources, &mut self.cursor);
        self.set_state(SessionState::Closed);
        info!(session_id = %self.id, stats = ?self.stats, "Live session closed");
        SessionOutcome {
            graph: self.graph,
            stats: self.stats,
        }
    }
}

/// Drain commands until a close is requested (or every handle is gone).
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<SessionCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Close => return,
            SessionCommand::PendingPlayback(reply) => {
                let _ = reply.send(0.0);
            }
            SessionCommand::RealtimeInput(_) | SessionCommand::ToolReply(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pipeline::{GainNode, ManualClock};
    use crate::audio::sink::testing::MemorySink;
    use crate::events::testing::RecordingEvents;
    use crate::protocol::{GroundingChunk, GroundingMetadata, Part, ServerContent, ToolCall, WebSource};
    use crate::tools::{ParameterSchema, ToolContext, ToolHandler, ToolRegistry, ToolResult};
    use crate::websocket::TransportPeer;
    use futures_util::FutureExt;
    use serde_json::{json, Value};

    struct EchoTool;

    impl ToolHandler for EchoTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new("known", "Returns a constant", ParameterSchema::object())
        }

        fn call(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            async move {
                let mut fields = serde_json::Map::new();
                fields.insert("value".to_string(), json!(1));
                Ok(ToolResult::Custom(fields))
            }
            .boxed()
        }
    }

    /// Parks its call until the user answers, like a tool waiting for a photo.
    struct WaitingTool;

    impl ToolHandler for WaitingTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new("waiting", "Waits for the user", ParameterSchema::object())
        }

        fn call(&self, _args: Value, ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            async move {
                let answer = ctx.pending.register(&ctx.call_id).await?;
                let mut fields = serde_json::Map::new();
                fields.insert("answer".to_string(), json!(answer));
                Ok(ToolResult::Custom(fields))
            }
            .boxed()
        }
    }

    struct Harness {
        session: LiveSession,
        peer: TransportPeer,
        dispatcher: ToolDispatcher,
        clock: Arc<ManualClock>,
        sink: MemorySink,
        events: Arc<RecordingEvents>,
    }

    impl Harness {
        fn handle(&self) -> SessionHandle {
            self.session.handle().clone()
        }

        fn push(&self, event: TransportEvent) {
            self.peer.events.send(event).unwrap();
        }

        fn push_message(&self, message: ServerMessage) {
            self.push(TransportEvent::Message(Box::new(message)));
        }

        /// Wait until every inbound event pushed so far has been handled.
        async fn settle(&self) {
            self.handle().pending_playback().await.unwrap();
        }

        async fn open(&self) {
            self.push(TransportEvent::Opened);
            self.handle().wait_until_open().await.unwrap();
        }

        async fn wait_for_parked(&self, call_id: &str) {
            tokio::time::timeout(Duration::from_secs(2), async {
                while !self.dispatcher.pending().is_pending(call_id) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("tool never parked its request");
        }

        async fn next_sent(&mut self) -> ClientMessage {
            tokio::time::timeout(Duration::from_secs(2), self.peer.sent.recv())
                .await
                .expect("timed out waiting for an outbound message")
                .expect("outbound channel closed")
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            model: "gemini-live-2.5-flash-preview".to_string(),
            voice: "Orus".to_string(),
            language_code: "hi-IN".to_string(),
            system_instruction: "You are Kisan Mitra".to_string(),
            declarations: vec![EchoTool.declaration()],
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        }
    }

    fn harness() -> Harness {
        let (transport, peer) = Transport::in_memory();
        let clock = Arc::new(ManualClock::new(5.0));
        let sink = MemorySink::default();
        let graph = PlaybackGraph::new(24000, clock.clone(), Box::new(sink.clone()), GainNode::new(1.0));
        let events = Arc::new(RecordingEvents::default());

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(WaitingTool));
        let dispatcher = ToolDispatcher::new(registry, events.clone());

        let session = LiveSession::open(
            test_config(),
            async move { Ok(transport) }.boxed(),
            graph,
            dispatcher.clone(),
            events.clone(),
        );
        Harness {
            session,
            peer,
            dispatcher,
            clock,
            sink,
            events,
        }
    }

    fn audio_part(data: String) -> Part {
        Part {
            text: None,
            inline_data: Some(WireAudioBlob {
                data,
                mime_type: "audio/pcm;rate=24000".to_string(),
            }),
        }
    }

    fn content(parts: Vec<Part>, interrupted: bool) -> ServerMessage {
        ServerMessage {
            server_content: Some(ServerContent {
                model_turn: Some(Content { role: None, parts }),
                interrupted,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn speech(seconds: f64) -> ServerMessage {
        let samples = vec![0.1; (24000.0 * seconds) as usize];
        content(vec![audio_part(create_blob(&samples, 24000).data)], false)
    }

    fn grounded(sources: &[(&str, &str)]) -> ServerMessage {
        ServerMessage {
            server_content: Some(ServerContent {
                grounding_metadata: Some(GroundingMetadata {
                    grounding_chunks: sources
                        .iter()
                        .map(|(uri, title)| GroundingChunk {
                            web: Some(WebSource {
                                uri: Some(uri.to_string()),
                                title: Some(title.to_string()),
                            }),
                        })
                        .collect(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_message_prefixes_model() {
        let value = serde_json::to_value(test_config().setup_message()).unwrap();
        assert_eq!(value["setup"]["model"], "models/gemini-live-2.5-flash-preview");
        assert_eq!(value["setup"]["tools"][1]["functionDeclarations"][0]["name"], "known");

        let mut config = test_config();
        config.model = "models/custom".to_string();
        config.declarations.clear();
        let value = serde_json::to_value(config.setup_message()).unwrap();
        assert_eq!(value["setup"]["model"], "models/custom");
        assert_eq!(value["setup"]["tools"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_sends_setup_then_reports_opened() {
        let mut h = harness();
        assert!(matches!(h.next_sent().await, ClientMessage::Setup(_)));
        assert_eq!(h.handle().state(), SessionState::Opening);

        h.open().await;
        assert!(h.handle().is_open());
        assert_eq!(h.events.statuses(), vec!["Opened".to_string()]);
    }

    #[tokio::test]
    async fn test_consecutive_buffers_play_back_to_back() {
        let h = harness();
        h.open().await;

        for _ in 0..3 {
            h.push_message(speech(1.0));
        }
        h.settle().await;

        assert_eq!(h.sink.start_times(), vec![5.0, 6.0, 7.0]);
        assert_eq!(h.handle().pending_playback().await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn test_interruption_stops_everything_and_resets_cursor() {
        let h = harness();
        h.open().await;

        for _ in 0..3 {
            h.push_message(speech(1.0));
        }
        h.settle().await;

        h.clock.set(5.5);
        h.push_message(content(vec![], true));
        h.settle().await;
        assert_eq!(h.sink.stop_count(), 3);
        assert_eq!(h.handle().pending_playback().await.unwrap(), 0.0);

        // The next frame starts now, not after the cancelled audio
        h.push_message(speech(1.0));
        h.settle().await;
        assert_eq!(h.sink.start_times().last(), Some(&5.5));

        let outcome = h.session.close().await.unwrap();
        assert_eq!(outcome.stats.interruptions, 1);
        assert_eq!(outcome.stats.buffers_scheduled, 4);
    }

    #[tokio::test]
    async fn test_audio_and_interruption_in_one_message() {
        let h = harness();
        h.open().await;

        let samples = vec![0.2; 2400];
        h.push_message(content(vec![audio_part(create_blob(&samples, 24000).data)], true));
        h.settle().await;

        assert_eq!(h.sink.start_times(), vec![5.0]);
        assert_eq!(h.sink.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_every_inline_part_is_played_in_order() {
        let h = harness();
        h.open().await;

        let half = create_blob(&vec![0.1; 12000], 24000).data;
        let quarter = create_blob(&vec![0.1; 6000], 24000).data;
        h.push_message(content(vec![audio_part(half), audio_part(quarter)], false));
        h.settle().await;

        assert_eq!(h.sink.start_times(), vec![5.0, 5.5]);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_session_open() {
        let h = harness();
        h.open().await;

        h.push_message(content(vec![audio_part("!!not base64!!".to_string())], false));
        // Three bytes: not a whole number of 16-bit samples
        h.push_message(content(vec![audio_part("AAEC".to_string())], false));
        h.push_message(speech(0.5));
        h.settle().await;

        let errors = h.events.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.starts_with("Audio playback error: ")));
        assert!(h.handle().is_open());
        assert_eq!(h.sink.start_times(), vec![5.0]);

        let outcome = h.session.close().await.unwrap();
        assert_eq!(outcome.stats.decode_errors as usize, errors.len());
    }

    #[tokio::test]
    async fn test_tool_batch_gets_one_ordered_reply() {
        let mut h = harness();
        h.next_sent().await;
        h.open().await;

        h.push_message(ServerMessage {
            tool_call: Some(ToolCall {
                function_calls: vec![
                    FunctionCall {
                        id: "1".to_string(),
                        name: "known".to_string(),
                        args: json!({}),
                    },
                    FunctionCall {
                        id: "2".to_string(),
                        name: "x".to_string(),
                        args: json!({}),
                    },
                ],
            }),
            ..Default::default()
        });

        match h.next_sent().await {
            ClientMessage::ToolResponse(reply) => {
                let responses = reply.function_responses;
                assert_eq!(responses.len(), 2);
                assert_eq!(responses[0].id, "1");
                assert_eq!(responses[0].response, json!({"kind": "custom", "value": 1}));
                assert_eq!(responses[1].id, "2");
                assert_eq!(responses[1].response["error"], "Unknown tool: x");
            }
            other => panic!("expected a tool response, got {:?}", other),
        }

        let loading = h.events.loading();
        assert_eq!(loading.len(), 2);
        assert!(!loading[1].active);
    }

    #[tokio::test]
    async fn test_close_abandons_tool_batch_waiting_on_user() {
        let mut h = harness();
        h.next_sent().await;
        h.open().await;

        h.push_message(ServerMessage {
            tool_call: Some(ToolCall {
                function_calls: vec![FunctionCall {
                    id: "w1".to_string(),
                    name: "waiting".to_string(),
                    args: json!({}),
                }],
            }),
            ..Default::default()
        });
        h.wait_for_parked("w1").await;

        let outcome = h.session.close().await.unwrap();
        assert_eq!(outcome.stats.tool_batches, 1);
        assert!(h.dispatcher.pending().pending_ids().is_empty());
        assert!(!h.dispatcher.complete_image_request("w1", "late.jpg".to_string()));
        assert_eq!(
            h.events.loading(),
            vec![LoadingState::busy("waiting"), LoadingState::idle()]
        );

        // The abandoned batch never answers the backend
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(message) = h.peer.sent.try_recv() {
            assert!(!matches!(message, ClientMessage::ToolResponse(_)));
        }
        assert!(h.events.tool_results().is_empty());
    }

    #[tokio::test]
    async fn test_zero_rate_audio_uses_output_rate() {
        let h = harness();
        h.open().await;

        let part = Part {
            text: None,
            inline_data: Some(WireAudioBlob {
                data: create_blob(&vec![0.1; 24000], 24000).data,
                mime_type: "audio/pcm;rate=0".to_string(),
            }),
        };
        h.push_message(content(vec![part], false));
        h.push_message(speech(1.0));
        h.settle().await;

        assert!(h.events.errors().is_empty());
        assert_eq!(h.sink.start_times(), vec![5.0, 6.0]);
        assert_eq!(h.handle().pending_playback().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_citations_notify_only_on_change() {
        let h = harness();
        h.open().await;

        h.push_message(grounded(&[("https://agmarknet.gov.in", "Agmarknet")]));
        h.push_message(grounded(&[("https://agmarknet.gov.in", "Agmarknet")]));
        h.push_message(speech(0.1));
        h.push_message(speech(0.1));
        h.settle().await;

        let updates = h.events.search_results();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0][0].title, "Agmarknet");
        assert!(updates[1].is_empty());
    }

    #[tokio::test]
    async fn test_microphone_chunks_forwarded_only_when_open() {
        let mut h = harness();
        let handle = h.handle();
        h.next_sent().await;

        handle.send_realtime_input(&[0.0; 4]).unwrap();
        h.settle().await;

        h.open().await;
        handle.send_realtime_input(&[0.5; 4]).unwrap();
        handle.send_realtime_input(&[-0.5; 4]).unwrap();

        for expected in [0.5f32, -0.5] {
            match h.next_sent().await {
                ClientMessage::RealtimeInput(input) => {
                    assert_eq!(input.media_chunks.len(), 1);
                    assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
                    assert_eq!(input.media_chunks[0].data, create_blob(&[expected; 4], 16000).data);
                }
                other => panic!("expected realtime input, got {:?}", other),
            }
        }

        let outcome = h.session.close().await.unwrap();
        assert_eq!(outcome.stats.chunks_dropped, 1);
        assert_eq!(outcome.stats.chunks_sent, 2);
    }

    #[tokio::test]
    async fn test_backend_close_is_terminal() {
        let h = harness();
        h.open().await;
        h.push_message(speech(2.0));
        h.push(TransportEvent::Closed {
            reason: "bye".to_string(),
        });

        let handle = h.handle();
        handle.wait_until_closed().await;
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(h.events.statuses().contains(&"Close:bye".to_string()));

        // Scheduled audio is stopped when the session ends
        let mut outcome = h.session.close().await.unwrap();
        assert_eq!(h.sink.stop_count(), 1);
        outcome.graph.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_transport_error_closes_session() {
        let h = harness();
        h.open().await;
        h.push(TransportEvent::Error("socket reset".to_string()));

        h.handle().wait_until_closed().await;
        assert_eq!(h.events.errors(), vec!["socket reset".to_string()]);
    }

    #[tokio::test]
    async fn test_connection_failure_reports_error() {
        let graph = PlaybackGraph::new(
            24000,
            Arc::new(ManualClock::new(0.0)),
            Box::new(MemorySink::default()),
            GainNode::new(1.0),
        );
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = ToolDispatcher::new(ToolRegistry::new(), events.clone());

        let session = LiveSession::open(
            test_config(),
            async { Err(AssistantError::Transport("refused".to_string())) }.boxed(),
            graph,
            dispatcher,
            events.clone(),
        );

        assert!(session.handle().wait_until_open().await.is_err());
        assert_eq!(
            events.errors(),
            vec!["Session connection error: Transport error: refused".to_string()]
        );
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_reported_and_terminal() {
        let h = harness();
        h.open().await;
        let handle = h.handle();

        let outcome = h.session.close().await.unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(outcome.stats.messages_received, 0);
        assert!(matches!(handle.pending_playback().await, Err(AssistantError::SessionClosed)));
        assert_eq!(h.events.statuses().last().map(String::as_str), Some("Close:session closed"));
    }
}
