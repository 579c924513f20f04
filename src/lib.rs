//! # Kisan Mitra Live
//!
//! A voice-first agricultural assistant: streams microphone audio to a live,
//! bidirectional speech model and plays its spoken answers back gaplessly, while
//! running the tools the model asks for (market prices, schemes, crop diagnosis).
//!
//! ## Architecture:
//! - **audio**: PCM codec, playback scheduling, capture chunking, sinks
//! - **protocol / websocket**: backend wire format and transport
//! - **session**: the per-conversation actor that routes every backend message
//! - **tools**: function declarations, validation and the batch dispatcher
//! - **recording / assistant**: microphone control and top-level orchestration
//! - **events / results / instructions**: UI callbacks, dashboard history, persona

pub mod assistant;
pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod instructions;
pub mod protocol;
pub mod recording;
pub mod results;
pub mod session;
pub mod tools;
pub mod websocket;

pub use assistant::Assistant;
pub use config::AppConfig;
pub use error::{AppResult, AssistantError, CaptureError};
pub use events::{LoadingState, LoggingEvents, SearchResult, SessionEvents};
pub use session::{LiveSession, SessionHandle, SessionState, SessionStats};
pub use tools::{ToolDispatcher, ToolHandler, ToolRegistry, ToolResult};
