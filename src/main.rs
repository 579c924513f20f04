//! # Kisan Mitra Live - Command-Line Runner
//!
//! Streams a WAV file to the live backend as if it were the microphone and
//! renders the spoken answer into another WAV file.
//!
//! ## What happens on startup:
//! 1. **Loads configuration** from `.env`, `config.toml` and `APP_*` variables
//! 2. **Sets up logging** (`RUST_LOG` overrides the default filter)
//! 3. **Builds the audio graphs** (WAV microphone, WAV render sink)
//! 4. **Opens a live session** and starts recording once it is open
//! 5. **Waits** until the input ends and playback has been idle for a while,
//!    or until Ctrl+C / SIGTERM

use anyhow::{anyhow, Result};
use kisan_mitra_live::audio::capture::WavFileMicrophone;
use kisan_mitra_live::audio::pipeline::{GainNode, PlaybackGraph, PlaybackSink, SystemClock};
use kisan_mitra_live::audio::sink::{NullSink, WavRenderSink};
use kisan_mitra_live::tools::{
    CropDiagnosisTool, KeywordDiagnoser, MarketDataSource, MarketDataTool, RecordTable, RegionalComparisonTool,
};
use kisan_mitra_live::websocket::WebSocketConnector;
use kisan_mitra_live::{AppConfig, Assistant, LoggingEvents, SessionHandle, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long playback must stay idle after the input ends before we hang up.
const DRAIN_IDLE: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting kisan-mitra-live v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.backend.model,
        voice = %config.session.voice,
        language = %config.session.language_code,
        "Configuration loaded"
    );
    if config.backend.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; the backend will most likely refuse the connection");
    }

    let input = config
        .io
        .input_wav
        .clone()
        .ok_or_else(|| anyhow!("No microphone input configured. Set APP_IO__INPUT_WAV to a 16kHz WAV file."))?;

    let output_rate = config.audio.output_sample_rate;
    let sink: Box<dyn PlaybackSink> = match &config.io.output_wav {
        Some(path) => Box::new(WavRenderSink::new(path, output_rate)),
        None => Box::new(NullSink),
    };
    let graph = PlaybackGraph::new(
        output_rate,
        Arc::new(SystemClock::new()),
        sink,
        GainNode::new(config.audio.output_gain),
    );

    let microphone = Arc::new(WavFileMicrophone::new(input, config.io.realtime_pacing));

    let market: Arc<dyn MarketDataSource> = match &config.io.market_data {
        Some(path) => Arc::new(RecordTable::from_json_file(path)?),
        None => {
            info!("No market data file configured; price lookups will find no records");
            Arc::new(RecordTable::default())
        }
    };

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(MarketDataTool::new(market.clone())));
    registry.register(Arc::new(RegionalComparisonTool::new(market)));
    registry.register(Arc::new(CropDiagnosisTool::new(Arc::new(KeywordDiagnoser))));

    let mut assistant = Assistant::new(
        config,
        Arc::new(WebSocketConnector),
        registry,
        microphone,
        Arc::new(LoggingEvents),
    );
    assistant.attach_playback(graph);
    let session = assistant.open_session()?;

    let outcome = tokio::select! {
        result = converse(&mut assistant, &session) => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, closing session...");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Conversation ended with an error");
    }
    assistant.shutdown().await?;
    info!("Stopped gracefully");
    outcome
}

/// Run one conversation: record the whole input, then let the answer play out.
async fn converse(assistant: &mut Assistant, session: &SessionHandle) -> Result<()> {
    session
        .wait_until_open()
        .await
        .map_err(|_| anyhow!("Session closed before it was opened"))?;

    if !assistant.start_recording() {
        return Err(anyhow!("Could not start recording"));
    }

    let chunks = assistant.wait_for_input_end().await.unwrap_or_default();
    info!(chunks, "Microphone input finished, waiting for the answer");

    let mut idle = Duration::ZERO;
    while idle < DRAIN_IDLE {
        tokio::time::sleep(DRAIN_POLL).await;
        match session.pending_playback().await {
            Ok(remaining) if remaining > 0.0 => idle = Duration::ZERO,
            Ok(_) => idle += DRAIN_POLL,
            Err(_) => {
                info!("Session closed by the backend");
                break;
            }
        }
    }
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls what gets logged; the default shows this crate at debug.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kisan_mitra_live=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
