//! Recording controller: microphone on/off.
//!
//! Starting a recording acquires the microphone, builds the capture graph and
//! streams every fixed-size chunk into the session. Stopping tears the graph
//! down and releases the microphone.

use crate::audio::capture::{create_capture_graph, CaptureGraph, Microphone};
use crate::audio::pipeline::GainNode;
use crate::events::SessionEvents;
use crate::session::SessionHandle;
use std::sync::Arc;
use tracing::{info, warn};

pub const STATUS_RECORDING: &str = "🔴 Recording... Capturing PCM chunks.";
pub const STATUS_STOPPED: &str = "Recording stopped. Click Start to begin again.";

pub struct RecordingController {
    microphone: Arc<dyn Microphone>,
    events: Arc<dyn SessionEvents>,
    sample_rate: u32,
    chunk_size: usize,
    tap: GainNode,
    capture: Option<CaptureGraph>,
}

impl RecordingController {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        events: Arc<dyn SessionEvents>,
        sample_rate: u32,
        chunk_size: usize,
        tap: GainNode,
    ) -> Self {
        Self {
            microphone,
            events,
            sample_rate,
            chunk_size,
            tap,
            capture: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }

    /// The input gain node, for live volume changes.
    pub fn tap(&self) -> &GainNode {
        &self.tap
    }

    /// Begin streaming microphone audio into `session`.
    ///
    /// Returns false (and reports why) if already recording or if the
    /// microphone cannot be acquired.
    pub fn start_recording(&mut self, session: &SessionHandle) -> bool {
        if self.is_recording() {
            return false;
        }

        self.events.update_status("Requesting microphone access...");
        let stream = match self.microphone.acquire(self.sample_rate) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Could not start recording");
                self.events.update_error(&format!("Error starting recording: {}", e));
                return false;
            }
        };

        let session = session.clone();
        let mut warned = false;
        let graph = create_capture_graph(stream, self.chunk_size, self.tap.clone(), move |chunk| {
            if session.send_realtime_input(&chunk.samples).is_err() && !warned {
                warned = true;
                warn!(sequence = chunk.sequence, "Session is closed, microphone audio is being discarded");
            }
        });

        self.capture = Some(graph);
        info!(sample_rate = self.sample_rate, chunk_size = self.chunk_size, "Recording started");
        self.events.update_status(STATUS_RECORDING);
        true
    }

    /// Stop streaming and release the microphone. Does nothing if not recording.
    pub fn stop_recording(&mut self) {
        let Some(mut graph) = self.capture.take() else {
            return;
        };
        graph.teardown();
        info!("Recording stopped");
        self.events.update_status(STATUS_STOPPED);
    }

    /// Wait for the microphone input to run out (end of an input file).
    /// Returns immediately if not recording.
    pub async fn wait_for_input_end(&mut self) -> Option<u64> {
        self.capture.as_mut()?.wait_finished().await
    }
}
