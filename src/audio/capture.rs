//! # Microphone Capture
//!
//! Acquires a microphone stream and turns it into fixed-size chunks of float PCM.
//!
//! ## Capture Graph:
//! ```text
//! microphone frames ─→ input gain tap ─→ re-chunker ─→ on_chunk(AudioChunk)
//! ```
//!
//! Microphones deliver frames of whatever size the device likes. The re-chunker
//! emits exactly `chunk_size` samples per callback, in order, and zero-pads the
//! final partial chunk when the input ends.

use crate::audio::pipeline::GainNode;
use crate::error::CaptureError;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One fixed-size block of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sequence: u64,
    pub samples: Vec<f32>,
}

/// An acquired microphone: a stream of raw frames plus the task producing them.
pub struct InputStream {
    sample_rate: u32,
    frames: mpsc::Receiver<Vec<f32>>,
    producer: Option<JoinHandle<()>>,
}

impl InputStream {
    pub fn new(sample_rate: u32, frames: mpsc::Receiver<Vec<f32>>, producer: Option<JoinHandle<()>>) -> Self {
        Self {
            sample_rate,
            frames,
            producer,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// A microphone that can be acquired for a capture session.
///
/// `acquire` is called from inside the runtime and may spawn the task that feeds
/// the returned stream.
pub trait Microphone: Send + Sync {
    fn acquire(&self, sample_rate: u32) -> Result<InputStream, CaptureError>;
}

/// Streams a WAV file as if it were a live microphone.
///
/// The first channel is used. The file must already be at the requested sample
/// rate; resampling is not done here.
pub struct WavFileMicrophone {
    path: PathBuf,
    realtime: bool,
}

impl WavFileMicrophone {
    pub fn new(path: impl Into<PathBuf>, realtime: bool) -> Self {
        Self {
            path: path.into(),
            realtime,
        }
    }

    fn read_samples(&self, sample_rate: u32) -> Result<Vec<f32>, CaptureError> {
        let display = self.path.display().to_string();
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => CaptureError::PermissionDenied(display.clone()),
            _ => CaptureError::Unavailable(format!("{}: {}", display, e)),
        })?;

        let (header, data) = wav::read(&mut BufReader::new(file))
            .map_err(|e| CaptureError::UnsupportedFormat(format!("{}: {}", display, e)))?;

        if header.sampling_rate != sample_rate {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{} is {}Hz, expected {}Hz",
                display, header.sampling_rate, sample_rate
            )));
        }

        let interleaved: Vec<f32> = match data {
            wav::BitDepth::Eight(samples) => samples.into_iter().map(|s| (s as f32 - 128.0) / 128.0).collect(),
            wav::BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
            wav::BitDepth::TwentyFour(samples) => samples.into_iter().map(|s| s as f32 / 8_388_608.0).collect(),
            wav::BitDepth::ThirtyTwoFloat(samples) => samples,
            wav::BitDepth::Empty => Vec::new(),
        };

        let channels = header.channel_count.max(1) as usize;
        Ok(interleaved.into_iter().step_by(channels).collect())
    }
}

impl Microphone for WavFileMicrophone {
    fn acquire(&self, sample_rate: u32) -> Result<InputStream, CaptureError> {
        let samples = self.read_samples(sample_rate)?;
        // 10ms device frames
        let frame_len = (sample_rate as usize / 100).max(1);
        let realtime = self.realtime;

        info!(
            path = %self.path.display(),
            samples = samples.len(),
            realtime,
            "Microphone input file opened"
        );

        let (tx, rx) = mpsc::channel(64);
        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            for frame in samples.chunks(frame_len) {
                if realtime {
                    ticker.tick().await;
                }
                if tx.send(frame.to_vec()).await.is_err() {
                    break;
                }
            }
            debug!("Microphone input file exhausted");
        });

        Ok(InputStream::new(sample_rate, rx, Some(producer)))
    }
}

/// A microphone fed by an application-owned channel (for embedding a real device
/// driver, or for tests). It can be acquired once.
pub struct ChannelMicrophone {
    frames: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
}

impl ChannelMicrophone {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            frames: Mutex::new(Some(frames)),
        }
    }

    /// Create the microphone together with the sender that feeds it.
    pub fn pair(capacity: usize) -> (mpsc::Sender<Vec<f32>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

impl Microphone for ChannelMicrophone {
    fn acquire(&self, sample_rate: u32) -> Result<InputStream, CaptureError> {
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CaptureError::Unavailable("microphone is already in use".to_string()))?;
        Ok(InputStream::new(sample_rate, frames, None))
    }
}

/// Re-slices arbitrary frames into fixed-size chunks.
struct Rechunker {
    chunk_size: usize,
    pending: Vec<f32>,
    sequence: u64,
}

impl Rechunker {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            pending: Vec::with_capacity(chunk_size * 2),
            sequence: 0,
        }
    }

    fn push(&mut self, frame: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(frame);
        let mut ready = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let rest = self.pending.split_off(self.chunk_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            ready.push(self.next_chunk(samples));
        }
        ready
    }

    /// Zero-pad whatever is left into a last chunk.
    fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(self.chunk_size, 0.0);
        Some(self.next_chunk(samples))
    }

    fn next_chunk(&mut self, samples: Vec<f32>) -> AudioChunk {
        let chunk = AudioChunk {
            sequence: self.sequence,
            samples,
        };
        self.sequence += 1;
        chunk
    }
}

/// The running capture graph. Dropping it does not stop capture; call
/// [`CaptureGraph::teardown`].
pub struct CaptureGraph {
    tap: GainNode,
    worker: Option<JoinHandle<u64>>,
    producer: Option<JoinHandle<()>>,
}

/// Connect `stream` through the input gain `tap` and invoke `on_chunk` once per
/// fixed-size chunk, in capture order.
pub fn create_capture_graph<F>(stream: InputStream, chunk_size: usize, tap: GainNode, mut on_chunk: F) -> CaptureGraph
where
    F: FnMut(AudioChunk) + Send + 'static,
{
    let InputStream {
        sample_rate,
        mut frames,
        producer,
    } = stream;
    let gain = tap.clone();

    let worker = tokio::spawn(async move {
        let mut chunker = Rechunker::new(chunk_size.max(1));
        while let Some(frame) = frames.recv().await {
            for mut chunk in chunker.push(&frame) {
                gain.apply(&mut chunk.samples);
                on_chunk(chunk);
            }
        }
        if let Some(mut chunk) = chunker.flush() {
            gain.apply(&mut chunk.samples);
            on_chunk(chunk);
        }
        debug!(sample_rate, chunks = chunker.sequence, "Capture input ended");
        chunker.sequence
    });

    CaptureGraph {
        tap,
        worker: Some(worker),
        producer,
    }
}

impl CaptureGraph {
    pub fn tap(&self) -> &GainNode {
        &self.tap
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| !w.is_finished()).unwrap_or(false)
    }

    /// Wait until the microphone stops producing frames. Returns how many chunks
    /// were emitted, or `None` if the graph was already torn down.
    pub async fn wait_finished(&mut self) -> Option<u64> {
        let worker = self.worker.take()?;
        match worker.await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Capture worker ended abnormally");
                None
            }
        }
    }

    /// Disconnect and release the microphone. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn collecting() -> (Arc<StdMutex<Vec<AudioChunk>>>, impl FnMut(AudioChunk) + Send + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |chunk| sink.lock().unwrap().push(chunk))
    }

    #[test]
    fn test_rechunker_emits_fixed_sizes() {
        let mut chunker = Rechunker::new(4);
        assert!(chunker.push(&[0.1, 0.2, 0.3]).is_empty());

        let ready = chunker.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(ready[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(ready[1].sequence, 1);

        let last = chunker.flush().unwrap();
        assert_eq!(last.samples, vec![0.9, 0.0, 0.0, 0.0]);
        assert!(chunker.flush().is_none());
    }

    #[tokio::test]
    async fn test_capture_graph_applies_gain_in_order() {
        let (tx, mic) = ChannelMicrophone::pair(8);
        let stream = mic.acquire(16000).unwrap();
        let (seen, on_chunk) = collecting();
        let mut graph = create_capture_graph(stream, 2, GainNode::new(0.5), on_chunk);

        tx.send(vec![1.0, 1.0, 0.5]).await.unwrap();
        tx.send(vec![0.5]).await.unwrap();
        drop(tx);

        assert_eq!(graph.wait_finished().await, Some(2));
        let chunks = seen.lock().unwrap().clone();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].samples, vec![0.5, 0.5]);
        assert_eq!(chunks[1].samples, vec![0.25, 0.25]);
    }

    #[tokio::test]
    async fn test_channel_microphone_acquires_once() {
        let (_tx, mic) = ChannelMicrophone::pair(1);
        assert!(mic.acquire(16000).is_ok());
        assert!(matches!(mic.acquire(16000), Err(CaptureError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (tx, mic) = ChannelMicrophone::pair(1);
        let stream = mic.acquire(16000).unwrap();
        let (_seen, on_chunk) = collecting();
        let mut graph = create_capture_graph(stream, 4, GainNode::new(1.0), on_chunk);

        assert!(graph.is_running());
        graph.teardown();
        graph.teardown();
        assert!(!graph.is_running());
        assert!(graph.wait_finished().await.is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn test_missing_wav_file_is_unavailable() {
        let mic = WavFileMicrophone::new("/nonexistent/question.wav", false);
        assert!(matches!(mic.acquire(16000), Err(CaptureError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_wav_file_microphone_streams_first_channel() {
        let path = std::env::temp_dir().join(format!("kisan-mic-{}.wav", uuid::Uuid::new_v4()));
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 2, 16000, 16);
        let interleaved: Vec<i16> = (0..400).flat_map(|_| [16384i16, -16384]).collect();
        wav::write(header, &wav::BitDepth::Sixteen(interleaved), &mut File::create(&path).unwrap()).unwrap();

        let mic = WavFileMicrophone::new(&path, false);
        let stream = mic.acquire(16000).unwrap();
        let (seen, on_chunk) = collecting();
        let mut graph = create_capture_graph(stream, 100, GainNode::new(1.0), on_chunk);

        assert_eq!(graph.wait_finished().await, Some(4));
        let chunks = seen.lock().unwrap().clone();
        assert!(chunks.iter().all(|c| c.samples.iter().all(|&s| s == 0.5)));

        assert!(matches!(
            WavFileMicrophone::new(&path, false).acquire(24000),
            Err(CaptureError::UnsupportedFormat(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
