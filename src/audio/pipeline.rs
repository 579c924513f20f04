//! # Playback Pipeline
//!
//! The playback half of the audio graph: a clock, a gain node that every source is
//! routed through, and the scheduling rules that keep synthesized speech gapless.
//!
//! ## Scheduling Rules:
//! - A buffer starts at `max(cursor, now)` and the cursor advances by its duration
//! - Buffers therefore never overlap and never leave gaps while speech is streaming
//! - An interruption stops every scheduled source and resets the cursor to "now"
//!
//! ## Ownership:
//! The [`PlaybackCursor`] and [`ActiveSourceSet`] belong to the streaming session;
//! the graph only reads and advances them when the session asks it to.

use crate::audio::codec::DecodedBuffer;
use crate::error::AppResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Source of "context time" in seconds, as seen by the playback device.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock time since the graph was created.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to. Used for offline rendering and tests.
#[derive(Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        let clock = Self::default();
        clock.set(start);
        clock
    }

    pub fn set(&self, seconds: f64) {
        self.micros.store((seconds.max(0.0) * 1_000_000.0).round() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

/// Shared gain value. Clones observe the same setting, so the UI can change volume
/// while audio is flowing. The f32 is stored as raw bits in an atomic.
#[derive(Debug, Clone)]
pub struct GainNode {
    bits: Arc<AtomicU32>,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(gain.to_bits())),
        }
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Scale samples in place.
    pub fn apply(&self, samples: &mut [f32]) {
        let gain = self.gain();
        if gain == 1.0 {
            return;
        }
        for sample in samples {
            *sample *= gain;
        }
    }
}

/// When the next decoded buffer may begin, in context time.
///
/// `0.0` is the "recompute from now" sentinel; it is what a fresh cursor holds
/// and what an interruption resets to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    next_start: f64,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> f64 {
        self.next_start
    }

    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }

    /// Earliest start time given the current context time.
    fn start_time(&self, now: f64) -> f64 {
        self.next_start.max(now)
    }
}

pub type SourceId = u64;

/// A scheduled playback source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceHandle {
    pub id: SourceId,
    pub start_at: f64,
    pub end_at: f64,
}

impl SourceHandle {
    pub fn duration(&self) -> f64 {
        self.end_at - self.start_at
    }
}

/// Sources that are scheduled or playing. Each handle leaves the set exactly once,
/// either when it finishes naturally or when it is cancelled.
#[derive(Debug, Default)]
pub struct ActiveSourceSet {
    sources: HashMap<SourceId, SourceHandle>,
}

impl ActiveSourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: SourceHandle) {
        self.sources.insert(handle.id, handle);
    }

    /// Remove a handle. Returns `None` if it was already removed.
    pub fn remove(&mut self, id: SourceId) -> Option<SourceHandle> {
        self.sources.remove(&id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Take every handle out of the set, earliest first.
    pub fn drain(&mut self) -> Vec<SourceHandle> {
        let mut handles: Vec<SourceHandle> = self.sources.drain().map(|(_, h)| h).collect();
        handles.sort_by(|a, b| a.start_at.total_cmp(&b.start_at));
        handles
    }

    /// Ids of handles whose playback has ended by `now`.
    fn finished(&self, now: f64) -> Vec<SourceId> {
        self.sources
            .values()
            .filter(|h| h.end_at <= now)
            .map(|h| h.id)
            .collect()
    }
}

/// Where scheduled buffers actually go (a device, a file, nowhere).
///
/// `stop` may be called for a source that has already finished; implementations
/// must treat that as a no-op.
pub trait PlaybackSink: Send {
    fn start(&mut self, id: SourceId, buffer: &DecodedBuffer, start_at: f64, gain: f32) -> AppResult<()>;

    fn stop(&mut self, id: SourceId, at: f64);

    /// The source played to its end and will never be stopped.
    fn release(&mut self, _id: SourceId) {}

    /// Flush and release the device. Called once from [`PlaybackGraph::teardown`].
    fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// The playback audio graph: clock + output gain tap + sink.
pub struct PlaybackGraph {
    sample_rate: u32,
    clock: Arc<dyn AudioClock>,
    tap: GainNode,
    sink: Box<dyn PlaybackSink>,
    next_id: SourceId,
    closed: bool,
}

impl PlaybackGraph {
    pub fn new(sample_rate: u32, clock: Arc<dyn AudioClock>, sink: Box<dyn PlaybackSink>, tap: GainNode) -> Self {
        Self {
            sample_rate,
            clock,
            tap,
            sink,
            next_id: 1,
            closed: false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The output gain node every source is connected to.
    pub fn tap(&self) -> &GainNode {
        &self.tap
    }

    pub fn current_time(&self) -> f64 {
        self.clock.now()
    }

    /// Schedule a decoded buffer right after whatever is already queued.
    ///
    /// ## Process:
    /// 1. `start_at = max(cursor, now)`
    /// 2. Start the source on the sink at `start_at`
    /// 3. Advance the cursor to `start_at + duration`
    /// 4. Register the handle so it can be reaped or cancelled later
    pub fn schedule_playback(
        &mut self,
        buffer: &DecodedBuffer,
        cursor: &mut PlaybackCursor,
        sources: &mut ActiveSourceSet,
    ) -> AppResult<SourceHandle> {
        let start_at = cursor.start_time(self.clock.now());
        let handle = SourceHandle {
            id: self.next_id,
            start_at,
            end_at: start_at + buffer.duration(),
        };
        self.next_id += 1;

        if buffer.sample_rate != self.sample_rate {
            warn!(
                buffer_rate = buffer.sample_rate,
                graph_rate = self.sample_rate,
                "Scheduling buffer at a different sample rate than the playback graph"
            );
        }

        self.sink.start(handle.id, buffer, start_at, self.tap.gain())?;
        cursor.next_start = handle.end_at;
        sources.insert(handle);

        debug!(
            source_id = handle.id,
            start_at = handle.start_at,
            duration = handle.duration(),
            "Scheduled playback buffer"
        );
        Ok(handle)
    }

    /// Drop handles whose playback has ended. Returns how many were removed.
    pub fn reap_finished(&mut self, sources: &mut ActiveSourceSet) -> usize {
        let now = self.clock.now();
        let finished = sources.finished(now);
        for id in &finished {
            sources.remove(*id);
            self.sink.release(*id);
        }
        finished.len()
    }

    /// Stop every scheduled source immediately and reset the cursor.
    ///
    /// Handles that already finished are simply skipped by the sink.
    pub fn cancel_all(&mut self, sources: &mut ActiveSourceSet, cursor: &mut PlaybackCursor) -> usize {
        let now = self.clock.now();
        let handles = sources.drain();
        for handle in &handles {
            self.sink.stop(handle.id, now);
        }
        cursor.reset();
        handles.len()
    }

    /// Seconds of already-scheduled audio still ahead of the clock.
    pub fn pending_seconds(&self, cursor: &PlaybackCursor) -> f64 {
        (cursor.current() - self.clock.now()).max(0.0)
    }

    /// Release the sink. Safe to call more than once.
    pub fn teardown(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.finish()
    }
}
