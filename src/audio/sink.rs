//! Playback sinks: where scheduled buffers end up.
//!
//! The live session never talks to a device directly. It schedules buffers on a
//! [`PlaybackGraph`](crate::audio::pipeline::PlaybackGraph), and the graph hands them
//! to one of these sinks.

use crate::audio::codec::{sample_to_i16, DecodedBuffer};
use crate::audio::pipeline::{PlaybackSink, SourceId};
use crate::error::AppResult;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, info};

/// Discards everything. Used when no output file is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn start(&mut self, _id: SourceId, _buffer: &DecodedBuffer, _start_at: f64, _gain: f32) -> AppResult<()> {
        Ok(())
    }

    fn stop(&mut self, _id: SourceId, _at: f64) {}
}

struct RenderedSource {
    start_frame: usize,
    samples: Vec<f32>,
    stop_frame: Option<usize>,
}

impl RenderedSource {
    fn audible_len(&self) -> usize {
        match self.stop_frame {
            Some(stop) => stop.saturating_sub(self.start_frame).min(self.samples.len()),
            None => self.samples.len(),
        }
    }
}

/// Add a source's audible samples to a timeline, growing it as needed.
fn mix_into(timeline: &mut Vec<f32>, source: &RenderedSource) {
    let len = source.audible_len();
    let end = source.start_frame + len;
    if timeline.len() < end {
        timeline.resize(end, 0.0);
    }
    for (offset, sample) in source.samples[..len].iter().enumerate() {
        timeline[source.start_frame + offset] += sample;
    }
}

/// Renders the playback timeline into a mono 16-bit WAV file.
///
/// Every source is placed at its scheduled start time. A stopped source is cut at
/// the time it was stopped, so an interruption is audible in the file exactly as a
/// listener would have heard it.
///
/// Only sources that are still playing are kept apart. Once a source is stopped or
/// released it is mixed into the timeline and its samples are dropped, so memory
/// follows the length of the rendered file.
pub struct WavRenderSink {
    path: PathBuf,
    sample_rate: u32,
    /// Sources that may still be cut
    playing: HashMap<SourceId, RenderedSource>,
    /// Everything that can no longer change
    mixed: Vec<f32>,
}

impl WavRenderSink {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            playing: HashMap::new(),
            mixed: Vec::new(),
        }
    }

    fn to_frame(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64).round() as usize
    }

    /// The full timeline: everything mixed so far plus the sources still playing.
    fn render(&self) -> Vec<f32> {
        let mut timeline = self.mixed.clone();
        for source in self.playing.values() {
            mix_into(&mut timeline, source);
        }
        timeline
    }
}

impl PlaybackSink for WavRenderSink {
    fn start(&mut self, id: SourceId, buffer: &DecodedBuffer, start_at: f64, gain: f32) -> AppResult<()> {
        // Downmix to mono
        let channels = buffer.channels.len().max(1) as f32;
        let samples = (0..buffer.frames())
            .map(|i| buffer.channels.iter().map(|c| c[i]).sum::<f32>() / channels * gain)
            .collect();

        let start_frame = self.to_frame(start_at);
        self.playing.insert(
            id,
            RenderedSource {
                start_frame,
                samples,
                stop_frame: None,
            },
        );
        Ok(())
    }

    fn stop(&mut self, id: SourceId, at: f64) {
        let frame = self.to_frame(at);
        // Only the first stop counts; later ones find nothing
        if let Some(mut source) = self.playing.remove(&id) {
            source.stop_frame = Some(frame);
            mix_into(&mut self.mixed, &source);
            debug!(source_id = id, stop_frame = frame, "Cut rendered source");
        }
    }

    fn release(&mut self, id: SourceId) {
        if let Some(source) = self.playing.remove(&id) {
            mix_into(&mut self.mixed, &source);
        }
    }

    fn finish(&mut self) -> AppResult<()> {
        let samples: Vec<i16> = self.render().into_iter().map(sample_to_i16).collect();
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let frames = samples.len();

        let mut file = File::create(&self.path)?;
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file)?;

        info!(
            path = %self.path.display(),
            frames,
            still_playing = self.playing.len(),
            "Wrote rendered playback"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(value: f32, frames: usize) -> DecodedBuffer {
        DecodedBuffer {
            sample_rate: 100,
            channels: vec![vec![value; frames]],
        }
    }

    #[test]
    fn test_render_places_sources_on_timeline() {
        let mut sink = WavRenderSink::new("unused.wav", 100);
        sink.start(1, &buffer(0.25, 100), 0.0, 1.0).unwrap();
        sink.start(2, &buffer(0.5, 100), 1.5, 1.0).unwrap();

        let timeline = sink.render();
        assert_eq!(timeline.len(), 250);
        assert_eq!(timeline[50], 0.25);
        assert_eq!(timeline[120], 0.0);
        assert_eq!(timeline[200], 0.5);
    }

    #[test]
    fn test_stopped_source_is_truncated() {
        let mut sink = WavRenderSink::new("unused.wav", 100);
        sink.start(1, &buffer(0.5, 100), 1.0, 0.5).unwrap();
        sink.stop(1, 1.25);
        sink.stop(1, 1.9);

        let timeline = sink.render();
        assert_eq!(timeline.len(), 125);
        assert_eq!(timeline[110], 0.25);
    }

    #[test]
    fn test_finished_sources_are_folded_into_timeline() {
        let mut sink = WavRenderSink::new("unused.wav", 100);
        sink.start(1, &buffer(0.25, 100), 0.0, 1.0).unwrap();
        sink.start(2, &buffer(0.5, 100), 1.0, 1.0).unwrap();
        sink.start(3, &buffer(0.5, 100), 2.0, 1.0).unwrap();
        let before = sink.render();

        sink.release(1);
        sink.stop(2, 1.5);
        assert_eq!(sink.playing.len(), 1);
        assert_eq!(sink.mixed.len(), 150);

        // A released source can no longer be cut
        sink.stop(1, 0.1);
        let after = sink.render();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[50], 0.25);
        assert_eq!(after[120], 0.5);
        assert_eq!(after[170], 0.0);
        assert_eq!(after[250], 0.5);

        sink.release(3);
        assert!(sink.playing.is_empty());
        assert_eq!(sink.render(), after);
    }

    #[test]
    fn test_stop_of_unknown_source_is_ignored() {
        let mut sink = WavRenderSink::new("unused.wav", 100);
        sink.stop(42, 0.0);
        assert!(sink.render().is_empty());
    }

    #[test]
    fn test_finish_writes_readable_wav() {
        let path = std::env::temp_dir().join(format!("kisan-render-{}.wav", uuid::Uuid::new_v4()));
        let mut sink = WavRenderSink::new(&path, 24000);
        sink.start(1, &buffer(0.5, 240), 0.0, 1.0).unwrap();
        sink.finish().unwrap();

        let mut file = File::open(&path).unwrap();
        let (header, data) = wav::read(&mut file).unwrap();
        assert_eq!(header.sampling_rate, 24000);
        assert_eq!(header.channel_count, 1);
        match data {
            wav::BitDepth::Sixteen(samples) => {
                assert_eq!(samples.len(), 240);
                assert_eq!(samples[0], 16384);
            }
            _ => panic!("expected 16-bit samples"),
        }
        let _ = std::fs::remove_file(&path);
    }
}
