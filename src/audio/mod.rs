//! # Audio Module
//!
//! Everything between the microphone, the wire and the speaker.
//!
//! ## Key Components:
//! - **Codec**: float samples ⇄ base64 little-endian 16-bit PCM
//! - **Pipeline**: playback clock, gain taps, cursor and gapless scheduling
//! - **Sink**: where scheduled playback ends up (null, WAV render)
//! - **Capture**: microphone acquisition and fixed-size chunking
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz mono, sent as `audio/pcm;rate=16000`
//! - **Playback**: 24kHz mono unless the frame's mime type says otherwise
//! - **Bit Depth**: 16-bit PCM, little-endian, full scale 32768

pub mod capture;
pub mod codec;
pub mod pipeline;
pub mod sink;
