//! Encoder/muxer side of a recording: the hardware collaborators the
//! pipeline drives, and the [`EncoderCore`] that sequences them.

pub mod ffmpeg;
mod pipeline;

pub use pipeline::{EncoderCore, EncoderState};

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Seconds between two key frames.
pub const IFRAME_INTERVAL_SECS: u32 = 5;
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const AUDIO_CHANNELS: u16 = 1;
pub const AUDIO_BIT_RATE: usize = 128_000;
/// Samples requested from the capture device per read.
pub const AUDIO_SAMPLES_PER_READ: usize = 1024;
/// Bounded wait of one output-queue poll.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
/// How long `drain(true)` waits for the end-of-stream buffer before giving up.
pub const END_OF_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// A rendered frame read back from an encoder-backed render context.
/// Pixels are RGBA, top row first, without row padding.
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub pts_us: i64,
}

/// Where a video encoder takes its input from.
pub trait FrameSink: Send + Sync {
    fn queue_frame(&self, frame: RgbaFrame) -> Result<()>;
}

/// The encoder's input surface, shared with the render context that draws
/// into it.
pub type InputSurface = Arc<dyn FrameSink>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: usize,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bit_rate: usize,
}

impl EncoderConfig {
    /// Video bit rate is `bits_per_pixel x width x height x frame_rate`.
    pub fn new(
        output: impl Into<PathBuf>,
        width: u32,
        height: u32,
        frame_rate: u32,
        bits_per_pixel: u32,
    ) -> Self {
        let bit_rate = bits_per_pixel as usize * width as usize * height as usize * frame_rate as usize;
        Self {
            output: output.into(),
            width,
            height,
            frame_rate,
            bit_rate,
            audio_sample_rate: AUDIO_SAMPLE_RATE,
            audio_channels: AUDIO_CHANNELS,
            audio_bit_rate: AUDIO_BIT_RATE,
        }
    }

    /// Key frame distance in frames.
    pub fn gop_size(&self) -> u32 {
        self.frame_rate * IFRAME_INTERVAL_SECS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Output format an encoder reports once its stream parameters are known.
/// `native` carries backend data the matching muxer needs to create the
/// track.
#[derive(Clone)]
pub struct TrackFormat {
    pub kind: TrackKind,
    pub codec: String,
    pub native: Option<Arc<dyn Any + Send + Sync>>,
}

impl TrackFormat {
    pub fn new(kind: TrackKind, codec: impl Into<String>) -> Self {
        Self {
            kind,
            codec: codec.into(),
            native: None,
        }
    }

    pub fn with_native(mut self, native: impl Any + Send + Sync) -> Self {
        self.native = Some(Arc::new(native));
        self
    }
}

impl fmt::Debug for TrackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackFormat")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("native", &self.native.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodedBuffer {
    pub data: Bytes,
    pub pts_us: i64,
    pub key_frame: bool,
    /// Codec setup data already carried by the track format.
    pub codec_config: bool,
    pub end_of_stream: bool,
}

impl EncodedBuffer {
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Default::default()
        }
    }
}

/// Result of one poll of an encoder's output queue.
#[derive(Debug)]
pub enum EncoderOutput {
    TryAgainLater,
    /// The output format is now available through `output_format`.
    FormatChanged,
    Buffer(EncodedBuffer),
}

pub trait VideoEncoder: Send {
    fn input_surface(&self) -> InputSurface;
    fn start(&mut self) -> Result<()>;
    fn signal_end_of_input(&mut self) -> Result<()>;
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput>;
    fn output_format(&self) -> Result<TrackFormat>;
    fn release(self: Box<Self>) -> Result<()>;
}

pub trait AudioEncoder: Send {
    fn start(&mut self) -> Result<()>;
    /// Queues interleaved PCM. Returns false when the input queue is full
    /// and the samples were dropped.
    fn queue_input(&mut self, pcm: &[i16], pts_us: i64) -> Result<bool>;
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput>;
    fn output_format(&self) -> Result<TrackFormat>;
    fn release(self: Box<Self>) -> Result<()>;
}

pub trait AudioCapture: Send {
    fn start(&mut self) -> Result<()>;
    /// Reads up to `pcm.len()` samples, returning how many were written.
    fn read(&mut self, pcm: &mut [i16]) -> Result<usize>;
    fn release(self: Box<Self>) -> Result<()>;
}

/// Container writer shared by the video drain and the audio loop.
/// Implementations serialize concurrent track writes internally.
pub trait Muxer: Send + Sync {
    fn add_track(&self, format: &TrackFormat) -> Result<usize>;
    fn start(&self) -> Result<()>;
    fn write_sample(&self, track: usize, buffer: &EncodedBuffer) -> Result<()>;
    /// Finalizes the container.
    fn stop(&self) -> Result<()>;
}

/// Creates the hardware collaborators of one recording session.
pub trait MediaBackend: Send {
    fn create_video_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>>;
    fn create_audio_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn AudioEncoder>>;
    fn create_audio_capture(&self, config: &EncoderConfig) -> Result<Box<dyn AudioCapture>>;
    fn create_muxer(&self, config: &EncoderConfig) -> Result<Arc<dyn Muxer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_rate_scales_with_frame_area_and_rate() {
        let config = EncoderConfig::new("out.mp4", 1280, 720, 30, 24);
        assert_eq!(config.bit_rate, 24 * 1280 * 720 * 30);
        assert_eq!(config.gop_size(), 150);
        assert_eq!(config.audio_sample_rate, 44_100);
    }
}
