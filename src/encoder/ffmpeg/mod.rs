//! [`MediaBackend`] over FFmpeg: an H.264 encoder whose input surface takes
//! read-back RGBA frames, AAC audio captured from an input device, and an
//! MP4 muxer.

mod audio;
mod muxer;
mod video;

pub use audio::{FfmpegAudioCapture, FfmpegAudioEncoder};
pub use muxer::FfmpegMuxer;
pub use video::FfmpegVideoEncoder;

use super::{
    AudioCapture, AudioEncoder, EncoderConfig, MediaBackend, Muxer, TrackFormat, VideoEncoder,
};
use crate::error::{Error, Result};
use ffmpeg_next::{Rational, codec};
use std::sync::{Arc, LazyLock};
use tracing::info;

/// Timestamps cross the collaborator seams in microseconds.
pub(crate) const MICROSECONDS: Rational = Rational(1, 1_000_000);

pub(crate) static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = n.min(16);
    info!(num, "Detecting CPU cores");
    num
});

/// Stream parameters of an opened encoder, carried in
/// [`TrackFormat::native`] to the muxer.
pub(crate) struct CodecParameters {
    pub(crate) parameters: codec::Parameters,
    pub(crate) time_base: Rational,
}

// A private copy made from an opened encoder; only read after creation.
unsafe impl Send for CodecParameters {}
unsafe impl Sync for CodecParameters {}

impl CodecParameters {
    pub(crate) fn from_format(format: &TrackFormat) -> Result<&CodecParameters> {
        format
            .native
            .as_ref()
            .and_then(|native| native.downcast_ref::<CodecParameters>())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{} track carries no FFmpeg parameters", format.codec))
            })
    }
}

pub(crate) fn is_again(error: &ffmpeg_next::Error) -> bool {
    *error
        == ffmpeg_next::Error::Other {
            errno: ffmpeg_next::util::error::EAGAIN,
        }
}

/// Encoders, capture device and muxer of a desktop recording.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    audio_driver: String,
    audio_device: String,
}

impl FfmpegBackend {
    /// `audio_driver` names an FFmpeg input device (`pulse`, `alsa`, ...) and
    /// `audio_device` the device it should open.
    pub fn new(audio_driver: impl Into<String>, audio_device: impl Into<String>) -> Result<Self> {
        ffmpeg_next::init()?;
        ffmpeg_next::device::register_all();
        Ok(Self {
            audio_driver: audio_driver.into(),
            audio_device: audio_device.into(),
        })
    }
}

impl MediaBackend for FfmpegBackend {
    fn create_video_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegVideoEncoder::new(config)?))
    }

    fn create_audio_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(FfmpegAudioEncoder::new(config)?))
    }

    fn create_audio_capture(&self, config: &EncoderConfig) -> Result<Box<dyn AudioCapture>> {
        Ok(Box::new(FfmpegAudioCapture::open(
            &self.audio_driver,
            &self.audio_device,
            config,
        )?))
    }

    fn create_muxer(&self, config: &EncoderConfig) -> Result<Arc<dyn Muxer>> {
        Ok(Arc::new(FfmpegMuxer::create(&config.output)?))
    }
}
