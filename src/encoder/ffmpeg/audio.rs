use super::{CodecParameters, MICROSECONDS, is_again};
use crate::encoder::{
    AudioCapture, AudioEncoder, EncodedBuffer, EncoderConfig, EncoderOutput, TrackFormat,
    TrackKind,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use ffmpeg_next::format::Sample;
use ffmpeg_next::format::sample::Type as SampleType;
use ffmpeg_next::software::resampling::Context as SamplerContext;
use ffmpeg_next::{ChannelLayout, Dictionary, Packet, Rational, codec, format, frame, media};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// PCM crossing the capture and encoder seams.
const PCM_FORMAT: Sample = Sample::I16(SampleType::Packed);
const AAC_FORMAT: Sample = Sample::F32(SampleType::Planar);
const AAC_DEFAULT_FRAME_SIZE: usize = 1024;
/// Encoder input beyond this many seconds is dropped.
const MAX_PENDING_SECS: usize = 2;

fn channel_layout(channels: u16) -> ChannelLayout {
    ChannelLayout::default(channels as i32)
}

fn pcm_bytes(samples: &[i16]) -> impl Iterator<Item = u8> + '_ {
    samples.iter().flat_map(|sample| sample.to_ne_bytes())
}

/// AAC-LC encoder taking interleaved 16-bit PCM.
pub struct FfmpegAudioEncoder {
    encoder: codec::encoder::audio::Encoder,
    resampler: SamplerContext,
    layout: ChannelLayout,
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    pending: Vec<i16>,
    next_pts: Option<i64>,
}

// The resampler is only touched from the thread that owns the encoder.
unsafe impl Send for FfmpegAudioEncoder {}

impl FfmpegAudioEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let aac = codec::encoder::find(codec::Id::AAC)
            .ok_or_else(|| Error::EncoderUnavailable("AAC encoder not found".into()))?;

        let mut enc_config = codec::Context::new_with_codec(aac)
            .encoder()
            .audio()
            .map_err(|e| Error::EncoderUnavailable(format!("AAC encoder config: {e}")))?;

        let layout = channel_layout(config.audio_channels);
        enc_config.set_flags(codec::Flags::GLOBAL_HEADER);
        enc_config.set_format(AAC_FORMAT);
        enc_config.set_rate(config.audio_sample_rate as i32);
        enc_config.set_channel_layout(layout);
        enc_config.set_bit_rate(config.audio_bit_rate);
        enc_config.set_time_base(Rational::new(1, config.audio_sample_rate as i32));

        let encoder = enc_config
            .open_with(Dictionary::new())
            .map_err(|e| Error::EncoderUnavailable(format!("Failed to open AAC encoder: {e}")))?;

        let frame_size = match encoder.frame_size() as usize {
            0 => {
                warn!("AAC encoder reported frame_size 0, defaulting to {AAC_DEFAULT_FRAME_SIZE}");
                AAC_DEFAULT_FRAME_SIZE
            }
            n => n,
        };
        info!(
            rate = config.audio_sample_rate,
            channels = config.audio_channels,
            bit_rate = config.audio_bit_rate,
            frame_size,
            "AAC encoder opened"
        );

        let resampler = SamplerContext::get(
            PCM_FORMAT,
            layout,
            config.audio_sample_rate,
            AAC_FORMAT,
            layout,
            config.audio_sample_rate,
        )?;

        Ok(Self {
            encoder,
            resampler,
            layout,
            sample_rate: config.audio_sample_rate,
            channels: config.audio_channels as usize,
            frame_size,
            pending: Vec::new(),
            next_pts: None,
        })
    }

    fn encode_pending(&mut self) -> Result<()> {
        let chunk = self.frame_size * self.channels;
        while self.pending.len() >= chunk {
            let mut input = frame::Audio::new(PCM_FORMAT, self.frame_size, self.layout);
            input.set_rate(self.sample_rate);
            for (dst, src) in input
                .data_mut(0)
                .iter_mut()
                .zip(pcm_bytes(&self.pending[..chunk]))
            {
                *dst = src;
            }
            self.pending.drain(..chunk);

            let mut output = frame::Audio::empty();
            self.resampler.run(&input, &mut output)?;
            output.set_pts(self.next_pts);
            self.next_pts = self.next_pts.map(|pts| pts + self.frame_size as i64);
            self.encoder.send_frame(&output)?;
        }
        Ok(())
    }
}

impl AudioEncoder for FfmpegAudioEncoder {
    fn start(&mut self) -> Result<()> {
        debug!("AAC encoder started");
        Ok(())
    }

    fn queue_input(&mut self, pcm: &[i16], pts_us: i64) -> Result<bool> {
        let limit = self.sample_rate as usize * self.channels * MAX_PENDING_SECS;
        if self.pending.len() + pcm.len() > limit {
            return Ok(false);
        }
        if self.next_pts.is_none() {
            self.next_pts = Some(pts_us * self.sample_rate as i64 / 1_000_000);
        }
        self.pending.extend_from_slice(pcm);
        self.encode_pending()?;
        Ok(true)
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<EncoderOutput> {
        let mut packet = Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => {
                let rate = self.sample_rate as i64;
                Ok(EncoderOutput::Buffer(EncodedBuffer {
                    data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                    pts_us: packet.pts().map(|pts| pts * 1_000_000 / rate).unwrap_or(0),
                    key_frame: packet.is_key(),
                    codec_config: false,
                    end_of_stream: false,
                }))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(EncoderOutput::Buffer(EncodedBuffer::end_of_stream())),
            Err(error) if is_again(&error) => Ok(EncoderOutput::TryAgainLater),
            Err(error) => Err(error.into()),
        }
    }

    fn output_format(&self) -> Result<TrackFormat> {
        let parameters: codec::Parameters = (&self.encoder).into();
        Ok(TrackFormat::new(TrackKind::Audio, "aac").with_native(CodecParameters {
            parameters,
            time_base: MICROSECONDS,
        }))
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(dropped = self.pending.len(), "Releasing AAC encoder");
        Ok(())
    }
}

/// Microphone capture through an FFmpeg input device, resampled to the
/// recording's PCM format.
pub struct FfmpegAudioCapture {
    input: format::context::Input,
    stream_index: usize,
    decoder: codec::decoder::Audio,
    resampler: Option<SamplerContext>,
    layout: ChannelLayout,
    sample_rate: u32,
    samples: VecDeque<i16>,
}

// The resampler is only touched from the thread that owns the capture.
unsafe impl Send for FfmpegAudioCapture {}

impl FfmpegAudioCapture {
    pub fn open(driver: &str, device: &str, config: &EncoderConfig) -> Result<Self> {
        let input_format = ffmpeg_next::device::input::audio()
            .find(|format| format.name() == driver)
            .ok_or_else(|| {
                Error::ResourceUnavailable(format!("Audio input driver '{driver}' not available"))
            })?;

        let mut opts = Dictionary::new();
        opts.set("sample_rate", &config.audio_sample_rate.to_string());
        opts.set("channels", &config.audio_channels.to_string());

        let context = format::open_with(
            &device.to_string(),
            &format::format::Format::Input(input_format),
            opts,
        )
        .map_err(|e| {
            Error::ResourceUnavailable(format!("Failed to open audio device '{device}': {e}"))
        })?;
        let format::context::Context::Input(input) = context else {
            return Err(Error::ResourceUnavailable(format!(
                "Audio device '{device}' is not an input"
            )));
        };

        let stream = input
            .streams()
            .best(media::Type::Audio)
            .ok_or_else(|| Error::ResourceUnavailable(format!("No audio stream on '{device}'")))?;
        let stream_index = stream.index();
        let decoder = codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .audio()?;

        info!(
            driver,
            device,
            rate = decoder.rate(),
            channels = decoder.channels(),
            "Audio capture opened"
        );
        Ok(Self {
            input,
            stream_index,
            decoder,
            resampler: None,
            layout: channel_layout(config.audio_channels),
            sample_rate: config.audio_sample_rate,
            samples: VecDeque::new(),
        })
    }

    fn read_packet(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(error) if is_again(&error) => {
                std::thread::sleep(Duration::from_millis(5));
                return Ok(());
            }
            Err(ffmpeg_next::Error::Eof) => {
                return Err(Error::ResourceUnavailable("Audio device closed".into()));
            }
            Err(error) => return Err(error.into()),
        }
        if packet.stream() != self.stream_index {
            return Ok(());
        }

        self.decoder.send_packet(&packet)?;
        let mut decoded = frame::Audio::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let resampler = match &mut self.resampler {
                Some(resampler) => resampler,
                resampler @ None => {
                    let mut in_layout = decoded.channel_layout();
                    if in_layout.is_empty() || in_layout.channels() == 0 {
                        in_layout = ChannelLayout::default(decoded.channels() as i32);
                    }
                    debug!(
                        format = ?decoded.format(),
                        rate = decoded.rate(),
                        channels = decoded.channels(),
                        "Audio capture resampler created"
                    );
                    resampler.insert(SamplerContext::get(
                        decoded.format(),
                        in_layout,
                        decoded.rate(),
                        PCM_FORMAT,
                        self.layout,
                        self.sample_rate,
                    )?)
                }
            };

            let mut resampled = frame::Audio::empty();
            resampler.run(&decoded, &mut resampled)?;
            let len = resampled.samples() * self.layout.channels() as usize * 2;
            let bytes = &resampled.data(0)[..len];
            self.samples.extend(
                bytes
                    .chunks_exact(2)
                    .map(|pair| i16::from_ne_bytes([pair[0], pair[1]])),
            );
        }
        Ok(())
    }
}

impl AudioCapture for FfmpegAudioCapture {
    fn start(&mut self) -> Result<()> {
        // Drop whatever the device buffered between open and start.
        self.samples.clear();
        debug!("Audio capture started");
        Ok(())
    }

    fn read(&mut self, pcm: &mut [i16]) -> Result<usize> {
        while self.samples.is_empty() {
            self.read_packet()?;
        }
        let count = pcm.len().min(self.samples.len());
        for (dst, src) in pcm.iter_mut().zip(self.samples.drain(..count)) {
            *dst = src;
        }
        trace!(count, "Audio samples read");
        Ok(count)
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!("Releasing audio capture");
        Ok(())
    }
}
