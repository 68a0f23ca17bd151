use super::{CodecParameters, MICROSECONDS, NUM_CPUS, is_again};
use crate::encoder::{
    EncodedBuffer, EncoderConfig, EncoderOutput, FrameSink, InputSurface, RgbaFrame, TrackFormat,
    TrackKind, VideoEncoder,
};
use crate::error::{Error, Result};
use async_channel::TryRecvError;
use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags};
use ffmpeg_next::{Dictionary, Packet, Rational, codec, frame, threading};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

enum WorkerInput {
    Frame(RgbaFrame),
    EndOfInput,
}

/// Input surface of [`FfmpegVideoEncoder`]. Frames go straight to the
/// encoder worker.
struct FrameQueue {
    sender: async_channel::Sender<WorkerInput>,
}

impl FrameSink for FrameQueue {
    fn queue_frame(&self, frame: RgbaFrame) -> Result<()> {
        self.sender
            .try_send(WorkerInput::Frame(frame))
            .map_err(|_| Error::ResourceUnavailable("video encoder input closed".into()))
    }
}

/// Software H.264 encoding of read-back frames, converted from RGBA to
/// YUV 4:2:0 on a dedicated "video-encoder" thread. Encoded packets are
/// picked up by [`VideoEncoder::dequeue_output`].
pub struct FfmpegVideoEncoder {
    input: async_channel::Sender<WorkerInput>,
    output: async_channel::Receiver<Result<EncodedBuffer>>,
    surface: InputSurface,
    parameters: codec::Parameters,
    worker: Option<JoinHandle<()>>,
    format_reported: bool,
}

// Parameters are a private copy taken when the encoder was opened.
unsafe impl Send for FfmpegVideoEncoder {}

impl FfmpegVideoEncoder {
    #[allow(clippy::field_reassign_with_default)]
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let h264 = codec::encoder::find(codec::Id::H264)
            .ok_or_else(|| Error::EncoderUnavailable("H.264 encoder not found".into()))?;

        let mut enc_config = codec::Context::new_with_codec(h264)
            .encoder()
            .video()
            .map_err(|e| Error::EncoderUnavailable(format!("H.264 encoder config: {e}")))?;

        enc_config.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut threading_config = threading::Config::default();
        threading_config.count = *NUM_CPUS;
        threading_config.kind = threading::Type::Slice;
        enc_config.set_threading(threading_config);

        enc_config.set_format(Pixel::YUV420P);
        enc_config.set_width(config.width);
        enc_config.set_height(config.height);
        enc_config.set_time_base(MICROSECONDS);
        enc_config.set_frame_rate(Some(Rational::new(config.frame_rate as i32, 1)));
        enc_config.set_bit_rate(config.bit_rate);
        enc_config.set_gop(config.gop_size());
        enc_config.set_max_b_frames(0);

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");

        let encoder = enc_config
            .open_with(opts)
            .map_err(|e| Error::EncoderUnavailable(format!("Failed to open H.264 encoder: {e}")))?;
        debug!(
            width = config.width,
            height = config.height,
            bit_rate = config.bit_rate,
            gop = config.gop_size(),
            "H.264 encoder opened"
        );

        let scaler = Scaler::get(
            Pixel::RGBA,
            config.width,
            config.height,
            Pixel::YUV420P,
            config.width,
            config.height,
            Flags::BILINEAR,
        )?;
        let parameters: codec::Parameters = (&encoder).into();

        let (input, frames) = async_channel::unbounded();
        let (packets, output) = async_channel::unbounded();
        let worker = EncodeWorker {
            encoder,
            scaler,
            width: config.width,
            height: config.height,
        };
        let worker = std::thread::Builder::new()
            .name("video-encoder".into())
            .spawn(move || worker.run(frames, packets))?;

        Ok(Self {
            surface: Arc::new(FrameQueue {
                sender: input.clone(),
            }),
            input,
            output,
            parameters,
            worker: Some(worker),
            format_reported: false,
        })
    }
}

impl VideoEncoder for FfmpegVideoEncoder {
    fn input_surface(&self) -> InputSurface {
        self.surface.clone()
    }

    fn start(&mut self) -> Result<()> {
        debug!("H.264 encoder started");
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        self.input
            .try_send(WorkerInput::EndOfInput)
            .map_err(|_| Error::ResourceUnavailable("video encoder input closed".into()))
    }

    /// Waits up to `timeout` for the worker's next packet.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        // Stream parameters are fixed once the encoder is open.
        if !self.format_reported {
            self.format_reported = true;
            return Ok(EncoderOutput::FormatChanged);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.output.try_recv() {
                Ok(buffer) => return buffer.map(EncoderOutput::Buffer),
                Err(TryRecvError::Closed) => {
                    return Err(Error::ResourceUnavailable("video encoder worker exited".into()));
                }
                Err(TryRecvError::Empty) if Instant::now() >= deadline => {
                    return Ok(EncoderOutput::TryAgainLater);
                }
                Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn output_format(&self) -> Result<TrackFormat> {
        Ok(TrackFormat::new(TrackKind::Video, "h264").with_native(CodecParameters {
            parameters: self.parameters.clone(),
            time_base: MICROSECONDS,
        }))
    }

    fn release(mut self: Box<Self>) -> Result<()> {
        debug!("Releasing H.264 encoder");
        self.input.close();
        self.output.close();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| Error::ResourceUnavailable("video encoder worker panicked".into()))?;
        }
        Ok(())
    }
}

/// Owns the codec and the scaler; lives on the "video-encoder" thread.
struct EncodeWorker {
    encoder: codec::encoder::video::Encoder,
    scaler: Scaler,
    width: u32,
    height: u32,
}

// The codec and the scaler move to the worker once and stay there.
unsafe impl Send for EncodeWorker {}

impl EncodeWorker {
    fn run(
        mut self,
        input: async_channel::Receiver<WorkerInput>,
        output: async_channel::Sender<Result<EncodedBuffer>>,
    ) {
        debug!("Video encoder worker started");
        while let Ok(message) = input.recv_blocking() {
            let result = match message {
                WorkerInput::Frame(frame) => self.encode(frame),
                WorkerInput::EndOfInput => {
                    debug!("Sending EOF to H.264 encoder");
                    self.encoder.send_eof().map_err(Error::from)
                }
            };
            let keep_going = match result {
                Ok(()) => self.receive_packets(&output),
                Err(error) => {
                    error!(%error, "Video encoding failed");
                    let _ = output.send_blocking(Err(error));
                    false
                }
            };
            if !keep_going {
                break;
            }
        }
        debug!("Video encoder worker stopped");
    }

    /// Forwards every packet the codec has ready. Returns false once the
    /// codec is drained or nobody is listening.
    fn receive_packets(&mut self, output: &async_channel::Sender<Result<EncodedBuffer>>) -> bool {
        loop {
            let mut packet = Packet::empty();
            let buffer = match self.encoder.receive_packet(&mut packet) {
                Ok(()) => EncodedBuffer {
                    data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                    pts_us: packet.pts().unwrap_or(0),
                    key_frame: packet.is_key(),
                    codec_config: false,
                    end_of_stream: false,
                },
                Err(ffmpeg_next::Error::Eof) => {
                    let _ = output.send_blocking(Ok(EncodedBuffer::end_of_stream()));
                    return false;
                }
                Err(error) if is_again(&error) => return true,
                Err(error) => {
                    let _ = output.send_blocking(Err(error.into()));
                    return false;
                }
            };
            if output.send_blocking(Ok(buffer)).is_err() {
                debug!("Encoder released, dropping remaining packets");
                return false;
            }
        }
    }

    fn encode(&mut self, frame: RgbaFrame) -> Result<()> {
        let row = self.width as usize * 4;
        if frame.width != self.width
            || frame.height != self.height
            || frame.data.len() < row * self.height as usize
        {
            return Err(Error::InvalidArgument(format!(
                "{}x{} frame for a {}x{} encoder",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut rgba = frame::Video::new(Pixel::RGBA, self.width, self.height);
        let stride = rgba.stride(0);
        let plane = rgba.data_mut(0);
        for (y, line) in frame.data.chunks_exact(row).take(self.height as usize).enumerate() {
            plane[y * stride..y * stride + row].copy_from_slice(line);
        }

        let mut yuv = frame::Video::empty();
        self.scaler.run(&rgba, &mut yuv)?;
        yuv.set_pts(Some(frame.pts_us));
        trace!(pts_us = frame.pts_us, "Encoding frame");
        self.encoder.send_frame(&yuv)?;
        Ok(())
    }
}
