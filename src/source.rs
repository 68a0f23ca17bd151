//! Demo frame source: decodes a camera device or media file with FFmpeg and
//! publishes RGB frames to the renderer.

use crate::error::{Error, Result};
use crate::render::{FrameBuffer, LatestFrame, RenderHandle};
use bytes::BytesMut;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags};
use ffmpeg_next::{Dictionary, Packet, Rational, codec, format, frame, media};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub struct FrameSource {
    input: format::context::Input,
    stream_index: usize,
    decoder: codec::decoder::Video,
    time_base: Rational,
    scaler: Option<(Scaler, u32, u32, Pixel)>,
    /// Files are paced to their timestamps; devices deliver in real time.
    paced: bool,
}

// Decoder and scaler are only used by the source thread.
unsafe impl Send for FrameSource {}

impl FrameSource {
    /// Opens `input`, through the FFmpeg input device `input_format` when
    /// given (`v4l2`, `avfoundation`, ...), otherwise as a media file or URL.
    pub fn open(input: &str, input_format: Option<&str>) -> Result<Self> {
        ffmpeg_next::init()?;
        ffmpeg_next::device::register_all();

        let (input_ctx, paced) = match input_format {
            Some(name) => {
                let device = ffmpeg_next::device::input::video()
                    .find(|format| format.name() == name)
                    .ok_or_else(|| {
                        Error::ResourceUnavailable(format!("Video input format '{name}' not available"))
                    })?;
                let context = format::open_with(
                    &input.to_string(),
                    &format::format::Format::Input(device),
                    Dictionary::new(),
                )?;
                let format::context::Context::Input(input_ctx) = context else {
                    return Err(Error::ResourceUnavailable(format!("'{input}' is not an input")));
                };
                (input_ctx, false)
            }
            None => (format::input(&input.to_string())?, true),
        };

        let stream = input_ctx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| Error::ResourceUnavailable(format!("No video stream in '{input}'")))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let decoder = codec::context::Context::from_parameters(stream.parameters())?
            .decoder()
            .video()?;

        info!(
            input,
            width = decoder.width(),
            height = decoder.height(),
            format = ?decoder.format(),
            paced,
            "Frame source opened"
        );
        Ok(Self {
            input: input_ctx,
            stream_index,
            decoder,
            time_base,
            scaler: None,
            paced,
        })
    }

    /// Decodes until `stop` is set or the input ends, publishing every frame
    /// and notifying the render thread.
    pub fn spawn<W: Send + 'static>(
        mut self,
        latest: LatestFrame,
        renderer: RenderHandle<W>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<Result<()>>> {
        let handle = std::thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                let result = self.run(&latest, &renderer, &stop);
                if let Err(error) = &result {
                    warn!(%error, "Frame source stopped");
                }
                result
            })?;
        Ok(handle)
    }

    fn run<W>(
        &mut self,
        latest: &LatestFrame,
        renderer: &RenderHandle<W>,
        stop: &AtomicBool,
    ) -> Result<()> {
        let started = Instant::now();
        let mut size = None;
        let mut published = 0u64;
        let mut replaced = 0u64;

        while !stop.load(Ordering::Acquire) {
            let Some((frame, pts)) = self.next_frame()? else {
                info!(published, "Frame source reached end of input");
                break;
            };

            if self.paced {
                if let Some(due) = pts.and_then(|pts| self.offset(pts)) {
                    let elapsed = started.elapsed();
                    if due > elapsed {
                        std::thread::sleep(due - elapsed);
                    }
                }
            }

            if size != Some((frame.width, frame.height)) {
                size = Some((frame.width, frame.height));
                renderer.geometry_changed(frame.width as i32, frame.height as i32)?;
            }
            if latest.publish(frame) {
                replaced += 1;
                trace!(replaced, "Undrawn frame replaced");
            }
            renderer.frame_ready()?;
            published += 1;
        }

        debug!(published, replaced, "Frame source finished");
        Ok(())
    }

    fn offset(&self, pts: i64) -> Option<Duration> {
        let Rational(num, den) = self.time_base;
        if pts < 0 || num <= 0 || den <= 0 {
            return None;
        }
        let micros = pts as i128 * num as i128 * 1_000_000 / den as i128;
        Some(Duration::from_micros(micros as u64))
    }

    /// Next decoded frame as RGB24, or `None` at end of input.
    fn next_frame(&mut self) -> Result<Option<(FrameBuffer, Option<i64>)>> {
        let mut decoded = frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded.timestamp().or(decoded.pts());
                return self.convert(&decoded).map(|frame| Some((frame, pts)));
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder.send_packet(&packet)?;
                    }
                }
                Err(ffmpeg_next::Error::Eof) => {
                    self.decoder.send_eof()?;
                    return match self.decoder.receive_frame(&mut decoded) {
                        Ok(()) => {
                            let pts = decoded.pts();
                            self.convert(&decoded).map(|frame| Some((frame, pts)))
                        }
                        Err(_) => Ok(None),
                    };
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn convert(&mut self, decoded: &frame::Video) -> Result<FrameBuffer> {
        let (width, height, format) = (decoded.width(), decoded.height(), decoded.format());
        let rebuild = !matches!(&self.scaler, Some((_, w, h, f)) if (*w, *h, *f) == (width, height, format));
        if rebuild {
            debug!(width, height, ?format, "Creating RGB scaler");
            let scaler = Scaler::get(format, width, height, Pixel::RGB24, width, height, Flags::BILINEAR)?;
            self.scaler = Some((scaler, width, height, format));
        }
        let Some((scaler, ..)) = self.scaler.as_mut() else {
            return Err(Error::InvalidState("scaler missing".into()));
        };

        let mut rgb = frame::Video::empty();
        scaler.run(decoded, &mut rgb)?;

        let row = width as usize * 3;
        let stride = rgb.stride(0);
        let plane = rgb.data(0);
        let mut data = BytesMut::with_capacity(row * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&plane[y * stride..y * stride + row]);
        }
        Ok(FrameBuffer::new(width, height, data.freeze()))
    }
}
