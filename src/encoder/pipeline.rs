use super::{
    AUDIO_SAMPLES_PER_READ, AudioCapture, AudioEncoder, DRAIN_TIMEOUT, END_OF_STREAM_TIMEOUT,
    EncodedBuffer, EncoderConfig, EncoderOutput, InputSurface, MediaBackend, Muxer, VideoEncoder,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    /// Encoders running, muxer open but waiting for the output formats.
    Encoding,
    /// Both tracks registered, muxer started, audio loop running.
    Muxing,
    /// End of stream requested from the video encoder.
    Draining,
    Stopped,
}

struct AudioLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<AudioLoopExit>,
}

struct AudioLoopExit {
    capture: Box<dyn AudioCapture>,
    encoder: Box<dyn AudioEncoder>,
    result: Result<()>,
}

/// Drives one recording: the video encoder fed through its input surface,
/// the audio capture and encode loop, and the muxer both write into.
///
/// Owned by the render thread. The only state shared with the audio thread
/// is the muxer and the loop's stop flag.
pub struct EncoderCore {
    state: EncoderState,
    config: EncoderConfig,
    video: Option<Box<dyn VideoEncoder>>,
    audio_encoder: Option<Box<dyn AudioEncoder>>,
    audio_capture: Option<Box<dyn AudioCapture>>,
    muxer: Option<Arc<dyn Muxer>>,
    input_surface: Option<InputSurface>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    muxer_started: bool,
    audio_loop: Option<AudioLoop>,
    clock: Instant,
}

impl EncoderCore {
    /// Starts both encoders and opens the muxer. Nothing is written until
    /// the video encoder reports its output format.
    pub fn start(backend: &dyn MediaBackend, config: EncoderConfig) -> Result<Self> {
        info!(
            output = %config.output.display(),
            width = config.width,
            height = config.height,
            frame_rate = config.frame_rate,
            bit_rate = config.bit_rate,
            "Starting encoder"
        );

        let mut core = Self {
            state: EncoderState::Idle,
            config,
            video: None,
            audio_encoder: None,
            audio_capture: None,
            muxer: None,
            input_surface: None,
            video_track: None,
            audio_track: None,
            muxer_started: false,
            audio_loop: None,
            clock: Instant::now(),
        };

        if let Err(error) = core.open(backend) {
            error!(%error, "Failed to start encoder");
            if let Err(release) = core.stop() {
                warn!(%release, "Failed to release partially started encoder");
            }
            return Err(error);
        }

        core.state = EncoderState::Encoding;
        Ok(core)
    }

    fn open(&mut self, backend: &dyn MediaBackend) -> Result<()> {
        let mut video = backend.create_video_encoder(&self.config)?;
        video.start()?;
        self.input_surface = Some(video.input_surface());
        self.video = Some(video);

        let mut audio_encoder = backend.create_audio_encoder(&self.config)?;
        audio_encoder.start()?;
        self.audio_encoder = Some(audio_encoder);

        self.audio_capture = Some(backend.create_audio_capture(&self.config)?);
        self.muxer = Some(backend.create_muxer(&self.config)?);
        Ok(())
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Surface the recorder render context presents into.
    pub fn input_surface(&self) -> Result<InputSurface> {
        self.input_surface
            .clone()
            .ok_or_else(|| Error::InvalidState("encoder has no input surface".into()))
    }

    /// Time since the session started. Video and audio timestamps are both
    /// taken from this clock.
    pub fn presentation_time(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Moves encoded video from the encoder to the muxer.
    ///
    /// Without `end_of_stream` this returns as soon as the encoder has no
    /// more output. With it, end of input is signalled first and draining
    /// continues until the end-of-stream buffer comes out, which also stops
    /// the audio loop. A failed audio loop is reported after the video tail
    /// has been drained.
    pub fn drain(&mut self, end_of_stream: bool) -> Result<()> {
        match self.state {
            EncoderState::Encoding | EncoderState::Muxing => {}
            state => {
                return Err(Error::InvalidState(format!("drain while {state:?}")));
            }
        }
        let audio = self.check_audio_loop();
        if !end_of_stream && audio.is_err() {
            return audio;
        }

        let mut video = self
            .video
            .take()
            .ok_or_else(|| Error::InvalidState("video encoder released".into()))?;
        let result = self.drain_video(&mut *video, end_of_stream);
        self.video = Some(video);
        result.and(audio)
    }

    fn drain_video(&mut self, video: &mut dyn VideoEncoder, end_of_stream: bool) -> Result<()> {
        let deadline = if end_of_stream {
            debug!("Signalling end of input to video encoder");
            video.signal_end_of_input()?;
            self.state = EncoderState::Draining;
            Some(Instant::now() + END_OF_STREAM_TIMEOUT)
        } else {
            None
        };

        loop {
            match video.dequeue_output(DRAIN_TIMEOUT)? {
                EncoderOutput::TryAgainLater => match deadline {
                    None => break,
                    Some(deadline) if Instant::now() >= deadline => {
                        warn!("Video encoder never reported end of stream, giving up");
                        self.signal_audio_stop();
                        break;
                    }
                    Some(_) => trace!("No output available yet, spinning to await EOS"),
                },
                EncoderOutput::FormatChanged => self.on_format_changed(&*video)?,
                EncoderOutput::Buffer(buffer) => {
                    if !buffer.codec_config && !buffer.data.is_empty() {
                        self.write_video(&buffer)?;
                    } else if buffer.codec_config {
                        debug!("Ignoring codec config buffer");
                    }

                    if buffer.end_of_stream {
                        if end_of_stream {
                            debug!("End of stream reached");
                        } else {
                            warn!("Reached end of stream unexpectedly");
                        }
                        self.signal_audio_stop();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn write_video(&self, buffer: &EncodedBuffer) -> Result<()> {
        let (Some(muxer), Some(track), true) = (&self.muxer, self.video_track, self.muxer_started)
        else {
            return Err(Error::ProtocolViolation("muxer hasn't started".into()));
        };
        trace!(size = buffer.data.len(), pts_us = buffer.pts_us, "Sent video buffer to muxer");
        muxer.write_sample(track, buffer)
    }

    fn on_format_changed(&mut self, video: &dyn VideoEncoder) -> Result<()> {
        if self.muxer_started {
            return Err(Error::ProtocolViolation("format changed twice".into()));
        }
        let muxer = self
            .muxer
            .clone()
            .ok_or_else(|| Error::InvalidState("muxer released".into()))?;
        let audio_encoder = self
            .audio_encoder
            .take()
            .ok_or_else(|| Error::InvalidState("audio encoder released".into()))?;
        let audio_capture = self
            .audio_capture
            .take()
            .ok_or_else(|| Error::InvalidState("audio capture released".into()))?;

        let registered = video.output_format().and_then(|video_format| {
            let audio_format = audio_encoder.output_format()?;
            info!(?video_format, ?audio_format, "Encoder output formats changed");
            let video_track = muxer.add_track(&video_format)?;
            let audio_track = muxer.add_track(&audio_format)?;
            muxer.start()?;
            Ok((video_track, audio_track))
        });
        let (video_track, audio_track) = match registered {
            Ok(tracks) => tracks,
            Err(error) => {
                self.audio_encoder = Some(audio_encoder);
                self.audio_capture = Some(audio_capture);
                return Err(error);
            }
        };

        self.video_track = Some(video_track);
        self.audio_track = Some(audio_track);
        self.muxer_started = true;
        if self.state == EncoderState::Encoding {
            self.state = EncoderState::Muxing;
        }
        debug!(video_track, audio_track, "Muxer started");

        let stop = Arc::new(AtomicBool::new(false));
        let clock = self.clock;
        let loop_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("audio-encoder".into())
            .spawn(move || {
                run_audio_loop(audio_capture, audio_encoder, muxer, audio_track, loop_stop, clock)
            })?;
        self.audio_loop = Some(AudioLoop { stop, handle });
        Ok(())
    }

    fn signal_audio_stop(&self) {
        if let Some(audio_loop) = &self.audio_loop {
            audio_loop.stop.store(true, Ordering::Release);
        }
    }

    /// Fails when the audio loop exited without being asked to.
    fn check_audio_loop(&mut self) -> Result<()> {
        let exited = self.audio_loop.as_ref().is_some_and(|audio_loop| {
            audio_loop.handle.is_finished() && !audio_loop.stop.load(Ordering::Acquire)
        });
        if !exited {
            return Ok(());
        }
        match self.join_audio_loop() {
            Some(Err(error)) => Err(error),
            _ => Err(Error::ResourceUnavailable("audio loop exited".into())),
        }
    }

    /// Stops the audio loop and takes back its capture device and encoder.
    fn join_audio_loop(&mut self) -> Option<Result<()>> {
        let audio_loop = self.audio_loop.take()?;
        audio_loop.stop.store(true, Ordering::Release);
        match audio_loop.handle.join() {
            Ok(exit) => {
                self.audio_capture = Some(exit.capture);
                self.audio_encoder = Some(exit.encoder);
                Some(exit.result)
            }
            Err(_) => {
                error!("Audio loop panicked");
                Some(Err(Error::ResourceUnavailable("audio loop panicked".into())))
            }
        }
    }

    /// Releases the audio capture device, the audio encoder, the video
    /// encoder and the muxer, in that order, after the audio loop has
    /// exited. A muxer that fails to finalize is logged and ignored.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == EncoderState::Stopped {
            return Ok(());
        }
        info!(state = ?self.state, "Stopping encoder");

        let mut result = Ok(());
        let mut keep_first = |step: Result<()>, what: &str| {
            if let Err(error) = step {
                warn!(%error, "Failed to release {what}");
                if result.is_ok() {
                    result = Err(error);
                }
            }
        };

        if let Some(audio_result) = self.join_audio_loop() {
            keep_first(audio_result, "audio loop");
        }
        if let Some(capture) = self.audio_capture.take() {
            keep_first(capture.release(), "audio capture");
        }
        if let Some(audio_encoder) = self.audio_encoder.take() {
            keep_first(audio_encoder.release(), "audio encoder");
        }
        self.input_surface = None;
        if let Some(video) = self.video.take() {
            keep_first(video.release(), "video encoder");
        }
        if let Some(muxer) = self.muxer.take() {
            if let Err(error) = muxer.stop() {
                debug!(%error, started = self.muxer_started, "Muxer finalize failed, ignoring");
            }
        }

        self.muxer_started = false;
        self.state = EncoderState::Stopped;
        result
    }
}

impl Drop for EncoderCore {
    fn drop(&mut self) {
        if self.state != EncoderState::Stopped {
            if let Err(error) = self.stop() {
                warn!(%error, "Failed to stop encoder on drop");
            }
        }
    }
}

fn run_audio_loop(
    mut capture: Box<dyn AudioCapture>,
    mut encoder: Box<dyn AudioEncoder>,
    muxer: Arc<dyn Muxer>,
    track: usize,
    stop: Arc<AtomicBool>,
    clock: Instant,
) -> AudioLoopExit {
    debug!(track, "Audio loop started");
    let result = audio_loop(&mut *capture, &mut *encoder, &*muxer, track, &stop, clock);
    match &result {
        Ok(()) => debug!("Audio loop stopped"),
        Err(error) => error!(%error, "Audio loop failed"),
    }
    AudioLoopExit {
        capture,
        encoder,
        result,
    }
}

fn audio_loop(
    capture: &mut dyn AudioCapture,
    encoder: &mut dyn AudioEncoder,
    muxer: &dyn Muxer,
    track: usize,
    stop: &AtomicBool,
    clock: Instant,
) -> Result<()> {
    capture.start()?;
    let mut pcm = vec![0i16; AUDIO_SAMPLES_PER_READ];

    while !stop.load(Ordering::Acquire) {
        let read = capture.read(&mut pcm)?;
        if read > 0 {
            let pts_us = clock.elapsed().as_micros() as i64;
            if !encoder.queue_input(&pcm[..read], pts_us)? {
                trace!(read, "Audio encoder input full, samples dropped");
            }
        }
        drain_audio(encoder, muxer, track)?;
    }
    drain_audio(encoder, muxer, track)
}

fn drain_audio(encoder: &mut dyn AudioEncoder, muxer: &dyn Muxer, track: usize) -> Result<()> {
    loop {
        match encoder.dequeue_output(DRAIN_TIMEOUT)? {
            EncoderOutput::TryAgainLater => return Ok(()),
            // The track was registered from the format reported at start.
            EncoderOutput::FormatChanged => debug!("Audio encoder format changed"),
            EncoderOutput::Buffer(buffer) => {
                if !buffer.codec_config && !buffer.data.is_empty() {
                    trace!(size = buffer.data.len(), pts_us = buffer.pts_us, "Sent audio buffer to muxer");
                    muxer.write_sample(track, &buffer)?;
                }
                if buffer.end_of_stream {
                    return Ok(());
                }
            }
        }
    }
}
