//! The frame renderer: applies the active filter to every incoming frame,
//! draws it to the preview and, while recording, a second time into the
//! encoder's input surface.

mod frame;
mod state;
mod thread;

pub use frame::{FrameBuffer, LatestFrame};
pub use state::{FrameGeometry, RecordingEvent, RecordingSession, RecordingStatus};
pub use thread::{RenderCommand, RenderHandle, RenderThread, RendererStatus};

use crate::encoder::{EncoderCore, EncoderState, MediaBackend};
use crate::error::{Error, Result};
use crate::gles::{
    Filter, FilterProgram, FullFrame, GlPlatform, IDENTITY_MATRIX, PresentationTarget,
    RenderContext,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidGeometry,
    NoSurface,
    NoFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Skipped(SkipReason),
    Drawn { recorded: bool },
}

/// Counters published with the renderer status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_drawn: u64,
    pub frames_recorded: u64,
    pub frames_skipped: u64,
    pub programs_compiled: u64,
    pub texture_size_updates: u64,
}

fn gl_of<P: GlPlatform>(platform: &P) -> Result<&P::Gl> {
    platform
        .gl()
        .ok_or_else(|| Error::ResourceUnavailable("GL is not loaded".into()))
}

/// Owns every GL context of the process and the recording pipeline. Lives
/// on the render thread.
///
/// A 1x1 off-screen base context is created first; the preview and recorder
/// contexts share its objects, so the filter program and its texture serve
/// both passes.
pub struct FrameRenderer<P: GlPlatform, B: MediaBackend> {
    platform: P,
    backend: B,
    latest: LatestFrame,
    base: Option<RenderContext<P>>,
    preview: Option<RenderContext<P>>,
    recorder: Option<RenderContext<P>>,
    active: Option<FilterProgram<P::Gl>>,
    active_filter: Option<Filter>,
    requested_filter: Filter,
    texture_size_stale: bool,
    geometry: FrameGeometry,
    session: RecordingSession,
    encoder: Option<EncoderCore>,
    last_pts: Option<Duration>,
    stats: RenderStats,
}

impl<P: GlPlatform, B: MediaBackend> FrameRenderer<P, B> {
    pub fn new(mut platform: P, backend: B, latest: LatestFrame, bits_per_pixel: u32) -> Result<Self> {
        let base = RenderContext::create(&mut platform, PresentationTarget::Offscreen, 1, 1, None)?;
        info!("Frame renderer ready");
        Ok(Self {
            platform,
            backend,
            latest,
            base: Some(base),
            preview: None,
            recorder: None,
            active: None,
            active_filter: None,
            requested_filter: Filter::default(),
            texture_size_stale: true,
            geometry: FrameGeometry::default(),
            session: RecordingSession::new(bits_per_pixel),
            encoder: None,
            last_pts: None,
            stats: RenderStats::default(),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn active_filter(&self) -> Option<Filter> {
        self.active_filter
    }

    pub fn requested_filter(&self) -> Filter {
        self.requested_filter
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.session.status()
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn encoder_state(&self) -> Option<EncoderState> {
        self.encoder.as_ref().map(EncoderCore::state)
    }

    /// Takes effect at the next frame.
    pub fn set_filter(&mut self, filter: Filter) {
        if filter != self.requested_filter {
            debug!(?filter, "Filter requested");
        }
        self.requested_filter = filter;
    }

    /// Records the incoming frame size. While a recording pipeline exists,
    /// a different valid size is rejected and the geometry stays unchanged.
    pub fn on_geometry_changed(&mut self, width: i32, height: i32) -> Result<()> {
        if let Some(encoder) = &self.encoder {
            let config = encoder.config();
            let recording = (config.width as i32, config.height as i32);
            if width > 0 && height > 0 && (width, height) != recording {
                return Err(Error::GeometryRejected(format!(
                    "frame size {width}x{height} while recording at {}x{}",
                    recording.0, recording.1
                )));
            }
        }
        if self.geometry.set(width, height) {
            debug!(width, height, "Frame geometry changed");
        }
        Ok(())
    }

    /// Creates the preview context for a newly available screen surface,
    /// replacing any previous one.
    pub fn on_surface_available(
        &mut self,
        target: PresentationTarget<P::Widget>,
        width: i32,
        height: i32,
    ) -> Result<()> {
        self.destroy_preview();
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| Error::InvalidState("renderer shut down".into()))?;
        let preview = RenderContext::create(&mut self.platform, target, width, height, Some(base))?;
        info!(width, height, kind = ?preview.kind(), "Preview surface available");
        self.preview = Some(preview);
        Ok(())
    }

    pub fn on_surface_destroyed(&mut self) {
        info!("Preview surface destroyed");
        self.destroy_preview();
    }

    /// Releases the filter program and the recorder context. An enabled
    /// recording keeps its pipeline and resumes on the next frame.
    pub fn on_pause(&mut self) {
        info!(recording = ?self.session.status(), "Pausing renderer");
        self.release_program();
        self.destroy_recorder();
        self.session.context_lost();
    }

    pub fn on_resume(&mut self) {
        info!(recording = ?self.session.status(), "Resuming renderer");
        self.geometry.mark_dirty();
    }

    pub fn start_recording(&mut self, output: PathBuf, frame_rate: u32) -> Result<()> {
        if self.session.request_start(output.clone(), frame_rate)? {
            info!(output = %output.display(), frame_rate, "Recording requested");
        }
        Ok(())
    }

    /// Drains the encoder to end of stream and tears the pipeline down.
    pub fn stop_recording(&mut self) -> Result<()> {
        self.session.request_stop()?;
        self.teardown_recording(true)
    }

    /// Draws the newest frame to the preview and, while recording, to the
    /// recorder surface.
    pub fn on_frame_ready(&mut self) -> Result<FrameOutcome> {
        if !self.geometry.is_valid() {
            trace!(size = ?self.geometry.size(), "Skipping frame, invalid geometry");
            return Ok(self.skip(SkipReason::InvalidGeometry));
        }
        if self.preview.is_none() {
            return Ok(self.skip(SkipReason::NoSurface));
        }
        let Some(frame) = self.latest.latest().filter(FrameBuffer::is_complete) else {
            return Ok(self.skip(SkipReason::NoFrame));
        };

        if let Some(preview) = &self.preview {
            preview.make_current(&mut self.platform)?;
        }
        self.install_filter()?;
        self.update_texture_size()?;
        self.draw_frame(&frame)?;
        if let Some(preview) = self.preview.as_mut() {
            preview.swap_buffers(&mut self.platform, None)?;
        }
        self.stats.frames_drawn += 1;

        let recorded = match self.record_frame(&frame) {
            Ok(recorded) => recorded,
            Err(error) => {
                self.abort_recording(&error);
                return Err(error);
            }
        };
        Ok(FrameOutcome::Drawn { recorded })
    }

    fn skip(&mut self, reason: SkipReason) -> FrameOutcome {
        self.stats.frames_skipped += 1;
        FrameOutcome::Skipped(reason)
    }

    /// Compiles a new program only when the program kind changes; other
    /// filter switches only update the kernel.
    fn install_filter(&mut self) -> Result<()> {
        let requested = self.requested_filter;
        if self.active_filter == Some(requested) && self.active.is_some() {
            return Ok(());
        }

        let kind = requested.program_kind();
        if self.active.as_ref().map(FilterProgram::kind) != Some(kind) {
            let gl = gl_of(&self.platform)?;
            let program = match FilterProgram::compile(gl, kind) {
                Ok(program) => program,
                Err(error) => {
                    warn!(%error, ?requested, "Filter program failed, keeping previous filter");
                    self.requested_filter = self.active_filter.unwrap_or_default();
                    return Err(error);
                }
            };
            if let Some(previous) = self.active.replace(program) {
                previous.release(gl);
            }
            self.stats.programs_compiled += 1;
            self.texture_size_stale = true;
        }

        if let (Some(program), Some((kernel, color_adjust))) =
            (self.active.as_mut(), requested.kernel())
        {
            program.set_kernel(&kernel, color_adjust)?;
        }
        self.active_filter = Some(requested);
        self.session.set_filter(requested);
        debug!(?requested, ?kind, "Filter installed");
        Ok(())
    }

    fn update_texture_size(&mut self) -> Result<()> {
        if !self.texture_size_stale && !self.geometry.is_dirty() {
            return Ok(());
        }
        let program = self
            .active
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no filter program installed".into()))?;
        program.set_texture_size(self.geometry.width(), self.geometry.height());
        self.texture_size_stale = false;
        self.geometry.mark_clean();
        self.stats.texture_size_updates += 1;
        Ok(())
    }

    /// Uploads `frame` and draws it into the current context.
    fn draw_frame(&self, frame: &FrameBuffer) -> Result<()> {
        let gl = gl_of(&self.platform)?;
        let program = self
            .active
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no filter program installed".into()))?;
        program.upload(gl, frame.width as i32, frame.height as i32, &frame.data);
        FullFrame::pre_draw(gl, program);
        FullFrame::draw(gl, program, program.texture(), &IDENTITY_MATRIX)
    }

    /// Second pass into the recorder surface. Allocates the pipeline and
    /// the recorder context on the first hand-off after a start or resume.
    fn record_frame(&mut self, frame: &FrameBuffer) -> Result<bool> {
        if !self.session.status().is_enabled() {
            return Ok(false);
        }

        if self.encoder.is_none() {
            let config = self.session.encoder_config(&self.geometry)?;
            self.encoder = Some(EncoderCore::start(&self.backend, config)?);
            self.last_pts = None;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(false);
        };

        if self.recorder.is_none() {
            let input = encoder.input_surface()?;
            let (width, height) = (encoder.config().width as i32, encoder.config().height as i32);
            let base = self
                .base
                .as_ref()
                .ok_or_else(|| Error::InvalidState("renderer shut down".into()))?;
            let recorder = RenderContext::create(
                &mut self.platform,
                PresentationTarget::Encoder(input),
                width,
                height,
                Some(base),
            )?;
            info!(width, height, "Recorder surface attached");
            self.recorder = Some(recorder);
        }

        if let Some(recorder) = &self.recorder {
            recorder.make_current(&mut self.platform)?;
        }
        self.draw_frame(frame)?;

        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(false);
        };
        encoder.drain(false)?;

        let mut pts = encoder.presentation_time();
        if let Some(last) = self.last_pts {
            if pts <= last {
                pts = last + Duration::from_micros(1);
            }
        }
        self.last_pts = Some(pts);

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.swap_buffers(&mut self.platform, Some(pts))?;
        }
        self.session.frame_handed_off()?;
        self.stats.frames_recorded += 1;

        if let Some(preview) = &self.preview {
            preview.make_current(&mut self.platform)?;
        }
        Ok(true)
    }

    fn teardown_recording(&mut self, drain: bool) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut encoder) = self.encoder.take() {
            if drain && matches!(encoder.state(), EncoderState::Encoding | EncoderState::Muxing) {
                if let Err(error) = encoder.drain(true) {
                    warn!(%error, "Failed to drain encoder at end of stream");
                    result = Err(error);
                }
            }
            if let Err(error) = encoder.stop() {
                warn!(%error, "Failed to stop encoder");
                result = result.and(Err(error));
            }
        }
        self.destroy_recorder();
        self.last_pts = None;
        info!("Recording stopped");
        result
    }

    /// Stops the recording after `cause`. The encoder is still drained to
    /// end of stream unless it broke the muxing protocol.
    pub fn abort_recording(&mut self, cause: &Error) {
        error!(error = %cause, "Recording failed, stopping");
        if self.session.status().is_enabled() {
            let _ = self.session.request_stop();
        }
        let drain = !matches!(cause, Error::ProtocolViolation(_));
        if let Err(error) = self.teardown_recording(drain) {
            warn!(%error, "Failed to release recording pipeline");
        }
    }

    /// Deletes the filter program with the base context current. The next
    /// frame compiles a fresh one.
    fn release_program(&mut self) {
        let Some(program) = self.active.take() else {
            return;
        };
        if let Some(base) = &self.base {
            if let Err(error) = base.make_current(&mut self.platform) {
                warn!(%error, "Failed to make base context current, leaking program");
                return;
            }
        }
        if let Some(gl) = self.platform.gl() {
            program.release(gl);
        }
        self.active_filter = None;
        self.texture_size_stale = true;
    }

    fn destroy_recorder(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            if let Err(error) = recorder.destroy(&mut self.platform) {
                warn!(%error, "Failed to destroy recorder context");
            }
        }
    }

    fn destroy_preview(&mut self) {
        if let Some(preview) = self.preview.take() {
            if let Err(error) = preview.destroy(&mut self.platform) {
                warn!(%error, "Failed to destroy preview context");
            }
        }
    }

    /// Stops any recording and releases every GL object and context. The
    /// base context goes last since it owns the shared objects.
    pub fn shutdown(mut self) -> Result<()> {
        info!("Shutting down frame renderer");
        let mut result = Ok(());
        if self.session.status().is_enabled() {
            let _ = self.session.request_stop();
            result = self.teardown_recording(true);
        }
        self.release_program();
        self.destroy_recorder();
        self.destroy_preview();
        if let Some(base) = self.base.take() {
            result = result.and(base.destroy(&mut self.platform));
        }
        result
    }
}
