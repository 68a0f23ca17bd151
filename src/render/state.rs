use crate::encoder::EncoderConfig;
use crate::error::{Error, Result};
use crate::gles::Filter;
use std::path::PathBuf;
use tracing::{debug, info};

/// Size of the incoming frames, and whether filters have seen it yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    width: i32,
    height: i32,
    dirty: bool,
}

impl FrameGeometry {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            dirty: true,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    /// Zero or negative sizes show up while surfaces are torn down and
    /// recreated. Frames are not drawn at such sizes.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns true when the size actually changed.
    pub fn set(&mut self, width: i32, height: i32) -> bool {
        if (self.width, self.height) == (width, height) {
            return false;
        }
        self.width = width;
        self.height = height;
        self.dirty = true;
        true
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingStatus {
    #[default]
    Off,
    /// Requested; the pipeline is allocated at the next frame hand-off.
    Starting,
    /// Recording stayed enabled while the GL context was rebuilt; the
    /// existing pipeline is reattached at the next frame hand-off.
    Resuming,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEvent {
    Start,
    Stop,
    /// A frame was drawn into the recorder surface.
    FrameHandedOff,
    /// The recorder context was torn down without stopping the recording.
    ContextLost,
}

impl RecordingStatus {
    pub fn is_enabled(self) -> bool {
        self != RecordingStatus::Off
    }

    /// The recording transition table. Anything not listed is an
    /// `InvalidState`.
    pub fn apply(self, event: RecordingEvent) -> Result<RecordingStatus> {
        use RecordingEvent::*;
        use RecordingStatus::*;

        match (self, event) {
            (Off, Start) => Ok(Starting),
            (Starting | Resuming | On, Start) => Ok(self),
            (Starting | Resuming | On, Stop) => Ok(Off),
            (Starting | Resuming | On, FrameHandedOff) => Ok(On),
            (On, ContextLost) => Ok(Resuming),
            (Off | Starting | Resuming, ContextLost) => Ok(self),
            (Off, Stop | FrameHandedOff) => Err(Error::InvalidState(format!(
                "recording event {event:?} while {self:?}"
            ))),
        }
    }
}

/// Recording request and status. At most one session is active; its
/// encoder pipeline is owned by the renderer.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    status: RecordingStatus,
    output: Option<PathBuf>,
    frame_rate: u32,
    bits_per_pixel: u32,
    bit_rate: Option<usize>,
    filter: Filter,
}

impl RecordingSession {
    pub fn new(bits_per_pixel: u32) -> Self {
        Self {
            status: RecordingStatus::Off,
            output: None,
            frame_rate: 0,
            bits_per_pixel,
            bit_rate: None,
            filter: Filter::default(),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn output(&self) -> Option<&PathBuf> {
        self.output.as_ref()
    }

    pub fn bit_rate(&self) -> Option<usize> {
        self.bit_rate
    }

    /// Filter the recording is rendered with; always the preview's.
    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn set_filter(&mut self, filter: Filter) {
        if self.status.is_enabled() && self.filter != filter {
            debug!(?filter, "Recording switched filter");
        }
        self.filter = filter;
    }

    fn transition(&mut self, event: RecordingEvent) -> Result<RecordingStatus> {
        let next = self.status.apply(event)?;
        if next != self.status {
            info!(from = ?self.status, to = ?next, ?event, "Recording status changed");
        }
        self.status = next;
        Ok(next)
    }

    /// Returns false when a recording was already enabled and the request
    /// was ignored.
    pub fn request_start(&mut self, output: PathBuf, frame_rate: u32) -> Result<bool> {
        if frame_rate == 0 {
            return Err(Error::InvalidArgument("frame rate must be positive".into()));
        }
        if self.status.is_enabled() {
            debug!(status = ?self.status, "Recording already enabled");
            return Ok(false);
        }
        self.transition(RecordingEvent::Start)?;
        self.output = Some(output);
        self.frame_rate = frame_rate;
        self.bit_rate = None;
        Ok(true)
    }

    pub fn request_stop(&mut self) -> Result<()> {
        self.transition(RecordingEvent::Stop)?;
        self.output = None;
        self.bit_rate = None;
        Ok(())
    }

    pub fn frame_handed_off(&mut self) -> Result<()> {
        self.transition(RecordingEvent::FrameHandedOff).map(|_| ())
    }

    pub fn context_lost(&mut self) {
        // Defined for every status.
        let _ = self.transition(RecordingEvent::ContextLost);
    }

    /// Encoder settings for a pipeline recording frames of `geometry`.
    pub fn encoder_config(&mut self, geometry: &FrameGeometry) -> Result<EncoderConfig> {
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::InvalidState("no recording requested".into()))?;
        if !geometry.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "recording size {}x{}",
                geometry.width(),
                geometry.height()
            )));
        }
        let config = EncoderConfig::new(
            output,
            geometry.width() as u32,
            geometry.height() as u32,
            self.frame_rate,
            self.bits_per_pixel,
        );
        self.bit_rate = Some(config.bit_rate);
        Ok(config)
    }
}
