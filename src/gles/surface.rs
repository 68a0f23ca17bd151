use crate::encoder::{InputSurface, RgbaFrame};
use crate::error::{Error, Result};
use crate::gles::GpuApi;
use bytes::BytesMut;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What a [`RenderContext`] presents into.
pub enum PresentationTarget<W> {
    /// A window surface handed over by the host shell.
    Screen(W),
    /// An off-screen pixel buffer; used for the resource-owning base context
    /// and for headless previews.
    Offscreen,
    /// The input surface of a video encoder. Every swap hands the rendered
    /// frame to the encoder.
    Encoder(InputSurface),
}

impl<W> PresentationTarget<W> {
    pub fn kind(&self) -> TargetKind {
        match self {
            PresentationTarget::Screen(_) => TargetKind::Screen,
            PresentationTarget::Offscreen => TargetKind::Offscreen,
            PresentationTarget::Encoder(_) => TargetKind::Encoder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Screen,
    Offscreen,
    Encoder,
}

/// Window-system glue: creates GL contexts bound to presentation surfaces
/// and switches which one is current on the calling thread.
///
/// Implementations are not thread-safe; a platform lives and dies on the
/// render thread.
pub trait GlPlatform {
    type Widget;
    type Context;
    type Gl: GpuApi;

    /// Creates a context bound to a surface for `target`, sharing objects
    /// with `shared` when given, and leaves it current.
    fn create_context(
        &mut self,
        target: &mut PresentationTarget<Self::Widget>,
        width: i32,
        height: i32,
        shared: Option<&Self::Context>,
    ) -> Result<Self::Context>;

    fn make_current(&mut self, context: &Self::Context) -> Result<()>;

    fn make_none_current(&mut self) -> Result<()>;

    /// Shows the rendered image of a window surface. Off-screen surfaces
    /// only need their commands flushed.
    fn present(&mut self, context: &mut Self::Context) -> Result<()>;

    fn destroy_context(&mut self, context: Self::Context) -> Result<()>;

    /// Loaded GL entry points, available once a context has been created.
    fn gl(&self) -> Option<&Self::Gl>;
}

/// One GL context bound to one presentation target.
pub struct RenderContext<P: GlPlatform> {
    kind: TargetKind,
    width: i32,
    height: i32,
    context: P::Context,
    encoder_input: Option<InputSurface>,
    readback: BytesMut,
}

impl<P: GlPlatform> RenderContext<P> {
    /// Creates the context and makes it current on the calling thread.
    pub fn create(
        platform: &mut P,
        mut target: PresentationTarget<P::Widget>,
        width: i32,
        height: i32,
        shared: Option<&RenderContext<P>>,
    ) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::InvalidArgument(format!(
                "render surface size {width}x{height}"
            )));
        }

        let kind = target.kind();
        let context = platform.create_context(
            &mut target,
            width,
            height,
            shared.map(|shared| &shared.context),
        )?;

        if let Some(gl) = platform.gl() {
            gl.viewport(0, 0, width, height);
        }

        let encoder_input = match target {
            PresentationTarget::Encoder(input) => Some(input),
            _ => None,
        };

        debug!(?kind, width, height, shared = shared.is_some(), "Render context created");
        Ok(Self {
            kind,
            width,
            height,
            context,
            encoder_input,
            readback: BytesMut::new(),
        })
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    pub fn make_current(&self, platform: &mut P) -> Result<()> {
        platform.make_current(&self.context)?;
        if let Some(gl) = platform.gl() {
            gl.viewport(0, 0, self.width, self.height);
        }
        Ok(())
    }

    /// Finishes the frame. For encoder targets the framebuffer is read back
    /// and queued on the encoder's input surface at `presentation_time`.
    pub fn swap_buffers(
        &mut self,
        platform: &mut P,
        presentation_time: Option<Duration>,
    ) -> Result<()> {
        if let Some(input) = &self.encoder_input {
            let gl = platform
                .gl()
                .ok_or_else(|| Error::ResourceUnavailable("GL is not loaded".into()))?;

            let row = self.width as usize * 4;
            let len = row * self.height as usize;
            self.readback.clear();
            self.readback.resize(len, 0);
            gl.read_pixels_rgba(self.width, self.height, &mut self.readback);

            let mut top_down = BytesMut::with_capacity(len);
            for line in self.readback.chunks_exact(row).rev() {
                top_down.extend_from_slice(line);
            }

            let pts_us = presentation_time.map(|pts| pts.as_micros() as i64).unwrap_or(0);
            trace!(pts_us, "Queue frame to encoder input surface");
            input.queue_frame(RgbaFrame {
                width: self.width as u32,
                height: self.height as u32,
                data: top_down.freeze(),
                pts_us,
            })?;
        }

        platform.present(&mut self.context)
    }

    /// Unbinds and releases. Both steps run even when the first one fails,
    /// so the display connection is never leaked.
    pub fn destroy(self, platform: &mut P) -> Result<()> {
        let kind = self.kind;
        let unbind = platform.make_none_current();
        if let Err(error) = &unbind {
            warn!(?kind, %error, "Failed to unbind render context before release");
        }

        let release = platform.destroy_context(self.context);
        if let Err(error) = &release {
            warn!(?kind, %error, "Failed to release render context");
        }

        debug!(?kind, "Render context destroyed");
        unbind.and(release)
    }
}
