use crate::error::{Error, Result};
use crate::gles::{GlPlatform, GpuApi, PresentationTarget};
use euclid::default::Size2D;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use surfman::{
    Connection, ContextAttributeFlags, ContextAttributes, GLVersion, NativeWidget, SurfaceAccess,
    SurfaceType,
};
use tracing::{debug, warn};

/// A shell window wrapped for surfman.
pub struct SurfmanWidget(pub NativeWidget);

// Window handles are plain identifiers; only the render thread binds them.
unsafe impl Send for SurfmanWidget {}

/// A surfman context together with the surface bound to it.
pub struct SurfmanContext {
    context: surfman::Context,
    presentable: bool,
}

/// [`GlPlatform`] over surfman. One device, any number of contexts sharing
/// objects with each other.
pub struct SurfmanPlatform {
    connection: Connection,
    device: surfman::Device,
    version: GLVersion,
    gl: Option<glow::Context>,
}

impl SurfmanPlatform {
    /// A platform without a window system connection. Only off-screen and
    /// encoder targets can be created.
    pub fn headless(opengl_version_major: u8, opengl_version_minor: u8) -> Result<Self> {
        let connection = Connection::new().map_err(|e| {
            Error::ResourceUnavailable(format!("Failed to create Surfman connection: {e:?}"))
        })?;
        Self::with_connection(connection, opengl_version_major, opengl_version_minor)
    }

    /// A platform connected to the display that owns `window`, so that
    /// [`PresentationTarget::Screen`] targets can be created for it.
    pub fn for_display(
        display: &impl HasDisplayHandle,
        opengl_version_major: u8,
        opengl_version_minor: u8,
    ) -> Result<Self> {
        let handle = display.display_handle().map_err(|e| {
            Error::ResourceUnavailable(format!("Display handle unavailable: {e}"))
        })?;
        let connection = Connection::from_display_handle(handle).map_err(|e| {
            Error::ResourceUnavailable(format!("Failed to connect to display: {e:?}"))
        })?;
        Self::with_connection(connection, opengl_version_major, opengl_version_minor)
    }

    fn with_connection(
        connection: Connection,
        opengl_version_major: u8,
        opengl_version_minor: u8,
    ) -> Result<Self> {
        let adapter = connection
            .create_adapter()
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to create adapter: {e:?}")))?;
        let device = connection
            .create_device(&adapter)
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to create device: {e:?}")))?;

        Ok(Self {
            connection,
            device,
            version: GLVersion::new(opengl_version_major, opengl_version_minor),
            gl: None,
        })
    }

    /// Wraps a shell window so it can be used as a screen target.
    pub fn native_widget(
        &self,
        window: &impl HasWindowHandle,
        width: i32,
        height: i32,
    ) -> Result<SurfmanWidget> {
        let handle = window
            .window_handle()
            .map_err(|e| Error::ResourceUnavailable(format!("Window handle unavailable: {e}")))?;
        self.connection
            .create_native_widget_from_window_handle(handle, Size2D::new(width, height))
            .map(SurfmanWidget)
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to wrap window: {e:?}")))
    }

    fn bind_surface_framebuffer(&self, context: &surfman::Context) -> Result<()> {
        let Some(gl) = self.gl.as_ref() else {
            return Ok(());
        };
        let info = self
            .device
            .context_surface_info(context)
            .map_err(|e| Error::ResourceUnavailable(format!("Surface info unavailable: {e:?}")))?;
        // Rebuilt from the raw id: surfman may link a different glow release.
        let framebuffer = info
            .and_then(|info| std::num::NonZeroU32::new(info.framebuffer_object))
            .map(glow::NativeFramebuffer);
        GpuApi::bind_framebuffer(gl, framebuffer);
        Ok(())
    }

    fn release(&mut self, context: &mut surfman::Context) -> Result<()> {
        let mut result = Ok(());
        match self.device.unbind_surface_from_context(context) {
            Ok(Some(mut surface)) => {
                if let Err(e) = self.device.destroy_surface(context, &mut surface) {
                    result = Err(Error::ResourceUnavailable(format!(
                        "Failed to destroy surface: {e:?}"
                    )));
                }
            }
            Ok(None) => {}
            Err(e) => {
                result = Err(Error::ResourceUnavailable(format!(
                    "Failed to unbind surface: {e:?}"
                )));
            }
        }

        if let Err(e) = self.device.destroy_context(context) {
            warn!("Failed to destroy surfman context: {:?}", e);
            result = Err(Error::ResourceUnavailable(format!(
                "Failed to destroy context: {e:?}"
            )));
        }
        result
    }
}

impl GlPlatform for SurfmanPlatform {
    type Widget = SurfmanWidget;
    type Context = SurfmanContext;
    type Gl = glow::Context;

    fn create_context(
        &mut self,
        target: &mut PresentationTarget<SurfmanWidget>,
        width: i32,
        height: i32,
        shared: Option<&SurfmanContext>,
    ) -> Result<SurfmanContext> {
        let attributes = ContextAttributes {
            version: self.version,
            flags: ContextAttributeFlags::ALPHA,
        };
        let descriptor = self
            .device
            .create_context_descriptor(&attributes)
            .map_err(|e| {
                Error::ConfigurationUnavailable(format!(
                    "Failed to create context descriptor: {e:?}"
                ))
            })?;

        let mut context = self
            .device
            .create_context(&descriptor, shared.map(|shared| &shared.context))
            .map_err(|e| {
                Error::ResourceUnavailable(format!("Failed to create OpenGL context: {e:?}"))
            })?;

        let (surface_type, presentable) =
            match std::mem::replace(target, PresentationTarget::Offscreen) {
                PresentationTarget::Screen(SurfmanWidget(native_widget)) => {
                    (SurfaceType::Widget { native_widget }, true)
                }
                other => {
                    *target = other;
                    (
                        SurfaceType::Generic {
                            size: Size2D::new(width, height),
                        },
                        false,
                    )
                }
            };

        let surface = match self
            .device
            .create_surface(&context, SurfaceAccess::GPUOnly, surface_type)
        {
            Ok(surface) => surface,
            Err(e) => {
                let _ = self.device.destroy_context(&mut context);
                return Err(Error::ResourceUnavailable(format!(
                    "Failed to create surface: {e:?}"
                )));
            }
        };

        if let Err((e, mut surface)) = self.device.bind_surface_to_context(&mut context, surface) {
            let _ = self.device.destroy_surface(&mut context, &mut surface);
            let _ = self.device.destroy_context(&mut context);
            return Err(Error::ResourceUnavailable(format!(
                "Failed to bind surface: {e:?}"
            )));
        }

        if let Err(e) = self.device.make_context_current(&context) {
            let _ = self.release(&mut context);
            return Err(Error::ResourceUnavailable(format!(
                "Failed to make OpenGL context current: {e:?}"
            )));
        }

        if self.gl.is_none() {
            let gl = unsafe {
                glow::Context::from_loader_function(|symbol| {
                    self.device.get_proc_address(&context, symbol)
                })
            };
            gl.info().log();
            self.gl = Some(gl);
        }

        self.bind_surface_framebuffer(&context)?;
        debug!(width, height, presentable, "Surfman context created");
        Ok(SurfmanContext {
            context,
            presentable,
        })
    }

    fn make_current(&mut self, context: &SurfmanContext) -> Result<()> {
        self.device
            .make_context_current(&context.context)
            .map_err(|e| {
                Error::ResourceUnavailable(format!("Failed to make context current: {e:?}"))
            })?;
        self.bind_surface_framebuffer(&context.context)
    }

    fn make_none_current(&mut self) -> Result<()> {
        self.device.make_no_context_current().map_err(|e| {
            Error::ResourceUnavailable(format!("Failed to release current context: {e:?}"))
        })
    }

    fn present(&mut self, context: &mut SurfmanContext) -> Result<()> {
        if !context.presentable {
            if let Some(gl) = self.gl.as_ref() {
                GpuApi::flush(gl);
            }
            return Ok(());
        }

        let mut surface = self
            .device
            .unbind_surface_from_context(&mut context.context)
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to unbind surface: {e:?}")))?
            .ok_or_else(|| Error::ResourceUnavailable("Context has no surface".into()))?;

        let presented = self.device.present_surface(&context.context, &mut surface);
        if let Err((e, mut surface)) = self
            .device
            .bind_surface_to_context(&mut context.context, surface)
        {
            let _ = self.device.destroy_surface(&mut context.context, &mut surface);
            return Err(Error::ResourceUnavailable(format!(
                "Failed to rebind surface: {e:?}"
            )));
        }
        presented
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to present surface: {e:?}")))?;

        self.bind_surface_framebuffer(&context.context)
    }

    fn destroy_context(&mut self, mut context: SurfmanContext) -> Result<()> {
        self.release(&mut context.context)
    }

    fn gl(&self) -> Option<&glow::Context> {
        self.gl.as_ref()
    }
}
