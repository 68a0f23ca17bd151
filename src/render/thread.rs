use super::{FrameOutcome, FrameRenderer, LatestFrame, RecordingStatus};
use crate::encoder::MediaBackend;
use crate::error::{Error, Result};
use crate::gles::{Filter, GlPlatform, PresentationTarget};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Messages from the shell and the frame source to the render thread.
pub enum RenderCommand<W> {
    SetFilter(Filter),
    StartRecording { output: PathBuf, frame_rate: u32 },
    StopRecording,
    GeometryChanged { width: i32, height: i32 },
    /// A new frame was published to the [`LatestFrame`] slot.
    FrameReady,
    SurfaceAvailable {
        target: PresentationTarget<W>,
        width: i32,
        height: i32,
    },
    SurfaceDestroyed,
    Pause,
    Resume,
    Shutdown,
}

/// Snapshot of the render thread, republished after every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendererStatus {
    pub running: bool,
    pub filter: Option<Filter>,
    pub recording: RecordingStatus,
    pub width: i32,
    pub height: i32,
    pub frames_drawn: u64,
    pub frames_recorded: u64,
    pub frames_skipped: u64,
    /// Frame notifications collapsed into a later one.
    pub frames_dropped: u64,
    pub programs_compiled: u64,
    pub last_error: Option<String>,
}

/// Cloneable sender side of the render thread.
pub struct RenderHandle<W> {
    commands: async_channel::Sender<RenderCommand<W>>,
    status: watch::Receiver<RendererStatus>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<W> Clone for RenderHandle<W> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            thread: self.thread.clone(),
        }
    }
}

impl<W> RenderHandle<W> {
    pub fn send(&self, command: RenderCommand<W>) -> Result<()> {
        self.commands
            .try_send(command)
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn set_filter(&self, filter: Filter) -> Result<()> {
        self.send(RenderCommand::SetFilter(filter))
    }

    pub fn start_recording(&self, output: impl Into<PathBuf>, frame_rate: u32) -> Result<()> {
        self.send(RenderCommand::StartRecording {
            output: output.into(),
            frame_rate,
        })
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.send(RenderCommand::StopRecording)
    }

    pub fn geometry_changed(&self, width: i32, height: i32) -> Result<()> {
        self.send(RenderCommand::GeometryChanged { width, height })
    }

    pub fn frame_ready(&self) -> Result<()> {
        self.send(RenderCommand::FrameReady)
    }

    pub fn surface_available(
        &self,
        target: PresentationTarget<W>,
        width: i32,
        height: i32,
    ) -> Result<()> {
        self.send(RenderCommand::SurfaceAvailable {
            target,
            width,
            height,
        })
    }

    pub fn surface_destroyed(&self) -> Result<()> {
        self.send(RenderCommand::SurfaceDestroyed)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(RenderCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(RenderCommand::Resume)
    }

    pub fn status(&self) -> RendererStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified whenever the status changes.
    pub fn subscribe(&self) -> watch::Receiver<RendererStatus> {
        self.status.clone()
    }

    /// Asks the thread to release everything and waits for it to exit.
    pub fn shutdown(&self) -> Result<()> {
        if self.send(RenderCommand::Shutdown).is_err() {
            debug!("Render thread already gone");
        }
        let handle = self
            .thread
            .lock()
            .map_err(|_| Error::ChannelClosed)?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::ResourceUnavailable("render thread panicked".into()))?;
        }
        Ok(())
    }
}

pub struct RenderThread;

impl RenderThread {
    /// Starts the render thread. The platform is built on that thread, since
    /// GL contexts stay with the thread that created them. Returns once the
    /// renderer is up, or with the error that prevented it.
    pub fn spawn<P, B, F>(
        make_platform: F,
        backend: B,
        latest: LatestFrame,
        bits_per_pixel: u32,
    ) -> Result<RenderHandle<P::Widget>>
    where
        P: GlPlatform + 'static,
        P::Widget: Send + 'static,
        B: MediaBackend + 'static,
        F: FnOnce() -> Result<P> + Send + 'static,
    {
        let (commands, receiver) = async_channel::unbounded();
        let (status_tx, status_rx) = watch::channel(RendererStatus::default());
        let (ready_tx, ready_rx) = async_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                let renderer = make_platform()
                    .and_then(|platform| FrameRenderer::new(platform, backend, latest, bits_per_pixel));
                match renderer {
                    Ok(renderer) => {
                        let _ = ready_tx.send_blocking(Ok(()));
                        run(renderer, receiver, status_tx);
                    }
                    Err(error) => {
                        error!(%error, "Failed to start renderer");
                        let _ = ready_tx.send_blocking(Err(error));
                    }
                }
            })?;

        let started = ready_rx.recv_blocking().map_err(|_| Error::ChannelClosed)?;
        if let Err(error) = started {
            let _ = handle.join();
            return Err(error);
        }

        info!("Render thread started");
        Ok(RenderHandle {
            commands,
            status: status_rx,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }
}

fn run<P: GlPlatform, B: MediaBackend>(
    mut renderer: FrameRenderer<P, B>,
    commands: async_channel::Receiver<RenderCommand<P::Widget>>,
    status: watch::Sender<RendererStatus>,
) {
    let mut snapshot = RendererStatus {
        running: true,
        ..Default::default()
    };
    publish(&renderer, &mut snapshot, &status);

    let mut pending = None;
    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match commands.recv_blocking() {
                Ok(command) => command,
                Err(_) => {
                    debug!("All render handles dropped");
                    break;
                }
            },
        };

        if let RenderCommand::FrameReady = command {
            // Only the newest frame is drawn.
            while let Ok(next) = commands.try_recv() {
                if let RenderCommand::FrameReady = next {
                    snapshot.frames_dropped += 1;
                } else {
                    pending = Some(next);
                    break;
                }
            }
        }

        let result = match command {
            RenderCommand::SetFilter(filter) => {
                renderer.set_filter(filter);
                Ok(())
            }
            RenderCommand::StartRecording { output, frame_rate } => {
                renderer.start_recording(output, frame_rate)
            }
            RenderCommand::StopRecording => renderer.stop_recording(),
            RenderCommand::GeometryChanged { width, height } => {
                renderer.on_geometry_changed(width, height)
            }
            RenderCommand::FrameReady => renderer.on_frame_ready().map(|outcome| {
                if let FrameOutcome::Skipped(reason) = outcome {
                    debug!(?reason, "Frame skipped");
                }
            }),
            RenderCommand::SurfaceAvailable {
                target,
                width,
                height,
            } => renderer.on_surface_available(target, width, height),
            RenderCommand::SurfaceDestroyed => {
                renderer.on_surface_destroyed();
                Ok(())
            }
            RenderCommand::Pause => {
                renderer.on_pause();
                Ok(())
            }
            RenderCommand::Resume => {
                renderer.on_resume();
                Ok(())
            }
            RenderCommand::Shutdown => break,
        };

        if let Err(error) = result {
            if error.is_fatal() {
                error!(%error, "Render command failed");
                if renderer.recording_status().is_enabled() {
                    renderer.abort_recording(&error);
                }
            } else {
                warn!(%error, "Render command failed");
            }
            snapshot.last_error = Some(error.to_string());
        }
        publish(&renderer, &mut snapshot, &status);
    }

    if let Err(error) = renderer.shutdown() {
        warn!(%error, "Renderer shutdown incomplete");
    }
    snapshot.running = false;
    status.send_replace(snapshot);
    info!("Render thread exited");
}

fn publish<P: GlPlatform, B: MediaBackend>(
    renderer: &FrameRenderer<P, B>,
    snapshot: &mut RendererStatus,
    status: &watch::Sender<RendererStatus>,
) {
    let stats = renderer.stats();
    let (width, height) = renderer.geometry().size();
    snapshot.filter = renderer.active_filter();
    snapshot.recording = renderer.recording_status();
    snapshot.width = width;
    snapshot.height = height;
    snapshot.frames_drawn = stats.frames_drawn;
    snapshot.frames_recorded = stats.frames_recorded;
    snapshot.frames_skipped = stats.frames_skipped;
    snapshot.programs_compiled = stats.programs_compiled;
    status.send_if_modified(|current| {
        if *current == *snapshot {
            return false;
        }
        *current = snapshot.clone();
        true
    });
}
