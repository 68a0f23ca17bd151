pub mod config;
pub mod encoder;
pub mod error;
pub mod gles;
pub mod render;
pub mod source;

//
// Re-export
//
pub use config::Config;
pub use encoder::{
    EncoderConfig, EncoderCore, EncoderState, MediaBackend, ffmpeg::FfmpegBackend,
};
pub use error::{Error, ErrorKind, Result};
pub use gles::{Filter, GlPlatform, PresentationTarget, ProgramKind, RenderContext, SurfmanPlatform};
pub use render::{
    FrameBuffer, FrameOutcome, FrameRenderer, LatestFrame, RecordingStatus, RenderHandle,
    RenderThread, RendererStatus,
};
pub use source::FrameSource;

/// GL version requested from the platform.
pub const GL_VERSION: (u8, u8) = (3, 3);

/// Runs the demo pipeline: camera frames through the configured filter into
/// an off-screen preview, recorded to `config.output` until Ctrl-C or the
/// configured duration.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let latest = LatestFrame::new();
    let backend = FfmpegBackend::new(&config.audio_driver, &config.audio_device)?;
    let source = FrameSource::open(&config.input, config.input_format.as_deref())?;

    let renderer = RenderThread::spawn(
        || SurfmanPlatform::headless(GL_VERSION.0, GL_VERSION.1),
        backend,
        latest.clone(),
        config.bits_per_pixel,
    )?;

    renderer.set_filter(config.filter)?;
    // Headless: the preview pass renders into an off-screen surface.
    renderer.surface_available(PresentationTarget::Offscreen, 1280, 720)?;
    renderer.start_recording(&config.output, config.frame_rate)?;

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let source_thread = source.spawn(latest, renderer.clone(), stop.clone())?;

    let duration = config.duration_secs.map(std::time::Duration::from_secs);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, stopping"),
        _ = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        } => tracing::info!(?duration, "Duration reached, stopping"),
    }

    stop.store(true, std::sync::atomic::Ordering::Release);
    let mut updates = renderer.subscribe();
    renderer.stop_recording()?;

    // Counters are final once the render thread has torn the session down.
    let status = updates
        .wait_for(|status| status.recording == RecordingStatus::Off || !status.running)
        .await?
        .clone();
    tracing::info!(
        frames_drawn = status.frames_drawn,
        frames_recorded = status.frames_recorded,
        frames_skipped = status.frames_skipped,
        frames_dropped = status.frames_dropped,
        "Recording finished"
    );

    let source_result = tokio::task::spawn_blocking(move || source_thread.join()).await?;
    let handle = renderer.clone();
    tokio::task::spawn_blocking(move || handle.shutdown()).await??;
    match source_result {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("frame source thread panicked"),
    }
    Ok(())
}
