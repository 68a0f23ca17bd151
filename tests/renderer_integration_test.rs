mod common;

use common::{FakeBackend, FakePlatform, SharedGlLog, lock, publish_frame};
use filtercam::encoder::{EncoderState, TrackKind};
use filtercam::error::{Error, ErrorKind};
use filtercam::gles::TargetKind;
use filtercam::render::SkipReason;
use filtercam::{Filter, FrameOutcome, FrameRenderer, LatestFrame, PresentationTarget, RecordingStatus};

struct Harness {
    renderer: FrameRenderer<FakePlatform, FakeBackend>,
    gl: SharedGlLog,
    media: FakeBackend,
    latest: LatestFrame,
}

impl Harness {
    fn new(width: i32, height: i32) -> Self {
        let gl = SharedGlLog::default();
        let media = FakeBackend::new();
        let latest = LatestFrame::new();
        let mut renderer = FrameRenderer::new(
            FakePlatform::with_log(gl.clone()),
            media.clone(),
            latest.clone(),
            24,
        )
        .unwrap();
        renderer
            .on_surface_available(PresentationTarget::Screen(()), 1280, 720)
            .unwrap();
        renderer.on_geometry_changed(width, height).unwrap();
        Self {
            renderer,
            gl,
            media,
            latest,
        }
    }

    fn frame(&mut self) -> FrameOutcome {
        let (width, height) = self.renderer.geometry().size();
        publish_frame(&self.latest, width.max(1) as u32, height.max(1) as u32);
        self.renderer.on_frame_ready().unwrap()
    }

    fn contexts_of(&self, kind: TargetKind) -> Vec<(i32, i32)> {
        lock(&self.gl)
            .contexts
            .iter()
            .filter(|(_, k, _, _)| *k == kind)
            .map(|(_, _, w, h)| (*w, *h))
            .collect()
    }
}

#[test]
fn test_blur_recording_starts_on_next_frame() {
    let mut h = Harness::new(1920, 1080);
    h.renderer.set_filter(Filter::Blur);

    for _ in 0..3 {
        assert_eq!(h.frame(), FrameOutcome::Drawn { recorded: false });
    }
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    assert_eq!(h.renderer.recording_status(), RecordingStatus::Starting);

    assert_eq!(h.frame(), FrameOutcome::Drawn { recorded: true });
    assert_eq!(h.renderer.recording_status(), RecordingStatus::On);
    assert_eq!(h.renderer.encoder_state(), Some(EncoderState::Muxing));

    let stats = h.renderer.stats();
    assert_eq!(stats.frames_drawn, 4);
    assert_eq!(stats.frames_recorded, 1);
    assert_eq!(stats.programs_compiled, 1);
    assert_eq!(stats.texture_size_updates, 1);
    assert_eq!(lock(&h.gl).programs_created, 1);
    assert_eq!(h.contexts_of(TargetKind::Encoder), vec![(1920, 1080)]);

    {
        let media = h.media.log();
        assert_eq!(media.configs[0].bit_rate, 24 * 1920 * 1080 * 30);
        assert_eq!(media.tracks, vec![TrackKind::Video, TrackKind::Audio]);
        assert_eq!(media.frames_queued.len(), 1);
        let frame = &media.frames_queued[0];
        assert_eq!((frame.width, frame.height), (1920, 1080));
        // Read back bottom row first, queued top row first.
        assert_eq!(frame.data[0], (1079 % 256) as u8);
    }
    assert_eq!(h.renderer.session().filter(), Filter::Blur);

    h.renderer.stop_recording().unwrap();
    assert_eq!(h.renderer.recording_status(), RecordingStatus::Off);
    assert_eq!(h.renderer.encoder_state(), None);
    let media = h.media.log();
    assert!(media.events.contains(&"muxer.stop".to_string()));
    assert!(media.violations.is_empty(), "{:?}", media.violations);
}

#[test]
fn test_zero_geometry_skips_without_gl_calls() {
    let mut h = Harness::new(0, 0);
    publish_frame(&h.latest, 640, 480);
    let calls = lock(&h.gl).calls.len();

    let outcome = h.renderer.on_frame_ready().unwrap();
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::InvalidGeometry));
    assert_eq!(lock(&h.gl).calls.len(), calls);
    assert_eq!(h.renderer.stats().frames_skipped, 1);
    assert_eq!(h.renderer.stats().frames_drawn, 0);
}

#[test]
fn test_skips_without_surface_or_frame() {
    let mut h = Harness::new(640, 480);
    assert_eq!(
        h.renderer.on_frame_ready().unwrap(),
        FrameOutcome::Skipped(SkipReason::NoFrame)
    );

    h.renderer.on_surface_destroyed();
    assert_eq!(
        h.frame(),
        FrameOutcome::Skipped(SkipReason::NoSurface)
    );
    assert_eq!(h.renderer.stats().frames_skipped, 2);
}

#[test]
fn test_same_filter_twice_compiles_once() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::Blur);
    h.frame();
    h.renderer.set_filter(Filter::Blur);
    h.frame();
    h.frame();

    let stats = h.renderer.stats();
    assert_eq!(stats.programs_compiled, 1);
    assert_eq!(stats.texture_size_updates, 1);
    assert_eq!(lock(&h.gl).programs_created, 1);
    assert_eq!(h.renderer.active_filter(), Some(Filter::Blur));
}

#[test]
fn test_same_kind_switch_only_updates_kernel() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::Blur);
    h.frame();
    h.renderer.set_filter(Filter::Sharpen);
    h.frame();

    assert_eq!(h.renderer.stats().programs_compiled, 1);
    assert_eq!(h.renderer.stats().texture_size_updates, 1);
    let gl = lock(&h.gl);
    assert_eq!(gl.programs_created, 1);
    let (sharpen, _) = Filter::Sharpen.kernel().unwrap();
    assert_eq!(gl.uniforms["uKernel"], sharpen.to_vec());
}

#[test]
fn test_kind_switch_recompiles_and_recomputes_texture_size() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::EdgeDetect);
    h.frame();
    h.renderer.set_filter(Filter::Grayscale);
    h.frame();
    h.renderer.set_filter(Filter::Emboss);
    h.frame();

    let stats = h.renderer.stats();
    assert_eq!(stats.programs_compiled, 3);
    assert_eq!(stats.texture_size_updates, 3);
    let gl = lock(&h.gl);
    assert_eq!(gl.programs_deleted, 2);
    assert_eq!(gl.uniforms["uColorAdjust"], vec![0.5]);

    let offsets = &gl.uniforms["uTexOffset"];
    assert_eq!(offsets.len(), 18);
    assert_eq!(offsets[0], -1.0 / 640.0);
    assert_eq!(offsets[1], -1.0 / 480.0);
    assert_eq!(offsets[8], 0.0);
    assert_eq!(offsets[17], 1.0 / 480.0);
}

#[test]
fn test_geometry_change_recomputes_texture_size() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::Blur);
    h.frame();
    h.renderer.on_geometry_changed(320, 240).unwrap();
    h.frame();

    assert_eq!(h.renderer.stats().texture_size_updates, 2);
    assert_eq!(lock(&h.gl).uniforms["uTexOffset"][0], -1.0 / 320.0);
    assert_eq!(lock(&h.gl).uploads.last(), Some(&(320, 240)));
}

#[test]
fn test_failed_compile_keeps_previous_filter() {
    let mut h = Harness::new(640, 480);
    h.frame();
    assert_eq!(h.renderer.active_filter(), Some(Filter::Identity));

    lock(&h.gl).fail_fragment_containing = Some("uKernel".into());
    h.renderer.set_filter(Filter::Blur);
    publish_frame(&h.latest, 640, 480);
    let error = h.renderer.on_frame_ready().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ShaderCompile);
    assert_eq!(h.renderer.requested_filter(), Filter::Identity);
    assert_eq!(h.renderer.active_filter(), Some(Filter::Identity));

    assert_eq!(h.frame(), FrameOutcome::Drawn { recorded: false });
    assert_eq!(lock(&h.gl).programs_created, 1);
}

#[test]
fn test_resize_rejected_while_recording() {
    let mut h = Harness::new(1920, 1080);
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();
    assert!(h.renderer.encoder_state().is_some());

    let error = h.renderer.on_geometry_changed(1280, 720).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::GeometryRejected);
    assert!(!error.is_fatal());
    assert_eq!(h.renderer.recording_status(), RecordingStatus::On);
    assert_eq!(h.renderer.geometry().size(), (1920, 1080));

    // Transient zero sizes during surface changes are accepted.
    h.renderer.on_geometry_changed(0, 0).unwrap();
    assert_eq!(
        h.renderer.on_frame_ready().unwrap(),
        FrameOutcome::Skipped(SkipReason::InvalidGeometry)
    );
    h.renderer.on_geometry_changed(1920, 1080).unwrap();
    assert_eq!(h.frame(), FrameOutcome::Drawn { recorded: true });

    h.renderer.stop_recording().unwrap();
    h.renderer.on_geometry_changed(1280, 720).unwrap();
}

#[test]
fn test_pause_keeps_recording_and_resumes_on_next_frame() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::Invert);
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();
    assert_eq!(h.renderer.recording_status(), RecordingStatus::On);

    h.renderer.on_pause();
    assert_eq!(h.renderer.recording_status(), RecordingStatus::Resuming);
    assert_eq!(h.renderer.active_filter(), None);
    assert_eq!(h.renderer.encoder_state(), Some(EncoderState::Muxing));
    assert_eq!(lock(&h.gl).programs_deleted, 1);

    h.renderer.on_resume();
    assert_eq!(h.frame(), FrameOutcome::Drawn { recorded: true });
    assert_eq!(h.renderer.recording_status(), RecordingStatus::On);
    assert_eq!(h.renderer.active_filter(), Some(Filter::Invert));
    assert_eq!(h.contexts_of(TargetKind::Encoder).len(), 2);
    assert_eq!(h.renderer.stats().programs_compiled, 2);

    // Same pipeline: no second set of tracks.
    assert_eq!(h.media.log().tracks.len(), 2);
    assert!(h.media.log().violations.is_empty());
}

#[test]
fn test_abort_drains_to_end_of_stream() {
    let mut h = Harness::new(640, 480);
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();
    h.frame();

    h.renderer
        .abort_recording(&Error::ResourceUnavailable("display lost".into()));
    assert_eq!(h.renderer.recording_status(), RecordingStatus::Off);
    assert_eq!(h.renderer.encoder_state(), None);

    let media = h.media.log();
    assert!(media.events.contains(&"video.end_of_input".to_string()));
    assert!(media.muxer_stopped);
    assert!(media.violations.is_empty(), "{:?}", media.violations);
}

#[test]
fn test_abort_after_protocol_violation_skips_end_of_stream() {
    let mut h = Harness::new(640, 480);
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();

    h.renderer
        .abort_recording(&Error::ProtocolViolation("format changed twice".into()));
    assert_eq!(h.renderer.recording_status(), RecordingStatus::Off);

    let media = h.media.log();
    assert!(!media.events.contains(&"video.end_of_input".to_string()));
    assert!(media.events.contains(&"video.release".to_string()));
    assert_eq!(lock(&h.gl).contexts_destroyed, 1);
}

#[test]
fn test_stop_while_off_is_invalid_state() {
    let mut h = Harness::new(640, 480);
    let error = h.renderer.stop_recording().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_start_twice_keeps_first_session() {
    let mut h = Harness::new(640, 480);
    h.renderer.start_recording("first.mp4".into(), 30).unwrap();
    h.renderer.start_recording("second.mp4".into(), 60).unwrap();
    h.frame();

    let media = h.media.log();
    assert_eq!(media.configs.len(), 1);
    assert_eq!(media.configs[0].output.to_str(), Some("first.mp4"));
    assert_eq!(media.configs[0].frame_rate, 30);
}

#[test]
fn test_gl_calls_always_have_a_current_context() {
    let mut h = Harness::new(640, 480);
    h.renderer.set_filter(Filter::Sharpen);
    h.frame();
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();
    h.renderer.on_pause();
    h.renderer.on_resume();
    h.frame();
    h.renderer.stop_recording().unwrap();
    h.frame();

    let Harness { renderer, gl, .. } = h;
    renderer.shutdown().unwrap();

    let gl = lock(&gl);
    assert_eq!(gl.calls_without_context, 0, "{:?}", gl.calls);
    assert_eq!(gl.contexts.len(), gl.contexts_destroyed);
    assert_eq!(gl.programs_created, gl.programs_deleted);
    assert_eq!(gl.textures_created, gl.textures_deleted);
}

#[test]
fn test_shutdown_stops_active_recording() {
    let mut h = Harness::new(640, 480);
    h.renderer.start_recording("capture.mp4".into(), 30).unwrap();
    h.frame();

    let Harness { renderer, media, .. } = h;
    renderer.shutdown().unwrap();

    let log = media.log();
    assert!(log.events.contains(&"video.end_of_input".to_string()));
    assert!(log.events.contains(&"muxer.stop".to_string()));
    assert!(log.muxer_stopped);
}
