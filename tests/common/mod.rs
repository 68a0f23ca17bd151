#![allow(dead_code)]

use bytes::Bytes;
use filtercam::encoder::{
    AudioCapture, AudioEncoder, EncodedBuffer, EncoderConfig, EncoderOutput, FrameSink,
    InputSurface, MediaBackend, Muxer, RgbaFrame, TrackFormat, TrackKind, VideoEncoder,
};
use filtercam::error::{Error, Result, ShaderStage};
use filtercam::gles::{GlPlatform, GpuApi, GpuInfo, PresentationTarget, TargetKind};
use filtercam::render::{FrameBuffer, LatestFrame};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ---- GL ----

#[derive(Debug, Default)]
pub struct GlLog {
    /// Names of GL calls, in order.
    pub calls: Vec<&'static str>,
    pub calls_without_context: usize,
    pub current: Option<u32>,
    pub programs_created: usize,
    pub programs_deleted: usize,
    pub textures_created: usize,
    pub textures_deleted: usize,
    pub draws: usize,
    pub uploads: Vec<(i32, i32)>,
    pub uniforms: HashMap<String, Vec<f32>>,
    pub shader_sources: Vec<String>,
    pub contexts: Vec<(u32, TargetKind, i32, i32)>,
    pub contexts_destroyed: usize,
    pub presents: usize,
    /// Fragment shaders containing this text fail to compile.
    pub fail_fragment_containing: Option<String>,
    /// Making any context current fails, as after a lost display.
    pub fail_make_current: bool,
}

pub type SharedGlLog = Arc<Mutex<GlLog>>;

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct FakeGl {
    log: SharedGlLog,
    next: AtomicUsize,
    shader_stages: Mutex<HashMap<u32, ShaderStage>>,
}

impl FakeGl {
    fn new(log: SharedGlLog) -> Self {
        Self {
            log,
            next: AtomicUsize::new(1),
            shader_stages: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, GlLog> {
        let mut log = lock(&self.log);
        if log.current.is_none() {
            log.calls_without_context += 1;
        }
        log.calls.push(call);
        log
    }

    fn id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed) as u32
    }
}

impl GpuApi for FakeGl {
    type Shader = u32;
    type Program = u32;
    type Texture = u32;
    type Buffer = u32;
    type VertexArray = u32;
    type Framebuffer = u32;
    type UniformLocation = String;

    fn is_embedded(&self) -> bool {
        false
    }

    fn info(&self) -> GpuInfo {
        GpuInfo {
            version: "3.3 fake".into(),
            ..Default::default()
        }
    }

    fn create_shader(&self, stage: ShaderStage) -> std::result::Result<u32, String> {
        self.record("create_shader");
        let id = self.id();
        lock(&self.shader_stages).insert(id, stage);
        Ok(id)
    }

    fn compile_shader(&self, shader: u32, source: &str) -> bool {
        let mut log = self.record("compile_shader");
        log.shader_sources.push(source.to_string());
        let stage = lock(&self.shader_stages).get(&shader).copied();
        match (&log.fail_fragment_containing, stage) {
            (Some(marker), Some(ShaderStage::Fragment)) => !source.contains(marker.as_str()),
            _ => true,
        }
    }

    fn shader_info_log(&self, _shader: u32) -> String {
        "0:1: fake compile error".into()
    }

    fn delete_shader(&self, _shader: u32) {
        self.record("delete_shader");
    }

    fn create_program(&self) -> std::result::Result<u32, String> {
        let mut log = self.record("create_program");
        log.programs_created += 1;
        drop(log);
        Ok(self.id())
    }

    fn link_program(&self, _program: u32, _vertex: u32, _fragment: u32) -> bool {
        self.record("link_program");
        true
    }

    fn program_info_log(&self, _program: u32) -> String {
        String::new()
    }

    fn delete_program(&self, _program: u32) {
        self.record("delete_program").programs_deleted += 1;
    }

    fn use_program(&self, _program: Option<u32>) {
        self.record("use_program");
    }

    fn attrib_location(&self, _program: u32, name: &str) -> Option<u32> {
        self.record("attrib_location");
        match name {
            "aPosition" => Some(0),
            "aTextureCoord" => Some(1),
            _ => None,
        }
    }

    fn uniform_location(&self, _program: u32, name: &str) -> Option<String> {
        self.record("uniform_location");
        Some(name.to_string())
    }

    fn uniform_1_i32(&self, location: &String, value: i32) {
        self.record("uniform")
            .uniforms
            .insert(location.clone(), vec![value as f32]);
    }

    fn uniform_1_f32(&self, location: &String, value: f32) {
        self.record("uniform")
            .uniforms
            .insert(location.clone(), vec![value]);
    }

    fn uniform_1_f32_slice(&self, location: &String, values: &[f32]) {
        self.record("uniform")
            .uniforms
            .insert(location.clone(), values.to_vec());
    }

    fn uniform_2_f32_slice(&self, location: &String, values: &[f32]) {
        self.record("uniform")
            .uniforms
            .insert(location.clone(), values.to_vec());
    }

    fn uniform_matrix_4_f32_slice(&self, location: &String, values: &[f32]) {
        self.record("uniform")
            .uniforms
            .insert(location.clone(), values.to_vec());
    }

    fn create_texture(&self) -> std::result::Result<u32, String> {
        self.record("create_texture").textures_created += 1;
        Ok(self.id())
    }

    fn active_texture_unit(&self, _unit: u32) {
        self.record("active_texture");
    }

    fn bind_texture(&self, _texture: Option<u32>) {
        self.record("bind_texture");
    }

    fn tex_parameter_i32(&self, _parameter: u32, _value: i32) {
        self.record("tex_parameter");
    }

    fn tex_image_rgb(&self, width: i32, height: i32, _pixels: &[u8]) {
        self.record("tex_image").uploads.push((width, height));
    }

    fn delete_texture(&self, _texture: u32) {
        self.record("delete_texture").textures_deleted += 1;
    }

    fn viewport(&self, _x: i32, _y: i32, _width: i32, _height: i32) {
        self.record("viewport");
    }

    fn clear_color(&self, _red: f32, _green: f32, _blue: f32, _alpha: f32) {
        self.record("clear_color");
    }

    fn clear_color_buffer(&self) {
        self.record("clear");
    }

    fn create_vertex_array(&self) -> std::result::Result<u32, String> {
        self.record("create_vertex_array");
        Ok(self.id())
    }

    fn bind_vertex_array(&self, _vertex_array: Option<u32>) {
        self.record("bind_vertex_array");
    }

    fn delete_vertex_array(&self, _vertex_array: u32) {
        self.record("delete_vertex_array");
    }

    fn create_buffer(&self) -> std::result::Result<u32, String> {
        self.record("create_buffer");
        Ok(self.id())
    }

    fn bind_array_buffer(&self, _buffer: Option<u32>) {
        self.record("bind_array_buffer");
    }

    fn array_buffer_data(&self, _data: &[f32]) {
        self.record("array_buffer_data");
    }

    fn delete_buffer(&self, _buffer: u32) {
        self.record("delete_buffer");
    }

    fn vertex_attrib_pointer_f32(&self, _index: u32, _size: i32, _stride: i32, _offset: i32) {
        self.record("vertex_attrib_pointer");
    }

    fn enable_vertex_attrib_array(&self, _index: u32) {
        self.record("enable_vertex_attrib_array");
    }

    fn draw_triangle_strip(&self, _first: i32, count: i32) {
        assert_eq!(count, 4);
        self.record("draw").draws += 1;
    }

    fn bind_framebuffer(&self, _framebuffer: Option<u32>) {
        self.record("bind_framebuffer");
    }

    fn read_pixels_rgba(&self, _width: i32, height: i32, out: &mut [u8]) {
        self.record("read_pixels");
        // Bottom row first, like GL: first byte of each row is its row index.
        let row = out.len() / height.max(1) as usize;
        for (y, line) in out.chunks_mut(row.max(1)).enumerate() {
            line.fill(0);
            line[0] = y as u8;
        }
    }

    fn flush(&self) {
        self.record("flush");
    }
}

pub struct FakeContext {
    id: u32,
}

/// Fake window system. Tracks which context is current so that GL calls
/// made without one are counted.
pub struct FakePlatform {
    pub log: SharedGlLog,
    gl: Option<FakeGl>,
    next_context: u32,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::with_log(SharedGlLog::default())
    }

    pub fn with_log(log: SharedGlLog) -> Self {
        Self {
            log,
            gl: None,
            next_context: 1,
        }
    }
}

impl GlPlatform for FakePlatform {
    type Widget = ();
    type Context = FakeContext;
    type Gl = FakeGl;

    fn create_context(
        &mut self,
        target: &mut PresentationTarget<()>,
        width: i32,
        height: i32,
        _shared: Option<&FakeContext>,
    ) -> Result<FakeContext> {
        let id = self.next_context;
        self.next_context += 1;
        {
            let mut log = lock(&self.log);
            log.contexts.push((id, target.kind(), width, height));
            log.current = Some(id);
        }
        if self.gl.is_none() {
            self.gl = Some(FakeGl::new(self.log.clone()));
        }
        Ok(FakeContext { id })
    }

    fn make_current(&mut self, context: &FakeContext) -> Result<()> {
        let mut log = lock(&self.log);
        if log.fail_make_current {
            return Err(Error::ResourceUnavailable("display lost".into()));
        }
        log.current = Some(context.id);
        Ok(())
    }

    fn make_none_current(&mut self) -> Result<()> {
        lock(&self.log).current = None;
        Ok(())
    }

    fn present(&mut self, _context: &mut FakeContext) -> Result<()> {
        lock(&self.log).presents += 1;
        Ok(())
    }

    fn destroy_context(&mut self, context: FakeContext) -> Result<()> {
        let mut log = lock(&self.log);
        log.contexts_destroyed += 1;
        if log.current == Some(context.id) {
            log.current = None;
        }
        Ok(())
    }

    fn gl(&self) -> Option<&FakeGl> {
        self.gl.as_ref()
    }
}

pub fn rgb_frame(width: u32, height: u32) -> FrameBuffer {
    let data = vec![128u8; width as usize * height as usize * 3];
    FrameBuffer::new(width, height, Bytes::from(data))
}

pub fn publish_frame(latest: &LatestFrame, width: u32, height: u32) {
    latest.publish(rgb_frame(width, height));
}

// ---- Media ----

#[derive(Debug, Default)]
pub struct MediaLog {
    pub events: Vec<String>,
    pub tracks: Vec<TrackKind>,
    pub muxer_started: bool,
    pub muxer_stopped: bool,
    /// (track, pts) of every sample written.
    pub writes: Vec<(usize, i64)>,
    pub violations: Vec<String>,
    pub frames_queued: Vec<RgbaFrame>,
    pub capture_reads: usize,
    pub configs: Vec<EncoderConfig>,
}

pub type SharedMediaLog = Arc<Mutex<MediaLog>>;

/// Knobs for misbehaving encoders.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// The video encoder reports its format a second time after the first buffer.
    pub double_format: bool,
    /// The video encoder emits a data buffer before reporting its format.
    pub data_before_format: bool,
    /// Every video buffer is preceded by a codec config buffer.
    pub codec_config: bool,
    /// The backend has no video encoder.
    pub no_video_encoder: bool,
    /// The video encoder never emits its end-of-stream buffer.
    pub never_eos: bool,
    /// Audio capture fails on its first read.
    pub capture_fails: bool,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub log: SharedMediaLog,
    pub script: Script,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: Script) -> Self {
        Self {
            log: SharedMediaLog::default(),
            script,
        }
    }

    pub fn log(&self) -> MutexGuard<'_, MediaLog> {
        lock(&self.log)
    }
}

fn event(log: &SharedMediaLog, event: &str) {
    lock(log).events.push(event.to_string());
}

impl MediaBackend for FakeBackend {
    fn create_video_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>> {
        if self.script.no_video_encoder {
            return Err(Error::EncoderUnavailable("no H.264 encoder".into()));
        }
        lock(&self.log).configs.push(config.clone());
        event(&self.log, "video.create");
        Ok(Box::new(FakeVideoEncoder {
            log: self.log.clone(),
            script: self.script.clone(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            polls: 0,
            format_reports: 0,
            end_of_input: false,
            config_sent: false,
        }))
    }

    fn create_audio_encoder(&self, _config: &EncoderConfig) -> Result<Box<dyn AudioEncoder>> {
        event(&self.log, "audio.create");
        Ok(Box::new(FakeAudioEncoder {
            log: self.log.clone(),
            queued: VecDeque::new(),
        }))
    }

    fn create_audio_capture(&self, _config: &EncoderConfig) -> Result<Box<dyn AudioCapture>> {
        event(&self.log, "capture.create");
        Ok(Box::new(FakeCapture {
            log: self.log.clone(),
            released: Arc::new(AtomicBool::new(false)),
            fails: self.script.capture_fails,
        }))
    }

    fn create_muxer(&self, _config: &EncoderConfig) -> Result<Arc<dyn Muxer>> {
        event(&self.log, "muxer.create");
        Ok(Arc::new(FakeMuxer {
            log: self.log.clone(),
        }))
    }
}

struct FakeSurface {
    log: SharedMediaLog,
    pending: Arc<Mutex<VecDeque<i64>>>,
}

impl FrameSink for FakeSurface {
    fn queue_frame(&self, frame: RgbaFrame) -> Result<()> {
        lock(&self.pending).push_back(frame.pts_us);
        lock(&self.log).frames_queued.push(frame);
        Ok(())
    }
}

pub struct FakeVideoEncoder {
    log: SharedMediaLog,
    script: Script,
    pending: Arc<Mutex<VecDeque<i64>>>,
    polls: usize,
    format_reports: usize,
    end_of_input: bool,
    config_sent: bool,
}

impl VideoEncoder for FakeVideoEncoder {
    fn input_surface(&self) -> InputSurface {
        Arc::new(FakeSurface {
            log: self.log.clone(),
            pending: self.pending.clone(),
        })
    }

    fn start(&mut self) -> Result<()> {
        event(&self.log, "video.start");
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        event(&self.log, "video.end_of_input");
        self.end_of_input = true;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        self.polls += 1;
        if self.script.data_before_format && self.format_reports == 0 {
            self.format_reports = usize::MAX;
            return Ok(EncoderOutput::Buffer(EncodedBuffer {
                data: Bytes::from_static(&[0, 0, 0, 1]),
                pts_us: 0,
                key_frame: true,
                ..Default::default()
            }));
        }
        if self.format_reports == 0 {
            self.format_reports = 1;
            return Ok(EncoderOutput::FormatChanged);
        }
        if self.script.codec_config && !self.config_sent {
            self.config_sent = true;
            return Ok(EncoderOutput::Buffer(EncodedBuffer {
                data: Bytes::from_static(&[0x67, 0x68]),
                codec_config: true,
                ..Default::default()
            }));
        }

        let next = lock(&self.pending).pop_front();
        if let Some(pts_us) = next {
            return Ok(EncoderOutput::Buffer(EncodedBuffer {
                data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
                pts_us,
                key_frame: true,
                ..Default::default()
            }));
        }
        if self.script.double_format && self.format_reports == 1 && !lock(&self.log).writes.is_empty() {
            self.format_reports = 2;
            return Ok(EncoderOutput::FormatChanged);
        }
        if self.end_of_input {
            if self.script.never_eos {
                std::thread::sleep(timeout);
                return Ok(EncoderOutput::TryAgainLater);
            }
            return Ok(EncoderOutput::Buffer(EncodedBuffer::end_of_stream()));
        }
        Ok(EncoderOutput::TryAgainLater)
    }

    fn output_format(&self) -> Result<TrackFormat> {
        Ok(TrackFormat::new(TrackKind::Video, "h264"))
    }

    fn release(self: Box<Self>) -> Result<()> {
        event(&self.log, "video.release");
        Ok(())
    }
}

pub struct FakeAudioEncoder {
    log: SharedMediaLog,
    queued: VecDeque<i64>,
}

impl AudioEncoder for FakeAudioEncoder {
    fn start(&mut self) -> Result<()> {
        event(&self.log, "audio.start");
        Ok(())
    }

    fn queue_input(&mut self, pcm: &[i16], pts_us: i64) -> Result<bool> {
        assert!(!pcm.is_empty());
        self.queued.push_back(pts_us);
        Ok(true)
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<EncoderOutput> {
        match self.queued.pop_front() {
            Some(pts_us) => Ok(EncoderOutput::Buffer(EncodedBuffer {
                data: Bytes::from_static(&[0x21, 0x10]),
                pts_us,
                ..Default::default()
            })),
            None => Ok(EncoderOutput::TryAgainLater),
        }
    }

    fn output_format(&self) -> Result<TrackFormat> {
        Ok(TrackFormat::new(TrackKind::Audio, "aac"))
    }

    fn release(self: Box<Self>) -> Result<()> {
        event(&self.log, "audio.release");
        Ok(())
    }
}

pub struct FakeCapture {
    log: SharedMediaLog,
    released: Arc<AtomicBool>,
    fails: bool,
}

impl AudioCapture for FakeCapture {
    fn start(&mut self) -> Result<()> {
        event(&self.log, "capture.start");
        Ok(())
    }

    fn read(&mut self, pcm: &mut [i16]) -> Result<usize> {
        // Real devices block until a period is captured.
        std::thread::sleep(Duration::from_millis(2));
        let mut log = lock(&self.log);
        if self.released.load(Ordering::Acquire) {
            log.violations.push("capture read after release".into());
        }
        if self.fails {
            log.events.push("capture.failed".into());
            return Err(Error::ResourceUnavailable("Audio device closed".into()));
        }
        log.capture_reads += 1;
        pcm.fill(7);
        Ok(pcm.len())
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.released.store(true, Ordering::Release);
        event(&self.log, "capture.release");
        Ok(())
    }
}

pub struct FakeMuxer {
    log: SharedMediaLog,
}

impl Muxer for FakeMuxer {
    fn add_track(&self, format: &TrackFormat) -> Result<usize> {
        let mut log = lock(&self.log);
        if log.muxer_started {
            log.violations.push("track added after start".into());
        }
        log.tracks.push(format.kind);
        log.events.push(format!("muxer.add_track.{:?}", format.kind));
        Ok(log.tracks.len() - 1)
    }

    fn start(&self) -> Result<()> {
        let mut log = lock(&self.log);
        if log.tracks.len() != 2 {
            let tracks = log.tracks.len();
            log.violations.push(format!("started with {tracks} tracks"));
        }
        log.muxer_started = true;
        log.events.push("muxer.start".into());
        Ok(())
    }

    fn write_sample(&self, track: usize, buffer: &EncodedBuffer) -> Result<()> {
        let mut log = lock(&self.log);
        if !log.muxer_started {
            log.violations.push("write before start".into());
        }
        if log.muxer_stopped {
            log.violations.push("write after stop".into());
        }
        if buffer.codec_config || buffer.data.is_empty() {
            log.violations.push("config or empty buffer written".into());
        }
        log.writes.push((track, buffer.pts_us));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut log = lock(&self.log);
        log.events.push("muxer.stop".into());
        if !log.muxer_started {
            return Err(Error::InvalidState("muxer stopped before start".into()));
        }
        log.muxer_stopped = true;
        Ok(())
    }
}
