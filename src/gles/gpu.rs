use crate::error::ShaderStage;
use glow::{HasContext, PixelPackData, PixelUnpackData};
use std::fmt::Debug;
use tracing::info;

/// The slice of OpenGL the filter pipeline talks to.
///
/// Every call assumes a context is current on the calling thread; callers
/// only reach these methods through a [`RenderContext`](super::RenderContext)
/// that has been made current. Texture calls operate on `TEXTURE_2D` and
/// buffer calls on `ARRAY_BUFFER`.
pub trait GpuApi {
    type Shader: Copy + Debug;
    type Program: Copy + Debug + PartialEq;
    type Texture: Copy + Debug + PartialEq;
    type Buffer: Copy + Debug;
    type VertexArray: Copy + Debug;
    type Framebuffer: Copy + Debug;
    type UniformLocation: Clone + Debug;

    /// GLES rather than desktop GL. Selects the shader dialect.
    fn is_embedded(&self) -> bool;

    fn info(&self) -> GpuInfo;

    fn create_shader(&self, stage: ShaderStage) -> Result<Self::Shader, String>;
    /// Uploads the source, compiles, and returns the compile status.
    fn compile_shader(&self, shader: Self::Shader, source: &str) -> bool;
    fn shader_info_log(&self, shader: Self::Shader) -> String;
    fn delete_shader(&self, shader: Self::Shader);

    fn create_program(&self) -> Result<Self::Program, String>;
    /// Attaches both stages, links, and returns the link status.
    fn link_program(
        &self,
        program: Self::Program,
        vertex: Self::Shader,
        fragment: Self::Shader,
    ) -> bool;
    fn program_info_log(&self, program: Self::Program) -> String;
    fn delete_program(&self, program: Self::Program);
    fn use_program(&self, program: Option<Self::Program>);
    fn attrib_location(&self, program: Self::Program, name: &str) -> Option<u32>;
    fn uniform_location(&self, program: Self::Program, name: &str)
    -> Option<Self::UniformLocation>;

    fn uniform_1_i32(&self, location: &Self::UniformLocation, value: i32);
    fn uniform_1_f32(&self, location: &Self::UniformLocation, value: f32);
    fn uniform_1_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]);
    fn uniform_2_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]);
    fn uniform_matrix_4_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]);

    fn create_texture(&self) -> Result<Self::Texture, String>;
    fn active_texture_unit(&self, unit: u32);
    fn bind_texture(&self, texture: Option<Self::Texture>);
    fn tex_parameter_i32(&self, parameter: u32, value: i32);
    /// Replaces the bound texture's image with tightly packed RGB24 pixels.
    fn tex_image_rgb(&self, width: i32, height: i32, pixels: &[u8]);
    fn delete_texture(&self, texture: Self::Texture);

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32);
    fn clear_color(&self, red: f32, green: f32, blue: f32, alpha: f32);
    fn clear_color_buffer(&self);

    fn create_vertex_array(&self) -> Result<Self::VertexArray, String>;
    fn bind_vertex_array(&self, vertex_array: Option<Self::VertexArray>);
    fn delete_vertex_array(&self, vertex_array: Self::VertexArray);
    fn create_buffer(&self) -> Result<Self::Buffer, String>;
    fn bind_array_buffer(&self, buffer: Option<Self::Buffer>);
    fn array_buffer_data(&self, data: &[f32]);
    fn delete_buffer(&self, buffer: Self::Buffer);
    fn vertex_attrib_pointer_f32(&self, index: u32, size: i32, stride: i32, offset: i32);
    fn enable_vertex_attrib_array(&self, index: u32);
    fn draw_triangle_strip(&self, first: i32, count: i32);

    fn bind_framebuffer(&self, framebuffer: Option<Self::Framebuffer>);
    /// Reads the bound framebuffer as RGBA, bottom row first.
    fn read_pixels_rgba(&self, width: i32, height: i32, out: &mut [u8]);
    fn flush(&self);
}

#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub version: String,
    pub shading_language_version: String,
    pub renderer: String,
    pub vendor: String,
}

impl GpuInfo {
    pub fn log(&self) {
        info!(
            version = %self.version,
            glsl = %self.shading_language_version,
            renderer = %self.renderer,
            vendor = %self.vendor,
            "OpenGL context ready"
        );
    }
}

fn stage_type(stage: ShaderStage) -> u32 {
    match stage {
        ShaderStage::Vertex => glow::VERTEX_SHADER,
        ShaderStage::Fragment | ShaderStage::Link => glow::FRAGMENT_SHADER,
    }
}

impl GpuApi for glow::Context {
    type Shader = glow::Shader;
    type Program = glow::Program;
    type Texture = glow::Texture;
    type Buffer = glow::Buffer;
    type VertexArray = glow::VertexArray;
    type Framebuffer = glow::Framebuffer;
    type UniformLocation = glow::UniformLocation;

    fn is_embedded(&self) -> bool {
        self.version().is_embedded
    }

    fn info(&self) -> GpuInfo {
        unsafe {
            GpuInfo {
                version: self.get_parameter_string(glow::VERSION),
                shading_language_version: self.get_parameter_string(glow::SHADING_LANGUAGE_VERSION),
                renderer: self.get_parameter_string(glow::RENDERER),
                vendor: self.get_parameter_string(glow::VENDOR),
            }
        }
    }

    fn create_shader(&self, stage: ShaderStage) -> Result<Self::Shader, String> {
        unsafe { HasContext::create_shader(self, stage_type(stage)) }
    }

    fn compile_shader(&self, shader: Self::Shader, source: &str) -> bool {
        unsafe {
            self.shader_source(shader, source);
            HasContext::compile_shader(self, shader);
            self.get_shader_compile_status(shader)
        }
    }

    fn shader_info_log(&self, shader: Self::Shader) -> String {
        unsafe { self.get_shader_info_log(shader) }
    }

    fn delete_shader(&self, shader: Self::Shader) {
        unsafe { HasContext::delete_shader(self, shader) }
    }

    fn create_program(&self) -> Result<Self::Program, String> {
        unsafe { HasContext::create_program(self) }
    }

    fn link_program(
        &self,
        program: Self::Program,
        vertex: Self::Shader,
        fragment: Self::Shader,
    ) -> bool {
        unsafe {
            self.attach_shader(program, vertex);
            self.attach_shader(program, fragment);
            HasContext::link_program(self, program);
            let linked = self.get_program_link_status(program);
            self.detach_shader(program, vertex);
            self.detach_shader(program, fragment);
            linked
        }
    }

    fn program_info_log(&self, program: Self::Program) -> String {
        unsafe { self.get_program_info_log(program) }
    }

    fn delete_program(&self, program: Self::Program) {
        unsafe { HasContext::delete_program(self, program) }
    }

    fn use_program(&self, program: Option<Self::Program>) {
        unsafe { HasContext::use_program(self, program) }
    }

    fn attrib_location(&self, program: Self::Program, name: &str) -> Option<u32> {
        unsafe { self.get_attrib_location(program, name) }
    }

    fn uniform_location(
        &self,
        program: Self::Program,
        name: &str,
    ) -> Option<Self::UniformLocation> {
        unsafe { self.get_uniform_location(program, name) }
    }

    fn uniform_1_i32(&self, location: &Self::UniformLocation, value: i32) {
        unsafe { HasContext::uniform_1_i32(self, Some(location), value) }
    }

    fn uniform_1_f32(&self, location: &Self::UniformLocation, value: f32) {
        unsafe { HasContext::uniform_1_f32(self, Some(location), value) }
    }

    fn uniform_1_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]) {
        unsafe { HasContext::uniform_1_f32_slice(self, Some(location), values) }
    }

    fn uniform_2_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]) {
        unsafe { HasContext::uniform_2_f32_slice(self, Some(location), values) }
    }

    fn uniform_matrix_4_f32_slice(&self, location: &Self::UniformLocation, values: &[f32]) {
        unsafe { HasContext::uniform_matrix_4_f32_slice(self, Some(location), false, values) }
    }

    fn create_texture(&self) -> Result<Self::Texture, String> {
        unsafe { HasContext::create_texture(self) }
    }

    fn active_texture_unit(&self, unit: u32) {
        unsafe { self.active_texture(glow::TEXTURE0 + unit) }
    }

    fn bind_texture(&self, texture: Option<Self::Texture>) {
        unsafe { HasContext::bind_texture(self, glow::TEXTURE_2D, texture) }
    }

    fn tex_parameter_i32(&self, parameter: u32, value: i32) {
        unsafe { HasContext::tex_parameter_i32(self, glow::TEXTURE_2D, parameter, value) }
    }

    fn tex_image_rgb(&self, width: i32, height: i32, pixels: &[u8]) {
        unsafe {
            // RGB rows are not 4-byte aligned for most widths.
            self.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            self.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGB8 as i32,
                width,
                height,
                0,
                glow::RGB,
                glow::UNSIGNED_BYTE,
                PixelUnpackData::Slice(Some(pixels)),
            );
        }
    }

    fn delete_texture(&self, texture: Self::Texture) {
        unsafe { HasContext::delete_texture(self, texture) }
    }

    fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        unsafe { HasContext::viewport(self, x, y, width, height) }
    }

    fn clear_color(&self, red: f32, green: f32, blue: f32, alpha: f32) {
        unsafe { HasContext::clear_color(self, red, green, blue, alpha) }
    }

    fn clear_color_buffer(&self) {
        unsafe { self.clear(glow::COLOR_BUFFER_BIT) }
    }

    fn create_vertex_array(&self) -> Result<Self::VertexArray, String> {
        unsafe { HasContext::create_vertex_array(self) }
    }

    fn bind_vertex_array(&self, vertex_array: Option<Self::VertexArray>) {
        unsafe { HasContext::bind_vertex_array(self, vertex_array) }
    }

    fn delete_vertex_array(&self, vertex_array: Self::VertexArray) {
        unsafe { HasContext::delete_vertex_array(self, vertex_array) }
    }

    fn create_buffer(&self) -> Result<Self::Buffer, String> {
        unsafe { HasContext::create_buffer(self) }
    }

    fn bind_array_buffer(&self, buffer: Option<Self::Buffer>) {
        unsafe { self.bind_buffer(glow::ARRAY_BUFFER, buffer) }
    }

    fn array_buffer_data(&self, data: &[f32]) {
        unsafe {
            self.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(data),
                glow::STREAM_DRAW,
            )
        }
    }

    fn delete_buffer(&self, buffer: Self::Buffer) {
        unsafe { HasContext::delete_buffer(self, buffer) }
    }

    fn vertex_attrib_pointer_f32(&self, index: u32, size: i32, stride: i32, offset: i32) {
        unsafe { HasContext::vertex_attrib_pointer_f32(self, index, size, glow::FLOAT, false, stride, offset) }
    }

    fn enable_vertex_attrib_array(&self, index: u32) {
        unsafe { HasContext::enable_vertex_attrib_array(self, index) }
    }

    fn draw_triangle_strip(&self, first: i32, count: i32) {
        unsafe { self.draw_arrays(glow::TRIANGLE_STRIP, first, count) }
    }

    fn bind_framebuffer(&self, framebuffer: Option<Self::Framebuffer>) {
        unsafe { HasContext::bind_framebuffer(self, glow::FRAMEBUFFER, framebuffer) }
    }

    fn read_pixels_rgba(&self, width: i32, height: i32, out: &mut [u8]) {
        unsafe {
            self.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.read_pixels(
                0,
                0,
                width,
                height,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                PixelPackData::Slice(Some(out)),
            );
        }
    }

    fn flush(&self) {
        unsafe { HasContext::flush(self) }
    }
}
