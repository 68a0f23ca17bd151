use crate::error::{Error, Result, ShaderStage};
use crate::gles::GpuApi;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const KERNEL_SIZE: usize = 9;

/// User-facing filters. Several share one [`ProgramKind`] and differ only in
/// their convolution kernel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Filter {
    #[default]
    Identity,
    Grayscale,
    Blur,
    Sharpen,
    EdgeDetect,
    Emboss,
    Invert,
    GrayscaleInvert,
}

impl Filter {
    pub const ALL: [Filter; 8] = [
        Filter::Identity,
        Filter::Grayscale,
        Filter::Blur,
        Filter::Sharpen,
        Filter::EdgeDetect,
        Filter::Emboss,
        Filter::Invert,
        Filter::GrayscaleInvert,
    ];

    pub fn program_kind(self) -> ProgramKind {
        match self {
            Filter::Identity => ProgramKind::Passthrough,
            Filter::Grayscale => ProgramKind::Grayscale,
            Filter::Blur | Filter::Sharpen | Filter::EdgeDetect | Filter::Emboss => {
                ProgramKind::Convolution
            }
            Filter::Invert => ProgramKind::Negative,
            Filter::GrayscaleInvert => ProgramKind::GrayscaleNegative,
        }
    }

    /// Kernel and color adjustment for convolution filters.
    pub fn kernel(self) -> Option<([f32; KERNEL_SIZE], f32)> {
        match self {
            Filter::Blur => Some((
                [
                    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
                    2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0,
                    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
                ],
                0.0,
            )),
            Filter::Sharpen => Some((
                [
                    0.0, -1.0, 0.0,
                    -1.0, 5.0, -1.0,
                    0.0, -1.0, 0.0,
                ],
                0.0,
            )),
            Filter::EdgeDetect => Some((
                [
                    -1.0, -1.0, -1.0,
                    -1.0, 8.0, -1.0,
                    -1.0, -1.0, -1.0,
                ],
                0.0,
            )),
            Filter::Emboss => Some((
                [
                    2.0, 0.0, 0.0,
                    0.0, -1.0, 0.0,
                    0.0, 0.0, -1.0,
                ],
                0.5,
            )),
            Filter::Identity
            | Filter::Grayscale
            | Filter::Invert
            | Filter::GrayscaleInvert => None,
        }
    }
}

/// Distinct compiled programs. Switching between filters of the same kind
/// only updates uniforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Passthrough,
    Grayscale,
    Negative,
    GrayscaleNegative,
    Convolution,
}

const VERTEX_SHADER: &str = r#"
in vec4 aPosition;
in vec4 aTextureCoord;
uniform mat4 uTexMatrix;
out vec2 vTextureCoord;
void main() {
    gl_Position = aPosition;
    vTextureCoord = (uTexMatrix * aTextureCoord).xy;
}
"#;

const FRAGMENT_PASSTHROUGH: &str = r#"
in vec2 vTextureCoord;
uniform sampler2D sTexture;
out vec4 fragColor;
void main() {
    fragColor = texture(sTexture, vTextureCoord);
}
"#;

const FRAGMENT_GRAYSCALE: &str = r#"
in vec2 vTextureCoord;
uniform sampler2D sTexture;
out vec4 fragColor;
void main() {
    vec4 tc = texture(sTexture, vTextureCoord);
    float color = tc.r * 0.3 + tc.g * 0.59 + tc.b * 0.11;
    fragColor = vec4(color, color, color, 1.0);
}
"#;

const FRAGMENT_NEGATIVE: &str = r#"
in vec2 vTextureCoord;
uniform sampler2D sTexture;
out vec4 fragColor;
void main() {
    vec4 color = texture(sTexture, vTextureCoord);
    fragColor = vec4(1.0 - color.rgb, color.a);
}
"#;

const FRAGMENT_GRAYSCALE_NEGATIVE: &str = r#"
in vec2 vTextureCoord;
uniform sampler2D sTexture;
out vec4 fragColor;
void main() {
    vec4 tc = texture(sTexture, vTextureCoord);
    float color = 1.0 - (tc.r * 0.3 + tc.g * 0.59 + tc.b * 0.11);
    fragColor = vec4(color, color, color, 1.0);
}
"#;

const FRAGMENT_CONVOLUTION: &str = r#"
#define KERNEL_SIZE 9
in vec2 vTextureCoord;
uniform sampler2D sTexture;
uniform float uKernel[KERNEL_SIZE];
uniform vec2 uTexOffset[KERNEL_SIZE];
uniform float uColorAdjust;
out vec4 fragColor;
void main() {
    vec4 sum = vec4(0.0);
    for (int i = 0; i < KERNEL_SIZE; i++) {
        vec4 texc = texture(sTexture, vTextureCoord + uTexOffset[i]);
        sum += texc * uKernel[i];
    }
    sum += uColorAdjust;
    fragColor = vec4(sum.rgb, 1.0);
}
"#;

impl ProgramKind {
    fn fragment_source(self) -> &'static str {
        match self {
            ProgramKind::Passthrough => FRAGMENT_PASSTHROUGH,
            ProgramKind::Grayscale => FRAGMENT_GRAYSCALE,
            ProgramKind::Negative => FRAGMENT_NEGATIVE,
            ProgramKind::GrayscaleNegative => FRAGMENT_GRAYSCALE_NEGATIVE,
            ProgramKind::Convolution => FRAGMENT_CONVOLUTION,
        }
    }
}

fn shader_header(embedded: bool) -> &'static str {
    if embedded {
        "#version 300 es\nprecision highp float;\n"
    } else {
        "#version 330 core\n"
    }
}

struct Uniforms<U> {
    texture: Option<U>,
    tex_matrix: Option<U>,
    kernel: Option<U>,
    tex_offset: Option<U>,
    color_adjust: Option<U>,
}

/// A linked program for one [`ProgramKind`] plus the texture frames are
/// uploaded into while it is active.
pub struct FilterProgram<G: GpuApi> {
    kind: ProgramKind,
    program: G::Program,
    texture: G::Texture,
    position_location: u32,
    texture_coord_location: u32,
    uniforms: Uniforms<G::UniformLocation>,
    kernel: [f32; KERNEL_SIZE],
    color_adjust: f32,
    tex_offset: Option<[f32; KERNEL_SIZE * 2]>,
}

impl<G: GpuApi> FilterProgram<G> {
    /// Compiles and links the program for `kind` in the current context and
    /// allocates its texture.
    pub fn compile(gl: &G, kind: ProgramKind) -> Result<Self> {
        let header = shader_header(gl.is_embedded());
        let vertex = compile_shader(gl, ShaderStage::Vertex, &format!("{header}{VERTEX_SHADER}"))?;
        let fragment = match compile_shader(
            gl,
            ShaderStage::Fragment,
            &format!("{header}{}", kind.fragment_source()),
        ) {
            Ok(fragment) => fragment,
            Err(error) => {
                gl.delete_shader(vertex);
                return Err(error);
            }
        };

        let program = gl.create_program().map_err(|e| Error::ShaderCompile {
            stage: ShaderStage::Link,
            log: format!("Failed to create program: {e}"),
        });
        let program = match program {
            Ok(program) => program,
            Err(error) => {
                gl.delete_shader(vertex);
                gl.delete_shader(fragment);
                return Err(error);
            }
        };

        let linked = gl.link_program(program, vertex, fragment);
        gl.delete_shader(vertex);
        gl.delete_shader(fragment);
        if !linked {
            let log = gl.program_info_log(program);
            gl.delete_program(program);
            return Err(Error::ShaderCompile {
                stage: ShaderStage::Link,
                log,
            });
        }

        let (Some(position_location), Some(texture_coord_location)) = (
            gl.attrib_location(program, "aPosition"),
            gl.attrib_location(program, "aTextureCoord"),
        ) else {
            gl.delete_program(program);
            return Err(Error::ShaderCompile {
                stage: ShaderStage::Link,
                log: "vertex attributes aPosition/aTextureCoord not found".into(),
            });
        };

        let uniforms = Uniforms {
            texture: gl.uniform_location(program, "sTexture"),
            tex_matrix: gl.uniform_location(program, "uTexMatrix"),
            kernel: gl.uniform_location(program, "uKernel"),
            tex_offset: gl.uniform_location(program, "uTexOffset"),
            color_adjust: gl.uniform_location(program, "uColorAdjust"),
        };

        let texture = match allocate_texture(gl) {
            Ok(texture) => texture,
            Err(error) => {
                gl.delete_program(program);
                return Err(error);
            }
        };

        info!(?kind, ?program, ?texture, "Created filter program");
        Ok(Self {
            kind,
            program,
            texture,
            position_location,
            texture_coord_location,
            uniforms,
            kernel: [0.0; KERNEL_SIZE],
            color_adjust: 0.0,
            tex_offset: None,
        })
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn program(&self) -> G::Program {
        self.program
    }

    pub fn texture(&self) -> G::Texture {
        self.texture
    }

    pub fn position_location(&self) -> u32 {
        self.position_location
    }

    pub fn texture_coord_location(&self) -> u32 {
        self.texture_coord_location
    }

    pub fn kernel(&self) -> ([f32; KERNEL_SIZE], f32) {
        (self.kernel, self.color_adjust)
    }

    /// Texel offsets for the current texture size, if one has been set.
    pub fn tex_offset(&self) -> Option<&[f32; KERNEL_SIZE * 2]> {
        self.tex_offset.as_ref()
    }

    /// Configures the convolution kernel. Only valid on convolution programs.
    pub fn set_kernel(&mut self, values: &[f32], color_adjust: f32) -> Result<()> {
        if self.kind != ProgramKind::Convolution {
            return Err(Error::InvalidArgument(format!(
                "{:?} program takes no kernel",
                self.kind
            )));
        }
        if values.len() != KERNEL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "Kernel size is {} vs. {KERNEL_SIZE}",
                values.len()
            )));
        }
        self.kernel.copy_from_slice(values);
        self.color_adjust = color_adjust;
        debug!(kernel = ?self.kernel, color_adjust, "Filter kernel set");
        Ok(())
    }

    /// Recomputes the offsets of the 3x3 neighbourhood for a `width` x
    /// `height` texture.
    pub fn set_texture_size(&mut self, width: i32, height: i32) {
        let rw = 1.0 / width as f32;
        let rh = 1.0 / height as f32;

        #[rustfmt::skip]
        let offsets = [
            -rw, -rh,   0.0, -rh,   rw, -rh,
            -rw, 0.0,   0.0, 0.0,   rw, 0.0,
            -rw, rh,    0.0, rh,    rw, rh,
        ];
        self.tex_offset = Some(offsets);
        debug!(width, height, "Filter texture size set");
    }

    /// Pushes the per-program uniforms. The program must be in use.
    pub(crate) fn apply_uniforms(&self, gl: &G, transform: &[f32; 16]) {
        if let Some(location) = &self.uniforms.texture {
            gl.uniform_1_i32(location, 0);
        }
        if let Some(location) = &self.uniforms.tex_matrix {
            gl.uniform_matrix_4_f32_slice(location, transform);
        }
        if self.kind != ProgramKind::Convolution {
            return;
        }
        if let Some(location) = &self.uniforms.kernel {
            gl.uniform_1_f32_slice(location, &self.kernel);
        }
        if let (Some(location), Some(offsets)) = (&self.uniforms.tex_offset, &self.tex_offset) {
            gl.uniform_2_f32_slice(location, offsets);
        }
        if let Some(location) = &self.uniforms.color_adjust {
            gl.uniform_1_f32(location, self.color_adjust);
        }
    }

    /// Replaces the texture image with a tightly packed RGB24 frame.
    pub fn upload(&self, gl: &G, width: i32, height: i32, pixels: &[u8]) {
        gl.active_texture_unit(0);
        gl.bind_texture(Some(self.texture));
        gl.tex_image_rgb(width, height, pixels);
    }

    /// Deletes the program and its texture. A context sharing them must be
    /// current.
    pub fn release(self, gl: &G) {
        debug!(kind = ?self.kind, program = ?self.program, "Deleting filter program");
        gl.delete_texture(self.texture);
        gl.delete_program(self.program);
    }
}

fn compile_shader<G: GpuApi>(gl: &G, stage: ShaderStage, source: &str) -> Result<G::Shader> {
    let shader = gl.create_shader(stage).map_err(|e| Error::ShaderCompile {
        stage,
        log: format!("Failed to create shader: {e}"),
    })?;

    if !gl.compile_shader(shader, source) {
        let log = gl.shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(Error::ShaderCompile { stage, log });
    }
    Ok(shader)
}

/// One 2D texture: nearest minification, linear magnification, clamped at
/// the edges. Frames arrive as full images, so no mipmaps.
pub fn allocate_texture<G: GpuApi>(gl: &G) -> Result<G::Texture> {
    let texture = gl
        .create_texture()
        .map_err(|e| Error::ResourceUnavailable(format!("Failed to create texture: {e}")))?;
    gl.bind_texture(Some(texture));
    gl.tex_parameter_i32(glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
    gl.tex_parameter_i32(glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
    gl.tex_parameter_i32(glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    gl.bind_texture(None);
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_filter_maps_to_a_program() {
        for filter in Filter::ALL {
            let kind = filter.program_kind();
            assert_eq!(
                filter.kernel().is_some(),
                kind == ProgramKind::Convolution,
                "{filter:?}"
            );
        }
    }

    #[test]
    fn blur_kernel_is_normalized() {
        let (kernel, adjust) = Filter::Blur.kernel().unwrap();
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < f32::EPSILON);
        assert_eq!(adjust, 0.0);
    }

    #[test]
    fn emboss_shifts_color() {
        let (_, adjust) = Filter::Emboss.kernel().unwrap();
        assert_eq!(adjust, 0.5);
    }

    #[test]
    fn headers_match_gl_flavour() {
        assert!(shader_header(true).starts_with("#version 300 es"));
        assert!(shader_header(false).starts_with("#version 330 core"));
    }
}
