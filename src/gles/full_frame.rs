use crate::error::{Error, Result};
use crate::gles::{FilterProgram, GpuApi};
use tracing::trace;

/// Background the target is cleared to before every draw.
pub const CLEAR_COLOR: [f32; 4] = [0.149_019_6, 0.149_019_6, 0.149_019_6, 1.0];

#[rustfmt::skip]
pub const IDENTITY_MATRIX: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

// x, y, z, u, v. Texture rows are uploaded top row first, so v runs downwards.
#[rustfmt::skip]
const QUAD: [f32; 20] = [
    -1.0, -1.0, 0.0,   0.0, 1.0,
     1.0, -1.0, 0.0,   1.0, 1.0,
    -1.0,  1.0, 0.0,   0.0, 0.0,
     1.0,  1.0, 0.0,   1.0, 0.0,
];

const STRIDE: i32 = 5 * size_of::<f32>() as i32;
const VERTEX_COUNT: i32 = 4;

/// Draws one textured quad covering the viewport of the current context.
pub struct FullFrame;

impl FullFrame {
    /// Clears the target and binds `program` with its texture on unit 0.
    pub fn pre_draw<G: GpuApi>(gl: &G, program: &FilterProgram<G>) {
        let [r, g, b, a] = CLEAR_COLOR;
        gl.clear_color(r, g, b, a);
        gl.clear_color_buffer();
        gl.use_program(Some(program.program()));
        gl.active_texture_unit(0);
        gl.bind_texture(Some(program.texture()));
    }

    /// Issues the strip draw with `texture` sampled through `transform`.
    pub fn draw<G: GpuApi>(
        gl: &G,
        program: &FilterProgram<G>,
        texture: G::Texture,
        transform: &[f32; 16],
    ) -> Result<()> {
        gl.use_program(Some(program.program()));
        gl.active_texture_unit(0);
        gl.bind_texture(Some(texture));
        program.apply_uniforms(gl, transform);

        let vao = gl
            .create_vertex_array()
            .map_err(|e| Error::ResourceUnavailable(format!("Failed to create VAO: {e}")))?;
        let vbo = match gl.create_buffer() {
            Ok(vbo) => vbo,
            Err(e) => {
                gl.delete_vertex_array(vao);
                return Err(Error::ResourceUnavailable(format!(
                    "Failed to create VBO: {e}"
                )));
            }
        };

        gl.bind_vertex_array(Some(vao));
        gl.bind_array_buffer(Some(vbo));
        gl.array_buffer_data(&QUAD);

        let position = program.position_location();
        let texture_coord = program.texture_coord_location();
        gl.vertex_attrib_pointer_f32(position, 3, STRIDE, 0);
        gl.enable_vertex_attrib_array(position);
        gl.vertex_attrib_pointer_f32(texture_coord, 2, STRIDE, 3 * size_of::<f32>() as i32);
        gl.enable_vertex_attrib_array(texture_coord);

        gl.draw_triangle_strip(0, VERTEX_COUNT);
        trace!(?texture, "Full frame drawn");

        gl.bind_array_buffer(None);
        gl.bind_vertex_array(None);
        gl.delete_buffer(vbo);
        gl.delete_vertex_array(vao);
        gl.bind_texture(None);
        gl.use_program(None);
        Ok(())
    }
}
