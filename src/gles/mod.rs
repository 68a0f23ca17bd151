//! OpenGL side of the pipeline: contexts bound to presentation targets,
//! filter programs and the full-frame quad.

mod full_frame;
mod gpu;
mod program;
mod surface;
mod surfman_platform;

pub use full_frame::{CLEAR_COLOR, FullFrame, IDENTITY_MATRIX};
pub use gpu::{GpuApi, GpuInfo};
pub use program::{Filter, FilterProgram, KERNEL_SIZE, ProgramKind, allocate_texture};
pub use surface::{GlPlatform, PresentationTarget, RenderContext, TargetKind};
pub use surfman_platform::{SurfmanContext, SurfmanPlatform, SurfmanWidget};
