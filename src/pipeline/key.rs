use crate::backend::PrimitiveType;
use crate::shader::ShaderId;

/// Identity of one immutable pipeline state object.
///
/// Two draws whose keys compare equal share the same cached pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex_shader: ShaderId,
    pub pixel_shader: ShaderId,
    pub blend_hash: u32,
    pub depth_hash: u32,
    pub rasterizer_hash: u32,
    pub vertex_layout_hash: u64,
    pub primitive_type: PrimitiveType,
    pub render_target_hash: u32,
}
