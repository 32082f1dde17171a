//! Packing of render state categories into 32-bit signatures.
//!
//! The layouts are fixed. Every field is masked to its bit width so two
//! states that differ in any encoded field hash differently.

use crate::backend::TextureFormat;

use super::tracker::RenderState;

/// Scale applied to the slope-scaled depth bias before packing
pub const SLOPE_SCALED_BIAS_SCALE: f32 = 100.0;

const BIAS_MASK: u32 = 0x1fff;

/// `color_write | alpha_to_coverage << 1 | blend_mode << 2`
pub fn blend_hash(state: &RenderState) -> u32 {
    (state.color_write as u32)
        | (state.alpha_to_coverage as u32) << 1
        | (state.blend_mode as u32) << 2
}

/// Depth and stencil state. The three stencil ops are packed base 5 into
/// the top 7 bits.
pub fn depth_stencil_hash(state: &RenderState) -> u32 {
    let ops = state.stencil_fail as u32
        + state.stencil_z_fail as u32 * 5
        + state.stencil_pass as u32 * 25;

    (state.depth_write as u32)
        | (state.stencil_test as u32) << 1
        | (state.depth_test_mode as u32) << 2
        | (state.stencil_compare_mask & 0xff) << 5
        | (state.stencil_write_mask & 0xff) << 13
        | (state.stencil_test_mode as u32) << 21
        | ops << 24
}

/// Constant depth bias in depth buffer units for the given depth bit count.
pub fn quantize_constant_bias(bias: f32, depth_bits: u32) -> i32 {
    (bias * (1u64 << depth_bits) as f32) as i32
}

pub fn quantize_slope_bias(bias: f32) -> i32 {
    (bias * SLOPE_SCALED_BIAS_SCALE) as i32
}

/// Rasterizer state. Both depth biases are quantized and truncated to 13 bits.
pub fn rasterizer_hash(state: &RenderState, depth_bits: u32) -> u32 {
    let constant = quantize_constant_bias(state.constant_depth_bias, depth_bits) as u32;
    let slope = quantize_slope_bias(state.slope_scaled_depth_bias) as u32;

    (state.scissor_test as u32)
        | (state.line_anti_alias as u32) << 1
        | (state.fill_mode as u32) << 2
        | (state.cull_mode as u32) << 4
        | (constant & BIAS_MASK) << 6
        | (slope & BIAS_MASK) << 19
}

fn format_code(format: TextureFormat) -> u32 {
    format as u32 + 1
}

/// Signature of the bound target formats and sample count.
pub fn render_target_hash(
    color_formats: &[TextureFormat],
    depth_format: Option<TextureFormat>,
    sample_count: u32,
) -> u32 {
    let mut hash = sample_count;
    for format in color_formats {
        hash = hash.wrapping_mul(31).wrapping_add(format_code(*format));
    }
    hash = hash.wrapping_mul(31);
    if let Some(format) = depth_format {
        hash = hash.wrapping_add(format_code(format));
    }
    hash
}
