//! Render state tracking and hashing.

pub mod hasher;
mod tracker;

pub use hasher::{
    blend_hash, depth_stencil_hash, rasterizer_hash, render_target_hash, SLOPE_SCALED_BIAS_SCALE,
};
pub use tracker::{DirtyFlags, DirtyRange, RenderState, StateFieldTracker, StencilTest};
