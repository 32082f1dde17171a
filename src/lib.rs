//! Pipeline State Engine - pipeline state caching and per-draw state resolution
//!
//! Rendering code changes render state through [`Graphics`] setters and issues
//! draws. Before each draw the engine resolves only the state categories that
//! changed, looks up or builds an immutable pipeline state object, rebinds the
//! textures that changed and uploads pending shader constants.
//!
//! Two backends implement [`backend::GraphicsBackend`]:
//! - **dummy**: records calls, used by tests
//! - **wgpu**: headless wgpu device (feature `wgpu-backend`)
//!
//! # Features
//! - Dirty-flag state tracking with fixed-layout state hashes
//! - Pipeline cache keyed by shader pair, state hashes, vertex layout and targets
//! - Texture unit resolution from shader variable names
//! - Shader parameter groups backed by shared constant buffers
//! - WGSL reflection through naga

pub mod backend;
pub mod draw;
pub mod error;
pub mod graphics;
pub mod pipeline;
pub mod shader;
pub mod state;
pub mod texture;
pub mod vertex;

pub use backend::dummy::DummyBackend;
#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;
pub use backend::{GraphicsBackend, TextureFormat};
pub use draw::DrawPreparer;
pub use error::{GraphicsError, GraphicsResult};
pub use graphics::{DrawStats, Graphics};
pub use pipeline::{CachedPipeline, PipelineCache, PipelineKey, TextureUnit};
pub use shader::{ShaderProgram, ShaderVariation, MAX_SHADER_PARAMETER_GROUPS};
pub use state::{DirtyFlags, RenderState, StencilTest, SLOPE_SCALED_BIAS_SCALE};
pub use texture::{CubeMapFace, Texture, Texture2DDescriptor, TextureCubeDescriptor, TextureUsageKind};
pub use vertex::{IndexBuffer, VertexBuffer, VertexElement};

/// Number of texture units
pub const MAX_TEXTURE_UNITS: usize = 16;
/// Maximum vertex buffers bound at once
pub const MAX_VERTEX_STREAMS: usize = 4;
/// Maximum simultaneous color render targets
pub const MAX_RENDERTARGETS: usize = 4;

/// Configuration for creating a headless device
#[derive(Debug, Clone)]
pub struct GraphicsConfig {
    /// Device label
    pub label: String,
    /// Backbuffer width
    pub width: u32,
    /// Backbuffer height
    pub height: u32,
    /// Backbuffer color format
    pub color_format: TextureFormat,
    /// Format of the default depth-stencil buffer
    pub depth_format: TextureFormat,
    /// Multisample count of the default targets
    pub sample_count: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            label: "Pipeline State Engine".to_string(),
            width: 1280,
            height: 720,
            color_format: TextureFormat::Rgba8Unorm,
            depth_format: TextureFormat::Depth24PlusStencil8,
            sample_count: 1,
        }
    }
}

impl GraphicsConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_color_format(mut self, format: TextureFormat) -> Self {
        self.color_format = format;
        self
    }

    pub fn with_depth_format(mut self, format: TextureFormat) -> Self {
        self.depth_format = format;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}
