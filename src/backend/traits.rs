//! Core backend abstraction traits
//!
//! The draw path only talks to the GPU through [`GraphicsBackend`]. Both the
//! wgpu backend and the dummy backend implement it.

use crate::backend::types::*;
use crate::shader::ShaderReflection;
use crate::vertex::VertexLayoutDescription;
use std::ops::Range;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create sampler: {0}")]
    SamplerCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create resource binding: {0}")]
    ResourceBindingCreationFailed(String),
    #[error("Failed to read back texture: {0}")]
    ReadbackFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a compiled shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub(crate) u64);

/// Handle to an immutable pipeline state object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a resource binding object created from a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBindingHandle(pub(crate) u64);

/// Index of a mutable variable inside a resource binding object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableHandle(pub(crate) u32);

/// A named texture variable exposed by a resource binding object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingVariable {
    pub variable: VariableHandle,
    pub name: String,
}

/// Shader source handed to the backend
#[derive(Debug, Clone)]
pub enum ShaderSource {
    Wgsl(String),
    /// Precompiled bytecode, only accepted by backends that understand it
    Bytecode(Vec<u8>),
}

/// Shader stage descriptor
#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    pub label: Option<String>,
    pub stage: ShaderStage,
    pub source: ShaderSource,
    pub entry_point: String,
    pub reflection: ShaderReflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendStateDescriptor {
    pub mode: BlendMode,
    pub alpha_to_coverage: bool,
    pub color_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilStateDescriptor {
    pub depth_write: bool,
    pub depth_compare: CompareMode,
    pub stencil_enable: bool,
    pub stencil_compare: CompareMode,
    pub stencil_pass: StencilOp,
    pub stencil_fail: StencilOp,
    pub stencil_z_fail: StencilOp,
    pub stencil_compare_mask: u32,
    pub stencil_write_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerStateDescriptor {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub scissor_enable: bool,
    pub line_anti_alias: bool,
    /// Constant bias already scaled to depth buffer units
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
}

/// A texture variable the resource binding must expose as mutable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicVariableDescriptor {
    pub stage: ShaderStage,
    pub name: String,
}

/// Everything needed to build one immutable pipeline state object
#[derive(Debug, Clone)]
pub struct PipelineStateDescriptor {
    pub label: Option<String>,
    pub vertex_shader: ShaderHandle,
    pub pixel_shader: ShaderHandle,
    pub input_layout: VertexLayoutDescription,
    pub primitive_type: PrimitiveType,
    pub blend: BlendStateDescriptor,
    pub depth_stencil: DepthStencilStateDescriptor,
    pub rasterizer: RasterizerStateDescriptor,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
    pub dynamic_variables: Vec<DynamicVariableDescriptor>,
}

/// One vertex buffer binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
}

/// Main graphics backend trait
pub trait GraphicsBackend {
    /// Human readable backend name
    fn name(&self) -> &'static str;

    // Default framebuffer

    /// View of the default color target
    fn backbuffer_view(&self) -> TextureViewHandle;

    /// View of the default depth-stencil target
    fn default_depth_stencil_view(&self) -> TextureViewHandle;

    fn backbuffer_size(&self) -> (u32, u32);

    fn backbuffer_format(&self) -> TextureFormat;

    fn default_depth_format(&self) -> TextureFormat;

    fn backbuffer_sample_count(&self) -> u32;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write data to a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view
    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle>;

    /// Write tightly packed rows into a region of one mip level
    fn write_texture(
        &mut self,
        texture: TextureHandle,
        region: &TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    );

    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    /// Create a shader stage object
    fn create_shader(&mut self, desc: &ShaderDescriptor) -> BackendResult<ShaderHandle>;

    fn destroy_shader(&mut self, shader: ShaderHandle);

    // Pipeline state

    /// Create an immutable pipeline state object
    fn create_pipeline_state(
        &mut self,
        desc: &PipelineStateDescriptor,
    ) -> BackendResult<PipelineHandle>;

    /// Bind a constant buffer to a static variable of the pipeline.
    ///
    /// Returns `false` when the stage has no variable with that name.
    fn set_static_variable(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        name: &str,
        buffer: BufferHandle,
    ) -> BackendResult<bool>;

    /// Create a resource binding object holding the pipeline's mutable variables
    fn create_resource_binding(
        &mut self,
        pipeline: PipelineHandle,
    ) -> BackendResult<ResourceBindingHandle>;

    /// Texture variables of one stage, in declaration order
    fn binding_variables(
        &self,
        binding: ResourceBindingHandle,
        stage: ShaderStage,
    ) -> Vec<BindingVariable>;

    /// Point a texture variable at a view and its sampler
    fn set_binding_variable(
        &mut self,
        binding: ResourceBindingHandle,
        variable: VariableHandle,
        view: TextureViewHandle,
        sampler: Option<SamplerHandle>,
    );

    fn destroy_pipeline_state(&mut self, pipeline: PipelineHandle);

    fn destroy_resource_binding(&mut self, binding: ResourceBindingHandle);

    // Command recording

    /// Bind color targets by slot and an optional depth-stencil target
    fn set_render_targets(
        &mut self,
        colors: &[Option<TextureViewHandle>],
        depth_stencil: Option<TextureViewHandle>,
    );

    /// Set viewport
    fn set_viewport(&mut self, rect: &IntRect);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, rect: &IntRect);

    fn set_stencil_reference(&mut self, reference: u32);

    /// Set the pipeline state
    fn set_pipeline_state(&mut self, pipeline: PipelineHandle);

    /// Make the binding's current variable values visible to subsequent draws
    fn commit_resources(&mut self, binding: ResourceBindingHandle);

    /// Set a contiguous range of vertex buffers
    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Option<VertexBufferBinding>]);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat);

    /// Draw primitives
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    /// Draw indexed primitives
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    /// Submit all recorded work
    fn flush(&mut self) -> BackendResult<()>;
}
