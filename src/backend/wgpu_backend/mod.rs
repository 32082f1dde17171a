//! Headless wgpu backend
//!
//! Renders into an offscreen backbuffer created from [`GraphicsConfig`].
//! Render pass commands are buffered and replayed when the render targets
//! change or the backend is flushed.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::{ResourceDimension, ShaderReflection, ShaderResourceKind, TextureSampleKind};
use crate::vertex::{VertexElementSemantic, VertexElementType, VertexLayoutDescription};
use crate::GraphicsConfig;
use wgpu::util::DeviceExt;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

const MAX_VERTEX_BUFFER_SLOTS: usize = 8;

/// Device features used when the adapter offers them
const OPTIONAL_FEATURES: wgpu::Features = wgpu::Features::POLYGON_MODE_LINE
    .union(wgpu::Features::POLYGON_MODE_POINT)
    .union(wgpu::Features::TEXTURE_COMPRESSION_BC);

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(u64),
    SetBindGroup { index: u32, bind_group: u64 },
    SetVertexBuffer { slot: u32, buffer: u64, offset: u64 },
    SetIndexBuffer { buffer: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32 },
    SetScissorRect { x: u32, y: u32, width: u32, height: u32 },
    SetStencilReference(u32),
    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    colors: Vec<Option<u64>>,
    depth_stencil: Option<u64>,
    size: (u32, u32),
    commands: Vec<RenderCommand>,
}

struct WgpuTexture {
    texture: wgpu::Texture,
    dimension: TextureDimension,
    format: TextureFormat,
    width: u32,
    height: u32,
}

struct WgpuTextureView {
    view: wgpu::TextureView,
    kind: TextureViewKind,
    format: TextureFormat,
    width: u32,
    height: u32,
}

struct WgpuShader {
    module: wgpu::ShaderModule,
    stage: ShaderStage,
    entry_point: String,
    reflection: ShaderReflection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Uniform { size: u32 },
    Resource(ShaderResourceKind),
}

struct LayoutSlot {
    binding: u32,
    kind: SlotKind,
}

struct BindGroupSlots {
    layout: wgpu::BindGroupLayout,
    slots: Vec<LayoutSlot>,
}

struct WgpuPipeline {
    pipeline: wgpu::RenderPipeline,
    groups: Vec<BindGroupSlots>,
    vertex_shader: ShaderHandle,
    pixel_shader: ShaderHandle,
    /// Constant buffers keyed by (group, binding)
    statics: HashMap<(u32, u32), u64>,
    scissor_enable: bool,
}

struct TextureVariable {
    stage: ShaderStage,
    name: String,
    slot: (u32, u32),
    sampler_slot: Option<(u32, u32)>,
    view: Option<u64>,
    sampler: Option<u64>,
}

struct WgpuResourceBinding {
    pipeline: u64,
    variables: Vec<TextureVariable>,
    bind_groups: Vec<u64>,
    dirty: bool,
}

/// State that outlives a render pass and is replayed into the next one
#[derive(Default)]
struct BoundState {
    pipeline: Option<u64>,
    bind_groups: Vec<(u32, u64)>,
    vertex_buffers: [Option<(u64, u64)>; MAX_VERTEX_BUFFER_SLOTS],
    index_buffer: Option<(u64, IndexFormat)>,
    viewport: Option<IntRect>,
    scissor: Option<IntRect>,
    stencil_reference: u32,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,

    // Default framebuffer
    backbuffer_texture: u64,
    backbuffer_view: u64,
    depth_view: u64,
    backbuffer_size: (u32, u32),
    color_format: TextureFormat,
    depth_format: TextureFormat,
    sample_count: u32,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, WgpuTexture>,
    texture_views: HashMap<u64, WgpuTextureView>,
    samplers: HashMap<u64, wgpu::Sampler>,
    shaders: HashMap<u64, WgpuShader>,
    pipelines: HashMap<u64, WgpuPipeline>,
    resource_bindings: HashMap<u64, WgpuResourceBinding>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    /// Bind groups replaced while a pass may still reference them
    retired_bind_groups: Vec<u64>,

    // Stand-ins for unbound slots
    fallback_vertex_buffer: u64,
    fallback_textures: HashMap<(ResourceDimension, TextureSampleKind), (wgpu::Texture, wgpu::TextureView)>,
    fallback_samplers: HashMap<bool, wgpu::Sampler>,
    fallback_uniforms: HashMap<u32, wgpu::Buffer>,

    next_id: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    targets: Option<(Vec<Option<u64>>, Option<u64>)>,
    pending_render_pass: Option<PendingRenderPass>,
    bound: BoundState,
    polygon_mode_warned: bool,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            TextureFormat::Bc1RgbaUnorm => wgpu::TextureFormat::Bc1RgbaUnorm,
            TextureFormat::Bc2RgbaUnorm => wgpu::TextureFormat::Bc2RgbaUnorm,
            TextureFormat::Bc3RgbaUnorm => wgpu::TextureFormat::Bc3RgbaUnorm,
            TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
            TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::COPY_SRC;
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_vertex_format(element_type: VertexElementType) -> wgpu::VertexFormat {
        match element_type {
            VertexElementType::Int => wgpu::VertexFormat::Sint32,
            VertexElementType::Float => wgpu::VertexFormat::Float32,
            VertexElementType::Vector2 => wgpu::VertexFormat::Float32x2,
            VertexElementType::Vector3 => wgpu::VertexFormat::Float32x3,
            VertexElementType::Vector4 => wgpu::VertexFormat::Float32x4,
            VertexElementType::UByte4 => wgpu::VertexFormat::Uint8x4,
            VertexElementType::UByte4Norm => wgpu::VertexFormat::Unorm8x4,
        }
    }

    /// Shader input location an attribute is fed to.
    ///
    /// Texture coordinates occupy locations 8 to 15, one per semantic index.
    fn shader_location(semantic: VertexElementSemantic, index: u8) -> Option<u32> {
        let base = match semantic {
            VertexElementSemantic::Position => 0,
            VertexElementSemantic::Normal => 1,
            VertexElementSemantic::Binormal => 2,
            VertexElementSemantic::Tangent => 3,
            VertexElementSemantic::Color => 4,
            VertexElementSemantic::BlendWeights => 5,
            VertexElementSemantic::BlendIndices => 6,
            VertexElementSemantic::ObjectIndex => 7,
            VertexElementSemantic::TexCoord => {
                return (index < 8).then_some(8 + index as u32);
            }
        };
        (index == 0).then_some(base)
    }

    fn convert_compare_function(mode: CompareMode) -> wgpu::CompareFunction {
        match mode {
            CompareMode::Always => wgpu::CompareFunction::Always,
            CompareMode::Equal => wgpu::CompareFunction::Equal,
            CompareMode::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareMode::Less => wgpu::CompareFunction::Less,
            CompareMode::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareMode::Greater => wgpu::CompareFunction::Greater,
            CompareMode::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        }
    }

    fn convert_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
        match op {
            StencilOp::Keep => wgpu::StencilOperation::Keep,
            StencilOp::Zero => wgpu::StencilOperation::Zero,
            StencilOp::Ref => wgpu::StencilOperation::Replace,
            StencilOp::Incr => wgpu::StencilOperation::IncrementClamp,
            StencilOp::Decr => wgpu::StencilOperation::DecrementClamp,
        }
    }

    /// Blend state for a blend mode, `None` when blending is off.
    fn convert_blend_mode(mode: BlendMode) -> Option<wgpu::BlendState> {
        use wgpu::{BlendFactor as F, BlendOperation as Op};

        let (src_factor, dst_factor, operation) = match mode {
            BlendMode::Replace => return None,
            BlendMode::Add => (F::One, F::One, Op::Add),
            BlendMode::Multiply => (F::Dst, F::Zero, Op::Add),
            BlendMode::Alpha => (F::SrcAlpha, F::OneMinusSrcAlpha, Op::Add),
            BlendMode::AddAlpha => (F::SrcAlpha, F::One, Op::Add),
            BlendMode::PremulAlpha => (F::One, F::OneMinusSrcAlpha, Op::Add),
            BlendMode::InvDestAlpha => (F::OneMinusDstAlpha, F::DstAlpha, Op::Add),
            BlendMode::Subtract => (F::One, F::One, Op::ReverseSubtract),
            BlendMode::SubtractAlpha => (F::SrcAlpha, F::One, Op::ReverseSubtract),
        };
        let component = wgpu::BlendComponent {
            src_factor,
            dst_factor,
            operation,
        };
        Some(wgpu::BlendState {
            color: component,
            alpha: component,
        })
    }

    fn convert_primitive_type(primitive_type: PrimitiveType) -> wgpu::PrimitiveTopology {
        match primitive_type {
            PrimitiveType::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveType::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveType::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveType::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
            PrimitiveType::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        }
    }

    fn convert_cull_mode(mode: CullMode) -> Option<wgpu::Face> {
        // Front faces wind clockwise
        match mode {
            CullMode::None => None,
            CullMode::Ccw => Some(wgpu::Face::Back),
            CullMode::Cw => Some(wgpu::Face::Front),
        }
    }

    fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::Wrap => wgpu::AddressMode::Repeat,
            AddressMode::Mirror => wgpu::AddressMode::MirrorRepeat,
            AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
        }
    }

    fn convert_view_dimension(dimension: ResourceDimension) -> wgpu::TextureViewDimension {
        match dimension {
            ResourceDimension::D2 => wgpu::TextureViewDimension::D2,
            ResourceDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            ResourceDimension::Cube => wgpu::TextureViewDimension::Cube,
            ResourceDimension::D3 => wgpu::TextureViewDimension::D3,
        }
    }

    fn convert_binding_type(kind: SlotKind) -> wgpu::BindingType {
        match kind {
            SlotKind::Uniform { .. } => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            SlotKind::Resource(ShaderResourceKind::Texture {
                dimension,
                sample_kind,
                multisampled,
            }) => wgpu::BindingType::Texture {
                sample_type: match sample_kind {
                    TextureSampleKind::Float => wgpu::TextureSampleType::Float {
                        filterable: !multisampled,
                    },
                    TextureSampleKind::Depth => wgpu::TextureSampleType::Depth,
                    TextureSampleKind::Sint => wgpu::TextureSampleType::Sint,
                    TextureSampleKind::Uint => wgpu::TextureSampleType::Uint,
                },
                view_dimension: Self::convert_view_dimension(dimension),
                multisampled,
            },
            SlotKind::Resource(ShaderResourceKind::Sampler { comparison }) => {
                wgpu::BindingType::Sampler(if comparison {
                    wgpu::SamplerBindingType::Comparison
                } else {
                    wgpu::SamplerBindingType::Filtering
                })
            }
        }
    }

    /// Create a headless device with the default framebuffer described by `config`.
    pub fn new(config: &GraphicsConfig) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(config))
    }

    pub async fn new_async(config: &GraphicsConfig) -> BackendResult<Self> {
        let (instance, adapter, device, queue) = Self::init_headless(&config.label).await?;
        let features = device.features();

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("wgpu error: {}", error);
        }));

        let mut backend = Self {
            instance,
            adapter,
            device,
            queue,
            features,
            backbuffer_texture: 0,
            backbuffer_view: 0,
            depth_view: 0,
            backbuffer_size: (config.width.max(1), config.height.max(1)),
            color_format: config.color_format,
            depth_format: config.depth_format,
            sample_count: config.sample_count.max(1),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            resource_bindings: HashMap::new(),
            bind_groups: HashMap::new(),
            retired_bind_groups: Vec::new(),
            fallback_vertex_buffer: 0,
            fallback_textures: HashMap::new(),
            fallback_samplers: HashMap::new(),
            fallback_uniforms: HashMap::new(),
            next_id: 1,
            encoder: None,
            targets: None,
            pending_render_pass: None,
            bound: BoundState::default(),
            polygon_mode_warned: false,
        };
        backend.create_default_targets()?;

        let fallback = backend.create_buffer(&BufferDescriptor {
            label: Some("Fallback Vertex Buffer".into()),
            size: 64,
            usage: BufferUsage::VERTEX,
        })?;
        backend.fallback_vertex_buffer = fallback.0;

        log::info!(
            "wgpu backend ready: {}x{} {:?}, depth {:?}, {}x MSAA",
            backend.backbuffer_size.0,
            backend.backbuffer_size.1,
            backend.color_format,
            backend.depth_format,
            backend.sample_count
        );
        Ok(backend)
    }

    async fn init_headless(
        label: &str,
    ) -> BackendResult<(wgpu::Instance, wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all());
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let power_preference =
            wgpu::util::power_preference_from_env().unwrap_or(wgpu::PowerPreference::HighPerformance);
        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
        {
            Some(adapter) => adapter,
            None => {
                log::warn!("No hardware adapter available, trying the fallback adapter");
                instance
                    .request_adapter(&wgpu::RequestAdapterOptions {
                        power_preference,
                        compatible_surface: None,
                        force_fallback_adapter: true,
                    })
                    .await
                    .ok_or_else(|| {
                        BackendError::InitializationFailed("No suitable adapter found".into())
                    })?
            }
        };

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(label),
                    required_features: adapter.features() & OPTIONAL_FEATURES,
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        Ok((instance, adapter, device, queue))
    }

    fn create_default_targets(&mut self) -> BackendResult<()> {
        let (width, height) = self.backbuffer_size;
        let color = self.create_texture(&TextureDescriptor {
            label: Some("Backbuffer".into()),
            width,
            height,
            dimension: TextureDimension::D2,
            mip_levels: 1,
            sample_count: self.sample_count,
            format: self.color_format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        })?;
        let color_view = self.create_texture_view(
            color,
            &TextureViewDescriptor::new(TextureViewKind::RenderTarget),
        )?;

        let depth = self.create_texture(&TextureDescriptor {
            label: Some("Default Depth Stencil".into()),
            width,
            height,
            dimension: TextureDimension::D2,
            mip_levels: 1,
            sample_count: self.sample_count,
            format: self.depth_format,
            usage: TextureUsage::RENDER_ATTACHMENT,
        })?;
        let depth_view = self.create_texture_view(
            depth,
            &TextureViewDescriptor::new(TextureViewKind::DepthStencil),
        )?;

        self.backbuffer_texture = color.0;
        self.backbuffer_view = color_view.0;
        self.depth_view = depth_view.0;
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Run `f` inside a validation error scope.
    fn with_validation<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(error.to_string()),
            None => Ok(value),
        }
    }

    fn polygon_mode(&mut self, fill_mode: FillMode) -> wgpu::PolygonMode {
        let (mode, feature) = match fill_mode {
            FillMode::Solid => return wgpu::PolygonMode::Fill,
            FillMode::Wireframe => (wgpu::PolygonMode::Line, wgpu::Features::POLYGON_MODE_LINE),
            FillMode::Point => (wgpu::PolygonMode::Point, wgpu::Features::POLYGON_MODE_POINT),
        };
        if self.features.contains(feature) {
            return mode;
        }
        if !self.polygon_mode_warned {
            log::warn!("{:?} fill mode not supported by the device, drawing solid", fill_mode);
            self.polygon_mode_warned = true;
        }
        wgpu::PolygonMode::Fill
    }

    /// Union of both stages' bindings, keyed by group then binding
    fn collect_bind_group_slots(
        shaders: [&WgpuShader; 2],
    ) -> BTreeMap<u32, BTreeMap<u32, (SlotKind, wgpu::ShaderStages)>> {
        let mut groups: BTreeMap<u32, BTreeMap<u32, (SlotKind, wgpu::ShaderStages)>> =
            BTreeMap::new();
        for shader in shaders {
            let visibility = match shader.stage {
                ShaderStage::Vertex => wgpu::ShaderStages::VERTEX,
                ShaderStage::Pixel => wgpu::ShaderStages::FRAGMENT,
            };
            let reflection = &shader.reflection;
            let slots = reflection
                .constant_buffers
                .iter()
                .map(|cb| (cb.group, cb.binding, SlotKind::Uniform { size: cb.size }))
                .chain(
                    reflection
                        .resources
                        .iter()
                        .map(|r| (r.group, r.binding, SlotKind::Resource(r.kind))),
                );
            for (group, binding, kind) in slots {
                groups
                    .entry(group)
                    .or_default()
                    .entry(binding)
                    .or_insert((kind, wgpu::ShaderStages::empty()))
                    .1 |= visibility;
            }
        }
        groups
    }

    /// Attributes per vertex buffer slot
    fn convert_vertex_attributes(layout: &VertexLayoutDescription) -> Vec<Vec<wgpu::VertexAttribute>> {
        let mut slots = vec![Vec::new(); layout.strides.len()];
        for element in &layout.elements {
            let Some(shader_location) =
                Self::shader_location(element.semantic, element.semantic_index)
            else {
                log::warn!(
                    "No shader location for {:?}{}, attribute dropped",
                    element.semantic,
                    element.semantic_index
                );
                continue;
            };
            if let Some(attributes) = slots.get_mut(element.buffer_slot as usize) {
                attributes.push(wgpu::VertexAttribute {
                    format: Self::convert_vertex_format(element.element_type),
                    offset: element.offset as u64,
                    shader_location,
                });
            }
        }
        slots
    }

    fn ensure_fallback(&mut self, kind: SlotKind) {
        match kind {
            SlotKind::Uniform { size } => {
                let device = &self.device;
                self.fallback_uniforms.entry(size).or_insert_with(|| {
                    device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("Fallback Uniform Buffer"),
                        size: (size.max(16) as u64).next_multiple_of(16),
                        usage: wgpu::BufferUsages::UNIFORM,
                        mapped_at_creation: false,
                    })
                });
            }
            SlotKind::Resource(ShaderResourceKind::Texture {
                dimension,
                sample_kind,
                ..
            }) => {
                let device = &self.device;
                self.fallback_textures
                    .entry((dimension, sample_kind))
                    .or_insert_with(|| {
                        let format = match sample_kind {
                            TextureSampleKind::Float => wgpu::TextureFormat::Rgba8Unorm,
                            TextureSampleKind::Depth => wgpu::TextureFormat::Depth32Float,
                            TextureSampleKind::Sint => wgpu::TextureFormat::R32Sint,
                            TextureSampleKind::Uint => wgpu::TextureFormat::R32Uint,
                        };
                        let (texture_dimension, layers) = match dimension {
                            ResourceDimension::D3 => (wgpu::TextureDimension::D3, 1),
                            ResourceDimension::Cube => (wgpu::TextureDimension::D2, 6),
                            _ => (wgpu::TextureDimension::D2, 1),
                        };
                        let texture = device.create_texture(&wgpu::TextureDescriptor {
                            label: Some("Fallback Texture"),
                            size: wgpu::Extent3d {
                                width: 1,
                                height: 1,
                                depth_or_array_layers: layers,
                            },
                            mip_level_count: 1,
                            sample_count: 1,
                            dimension: texture_dimension,
                            format,
                            usage: wgpu::TextureUsages::TEXTURE_BINDING,
                            view_formats: &[],
                        });
                        let view = texture.create_view(&wgpu::TextureViewDescriptor {
                            dimension: Some(Self::convert_view_dimension(dimension)),
                            ..Default::default()
                        });
                        (texture, view)
                    });
            }
            SlotKind::Resource(ShaderResourceKind::Sampler { comparison }) => {
                let device = &self.device;
                self.fallback_samplers.entry(comparison).or_insert_with(|| {
                    device.create_sampler(&wgpu::SamplerDescriptor {
                        label: Some("Fallback Sampler"),
                        compare: comparison.then_some(wgpu::CompareFunction::LessEqual),
                        ..Default::default()
                    })
                });
            }
        }
    }

    /// Recreate the bind groups of a resource binding from its current variables.
    fn rebuild_bind_groups(&mut self, id: u64) -> Result<(), String> {
        let kinds: Vec<SlotKind> = {
            let state = self
                .resource_bindings
                .get(&id)
                .ok_or("unknown resource binding")?;
            let pipeline = self
                .pipelines
                .get(&state.pipeline)
                .ok_or("pipeline was destroyed")?;
            pipeline
                .groups
                .iter()
                .flat_map(|g| g.slots.iter().map(|s| s.kind))
                .collect()
        };
        for kind in kinds {
            self.ensure_fallback(kind);
        }

        let groups = {
            let state = self
                .resource_bindings
                .get(&id)
                .ok_or("unknown resource binding")?;
            let pipeline = self
                .pipelines
                .get(&state.pipeline)
                .ok_or("pipeline was destroyed")?;

            let mut groups = Vec::with_capacity(pipeline.groups.len());
            for (group_index, group) in pipeline.groups.iter().enumerate() {
                let mut entries = Vec::with_capacity(group.slots.len());
                for slot in &group.slots {
                    let key = (group_index as u32, slot.binding);
                    let resource = match slot.kind {
                        SlotKind::Uniform { size } => pipeline
                            .statics
                            .get(&key)
                            .and_then(|buffer| self.buffers.get(buffer))
                            .or_else(|| self.fallback_uniforms.get(&size))
                            .ok_or_else(|| format!("no constant buffer for {:?}", key))?
                            .as_entire_binding(),
                        SlotKind::Resource(ShaderResourceKind::Texture {
                            dimension,
                            sample_kind,
                            ..
                        }) => {
                            let view = state
                                .variables
                                .iter()
                                .filter(|v| v.slot == key)
                                .find_map(|v| v.view.and_then(|view| self.texture_views.get(&view)))
                                .map(|v| &v.view)
                                .or_else(|| {
                                    self.fallback_textures
                                        .get(&(dimension, sample_kind))
                                        .map(|(_, view)| view)
                                })
                                .ok_or_else(|| format!("no texture for {:?}", key))?;
                            wgpu::BindingResource::TextureView(view)
                        }
                        SlotKind::Resource(ShaderResourceKind::Sampler { comparison }) => {
                            let sampler = state
                                .variables
                                .iter()
                                .filter(|v| v.sampler_slot == Some(key))
                                .find_map(|v| v.sampler.and_then(|s| self.samplers.get(&s)))
                                .or_else(|| self.fallback_samplers.get(&comparison))
                                .ok_or_else(|| format!("no sampler for {:?}", key))?;
                            wgpu::BindingResource::Sampler(sampler)
                        }
                    };
                    entries.push(wgpu::BindGroupEntry {
                        binding: slot.binding,
                        resource,
                    });
                }

                let bind_group = self.with_validation(|device| {
                    device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: None,
                        layout: &group.layout,
                        entries: &entries,
                    })
                })?;
                groups.push(bind_group);
            }
            groups
        };

        let mut ids = Vec::with_capacity(groups.len());
        for bind_group in groups {
            let bind_group_id = self.allocate_id();
            self.bind_groups.insert(bind_group_id, bind_group);
            ids.push(bind_group_id);
        }
        if let Some(state) = self.resource_bindings.get_mut(&id) {
            let old = std::mem::replace(&mut state.bind_groups, ids);
            self.retired_bind_groups.extend(old);
            state.dirty = false;
        }
        Ok(())
    }

    /// Size of the targets commands are currently recorded against
    fn pass_size(&self) -> (u32, u32) {
        self.pending_render_pass
            .as_ref()
            .map_or(self.backbuffer_size, |pass| pass.size)
    }

    fn clamp_rect(rect: &IntRect, (width, height): (u32, u32)) -> (u32, u32, u32, u32) {
        let left = rect.left.clamp(0, width as i32);
        let top = rect.top.clamp(0, height as i32);
        let right = rect.right.clamp(left, width as i32);
        let bottom = rect.bottom.clamp(top, height as i32);
        (
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
    }

    fn viewport_command(rect: &IntRect, size: (u32, u32)) -> RenderCommand {
        let (x, y, width, height) = Self::clamp_rect(rect, size);
        RenderCommand::SetViewport {
            x: x as f32,
            y: y as f32,
            width: width.max(1) as f32,
            height: height.max(1) as f32,
        }
    }

    /// Scissor for the bound pipeline, the full target when scissoring is off
    fn scissor_command(&self, size: (u32, u32)) -> RenderCommand {
        let enabled = self
            .bound
            .pipeline
            .and_then(|id| self.pipelines.get(&id))
            .is_some_and(|p| p.scissor_enable);
        let full = IntRect::new(0, 0, size.0 as i32, size.1 as i32);
        let rect = match self.bound.scissor {
            Some(rect) if enabled => rect,
            _ => full,
        };
        let (x, y, width, height) = Self::clamp_rect(&rect, size);
        RenderCommand::SetScissorRect {
            x,
            y,
            width,
            height,
        }
    }

    /// Open a pass on the current targets and replay the bound state into it.
    fn begin_pending_pass(&mut self) {
        let Some((colors, depth_stencil)) = self.targets.clone() else {
            return;
        };
        let size = colors
            .iter()
            .flatten()
            .chain(depth_stencil.iter())
            .find_map(|id| self.texture_views.get(id))
            .map_or(self.backbuffer_size, |v| (v.width, v.height));

        let bound = &self.bound;
        let mut commands = Vec::new();
        if let Some(pipeline) = bound.pipeline {
            commands.push(RenderCommand::SetPipeline(pipeline));
        }
        for &(index, bind_group) in &bound.bind_groups {
            commands.push(RenderCommand::SetBindGroup { index, bind_group });
        }
        for (slot, binding) in bound.vertex_buffers.iter().enumerate() {
            if let Some((buffer, offset)) = *binding {
                commands.push(RenderCommand::SetVertexBuffer {
                    slot: slot as u32,
                    buffer,
                    offset,
                });
            }
        }
        if let Some((buffer, format)) = bound.index_buffer {
            commands.push(RenderCommand::SetIndexBuffer { buffer, format });
        }
        if let Some(viewport) = &bound.viewport {
            commands.push(Self::viewport_command(viewport, size));
        }
        commands.push(self.scissor_command(size));
        commands.push(RenderCommand::SetStencilReference(bound.stencil_reference));

        self.pending_render_pass = Some(PendingRenderPass {
            colors,
            depth_stencil,
            size,
            commands,
        });
    }

    fn record(&mut self, command: RenderCommand) {
        if self.pending_render_pass.is_none() {
            self.begin_pending_pass();
        }
        match self.pending_render_pass.as_mut() {
            Some(pass) => pass.commands.push(command),
            None => log::trace!("No render targets bound, command dropped"),
        }
    }

    /// Whether commands are recorded that have not been submitted yet
    fn has_recorded_work(&self) -> bool {
        self.encoder.is_some()
            || self.pending_render_pass.as_ref().is_some_and(|pass| {
                pass.commands.iter().any(|cmd| {
                    matches!(cmd, RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. })
                })
            })
    }

    /// Execute the pending pass into the command encoder.
    fn end_render_pass(&mut self) {
        let Some(pending) = self.pending_render_pass.take() else {
            return;
        };
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Draw Encoder"),
                })
        });

        {
            let load_store = wgpu::Operations {
                load: wgpu::LoadOp::Load,
                store: wgpu::StoreOp::Store,
            };
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
                .colors
                .iter()
                .map(|color| {
                    color
                        .and_then(|id| self.texture_views.get(&id))
                        .map(|v| wgpu::RenderPassColorAttachment {
                            view: &v.view,
                            resolve_target: None,
                            ops: load_store,
                        })
                })
                .collect();

            let depth_stencil_attachment = pending
                .depth_stencil
                .and_then(|id| self.texture_views.get(&id))
                .map(|v| {
                    let writable = v.kind != TextureViewKind::ReadOnlyDepthStencil;
                    wgpu::RenderPassDepthStencilAttachment {
                        view: &v.view,
                        depth_ops: writable.then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: (writable && v.format.has_stencil()).then_some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                    }
                });

            if color_attachments.iter().all(Option::is_none) && depth_stencil_attachment.is_none() {
                log::warn!(
                    "Render pass without attachments, dropping {} commands",
                    pending.commands.len()
                );
            } else {
                let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Draw Pass"),
                    color_attachments: &color_attachments,
                    depth_stencil_attachment,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });

                for cmd in &pending.commands {
                    match cmd {
                        RenderCommand::SetPipeline(id) => {
                            if let Some(pipeline) = self.pipelines.get(id) {
                                render_pass.set_pipeline(&pipeline.pipeline);
                            }
                        }
                        RenderCommand::SetBindGroup { index, bind_group } => {
                            if let Some(bg) = self.bind_groups.get(bind_group) {
                                render_pass.set_bind_group(*index, bg, &[]);
                            }
                        }
                        RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                            if let Some(buf) = self.buffers.get(buffer) {
                                render_pass.set_vertex_buffer(*slot, buf.slice(*offset..));
                            }
                        }
                        RenderCommand::SetIndexBuffer { buffer, format } => {
                            if let Some(buf) = self.buffers.get(buffer) {
                                render_pass
                                    .set_index_buffer(buf.slice(..), Self::convert_index_format(*format));
                            }
                        }
                        RenderCommand::SetViewport { x, y, width, height } => {
                            render_pass.set_viewport(*x, *y, *width, *height, 0.0, 1.0);
                        }
                        RenderCommand::SetScissorRect { x, y, width, height } => {
                            render_pass.set_scissor_rect(*x, *y, *width, *height);
                        }
                        RenderCommand::SetStencilReference(reference) => {
                            render_pass.set_stencil_reference(*reference);
                        }
                        RenderCommand::Draw { vertices, instances } => {
                            render_pass.draw(vertices.clone(), instances.clone());
                        }
                        RenderCommand::DrawIndexed {
                            indices,
                            base_vertex,
                            instances,
                        } => {
                            render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                        }
                    }
                }
            }
        }

        self.encoder = Some(encoder);
        for id in self.retired_bind_groups.drain(..) {
            self.bind_groups.remove(&id);
        }
    }

    /// Get the wgpu device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get the wgpu queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Flush all work and read the backbuffer back as tightly packed rows.
    ///
    /// Only single-sampled backbuffers with an uncompressed color format can
    /// be read.
    pub fn read_backbuffer(&mut self) -> BackendResult<Vec<u8>> {
        if self.sample_count > 1 || self.color_format.is_compressed() {
            return Err(BackendError::ReadbackFailed(format!(
                "cannot read {:?} backbuffer with {} samples",
                self.color_format, self.sample_count
            )));
        }
        self.flush()?;

        let (width, height) = self.backbuffer_size;
        let Some(texture) = self.textures.get(&self.backbuffer_texture) else {
            return Err(BackendError::ReadbackFailed("backbuffer missing".into()));
        };
        let row_bytes = width * self.color_format.bytes_per_pixel();
        let padded_row_bytes = row_bytes.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Backbuffer Readback"),
            size: padded_row_bytes as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::DeviceLost)?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row_bytes as usize) {
                pixels.extend_from_slice(&row[..row_bytes as usize]);
            }
        }
        staging.unmap();
        Ok(pixels)
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn backbuffer_view(&self) -> TextureViewHandle {
        TextureViewHandle(self.backbuffer_view)
    }

    fn default_depth_stencil_view(&self) -> TextureViewHandle {
        TextureViewHandle(self.depth_view)
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        self.backbuffer_size
    }

    fn backbuffer_format(&self) -> TextureFormat {
        self.color_format
    }

    fn default_depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    fn backbuffer_sample_count(&self) -> u32 {
        self.sample_count
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let size = desc.size.max(wgpu::COPY_BUFFER_ALIGNMENT).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self
            .with_validation(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: desc.label.as_deref(),
                    size,
                    usage: Self::convert_buffer_usage(desc.usage),
                    mapped_at_creation: false,
                })
            })
            .map_err(BackendError::BufferCreationFailed)?;

        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if !self.buffers.contains_key(&buffer.0) {
            return;
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            log::warn!("Unaligned buffer write at offset {} ignored", offset);
            return;
        }
        let remainder = data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize;
        let data: Cow<[u8]> = if remainder == 0 {
            Cow::Borrowed(data)
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len() + wgpu::COPY_BUFFER_ALIGNMENT as usize - remainder, 0);
            Cow::Owned(padded)
        };

        if !self.has_recorded_work() {
            if let Some(buf) = self.buffers.get(&buffer.0) {
                self.queue.write_buffer(buf, offset, &data);
            }
            return;
        }

        // Queue writes land before the whole submission, so commands already
        // recorded would read the new contents. Copy inside the encoder instead.
        self.end_render_pass();
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Buffer Update Staging"),
            contents: &data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Draw Encoder"),
            })
        });
        if let Some(buf) = self.buffers.get(&buffer.0) {
            encoder.copy_buffer_to_buffer(&staging, 0, buf, offset, data.len() as u64);
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.format.is_compressed() && !self.features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC) {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} needs block compression support",
                desc.format
            )));
        }

        let mut usage = Self::convert_texture_usage(desc.usage);
        if desc.sample_count > 1 {
            usage.remove(wgpu::TextureUsages::TEXTURE_BINDING);
        }

        let texture = self
            .with_validation(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: desc.label.as_deref(),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: desc.dimension.array_layers(),
                    },
                    mip_level_count: desc.mip_levels.max(1),
                    sample_count: desc.sample_count.max(1),
                    dimension: wgpu::TextureDimension::D2,
                    format: Self::convert_texture_format(desc.format),
                    usage,
                    view_formats: &[],
                })
            })
            .map_err(BackendError::TextureCreationFailed)?;

        let id = self.allocate_id();
        self.textures.insert(
            id,
            WgpuTexture {
                texture,
                dimension: desc.dimension,
                format: desc.format,
                width: desc.width,
                height: desc.height,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::TextureCreationFailed("Texture not found".into()))?;

        let (aspect, mip_level_count) = match desc.kind {
            TextureViewKind::ShaderResource if tex.format.is_depth() => {
                (wgpu::TextureAspect::DepthOnly, desc.mip_level_count)
            }
            TextureViewKind::ShaderResource => (wgpu::TextureAspect::All, desc.mip_level_count),
            _ => (wgpu::TextureAspect::All, Some(1)),
        };
        // Target views address a single layer
        let (dimension, array_layer_count) = match (desc.kind, tex.dimension) {
            (TextureViewKind::ShaderResource, TextureDimension::Cube) => {
                (wgpu::TextureViewDimension::Cube, None)
            }
            _ => (wgpu::TextureViewDimension::D2, Some(1)),
        };
        let view = tex.texture.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            format: None,
            dimension: Some(dimension),
            aspect,
            base_mip_level: desc.base_mip_level,
            mip_level_count,
            base_array_layer: 0,
            array_layer_count,
        });
        let view = WgpuTextureView {
            view,
            kind: desc.kind,
            format: tex.format,
            width: (tex.width >> desc.base_mip_level).max(1),
            height: (tex.height >> desc.base_mip_level).max(1),
        };

        let id = self.allocate_id();
        self.texture_views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        region: &TextureRegion,
        data: &[u8],
        bytes_per_row: u32,
    ) {
        let Some(tex) = self.textures.get(&texture.0) else {
            return;
        };

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &tex.texture,
                mip_level: region.mip_level,
                origin: wgpu::Origin3d {
                    x: region.x,
                    y: region.y,
                    z: region.layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            tex.texture.destroy();
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let (min_filter, mag_filter, mipmap_filter) = match desc.filter {
            FilterMode::Nearest => (
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
                wgpu::FilterMode::Nearest,
            ),
            FilterMode::Bilinear => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Nearest,
            ),
            FilterMode::Trilinear => (
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
                wgpu::FilterMode::Linear,
            ),
        };

        let sampler = self
            .with_validation(|device| {
                device.create_sampler(&wgpu::SamplerDescriptor {
                    label: desc.label.as_deref(),
                    address_mode_u: Self::convert_address_mode(desc.address_mode_u),
                    address_mode_v: Self::convert_address_mode(desc.address_mode_v),
                    address_mode_w: Self::convert_address_mode(desc.address_mode_w),
                    mag_filter,
                    min_filter,
                    mipmap_filter,
                    compare: desc.compare.map(Self::convert_compare_function),
                    ..Default::default()
                })
            })
            .map_err(BackendError::SamplerCreationFailed)?;

        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor) -> BackendResult<ShaderHandle> {
        let source = match &desc.source {
            ShaderSource::Wgsl(code) => wgpu::ShaderSource::Wgsl(code.as_str().into()),
            ShaderSource::Bytecode(_) => {
                return Err(BackendError::ShaderCreationFailed(
                    "wgpu backend only accepts WGSL source".into(),
                ))
            }
        };

        let module = self
            .with_validation(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: desc.label.as_deref(),
                    source,
                })
            })
            .map_err(BackendError::ShaderCreationFailed)?;

        let id = self.allocate_id();
        self.shaders.insert(
            id,
            WgpuShader {
                module,
                stage: desc.stage,
                entry_point: desc.entry_point.clone(),
                reflection: desc.reflection.clone(),
            },
        );
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
    }

    fn create_pipeline_state(
        &mut self,
        desc: &PipelineStateDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let polygon_mode = self.polygon_mode(desc.rasterizer.fill_mode);
        if desc.rasterizer.line_anti_alias {
            log::trace!("Line anti-aliasing is not available, ignored");
        }

        let (Some(vs), Some(ps)) = (
            self.shaders.get(&desc.vertex_shader.0),
            self.shaders.get(&desc.pixel_shader.0),
        ) else {
            return Err(BackendError::PipelineCreationFailed(
                "Shader not found".into(),
            ));
        };

        let slots = Self::collect_bind_group_slots([vs, ps]);
        let group_count = slots.keys().next_back().map_or(0, |group| group + 1);
        let mut groups = Vec::with_capacity(group_count as usize);
        for group in 0..group_count {
            let bindings = slots.get(&group);
            let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
                .into_iter()
                .flatten()
                .map(|(binding, (kind, visibility))| wgpu::BindGroupLayoutEntry {
                    binding: *binding,
                    visibility: *visibility,
                    ty: Self::convert_binding_type(*kind),
                    count: None,
                })
                .collect();
            let layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: None,
                    entries: &entries,
                });
            groups.push(BindGroupSlots {
                layout,
                slots: bindings
                    .into_iter()
                    .flatten()
                    .map(|(binding, (kind, _))| LayoutSlot {
                        binding: *binding,
                        kind: *kind,
                    })
                    .collect(),
            });
        }
        let layout_refs: Vec<&wgpu::BindGroupLayout> = groups.iter().map(|g| &g.layout).collect();
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layout_refs,
                push_constant_ranges: &[],
            });

        // Trailing unbound slots are not part of the layout
        let layout = &desc.input_layout;
        let used_slots = layout
            .strides
            .iter()
            .rposition(|stride| *stride != 0)
            .map_or(0, |last| last + 1);
        let attributes = Self::convert_vertex_attributes(layout);
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = attributes[..used_slots]
            .iter()
            .enumerate()
            .map(|(slot, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.strides[slot] as u64,
                step_mode: if layout.is_instanced_slot(slot as u32) {
                    wgpu::VertexStepMode::Instance
                } else {
                    wgpu::VertexStepMode::Vertex
                },
                attributes,
            })
            .collect();

        let topology = Self::convert_primitive_type(desc.primitive_type);
        let depth_stencil = desc.depth_format.map(|format| {
            let ds = &desc.depth_stencil;
            let stencil = if ds.stencil_enable && format.has_stencil() {
                let face = wgpu::StencilFaceState {
                    compare: Self::convert_compare_function(ds.stencil_compare),
                    fail_op: Self::convert_stencil_op(ds.stencil_fail),
                    depth_fail_op: Self::convert_stencil_op(ds.stencil_z_fail),
                    pass_op: Self::convert_stencil_op(ds.stencil_pass),
                };
                wgpu::StencilState {
                    front: face,
                    back: face,
                    read_mask: ds.stencil_compare_mask,
                    write_mask: ds.stencil_write_mask,
                }
            } else {
                wgpu::StencilState::default()
            };
            // Depth bias only applies to filled primitives
            let filled = matches!(
                topology,
                wgpu::PrimitiveTopology::TriangleList | wgpu::PrimitiveTopology::TriangleStrip
            );
            let bias = if filled {
                wgpu::DepthBiasState {
                    constant: desc.rasterizer.depth_bias,
                    slope_scale: desc.rasterizer.slope_scaled_depth_bias,
                    clamp: 0.0,
                }
            } else {
                wgpu::DepthBiasState::default()
            };
            wgpu::DepthStencilState {
                format: Self::convert_texture_format(format),
                depth_write_enabled: ds.depth_write,
                depth_compare: Self::convert_compare_function(ds.depth_compare),
                stencil,
                bias,
            }
        });

        let write_mask = if desc.blend.color_write {
            wgpu::ColorWrites::ALL
        } else {
            wgpu::ColorWrites::empty()
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(*format),
                    blend: Self::convert_blend_mode(desc.blend.mode),
                    write_mask,
                })
            })
            .collect();

        let sample_count = desc.sample_count.max(1);
        let pipeline = self
            .with_validation(|device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: desc.label.as_deref(),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &vs.module,
                        entry_point: &vs.entry_point,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &vertex_buffers,
                    },
                    primitive: wgpu::PrimitiveState {
                        topology,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Cw,
                        cull_mode: Self::convert_cull_mode(desc.rasterizer.cull_mode),
                        unclipped_depth: false,
                        polygon_mode,
                        conservative: false,
                    },
                    depth_stencil,
                    multisample: wgpu::MultisampleState {
                        count: sample_count,
                        mask: !0,
                        alpha_to_coverage_enabled: desc.blend.alpha_to_coverage && sample_count > 1,
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &ps.module,
                        entry_point: &ps.entry_point,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: &targets,
                    }),
                    multiview: None,
                })
            })
            .map_err(BackendError::PipelineCreationFailed)?;

        log::trace!(
            "Pipeline {:?}: {} bind groups, {} mutable texture variables",
            desc.label,
            groups.len(),
            desc.dynamic_variables.len()
        );

        let id = self.allocate_id();
        self.pipelines.insert(
            id,
            WgpuPipeline {
                pipeline,
                groups,
                vertex_shader: desc.vertex_shader,
                pixel_shader: desc.pixel_shader,
                statics: HashMap::new(),
                scissor_enable: desc.rasterizer.scissor_enable,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn set_static_variable(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        name: &str,
        buffer: BufferHandle,
    ) -> BackendResult<bool> {
        let Some(state) = self.pipelines.get_mut(&pipeline.0) else {
            return Err(BackendError::PipelineCreationFailed(
                "Pipeline not found".into(),
            ));
        };
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::ResourceBindingCreationFailed(format!(
                "Buffer for {} not found",
                name
            )));
        }
        let shader = match stage {
            ShaderStage::Vertex => state.vertex_shader,
            ShaderStage::Pixel => state.pixel_shader,
        };
        let Some(cb) = self
            .shaders
            .get(&shader.0)
            .and_then(|s| s.reflection.constant_buffers.iter().find(|cb| cb.name == name))
        else {
            return Ok(false);
        };
        state.statics.insert((cb.group, cb.binding), buffer.0);
        Ok(true)
    }

    fn create_resource_binding(
        &mut self,
        pipeline: PipelineHandle,
    ) -> BackendResult<ResourceBindingHandle> {
        let Some(state) = self.pipelines.get(&pipeline.0) else {
            return Err(BackendError::ResourceBindingCreationFailed(
                "Pipeline not found".into(),
            ));
        };

        let mut variables = Vec::new();
        for (stage, shader) in [
            (ShaderStage::Vertex, state.vertex_shader),
            (ShaderStage::Pixel, state.pixel_shader),
        ] {
            let Some(shader) = self.shaders.get(&shader.0) else {
                continue;
            };
            let reflection = &shader.reflection;
            for texture in reflection.textures() {
                // tDiffMap samples through sDiffMap
                let sampler_slot = texture.name.strip_prefix('t').and_then(|rest| {
                    let sampler_name = format!("s{}", rest);
                    reflection
                        .resources
                        .iter()
                        .find(|r| !r.is_texture() && r.name == sampler_name)
                        .map(|r| (r.group, r.binding))
                });
                variables.push(TextureVariable {
                    stage,
                    name: texture.name.clone(),
                    slot: (texture.group, texture.binding),
                    sampler_slot,
                    view: None,
                    sampler: None,
                });
            }
        }

        let id = self.allocate_id();
        self.resource_bindings.insert(
            id,
            WgpuResourceBinding {
                pipeline: pipeline.0,
                variables,
                bind_groups: Vec::new(),
                dirty: true,
            },
        );
        Ok(ResourceBindingHandle(id))
    }

    fn binding_variables(
        &self,
        binding: ResourceBindingHandle,
        stage: ShaderStage,
    ) -> Vec<BindingVariable> {
        let Some(state) = self.resource_bindings.get(&binding.0) else {
            return Vec::new();
        };
        state
            .variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.stage == stage)
            .map(|(index, v)| BindingVariable {
                variable: VariableHandle(index as u32),
                name: v.name.clone(),
            })
            .collect()
    }

    fn set_binding_variable(
        &mut self,
        binding: ResourceBindingHandle,
        variable: VariableHandle,
        view: TextureViewHandle,
        sampler: Option<SamplerHandle>,
    ) {
        let Some(state) = self.resource_bindings.get_mut(&binding.0) else {
            return;
        };
        let Some(var) = state.variables.get_mut(variable.0 as usize) else {
            return;
        };
        let sampler = sampler.map(|s| s.0);
        if var.view != Some(view.0) || var.sampler != sampler {
            var.view = Some(view.0);
            var.sampler = sampler;
            state.dirty = true;
        }
    }

    fn destroy_pipeline_state(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
        if self.bound.pipeline == Some(pipeline.0) {
            self.bound.pipeline = None;
        }
    }

    fn destroy_resource_binding(&mut self, binding: ResourceBindingHandle) {
        if let Some(state) = self.resource_bindings.remove(&binding.0) {
            self.bound
                .bind_groups
                .retain(|(_, id)| !state.bind_groups.contains(id));
            self.retired_bind_groups.extend(state.bind_groups);
        }
    }

    fn set_render_targets(
        &mut self,
        colors: &[Option<TextureViewHandle>],
        depth_stencil: Option<TextureViewHandle>,
    ) {
        self.end_render_pass();
        self.targets = Some((
            colors.iter().map(|c| c.map(|v| v.0)).collect(),
            depth_stencil.map(|v| v.0),
        ));
        self.begin_pending_pass();
    }

    fn set_viewport(&mut self, rect: &IntRect) {
        self.bound.viewport = Some(*rect);
        if self.pending_render_pass.is_none() {
            // The new pass replays the viewport
            self.begin_pending_pass();
            return;
        }
        let command = Self::viewport_command(rect, self.pass_size());
        self.record(command);
    }

    fn set_scissor_rect(&mut self, rect: &IntRect) {
        self.bound.scissor = Some(*rect);
        if self.pending_render_pass.is_none() {
            self.begin_pending_pass();
            return;
        }
        let command = self.scissor_command(self.pass_size());
        self.record(command);
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.bound.stencil_reference = reference;
        self.record(RenderCommand::SetStencilReference(reference));
    }

    fn set_pipeline_state(&mut self, pipeline: PipelineHandle) {
        self.bound.pipeline = Some(pipeline.0);
        self.record(RenderCommand::SetPipeline(pipeline.0));
        // Scissoring is part of the pipeline state
        let command = self.scissor_command(self.pass_size());
        self.record(command);
    }

    fn commit_resources(&mut self, binding: ResourceBindingHandle) {
        let Some(state) = self.resource_bindings.get(&binding.0) else {
            return;
        };
        if state.dirty {
            if let Err(e) = self.rebuild_bind_groups(binding.0) {
                log::error!("Failed to commit resources: {}", e);
                return;
            }
        }

        let Some(state) = self.resource_bindings.get(&binding.0) else {
            return;
        };
        let bind_groups: Vec<(u32, u64)> = state
            .bind_groups
            .iter()
            .enumerate()
            .map(|(index, id)| (index as u32, *id))
            .collect();
        for &(index, bind_group) in &bind_groups {
            self.record(RenderCommand::SetBindGroup { index, bind_group });
        }
        self.bound.bind_groups = bind_groups;
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Option<VertexBufferBinding>]) {
        for (i, binding) in buffers.iter().enumerate() {
            let slot = first_slot as usize + i;
            if slot >= MAX_VERTEX_BUFFER_SLOTS {
                log::warn!("Vertex buffer slot {} out of range", slot);
                continue;
            }
            // Unbound slots still need a buffer when the layout has a gap
            let (buffer, offset) = binding
                .map(|b| (b.buffer.0, b.offset))
                .unwrap_or((self.fallback_vertex_buffer, 0));
            self.bound.vertex_buffers[slot] = Some((buffer, offset));
            self.record(RenderCommand::SetVertexBuffer {
                slot: slot as u32,
                buffer,
                offset,
            });
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, format: IndexFormat) {
        self.bound.index_buffer = Some((buffer.0, format));
        self.record(RenderCommand::SetIndexBuffer {
            buffer: buffer.0,
            format,
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RenderCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record(RenderCommand::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.end_render_pass();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(Some(encoder.finish()));
        }
        for id in self.retired_bind_groups.drain(..) {
            self.bind_groups.remove(&id);
        }
        Ok(())
    }
}
