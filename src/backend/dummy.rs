//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't perform actual GPU operations. It hands out handles,
//! keeps enough bookkeeping to answer binding-variable queries, and records
//! every state-changing call so tests can assert on what the draw path did.

use std::collections::HashMap;
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::shader::ShaderReflection;

/// A recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreatePipelineState(PipelineHandle),
    CreateResourceBinding(ResourceBindingHandle),
    SetStaticVariable {
        pipeline: PipelineHandle,
        stage: ShaderStage,
        name: String,
    },
    WriteBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: usize,
    },
    WriteTexture {
        texture: TextureHandle,
        region: TextureRegion,
        bytes_per_row: u32,
    },
    SetRenderTargets {
        colors: Vec<Option<TextureViewHandle>>,
        depth_stencil: Option<TextureViewHandle>,
    },
    SetViewport(IntRect),
    SetScissorRect(IntRect),
    SetStencilReference(u32),
    SetPipelineState(PipelineHandle),
    SetBindingVariable {
        binding: ResourceBindingHandle,
        variable: VariableHandle,
        view: TextureViewHandle,
    },
    CommitResources(ResourceBindingHandle),
    SetVertexBuffers {
        first_slot: u32,
        buffers: Vec<Option<VertexBufferBinding>>,
    },
    SetIndexBuffer(BufferHandle),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    Flush,
}

#[derive(Debug)]
struct DummyShader {
    stage: ShaderStage,
    reflection: ShaderReflection,
}

#[derive(Debug)]
struct DummyPipeline {
    desc: PipelineStateDescriptor,
    statics: HashMap<(ShaderStage, String), BufferHandle>,
}

#[derive(Debug)]
struct DummyBinding {
    variables: Vec<(ShaderStage, BindingVariable)>,
    values: HashMap<VariableHandle, TextureViewHandle>,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    width: u32,
    height: u32,
    backbuffer_format: TextureFormat,
    depth_format: TextureFormat,
    next_id: u64,
    shaders: HashMap<u64, DummyShader>,
    pipelines: HashMap<u64, DummyPipeline>,
    bindings: HashMap<u64, DummyBinding>,
    buffers: HashMap<u64, u64>,
    calls: Vec<BackendCall>,
    pipelines_created: usize,
    fail_pipeline_creation: bool,
}

const BACKBUFFER_VIEW: TextureViewHandle = TextureViewHandle(u64::MAX);
const DEFAULT_DEPTH_VIEW: TextureViewHandle = TextureViewHandle(u64::MAX - 1);

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a new dummy backend with a 1280x720 backbuffer.
    pub fn new() -> Self {
        Self::with_backbuffer(1280, 720, TextureFormat::Bgra8Unorm, TextureFormat::Depth24PlusStencil8)
    }

    pub fn with_backbuffer(
        width: u32,
        height: u32,
        backbuffer_format: TextureFormat,
        depth_format: TextureFormat,
    ) -> Self {
        Self {
            width,
            height,
            backbuffer_format,
            depth_format,
            next_id: 1,
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            bindings: HashMap::new(),
            buffers: HashMap::new(),
            calls: Vec::new(),
            pipelines_created: 0,
            fail_pipeline_creation: false,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Make subsequent pipeline creations fail.
    pub fn set_fail_pipeline_creation(&mut self, fail: bool) {
        self.fail_pipeline_creation = fail;
    }

    /// Recorded calls since creation or the last [`clear_calls`](Self::clear_calls).
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of pipeline state objects created so far
    pub fn pipelines_created(&self) -> usize {
        self.pipelines_created
    }

    /// Number of pipeline state objects currently alive
    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Descriptor a pipeline was created from
    pub fn pipeline_descriptor(&self, pipeline: PipelineHandle) -> Option<&PipelineStateDescriptor> {
        self.pipelines.get(&pipeline.0).map(|p| &p.desc)
    }

    /// Constant buffer bound to a static variable of a pipeline
    pub fn static_variable(
        &self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        name: &str,
    ) -> Option<BufferHandle> {
        self.pipelines
            .get(&pipeline.0)?
            .statics
            .get(&(stage, name.to_string()))
            .copied()
    }

    /// View currently assigned to a binding variable
    pub fn binding_value(
        &self,
        binding: ResourceBindingHandle,
        variable: VariableHandle,
    ) -> Option<TextureViewHandle> {
        self.bindings.get(&binding.0)?.values.get(&variable).copied()
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn backbuffer_view(&self) -> TextureViewHandle {
        BACKBUFFER_VIEW
    }

    fn default_depth_stencil_view(&self) -> TextureViewHandle {
        DEFAULT_DEPTH_VIEW
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn backbuffer_format(&self) -> TextureFormat {
        self.backbuffer_format
    }

    fn default_depth_format(&self) -> TextureFormat {
        self.depth_format
    }

    fn backbuffer_sample_count(&self) -> u32 {
        1
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.allocate_id();
        self.buffers.insert(id, desc.size);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        log::trace!("DummyBackend: writing {} bytes to buffer {:?}", data.len(), buffer);
        self.calls.push(BackendCall::WriteBuffer {
            buffer,
            offset,
            size: data.len(),
        });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        Ok(TextureHandle(self.allocate_id()))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        log::trace!("DummyBackend: creating {:?} view of {:?}", desc.kind, texture);
        Ok(TextureViewHandle(self.allocate_id()))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        region: &TextureRegion,
        _data: &[u8],
        bytes_per_row: u32,
    ) {
        self.calls.push(BackendCall::WriteTexture {
            texture,
            region: *region,
            bytes_per_row,
        });
    }

    fn destroy_texture(&mut self, _texture: TextureHandle) {}

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.allocate_id()))
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor) -> BackendResult<ShaderHandle> {
        log::trace!("DummyBackend: creating {:?} shader {:?}", desc.stage, desc.label);
        let id = self.allocate_id();
        self.shaders.insert(
            id,
            DummyShader {
                stage: desc.stage,
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
        if self.fail_pipeline_creation {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?} rejected by dummy backend",
                desc.label
            )));
        }
        for shader in [desc.vertex_shader, desc.pixel_shader] {
            if !self.shaders.contains_key(&shader.0) {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "unknown shader {:?}",
                    shader
                )));
            }
        }

        log::trace!("DummyBackend: creating pipeline {:?}", desc.label);
        let handle = PipelineHandle(self.allocate_id());
        self.pipelines.insert(
            handle.0,
            DummyPipeline {
                desc: desc.clone(),
                statics: HashMap::new(),
            },
        );
        self.pipelines_created += 1;
        self.calls.push(BackendCall::CreatePipelineState(handle));
        Ok(handle)
    }

    fn set_static_variable(
        &mut self,
        pipeline: PipelineHandle,
        stage: ShaderStage,
        name: &str,
        buffer: BufferHandle,
    ) -> BackendResult<bool> {
        let Some(entry) = self.pipelines.get_mut(&pipeline.0) else {
            return Err(BackendError::PipelineCreationFailed("unknown pipeline".into()));
        };
        let shader = match stage {
            ShaderStage::Vertex => entry.desc.vertex_shader,
            ShaderStage::Pixel => entry.desc.pixel_shader,
        };
        let found = self
            .shaders
            .get(&shader.0)
            .is_some_and(|s| s.reflection.constant_buffers.iter().any(|cb| cb.name == name));
        if found {
            entry.statics.insert((stage, name.to_string()), buffer);
            self.calls.push(BackendCall::SetStaticVariable {
                pipeline,
                stage,
                name: name.to_string(),
            });
        }
        Ok(found)
    }

    fn create_resource_binding(
        &mut self,
        pipeline: PipelineHandle,
    ) -> BackendResult<ResourceBindingHandle> {
        let Some(entry) = self.pipelines.get(&pipeline.0) else {
            return Err(BackendError::ResourceBindingCreationFailed(
                "unknown pipeline".into(),
            ));
        };

        let mut variables = Vec::new();
        for shader in [entry.desc.vertex_shader, entry.desc.pixel_shader] {
            let Some(shader) = self.shaders.get(&shader.0) else {
                continue;
            };
            for texture in shader.reflection.textures() {
                let variable = VariableHandle(variables.len() as u32);
                variables.push((
                    shader.stage,
                    BindingVariable {
                        variable,
                        name: texture.name.clone(),
                    },
                ));
            }
        }

        let handle = ResourceBindingHandle(self.allocate_id());
        self.bindings.insert(
            handle.0,
            DummyBinding {
                variables,
                values: HashMap::new(),
            },
        );
        self.calls.push(BackendCall::CreateResourceBinding(handle));
        Ok(handle)
    }

    fn binding_variables(
        &self,
        binding: ResourceBindingHandle,
        stage: ShaderStage,
    ) -> Vec<BindingVariable> {
        self.bindings
            .get(&binding.0)
            .map(|b| {
                b.variables
                    .iter()
                    .filter(|(s, _)| *s == stage)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_binding_variable(
        &mut self,
        binding: ResourceBindingHandle,
        variable: VariableHandle,
        view: TextureViewHandle,
        _sampler: Option<SamplerHandle>,
    ) {
        if let Some(entry) = self.bindings.get_mut(&binding.0) {
            entry.values.insert(variable, view);
        }
        self.calls.push(BackendCall::SetBindingVariable {
            binding,
            variable,
            view,
        });
    }

    fn destroy_pipeline_state(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn destroy_resource_binding(&mut self, binding: ResourceBindingHandle) {
        self.bindings.remove(&binding.0);
    }

    fn set_render_targets(
        &mut self,
        colors: &[Option<TextureViewHandle>],
        depth_stencil: Option<TextureViewHandle>,
    ) {
        self.calls.push(BackendCall::SetRenderTargets {
            colors: colors.to_vec(),
            depth_stencil,
        });
    }

    fn set_viewport(&mut self, rect: &IntRect) {
        self.calls.push(BackendCall::SetViewport(*rect));
    }

    fn set_scissor_rect(&mut self, rect: &IntRect) {
        self.calls.push(BackendCall::SetScissorRect(*rect));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.calls.push(BackendCall::SetStencilReference(reference));
    }

    fn set_pipeline_state(&mut self, pipeline: PipelineHandle) {
        self.calls.push(BackendCall::SetPipelineState(pipeline));
    }

    fn commit_resources(&mut self, binding: ResourceBindingHandle) {
        self.calls.push(BackendCall::CommitResources(binding));
    }

    fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Option<VertexBufferBinding>]) {
        self.calls.push(BackendCall::SetVertexBuffers {
            first_slot,
            buffers: buffers.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _format: IndexFormat) {
        self.calls.push(BackendCall::SetIndexBuffer(buffer));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        log::trace!("DummyBackend: draw {:?} x {:?}", vertices, instances);
        self.calls.push(BackendCall::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        log::trace!("DummyBackend: draw indexed {:?} x {:?}", indices, instances);
        self.calls.push(BackendCall::DrawIndexed {
            indices,
            base_vertex,
            instances,
        });
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.calls.push(BackendCall::Flush);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::VertexLayoutDescription;

    fn shader(backend: &mut DummyBackend, stage: ShaderStage, reflection: ShaderReflection) -> ShaderHandle {
        backend
            .create_shader(&ShaderDescriptor {
                label: None,
                stage,
                source: ShaderSource::Wgsl(String::new()),
                entry_point: "main".into(),
                reflection,
            })
            .unwrap()
    }

    fn pipeline_desc(vs: ShaderHandle, ps: ShaderHandle) -> PipelineStateDescriptor {
        PipelineStateDescriptor {
            label: None,
            vertex_shader: vs,
            pixel_shader: ps,
            input_layout: VertexLayoutDescription::default(),
            primitive_type: PrimitiveType::TriangleList,
            blend: BlendStateDescriptor {
                mode: BlendMode::Replace,
                alpha_to_coverage: false,
                color_write: true,
            },
            depth_stencil: DepthStencilStateDescriptor {
                depth_write: true,
                depth_compare: CompareMode::LessEqual,
                stencil_enable: false,
                stencil_compare: CompareMode::Always,
                stencil_pass: StencilOp::Keep,
                stencil_fail: StencilOp::Keep,
                stencil_z_fail: StencilOp::Keep,
                stencil_compare_mask: 0xff,
                stencil_write_mask: 0xff,
            },
            rasterizer: RasterizerStateDescriptor {
                fill_mode: FillMode::Solid,
                cull_mode: CullMode::Ccw,
                scissor_enable: false,
                line_anti_alias: false,
                depth_bias: 0,
                slope_scaled_depth_bias: 0.0,
            },
            color_formats: vec![TextureFormat::Bgra8Unorm],
            depth_format: Some(TextureFormat::Depth24PlusStencil8),
            sample_count: 1,
            dynamic_variables: Vec::new(),
        }
    }

    #[test]
    fn test_binding_variables_per_stage() {
        let mut backend = DummyBackend::new();
        let vs = shader(&mut backend, ShaderStage::Vertex, ShaderReflection::new().with_texture("tVolumeMap", 0, 0));
        let ps = shader(
            &mut backend,
            ShaderStage::Pixel,
            ShaderReflection::new()
                .with_texture("tDiffMap", 1, 0)
                .with_sampler("sDiffMap", 1, 1)
                .with_texture("tNormalMap", 1, 2),
        );

        let pipeline = backend.create_pipeline_state(&pipeline_desc(vs, ps)).unwrap();
        let binding = backend.create_resource_binding(pipeline).unwrap();

        let vs_vars = backend.binding_variables(binding, ShaderStage::Vertex);
        let ps_vars = backend.binding_variables(binding, ShaderStage::Pixel);
        assert_eq!(vs_vars.len(), 1);
        let names: Vec<&str> = ps_vars.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["tDiffMap", "tNormalMap"]);
        assert_ne!(vs_vars[0].variable, ps_vars[0].variable);
    }

    #[test]
    fn test_failure_injection() {
        let mut backend = DummyBackend::new();
        let vs = shader(&mut backend, ShaderStage::Vertex, ShaderReflection::new());
        let ps = shader(&mut backend, ShaderStage::Pixel, ShaderReflection::new());

        backend.set_fail_pipeline_creation(true);
        assert!(backend.create_pipeline_state(&pipeline_desc(vs, ps)).is_err());
        assert_eq!(backend.pipelines_created(), 0);

        backend.set_fail_pipeline_creation(false);
        assert!(backend.create_pipeline_state(&pipeline_desc(vs, ps)).is_ok());
        assert_eq!(backend.pipelines_created(), 1);
    }

    #[test]
    fn test_static_variable_lookup() {
        let mut backend = DummyBackend::new();
        let vs = shader(&mut backend, ShaderStage::Vertex, ShaderReflection::new());
        let ps = shader(
            &mut backend,
            ShaderStage::Pixel,
            ShaderReflection::new().with_constant_buffer(
                crate::shader::ShaderParameterGroup::Material,
                "MaterialPS",
                16,
                0,
                0,
            ),
        );
        let pipeline = backend.create_pipeline_state(&pipeline_desc(vs, ps)).unwrap();
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::UNIFORM,
            })
            .unwrap();

        assert!(backend
            .set_static_variable(pipeline, ShaderStage::Pixel, "MaterialPS", buffer)
            .unwrap());
        assert!(!backend
            .set_static_variable(pipeline, ShaderStage::Vertex, "MaterialPS", buffer)
            .unwrap());
        assert_eq!(
            backend.static_variable(pipeline, ShaderStage::Pixel, "MaterialPS"),
            Some(buffer)
        );
    }
}
