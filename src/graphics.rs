//! The graphics context: state setters and draw submission.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::backend::{
    BlendMode, BufferHandle, CompareMode, CullMode, FillMode, GraphicsBackend, IndexFormat,
    IntRect, PrimitiveType, ShaderStage,
};
use crate::draw::DrawPreparer;
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::PipelineCache;
use crate::shader::{
    ConstantBufferPool, ShaderId, ShaderParameterValue, ShaderProgram, ShaderVariation,
};
use crate::state::{DirtyFlags, RenderState, StateFieldTracker, StencilTest};
use crate::texture::{Texture, TextureUsageKind};
use crate::vertex::{IndexBuffer, VertexBuffer, VertexStream};
use crate::MAX_VERTEX_STREAMS;

/// Counters accumulated by the draw entry points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub primitives: u32,
    pub batches: u32,
}

/// Owns the backend together with the render state, pipeline cache and
/// shader programs, and turns state changes plus draw calls into backend
/// commands.
pub struct Graphics<B: GraphicsBackend> {
    backend: B,
    tracker: StateFieldTracker,
    preparer: DrawPreparer,
    cache: PipelineCache,
    constant_buffers: ConstantBufferPool,
    programs: HashMap<(ShaderId, ShaderId), ShaderProgram>,
    current_program: Option<(ShaderId, ShaderId)>,
    index_buffer: Option<(BufferHandle, IndexFormat)>,
    stats: DrawStats,
}

impl<B: GraphicsBackend> Graphics<B> {
    pub fn new(backend: B) -> Self {
        let (width, height) = backend.backbuffer_size();
        log::info!(
            "Graphics initialised on {} ({}x{} {:?})",
            backend.name(),
            width,
            height,
            backend.backbuffer_format()
        );

        Self {
            backend,
            tracker: StateFieldTracker::new(width, height),
            preparer: DrawPreparer::new(),
            cache: PipelineCache::new(),
            constant_buffers: ConstantBufferPool::new(),
            programs: HashMap::new(),
            current_program: None,
            index_buffer: None,
            stats: DrawStats::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> &RenderState {
        self.tracker.state()
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.tracker.dirty()
    }

    pub fn tracker(&self) -> &StateFieldTracker {
        &self.tracker
    }

    pub fn preparer(&self) -> &DrawPreparer {
        &self.preparer
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.cache
    }

    pub fn constant_buffers(&self) -> &ConstantBufferPool {
        &self.constant_buffers
    }

    pub fn stats(&self) -> DrawStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DrawStats::default();
    }

    // Fixed function state

    pub fn set_blend_mode(&mut self, mode: BlendMode, alpha_to_coverage: bool) {
        self.tracker.set_blend_mode(mode, alpha_to_coverage);
    }

    pub fn set_color_write(&mut self, enable: bool) {
        self.tracker.set_color_write(enable);
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.tracker.set_cull_mode(mode);
    }

    pub fn set_depth_bias(&mut self, constant_bias: f32, slope_scaled_bias: f32) {
        self.tracker.set_depth_bias(constant_bias, slope_scaled_bias);
    }

    pub fn set_depth_test(&mut self, mode: CompareMode) {
        self.tracker.set_depth_test(mode);
    }

    pub fn set_depth_write(&mut self, enable: bool) {
        self.tracker.set_depth_write(enable);
    }

    pub fn set_fill_mode(&mut self, mode: FillMode) {
        self.tracker.set_fill_mode(mode);
    }

    pub fn set_line_anti_alias(&mut self, enable: bool) {
        self.tracker.set_line_anti_alias(enable);
    }

    pub fn set_scissor_test(&mut self, enable: bool, rect: IntRect) {
        self.tracker.set_scissor_test(enable, rect);
    }

    pub fn set_stencil_test(&mut self, enable: bool, test: StencilTest) {
        self.tracker.set_stencil_test(enable, test);
    }

    /// Set the viewport and push it to the device right away.
    pub fn set_viewport(&mut self, rect: IntRect) {
        self.tracker.set_viewport(rect);
        self.backend.set_viewport(&self.tracker.state().viewport);
    }

    // Shaders

    /// Set the shader pair, linking a [`ShaderProgram`] the first time a pair is seen.
    pub fn set_shaders(
        &mut self,
        vertex_shader: Option<Arc<ShaderVariation>>,
        pixel_shader: Option<Arc<ShaderVariation>>,
    ) -> GraphicsResult<()> {
        if vertex_shader.as_ref().is_some_and(|s| s.stage() != ShaderStage::Vertex)
            || pixel_shader.as_ref().is_some_and(|s| s.stage() != ShaderStage::Pixel)
        {
            log::error!("Shader bound to the wrong stage");
            return Err(GraphicsError::InvalidParameter("shader stage mismatch".into()));
        }

        self.current_program = match (&vertex_shader, &pixel_shader) {
            (Some(vs), Some(ps)) => {
                let key = (vs.id(), ps.id());
                if !self.programs.contains_key(&key) {
                    let program = ShaderProgram::new(
                        &mut self.backend,
                        &mut self.constant_buffers,
                        Arc::clone(vs),
                        Arc::clone(ps),
                    )?;
                    self.programs.insert(key, program);
                }
                Some(key)
            }
            _ => None,
        };

        self.tracker.set_shaders(vertex_shader, pixel_shader);
        Ok(())
    }

    fn current_program(&self) -> Option<&ShaderProgram> {
        self.current_program.and_then(|key| self.programs.get(&key))
    }

    pub fn has_shader_parameter(&self, name: &str) -> bool {
        self.current_program()
            .is_some_and(|program| program.has_parameter(name))
    }

    /// Write a parameter of the current program. Unknown names are ignored.
    pub fn set_shader_parameter<V: ShaderParameterValue + ?Sized>(&mut self, name: &str, value: &V) {
        let Some(param) = self.current_program().and_then(|p| p.parameter(name)).copied() else {
            return;
        };

        let mut bytes = Vec::new();
        value.write_bytes(&mut bytes);
        bytes.truncate(param.size as usize);
        self.constant_buffers
            .set_parameter(param.buffer, param.offset, &bytes);
    }

    // Geometry

    pub fn set_vertex_buffer(&mut self, buffer: Option<&VertexBuffer>) {
        let stream = buffer.and_then(|b| b.stream(0));
        self.tracker.set_vertex_buffers(&[stream]);
    }

    /// Bind vertex buffers to consecutive slots starting at 0. Buffers with
    /// per-instance elements start `instance_offset` vertices in.
    pub fn set_vertex_buffers(
        &mut self,
        buffers: &[&VertexBuffer],
        instance_offset: u32,
    ) -> GraphicsResult<()> {
        if buffers.len() > MAX_VERTEX_STREAMS {
            log::error!("Too many vertex buffers");
            return Err(GraphicsError::TooManyVertexBuffers {
                count: buffers.len(),
                max: MAX_VERTEX_STREAMS,
            });
        }

        let streams: Vec<Option<VertexStream>> =
            buffers.iter().map(|b| b.stream(instance_offset)).collect();
        self.tracker.set_vertex_buffers(&streams);
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: Option<&IndexBuffer>) {
        let binding = buffer.and_then(|b| Some((b.handle()?, b.index_format())));
        if binding == self.index_buffer {
            return;
        }
        if let Some((handle, format)) = binding {
            self.backend.set_index_buffer(handle, format);
        }
        self.index_buffer = binding;
    }

    // Textures and targets

    pub fn set_texture(&mut self, unit: usize, texture: Option<Arc<Texture>>) {
        self.tracker.set_texture(unit, texture);
    }

    pub fn set_render_target(&mut self, index: usize, texture: Option<Arc<Texture>>) {
        if let Some(t) = &texture {
            if t.usage() != TextureUsageKind::RenderTarget {
                log::error!("Texture is not a render target");
                return;
            }
        }
        self.tracker.set_render_target(index, texture);
    }

    pub fn set_depth_stencil(&mut self, texture: Option<Arc<Texture>>) {
        if let Some(t) = &texture {
            if t.usage() != TextureUsageKind::DepthStencil {
                log::error!("Texture is not a depth-stencil texture");
                return;
            }
        }
        self.tracker.set_depth_stencil(texture);
    }

    /// Return to the backbuffer and default depth-stencil, with a full viewport.
    pub fn reset_render_targets(&mut self) {
        for index in 0..crate::MAX_RENDERTARGETS {
            self.tracker.set_render_target(index, None);
        }
        self.tracker.set_depth_stencil(None);
        self.tracker.reset_viewport();
    }

    // Draw submission

    fn effective_primitive(&self, primitive_type: PrimitiveType) -> PrimitiveType {
        if self.tracker.state().fill_mode == FillMode::Point {
            PrimitiveType::PointList
        } else {
            primitive_type
        }
    }

    fn prepare_draw(&mut self, primitive_type: PrimitiveType) -> GraphicsResult<Option<PrimitiveType>> {
        let primitive_type = self.effective_primitive(primitive_type);
        self.tracker.set_primitive_type(primitive_type);

        let program = self
            .current_program
            .and_then(|key| self.programs.get(&key));
        let ready = self.preparer.prepare(
            &mut self.backend,
            &mut self.tracker,
            program,
            &mut self.constant_buffers,
            &mut self.cache,
        )?;
        Ok(ready.then_some(primitive_type))
    }

    fn index_buffer_check(&self) -> GraphicsResult<()> {
        if self.index_buffer.is_none() {
            log::error!("Indexed draw without an index buffer");
            return Err(GraphicsError::InvalidParameter("no index buffer bound".into()));
        }
        Ok(())
    }

    /// Draw non-indexed geometry.
    pub fn draw(
        &mut self,
        primitive_type: PrimitiveType,
        vertex_start: u32,
        vertex_count: u32,
    ) -> GraphicsResult<()> {
        if vertex_count == 0 || self.current_program.is_none() {
            return Ok(());
        }
        let vertices = draw_range(vertex_start, vertex_count)?;
        let Some(primitive_type) = self.prepare_draw(primitive_type)? else {
            return Ok(());
        };

        self.backend.draw(vertices, 0..1);
        self.stats.primitives += primitive_type.primitive_count(vertex_count);
        self.stats.batches += 1;
        Ok(())
    }

    /// Draw indexed geometry.
    pub fn draw_indexed(
        &mut self,
        primitive_type: PrimitiveType,
        index_start: u32,
        index_count: u32,
    ) -> GraphicsResult<()> {
        self.draw_instanced_base_vertex(primitive_type, index_start, index_count, 0, 1)
    }

    /// Draw indexed geometry with a vertex offset added to every index.
    pub fn draw_indexed_base_vertex(
        &mut self,
        primitive_type: PrimitiveType,
        index_start: u32,
        index_count: u32,
        base_vertex: i32,
    ) -> GraphicsResult<()> {
        self.draw_instanced_base_vertex(primitive_type, index_start, index_count, base_vertex, 1)
    }

    /// Draw indexed, instanced geometry.
    pub fn draw_instanced(
        &mut self,
        primitive_type: PrimitiveType,
        index_start: u32,
        index_count: u32,
        instance_count: u32,
    ) -> GraphicsResult<()> {
        self.draw_instanced_base_vertex(primitive_type, index_start, index_count, 0, instance_count)
    }

    pub fn draw_instanced_base_vertex(
        &mut self,
        primitive_type: PrimitiveType,
        index_start: u32,
        index_count: u32,
        base_vertex: i32,
        instance_count: u32,
    ) -> GraphicsResult<()> {
        if index_count == 0 || instance_count == 0 || self.current_program.is_none() {
            return Ok(());
        }
        self.index_buffer_check()?;
        let indices = draw_range(index_start, index_count)?;
        let Some(primitive_type) = self.prepare_draw(primitive_type)? else {
            return Ok(());
        };

        self.backend
            .draw_indexed(indices, base_vertex, 0..instance_count);
        self.stats.primitives += primitive_type.primitive_count(index_count) * instance_count;
        self.stats.batches += 1;
        Ok(())
    }

    /// Submit recorded work to the device.
    pub fn flush(&mut self) -> GraphicsResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Destroy every cached pipeline. The next draw rebuilds what it needs.
    pub fn release_pipelines(&mut self) {
        self.cache.release_all(&mut self.backend);
        self.preparer.reset();
    }
}

impl<B: GraphicsBackend> Drop for Graphics<B> {
    fn drop(&mut self) {
        self.preparer.reset();
        self.cache.release_all(&mut self.backend);
        self.constant_buffers.release_all(&mut self.backend);
    }
}

fn draw_range(start: u32, count: u32) -> GraphicsResult<Range<u32>> {
    match start.checked_add(count) {
        Some(end) => Ok(start..end),
        None => {
            log::error!("Draw range {} + {} overflows", start, count);
            Err(GraphicsError::InvalidRange(format!(
                "{} elements from {}",
                count, start
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{BackendCall, DummyBackend};
    use crate::backend::{ShaderDescriptor, ShaderSource};
    use crate::shader::{ShaderParameterGroup, ShaderReflection};
    use glam::Vec4;

    fn shader(graphics: &mut Graphics<DummyBackend>, stage: ShaderStage, reflection: ShaderReflection) -> Arc<ShaderVariation> {
        ShaderVariation::create(
            graphics.backend_mut(),
            "Unlit",
            ShaderDescriptor {
                label: None,
                stage,
                source: ShaderSource::Wgsl(String::new()),
                entry_point: "main".into(),
                reflection,
            },
        )
        .unwrap()
    }

    fn graphics_with_shaders() -> Graphics<DummyBackend> {
        let mut graphics = Graphics::new(DummyBackend::new());
        let vs = shader(&mut graphics, ShaderStage::Vertex, ShaderReflection::new());
        let ps = shader(
            &mut graphics,
            ShaderStage::Pixel,
            ShaderReflection::new()
                .with_constant_buffer(ShaderParameterGroup::Material, "MaterialPS", 16, 0, 0)
                .with_parameter("MatDiffColor", ShaderParameterGroup::Material, 0, 16),
        );
        graphics.set_shaders(Some(vs), Some(ps)).unwrap();
        graphics
    }

    #[test]
    fn test_draw_without_shaders_is_skipped() {
        let mut graphics = Graphics::new(DummyBackend::new());
        graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
        assert_eq!(graphics.stats().batches, 0);
        assert!(!graphics
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Draw { .. })));
    }

    #[test]
    fn test_stage_mismatch_rejected() {
        let mut graphics = Graphics::new(DummyBackend::new());
        let ps = shader(&mut graphics, ShaderStage::Pixel, ShaderReflection::new());
        let result = graphics.set_shaders(Some(ps.clone()), Some(ps));
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_shader_parameter_uploaded_on_draw() {
        let mut graphics = graphics_with_shaders();
        assert!(graphics.has_shader_parameter("MatDiffColor"));

        graphics.set_shader_parameter("MatDiffColor", &Vec4::ONE);
        graphics.set_shader_parameter("Unknown", &1.0f32);
        assert_eq!(graphics.constant_buffers().pending_count(), 1);

        graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
        assert_eq!(graphics.constant_buffers().pending_count(), 0);
        assert!(graphics
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::WriteBuffer { size: 16, .. })));
    }

    #[test]
    fn test_overflowing_draw_range_rejected() {
        let mut graphics = graphics_with_shaders();
        let result = graphics.draw(PrimitiveType::TriangleList, u32::MAX - 1, 3);
        assert!(matches!(result, Err(GraphicsError::InvalidRange(_))));
        assert_eq!(graphics.stats().batches, 0);
        assert!(!graphics
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Draw { .. })));

        assert_eq!(draw_range(u32::MAX - 3, 3).unwrap(), u32::MAX - 3..u32::MAX);
        assert!(draw_range(u32::MAX, 1).is_err());
    }

    #[test]
    fn test_point_fill_forces_point_list() {
        let mut graphics = graphics_with_shaders();
        graphics.set_fill_mode(FillMode::Point);
        graphics.draw(PrimitiveType::TriangleList, 0, 6).unwrap();

        assert_eq!(graphics.state().primitive_type, PrimitiveType::PointList);
        assert_eq!(graphics.stats().primitives, 6);
    }

    #[test]
    fn test_indexed_draw_requires_index_buffer() {
        let mut graphics = graphics_with_shaders();
        let result = graphics.draw_indexed(PrimitiveType::TriangleList, 0, 3);
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));

        // Zero counts return before any validation
        assert!(graphics.draw_indexed(PrimitiveType::TriangleList, 0, 0).is_ok());
    }

    #[test]
    fn test_stats_accumulate_and_reset() {
        let mut graphics = graphics_with_shaders();
        graphics.draw(PrimitiveType::TriangleList, 0, 6).unwrap();
        graphics.draw(PrimitiveType::LineList, 0, 4).unwrap();
        assert_eq!(
            graphics.stats(),
            DrawStats {
                primitives: 4,
                batches: 2
            }
        );
        graphics.reset_stats();
        assert_eq!(graphics.stats(), DrawStats::default());
    }

    #[test]
    fn test_too_many_vertex_buffers() {
        let mut graphics = Graphics::new(DummyBackend::new());
        let vb = VertexBuffer::new(false);
        let buffers = [&vb; MAX_VERTEX_STREAMS + 1];
        assert!(matches!(
            graphics.set_vertex_buffers(&buffers, 0),
            Err(GraphicsError::TooManyVertexBuffers { .. })
        ));
    }

    #[test]
    fn test_drop_releases_cached_pipelines() {
        let mut graphics = graphics_with_shaders();
        graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
        assert_eq!(graphics.backend().live_pipelines(), 1);

        graphics.release_pipelines();
        assert_eq!(graphics.backend().live_pipelines(), 0);
        graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
        assert_eq!(graphics.backend().pipelines_created(), 2);
    }
}
