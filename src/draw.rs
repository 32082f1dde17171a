//! Per-draw resolution of dirty state into backend calls.

use std::sync::Arc;

use crate::backend::{GraphicsBackend, TextureFormat, TextureViewHandle, VertexBufferBinding};
use crate::error::GraphicsResult;
use crate::pipeline::{CachedPipeline, PipelineCache, PipelineKey, PipelineRequest, TextureUnitNames};
use crate::shader::{ConstantBufferPool, ShaderProgram};
use crate::state::{
    blend_hash, depth_stencil_hash, rasterizer_hash, render_target_hash, DirtyFlags,
    StateFieldTracker,
};
use crate::vertex::VertexLayoutResolver;
use crate::MAX_RENDERTARGETS;

/// Resolves the tracker's dirty state right before each draw.
///
/// Keeps the last computed hashes so only categories that actually changed
/// value trigger a pipeline lookup.
#[derive(Debug)]
pub struct DrawPreparer {
    blend_hash: u32,
    depth_hash: u32,
    rasterizer_hash: u32,
    vertex_layout_hash: u64,
    render_target_hash: u32,
    color_formats: Vec<TextureFormat>,
    depth_format: Option<TextureFormat>,
    sample_count: u32,
    depth_bits: u32,
    pipeline_dirty: bool,
    current: Option<Arc<CachedPipeline>>,
    texture_names: TextureUnitNames,
}

impl Default for DrawPreparer {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawPreparer {
    pub fn new() -> Self {
        Self {
            blend_hash: u32::MAX,
            depth_hash: u32::MAX,
            rasterizer_hash: u32::MAX,
            vertex_layout_hash: 0,
            render_target_hash: u32::MAX,
            color_formats: Vec::new(),
            depth_format: None,
            sample_count: 1,
            depth_bits: 24,
            pipeline_dirty: true,
            current: None,
            texture_names: TextureUnitNames::new(),
        }
    }

    /// Pipeline bound by the last successful prepare
    pub fn current_pipeline(&self) -> Option<&Arc<CachedPipeline>> {
        self.current.as_ref()
    }

    pub fn is_pipeline_dirty(&self) -> bool {
        self.pipeline_dirty
    }

    pub fn blend_hash(&self) -> u32 {
        self.blend_hash
    }

    pub fn depth_hash(&self) -> u32 {
        self.depth_hash
    }

    pub fn rasterizer_hash(&self) -> u32 {
        self.rasterizer_hash
    }

    pub fn vertex_layout_hash(&self) -> u64 {
        self.vertex_layout_hash
    }

    pub fn render_target_hash(&self) -> u32 {
        self.render_target_hash
    }

    /// Forget the bound pipeline, e.g. after the cache was released.
    pub fn reset(&mut self) {
        self.current = None;
        self.pipeline_dirty = true;
    }

    /// Bring the device in line with the tracked state.
    ///
    /// Returns `Ok(false)` when no shader pair is set and the draw must be
    /// skipped. A pipeline creation failure is returned as an error and the
    /// lookup is retried on the next call.
    pub fn prepare<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        tracker: &mut StateFieldTracker,
        program: Option<&ShaderProgram>,
        constant_buffers: &mut ConstantBufferPool,
        cache: &mut PipelineCache,
    ) -> GraphicsResult<bool> {
        if tracker.is_dirty(DirtyFlags::RENDER_TARGETS) {
            self.apply_render_targets(backend, tracker);
            tracker.clear_dirty(DirtyFlags::RENDER_TARGETS);
        }

        let Some(program) = program else {
            log::trace!("No shader program set, skipping draw");
            return Ok(false);
        };
        if tracker.state().vertex_shader.is_none() || tracker.state().pixel_shader.is_none() {
            return Ok(false);
        }

        let mut pipeline_changed = false;
        if tracker.is_dirty(DirtyFlags::PIPELINE) || self.pipeline_dirty {
            if let Some(range) = tracker.take_dirty_vertex_buffers() {
                let buffers: Vec<Option<VertexBufferBinding>> = tracker.state().vertex_buffers
                    [range.first..=range.last]
                    .iter()
                    .map(|stream| {
                        stream.as_ref().map(|s| VertexBufferBinding {
                            buffer: s.buffer,
                            offset: s.offset,
                        })
                    })
                    .collect();
                backend.set_vertex_buffers(range.first as u32, &buffers);
            }

            self.update_hashes(tracker);
            tracker.clear_dirty(DirtyFlags::PIPELINE);

            if self.pipeline_dirty {
                let state = tracker.state();
                let (Some(vs), Some(ps)) = (&state.vertex_shader, &state.pixel_shader) else {
                    return Ok(false);
                };
                let key = PipelineKey {
                    vertex_shader: vs.id(),
                    pixel_shader: ps.id(),
                    blend_hash: self.blend_hash,
                    depth_hash: self.depth_hash,
                    rasterizer_hash: self.rasterizer_hash,
                    vertex_layout_hash: self.vertex_layout_hash,
                    primitive_type: state.primitive_type,
                    render_target_hash: self.render_target_hash,
                };
                let request = PipelineRequest {
                    vertex_shader: vs,
                    pixel_shader: ps,
                    program,
                    constant_buffers,
                    state,
                    color_formats: &self.color_formats,
                    depth_format: self.depth_format,
                    sample_count: self.sample_count,
                    depth_bits: self.depth_bits,
                    texture_names: &self.texture_names,
                };

                match cache.resolve(backend, key, &request) {
                    Ok(entry) => {
                        pipeline_changed = self
                            .current
                            .as_ref()
                            .map_or(true, |current| !Arc::ptr_eq(current, &entry));
                        self.current = Some(entry);
                        self.pipeline_dirty = false;
                    }
                    Err(e) => {
                        self.current = None;
                        return Err(e);
                    }
                }
            }
        }

        let Some(current) = self.current.as_ref() else {
            return Ok(false);
        };
        backend.set_pipeline_state(current.pipeline);

        let dirty_textures = tracker.dirty_textures();
        if pipeline_changed || dirty_textures.is_some() {
            let state = tracker.state();
            for entry in current.texture_units.iter() {
                let unit = entry.unit.index();
                if !pipeline_changed && !dirty_textures.is_some_and(|r| r.contains(unit)) {
                    continue;
                }
                let Some(texture) = &state.textures[unit] else {
                    continue;
                };
                if let Some(view) = texture.shader_resource_view() {
                    backend.set_binding_variable(
                        current.binding,
                        entry.variable,
                        view,
                        Some(texture.sampler()),
                    );
                }
            }
            tracker.clear_dirty_textures();
        }

        backend.commit_resources(current.binding);

        if tracker.is_dirty(DirtyFlags::SCISSOR_RECT) {
            backend.set_scissor_rect(&tracker.state().scissor_rect);
            tracker.clear_dirty(DirtyFlags::SCISSOR_RECT);
        }
        if tracker.is_dirty(DirtyFlags::STENCIL_REF) {
            backend.set_stencil_reference(tracker.state().stencil_ref);
            tracker.clear_dirty(DirtyFlags::STENCIL_REF);
        }

        constant_buffers.apply_pending(backend);
        Ok(true)
    }

    fn update_hashes(&mut self, tracker: &StateFieldTracker) {
        let state = tracker.state();

        if tracker.is_dirty(DirtyFlags::VERTEX_DECLARATION) {
            let hash = VertexLayoutResolver::layout_hash(&state.vertex_buffers);
            if hash != 0 && hash != self.vertex_layout_hash {
                self.pipeline_dirty = true;
            }
            self.vertex_layout_hash = hash;
        }

        if tracker.is_dirty(
            DirtyFlags::VERTEX_SHADER | DirtyFlags::PIXEL_SHADER | DirtyFlags::PRIMITIVE_TYPE,
        ) {
            self.pipeline_dirty = true;
        }

        if tracker.is_dirty(DirtyFlags::BLEND) {
            let hash = blend_hash(state);
            if hash != self.blend_hash {
                self.blend_hash = hash;
                self.pipeline_dirty = true;
            }
        }
        if tracker.is_dirty(DirtyFlags::DEPTH_STENCIL) {
            let hash = depth_stencil_hash(state);
            if hash != self.depth_hash {
                self.depth_hash = hash;
                self.pipeline_dirty = true;
            }
        }
        if tracker.is_dirty(DirtyFlags::RASTERIZER) {
            let hash = rasterizer_hash(state, self.depth_bits);
            if hash != self.rasterizer_hash {
                self.rasterizer_hash = hash;
                self.pipeline_dirty = true;
            }
        }
    }

    fn apply_render_targets<B: GraphicsBackend>(&mut self, backend: &mut B, tracker: &StateFieldTracker) {
        let state = tracker.state();
        let backbuffer_size = backend.backbuffer_size();

        // The backbuffer stands in for target 0 as long as the depth buffer fits it
        let use_backbuffer = state.render_targets[0].is_none()
            && state
                .depth_stencil
                .as_ref()
                .map_or(true, |ds| (ds.width(), ds.height()) == backbuffer_size);

        let mut colors: Vec<Option<TextureViewHandle>> = Vec::with_capacity(MAX_RENDERTARGETS);
        let mut color_formats = Vec::with_capacity(MAX_RENDERTARGETS);
        let mut sample_count = None;
        for (index, target) in state.render_targets.iter().enumerate() {
            match target {
                Some(texture) => {
                    colors.push(texture.render_target_view());
                    if texture.render_target_view().is_some() {
                        color_formats.push(texture.format());
                        sample_count.get_or_insert(texture.sample_count());
                    }
                }
                None if index == 0 && use_backbuffer => {
                    colors.push(Some(backend.backbuffer_view()));
                    color_formats.push(backend.backbuffer_format());
                    sample_count.get_or_insert(backend.backbuffer_sample_count());
                }
                None => colors.push(None),
            }
        }
        while colors.last() == Some(&None) {
            colors.pop();
        }

        let (depth_view, depth_format) = match &state.depth_stencil {
            Some(ds) => {
                let view = if !state.depth_write && ds.read_only_view().is_some() {
                    ds.read_only_view()
                } else {
                    ds.render_target_view()
                };
                sample_count.get_or_insert(ds.sample_count());
                (view, Some(ds.format()))
            }
            None => {
                let (width, height) = tracker.render_target_dimensions();
                if (width as u32, height as u32) == backbuffer_size {
                    (
                        Some(backend.default_depth_stencil_view()),
                        Some(backend.default_depth_format()),
                    )
                } else {
                    (None, None)
                }
            }
        };
        let sample_count = sample_count.unwrap_or(1);

        let hash = render_target_hash(&color_formats, depth_format, sample_count);
        if hash != self.render_target_hash {
            self.render_target_hash = hash;
            self.pipeline_dirty = true;
        }
        self.depth_bits = depth_format.map_or(24, |f| f.depth_bits());
        self.color_formats = color_formats;
        self.depth_format = depth_format;
        self.sample_count = sample_count;

        log::trace!(
            "Binding {} color targets, depth {:?}",
            colors.len(),
            depth_view
        );
        backend.set_render_targets(&colors, depth_view);
        backend.set_viewport(&state.viewport);
    }
}
