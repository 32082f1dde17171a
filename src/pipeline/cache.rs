//! Cache of pipeline state objects and their resource bindings.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{
    BlendStateDescriptor, DepthStencilStateDescriptor, DynamicVariableDescriptor, GraphicsBackend,
    PipelineHandle, PipelineStateDescriptor, RasterizerStateDescriptor, ResourceBindingHandle,
    ShaderStage, TextureFormat,
};
use crate::error::{GraphicsError, GraphicsResult};
use crate::shader::{ConstantBufferPool, ShaderProgram, ShaderVariation};
use crate::state::hasher::quantize_constant_bias;
use crate::state::RenderState;
use crate::vertex::VertexLayoutResolver;

use super::binding::{ResourceBindingResolver, TextureUnitNames, TextureUnitTable};
use super::key::PipelineKey;

/// A pipeline state object together with its resource binding and texture unit table.
#[derive(Debug)]
pub struct CachedPipeline {
    pub pipeline: PipelineHandle,
    pub binding: ResourceBindingHandle,
    pub texture_units: TextureUnitTable,
}

/// Live state needed to build a pipeline on a cache miss
pub struct PipelineRequest<'a> {
    pub vertex_shader: &'a ShaderVariation,
    pub pixel_shader: &'a ShaderVariation,
    pub program: &'a ShaderProgram,
    pub constant_buffers: &'a ConstantBufferPool,
    pub state: &'a RenderState,
    pub color_formats: &'a [TextureFormat],
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
    pub depth_bits: u32,
    pub texture_names: &'a TextureUnitNames,
}

impl PipelineRequest<'_> {
    fn descriptor(&self) -> PipelineStateDescriptor {
        let state = self.state;

        let dynamic_variables = [self.vertex_shader, self.pixel_shader]
            .into_iter()
            .flat_map(|shader| {
                shader.reflection().textures().map(|t| DynamicVariableDescriptor {
                    stage: shader.stage(),
                    name: t.name.clone(),
                })
            })
            .collect();

        PipelineStateDescriptor {
            label: Some(format!("{}/{}", self.vertex_shader.name(), self.pixel_shader.name())),
            vertex_shader: self.vertex_shader.handle(),
            pixel_shader: self.pixel_shader.handle(),
            input_layout: VertexLayoutResolver::resolve(&state.vertex_buffers),
            primitive_type: state.primitive_type,
            blend: BlendStateDescriptor {
                mode: state.blend_mode,
                alpha_to_coverage: state.alpha_to_coverage,
                color_write: state.color_write,
            },
            depth_stencil: DepthStencilStateDescriptor {
                depth_write: state.depth_write,
                depth_compare: state.depth_test_mode,
                stencil_enable: state.stencil_test,
                stencil_compare: state.stencil_test_mode,
                stencil_pass: state.stencil_pass,
                stencil_fail: state.stencil_fail,
                stencil_z_fail: state.stencil_z_fail,
                stencil_compare_mask: state.stencil_compare_mask,
                stencil_write_mask: state.stencil_write_mask,
            },
            rasterizer: RasterizerStateDescriptor {
                fill_mode: state.fill_mode,
                cull_mode: state.cull_mode,
                scissor_enable: state.scissor_test,
                line_anti_alias: state.line_anti_alias,
                depth_bias: quantize_constant_bias(state.constant_depth_bias, self.depth_bits),
                slope_scaled_depth_bias: state.slope_scaled_depth_bias,
            },
            color_formats: self.color_formats.to_vec(),
            depth_format: self.depth_format,
            sample_count: self.sample_count,
            dynamic_variables,
        }
    }
}

/// Pipelines keyed by [`PipelineKey`].
///
/// Entries are never evicted. [`release_all`](Self::release_all) destroys all
/// of them at device teardown.
#[derive(Debug, Default)]
pub struct PipelineCache {
    entries: HashMap<PipelineKey, Arc<CachedPipeline>>,
    created_count: usize,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pipeline for `key`, building it from `request` on a miss.
    pub fn resolve<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        key: PipelineKey,
        request: &PipelineRequest<'_>,
    ) -> GraphicsResult<Arc<CachedPipeline>> {
        if let Some(entry) = self.entries.get(&key) {
            return Ok(Arc::clone(entry));
        }

        let desc = request.descriptor();
        let pipeline = backend.create_pipeline_state(&desc).map_err(|e| {
            log::error!("Failed to create pipeline state {:?}: {}", desc.label, e);
            GraphicsError::PipelineCreationFailed(e.to_string())
        })?;

        for stage in ShaderStage::ALL {
            for (name, buffer) in request.program.static_buffers(stage, request.constant_buffers) {
                match backend.set_static_variable(pipeline, stage, &name, buffer) {
                    Ok(true) => {}
                    Ok(false) => log::trace!("No static variable {} in {:?} stage", name, stage),
                    Err(e) => {
                        log::error!("Failed to bind constant buffer {}: {}", name, e);
                        backend.destroy_pipeline_state(pipeline);
                        return Err(GraphicsError::PipelineCreationFailed(e.to_string()));
                    }
                }
            }
        }

        let binding = match backend.create_resource_binding(pipeline) {
            Ok(binding) => binding,
            Err(e) => {
                log::error!("Failed to create resource binding for {:?}: {}", desc.label, e);
                backend.destroy_pipeline_state(pipeline);
                return Err(GraphicsError::PipelineCreationFailed(e.to_string()));
            }
        };

        let texture_units = ResourceBindingResolver::resolve(backend, binding, request.texture_names);

        log::debug!(
            "Created pipeline state {:?} ({} texture units) for {:?}",
            desc.label,
            texture_units.len(),
            key
        );

        let entry = Arc::new(CachedPipeline {
            pipeline,
            binding,
            texture_units,
        });
        self.entries.insert(key, Arc::clone(&entry));
        self.created_count += 1;
        Ok(entry)
    }

    pub fn get(&self, key: &PipelineKey) -> Option<&Arc<CachedPipeline>> {
        self.entries.get(key)
    }

    /// Number of pipelines built since creation
    pub fn created_count(&self) -> usize {
        self.created_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every cached pipeline and resource binding.
    pub fn release_all<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if self.entries.is_empty() {
            return;
        }
        log::debug!("Releasing {} cached pipeline states", self.entries.len());
        for (_, entry) in self.entries.drain() {
            backend.destroy_resource_binding(entry.binding);
            backend.destroy_pipeline_state(entry.pipeline);
        }
    }
}
