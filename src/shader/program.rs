//! Linked vertex/pixel shader pairs and shader parameter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::{BufferHandle, GraphicsBackend, ShaderStage};
use crate::error::GraphicsResult;

use super::constant_buffer::{ConstantBufferId, ConstantBufferPool};
use super::{ShaderParameterGroup, ShaderVariation, MAX_SHADER_PARAMETER_GROUPS};

/// Location of a named parameter inside a constant buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderParameter {
    pub stage: ShaderStage,
    pub group: ShaderParameterGroup,
    pub buffer: ConstantBufferId,
    pub offset: u32,
    pub size: u32,
}

/// A value that can be written into a constant buffer.
pub trait ShaderParameterValue {
    fn write_bytes(&self, out: &mut Vec<u8>);
}

impl ShaderParameterValue for f32 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

impl ShaderParameterValue for i32 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

impl ShaderParameterValue for bool {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(&(*self as i32)));
    }
}

impl ShaderParameterValue for [f32] {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::cast_slice(self));
    }
}

impl ShaderParameterValue for Vec2 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

impl ShaderParameterValue for Vec3 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

impl ShaderParameterValue for Vec4 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

impl ShaderParameterValue for Mat4 {
    fn write_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(self));
    }
}

fn stage_index(stage: ShaderStage) -> usize {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::Pixel => 1,
    }
}

/// A vertex and pixel shader used together, with their constant buffers
#[derive(Debug)]
pub struct ShaderProgram {
    vertex_shader: Arc<ShaderVariation>,
    pixel_shader: Arc<ShaderVariation>,
    constant_buffers: [[Option<ConstantBufferId>; MAX_SHADER_PARAMETER_GROUPS]; 2],
    parameters: HashMap<String, ShaderParameter>,
}

impl ShaderProgram {
    /// Link a shader pair, creating or reusing the constant buffers each
    /// stage's parameter groups need.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        pool: &mut ConstantBufferPool,
        vertex_shader: Arc<ShaderVariation>,
        pixel_shader: Arc<ShaderVariation>,
    ) -> GraphicsResult<Self> {
        let mut constant_buffers = [[None; MAX_SHADER_PARAMETER_GROUPS]; 2];
        let mut parameters = HashMap::new();

        for shader in [&vertex_shader, &pixel_shader] {
            let stage = shader.stage();
            let reflection = shader.reflection();

            for cb in reflection.constant_buffers.iter().filter(|cb| cb.size > 0) {
                let id = pool.get_or_create(backend, stage, cb.parameter_group, cb.size)?;
                constant_buffers[stage_index(stage)][cb.parameter_group as usize] = Some(id);
            }

            for param in &reflection.parameters {
                let Some(buffer) = constant_buffers[stage_index(stage)][param.parameter_group as usize]
                else {
                    continue;
                };
                parameters.insert(
                    param.name.clone(),
                    ShaderParameter {
                        stage,
                        group: param.parameter_group,
                        buffer,
                        offset: param.offset,
                        size: param.size,
                    },
                );
            }
        }

        Ok(Self {
            vertex_shader,
            pixel_shader,
            constant_buffers,
            parameters,
        })
    }

    pub fn vertex_shader(&self) -> &Arc<ShaderVariation> {
        &self.vertex_shader
    }

    pub fn pixel_shader(&self) -> &Arc<ShaderVariation> {
        &self.pixel_shader
    }

    pub fn parameter(&self, name: &str) -> Option<&ShaderParameter> {
        self.parameters.get(name)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn constant_buffer(
        &self,
        stage: ShaderStage,
        group: ShaderParameterGroup,
    ) -> Option<ConstantBufferId> {
        self.constant_buffers[stage_index(stage)][group as usize]
    }

    /// Named constant buffers of one stage, for binding as static pipeline variables.
    pub fn static_buffers(
        &self,
        stage: ShaderStage,
        pool: &ConstantBufferPool,
    ) -> Vec<(String, BufferHandle)> {
        let shader = match stage {
            ShaderStage::Vertex => &self.vertex_shader,
            ShaderStage::Pixel => &self.pixel_shader,
        };

        shader
            .reflection()
            .constant_buffers
            .iter()
            .filter(|cb| cb.size > 0 && !cb.name.is_empty())
            .filter_map(|cb| {
                let id = self.constant_buffer(stage, cb.parameter_group)?;
                let buffer = pool.get(id)?;
                Some((cb.name.clone(), buffer.handle()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::{ShaderDescriptor, ShaderSource};
    use crate::shader::ShaderReflection;

    fn shader(backend: &mut DummyBackend, stage: ShaderStage, reflection: ShaderReflection) -> Arc<ShaderVariation> {
        ShaderVariation::create(
            backend,
            "test",
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

    #[test]
    fn test_program_maps_parameters_to_buffers() {
        let mut backend = DummyBackend::new();
        let mut pool = ConstantBufferPool::new();

        let vs = shader(
            &mut backend,
            ShaderStage::Vertex,
            ShaderReflection::new()
                .with_constant_buffer(ShaderParameterGroup::Object, "ObjectVS", 64, 0, 0)
                .with_parameter("Model", ShaderParameterGroup::Object, 0, 64),
        );
        let ps = shader(
            &mut backend,
            ShaderStage::Pixel,
            ShaderReflection::new()
                .with_constant_buffer(ShaderParameterGroup::Material, "MaterialPS", 16, 0, 1)
                .with_parameter("MatDiffColor", ShaderParameterGroup::Material, 0, 16),
        );

        let program = ShaderProgram::new(&mut backend, &mut pool, vs, ps).unwrap();

        let model = program.parameter("Model").unwrap();
        assert_eq!(model.stage, ShaderStage::Vertex);
        assert_eq!(
            Some(model.buffer),
            program.constant_buffer(ShaderStage::Vertex, ShaderParameterGroup::Object)
        );
        assert!(program.has_parameter("MatDiffColor"));
        assert!(!program.has_parameter("Missing"));

        let statics = program.static_buffers(ShaderStage::Pixel, &pool);
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].0, "MaterialPS");
    }

    #[test]
    fn test_parameter_value_bytes() {
        let mut out = Vec::new();
        Vec4::new(1.0, 2.0, 3.0, 4.0).write_bytes(&mut out);
        true.write_bytes(&mut out);
        assert_eq!(out.len(), 20);
        assert_eq!(&out[16..], &1i32.to_ne_bytes());
    }
}
