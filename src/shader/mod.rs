//! Shader stages, reflection and per-program constant buffers.
//!
//! - [`ShaderVariation`]: one compiled stage with its reflection data
//! - [`ShaderProgram`]: a vertex/pixel pair and its parameter lookup
//! - [`ConstantBufferPool`]: constant buffers shared between programs

mod constant_buffer;
mod program;
mod reflection;

pub use constant_buffer::{ConstantBuffer, ConstantBufferId, ConstantBufferPool};
pub use program::{ShaderParameter, ShaderParameterValue, ShaderProgram};
pub use reflection::{
    ConstantBufferDesc, ResourceDimension, ShaderParameterDesc, ShaderReflection,
    ShaderResourceDesc, ShaderResourceKind, TextureSampleKind,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{GraphicsBackend, ShaderDescriptor, ShaderHandle, ShaderSource, ShaderStage};
use crate::error::{GraphicsError, GraphicsResult};

/// Number of shader parameter groups
pub const MAX_SHADER_PARAMETER_GROUPS: usize = 7;

/// Update frequency group of shader parameters. Each group owns one constant
/// buffer per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderParameterGroup {
    Frame = 0,
    Camera,
    Zone,
    Light,
    Material,
    Object,
    Custom,
}

impl ShaderParameterGroup {
    pub const ALL: [ShaderParameterGroup; MAX_SHADER_PARAMETER_GROUPS] = [
        ShaderParameterGroup::Frame,
        ShaderParameterGroup::Camera,
        ShaderParameterGroup::Zone,
        ShaderParameterGroup::Light,
        ShaderParameterGroup::Material,
        ShaderParameterGroup::Object,
        ShaderParameterGroup::Custom,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ShaderParameterGroup::Frame => "Frame",
            ShaderParameterGroup::Camera => "Camera",
            ShaderParameterGroup::Zone => "Zone",
            ShaderParameterGroup::Light => "Light",
            ShaderParameterGroup::Material => "Material",
            ShaderParameterGroup::Object => "Object",
            ShaderParameterGroup::Custom => "Custom",
        }
    }

    /// Parse a uniform block name such as `CameraVS` or `Light`.
    pub fn from_block_name(name: &str, stage: ShaderStage) -> Option<Self> {
        let base = name.strip_suffix(stage.suffix()).unwrap_or(name);
        Self::ALL.into_iter().find(|g| g.name() == base)
    }
}

/// Process-unique identity of a shader variation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(u64);

impl ShaderId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A compiled shader stage
#[derive(Debug)]
pub struct ShaderVariation {
    id: ShaderId,
    name: String,
    stage: ShaderStage,
    handle: ShaderHandle,
    reflection: ShaderReflection,
}

impl ShaderVariation {
    /// Create the GPU shader object for `desc`.
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        name: &str,
        desc: ShaderDescriptor,
    ) -> GraphicsResult<Arc<Self>> {
        let handle = backend.create_shader(&desc).map_err(|e| {
            log::error!("Failed to create {:?} shader {}: {}", desc.stage, name, e);
            GraphicsError::from(e)
        })?;
        log::debug!("Created {:?} shader {}", desc.stage, name);

        Ok(Arc::new(Self {
            id: ShaderId::next(),
            name: name.to_string(),
            stage: desc.stage,
            handle,
            reflection: desc.reflection,
        }))
    }

    /// Reflect `source` and create the shader object.
    pub fn from_wgsl<B: GraphicsBackend>(
        backend: &mut B,
        name: &str,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
    ) -> GraphicsResult<Arc<Self>> {
        let reflection = ShaderReflection::from_wgsl(source, stage).map_err(|e| {
            log::error!("Failed to parse shader {}: {}", name, e);
            GraphicsError::InvalidParameter(format!("shader {name} does not parse"))
        })?;
        Self::create(
            backend,
            name,
            ShaderDescriptor {
                label: Some(name.to_string()),
                stage,
                source: ShaderSource::Wgsl(source.to_string()),
                entry_point: entry_point.to_string(),
                reflection,
            },
        )
    }

    /// Destroy the GPU shader object. Pipelines already built keep working.
    pub fn release<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_shader(self.handle);
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn handle(&self) -> ShaderHandle {
        self.handle
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_name_parsing() {
        assert_eq!(
            ShaderParameterGroup::from_block_name("CameraVS", ShaderStage::Vertex),
            Some(ShaderParameterGroup::Camera)
        );
        assert_eq!(
            ShaderParameterGroup::from_block_name("Material", ShaderStage::Pixel),
            Some(ShaderParameterGroup::Material)
        );
        assert_eq!(
            ShaderParameterGroup::from_block_name("CameraPS", ShaderStage::Vertex),
            None
        );
    }

    #[test]
    fn test_shader_ids_are_unique() {
        assert_ne!(ShaderId::next(), ShaderId::next());
    }
}
