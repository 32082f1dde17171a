//! Shader reflection data and WGSL reflection via naga.

use crate::backend::ShaderStage;

use super::ShaderParameterGroup;

/// View dimension a texture variable expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    D2,
    D2Array,
    Cube,
    D3,
}

/// Sample type a texture variable expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSampleKind {
    Float,
    Depth,
    Sint,
    Uint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderResourceKind {
    Texture {
        dimension: ResourceDimension,
        sample_kind: TextureSampleKind,
        multisampled: bool,
    },
    Sampler {
        comparison: bool,
    },
}

/// A texture or sampler variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderResourceDesc {
    pub name: String,
    pub kind: ShaderResourceKind,
    pub group: u32,
    pub binding: u32,
}

impl ShaderResourceDesc {
    pub fn is_texture(&self) -> bool {
        matches!(self.kind, ShaderResourceKind::Texture { .. })
    }
}

/// A uniform block mapped to a parameter group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBufferDesc {
    pub name: String,
    pub parameter_group: ShaderParameterGroup,
    pub size: u32,
    pub group: u32,
    pub binding: u32,
}

/// A named value inside a parameter group's constant buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderParameterDesc {
    pub name: String,
    pub parameter_group: ShaderParameterGroup,
    pub offset: u32,
    pub size: u32,
}

/// Resources, constant buffers and parameters used by one shader stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub resources: Vec<ShaderResourceDesc>,
    pub constant_buffers: Vec<ConstantBufferDesc>,
    pub parameters: Vec<ShaderParameterDesc>,
}

impl ShaderReflection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_texture(self, name: &str, group: u32, binding: u32) -> Self {
        self.with_texture_dimension(name, ResourceDimension::D2, group, binding)
    }

    pub fn with_texture_dimension(
        mut self,
        name: &str,
        dimension: ResourceDimension,
        group: u32,
        binding: u32,
    ) -> Self {
        self.resources.push(ShaderResourceDesc {
            name: name.to_string(),
            kind: ShaderResourceKind::Texture {
                dimension,
                sample_kind: TextureSampleKind::Float,
                multisampled: false,
            },
            group,
            binding,
        });
        self
    }

    pub fn with_sampler(mut self, name: &str, group: u32, binding: u32) -> Self {
        self.resources.push(ShaderResourceDesc {
            name: name.to_string(),
            kind: ShaderResourceKind::Sampler { comparison: false },
            group,
            binding,
        });
        self
    }

    pub fn with_constant_buffer(
        mut self,
        parameter_group: ShaderParameterGroup,
        name: &str,
        size: u32,
        group: u32,
        binding: u32,
    ) -> Self {
        self.constant_buffers.push(ConstantBufferDesc {
            name: name.to_string(),
            parameter_group,
            size,
            group,
            binding,
        });
        self
    }

    pub fn with_parameter(
        mut self,
        name: &str,
        parameter_group: ShaderParameterGroup,
        offset: u32,
        size: u32,
    ) -> Self {
        self.parameters.push(ShaderParameterDesc {
            name: name.to_string(),
            parameter_group,
            offset,
            size,
        });
        self
    }

    /// Texture variables in declaration order
    pub fn textures(&self) -> impl Iterator<Item = &ShaderResourceDesc> {
        self.resources.iter().filter(|r| r.is_texture())
    }

    pub fn constant_buffer(&self, group: ShaderParameterGroup) -> Option<&ConstantBufferDesc> {
        self.constant_buffers
            .iter()
            .find(|cb| cb.parameter_group == group)
    }

    /// Reflect a WGSL module.
    ///
    /// Uniform blocks are matched to parameter groups by variable name
    /// (`MaterialPS`, `ObjectVS`, ...). Their struct members become
    /// parameters, with a leading `c` dropped from member names.
    pub fn from_wgsl(source: &str, stage: ShaderStage) -> Result<Self, String> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
        let mut reflection = Self::default();

        for (_, var) in module.global_variables.iter() {
            let (Some(name), Some(binding)) = (var.name.as_ref(), var.binding.as_ref()) else {
                continue;
            };
            let inner = &module.types[var.ty].inner;

            match var.space {
                naga::AddressSpace::Uniform => {
                    let Some(parameter_group) = ShaderParameterGroup::from_block_name(name, stage)
                    else {
                        log::warn!("Uniform block {} does not name a parameter group", name);
                        continue;
                    };
                    reflection.constant_buffers.push(ConstantBufferDesc {
                        name: name.clone(),
                        parameter_group,
                        size: inner.size(module.to_ctx()),
                        group: binding.group,
                        binding: binding.binding,
                    });

                    if let naga::TypeInner::Struct { members, .. } = inner {
                        for member in members {
                            let Some(member_name) = member.name.as_ref() else {
                                continue;
                            };
                            let member_size = module.types[member.ty].inner.size(module.to_ctx());
                            reflection.parameters.push(ShaderParameterDesc {
                                name: strip_parameter_prefix(member_name).to_string(),
                                parameter_group,
                                offset: member.offset,
                                size: member_size,
                            });
                        }
                    }
                }
                naga::AddressSpace::Handle => {
                    let kind = match inner {
                        naga::TypeInner::Image { dim, arrayed, class } => {
                            let dimension = match (dim, arrayed) {
                                (naga::ImageDimension::Cube, _) => ResourceDimension::Cube,
                                (naga::ImageDimension::D3, _) => ResourceDimension::D3,
                                (_, true) => ResourceDimension::D2Array,
                                _ => ResourceDimension::D2,
                            };
                            let (sample_kind, multisampled) = match class {
                                naga::ImageClass::Depth { multi } => (TextureSampleKind::Depth, *multi),
                                naga::ImageClass::Sampled { kind, multi } => {
                                    let sample_kind = match kind {
                                        naga::ScalarKind::Sint => TextureSampleKind::Sint,
                                        naga::ScalarKind::Uint => TextureSampleKind::Uint,
                                        _ => TextureSampleKind::Float,
                                    };
                                    (sample_kind, *multi)
                                }
                                naga::ImageClass::Storage { .. } => {
                                    log::warn!("Storage texture {} is not supported", name);
                                    continue;
                                }
                            };
                            ShaderResourceKind::Texture {
                                dimension,
                                sample_kind,
                                multisampled,
                            }
                        }
                        naga::TypeInner::Sampler { comparison } => ShaderResourceKind::Sampler {
                            comparison: *comparison,
                        },
                        _ => continue,
                    };
                    reflection.resources.push(ShaderResourceDesc {
                        name: name.clone(),
                        kind,
                        group: binding.group,
                        binding: binding.binding,
                    });
                }
                _ => {}
            }
        }

        Ok(reflection)
    }
}

fn strip_parameter_prefix(name: &str) -> &str {
    match name.strip_prefix('c') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_uppercase()) => rest,
        _ => name,
    }
}
