//! Mapping of shader texture variables to engine texture units.

use std::collections::HashMap;

use crate::backend::{GraphicsBackend, ResourceBindingHandle, ShaderStage, VariableHandle};
use crate::MAX_TEXTURE_UNITS;

/// Engine texture unit index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureUnit(pub u32);

impl TextureUnit {
    pub const DIFFUSE: TextureUnit = TextureUnit(0);
    pub const ALBEDOBUFFER: TextureUnit = TextureUnit(0);
    pub const NORMAL: TextureUnit = TextureUnit(1);
    pub const NORMALBUFFER: TextureUnit = TextureUnit(1);
    pub const SPECULAR: TextureUnit = TextureUnit(2);
    pub const EMISSIVE: TextureUnit = TextureUnit(3);
    pub const ENVIRONMENT: TextureUnit = TextureUnit(4);
    pub const VOLUMEMAP: TextureUnit = TextureUnit(5);
    pub const CUSTOM1: TextureUnit = TextureUnit(6);
    pub const CUSTOM2: TextureUnit = TextureUnit(7);
    pub const LIGHTRAMP: TextureUnit = TextureUnit(8);
    pub const LIGHTSHAPE: TextureUnit = TextureUnit(9);
    pub const SHADOWMAP: TextureUnit = TextureUnit(10);
    pub const FACESELECT: TextureUnit = TextureUnit(11);
    pub const INDIRECTION: TextureUnit = TextureUnit(12);
    pub const DEPTHBUFFER: TextureUnit = TextureUnit(13);
    pub const LIGHTBUFFER: TextureUnit = TextureUnit(14);
    pub const ZONE: TextureUnit = TextureUnit(15);

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Static name to unit table consulted when a pipeline is first built.
#[derive(Debug, Clone)]
pub struct TextureUnitNames {
    names: HashMap<&'static str, TextureUnit>,
}

impl Default for TextureUnitNames {
    fn default() -> Self {
        let names = HashMap::from([
            ("DiffMap", TextureUnit::DIFFUSE),
            ("DiffCubeMap", TextureUnit::DIFFUSE),
            ("AlbedoBuffer", TextureUnit::ALBEDOBUFFER),
            ("NormalMap", TextureUnit::NORMAL),
            ("NormalBuffer", TextureUnit::NORMALBUFFER),
            ("SpecMap", TextureUnit::SPECULAR),
            ("RoughMetalFresnel", TextureUnit::SPECULAR),
            ("EmissiveMap", TextureUnit::EMISSIVE),
            ("EnvMap", TextureUnit::ENVIRONMENT),
            ("EnvCubeMap", TextureUnit::ENVIRONMENT),
            ("VolumeMap", TextureUnit::VOLUMEMAP),
            ("LightRampMap", TextureUnit::LIGHTRAMP),
            ("LightSpotMap", TextureUnit::LIGHTSHAPE),
            ("LightCubeMap", TextureUnit::LIGHTSHAPE),
            ("ShadowMap", TextureUnit::SHADOWMAP),
            ("FaceSelectCubeMap", TextureUnit::FACESELECT),
            ("IndirectionCubeMap", TextureUnit::INDIRECTION),
            ("DepthBuffer", TextureUnit::DEPTHBUFFER),
            ("LightBuffer", TextureUnit::LIGHTBUFFER),
            ("ZoneCubeMap", TextureUnit::ZONE),
            ("ZoneVolumeMap", TextureUnit::ZONE),
        ]);
        Self { names }
    }
}

impl TextureUnitNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<TextureUnit> {
        self.names.get(name).copied()
    }

    /// Resolve a shader variable name such as `tDiffMap` or `tCustom7`.
    ///
    /// Unknown names fall back to their first run of decimal digits. Returns
    /// `None` for names that resolve to no unit below [`MAX_TEXTURE_UNITS`].
    pub fn resolve(&self, variable_name: &str) -> Option<TextureUnit> {
        let name = variable_name.strip_prefix('t').unwrap_or(variable_name);

        let unit = match self.get(name) {
            Some(unit) => unit,
            None => TextureUnit(first_number(name)?),
        };

        (unit.index() < MAX_TEXTURE_UNITS).then_some(unit)
    }
}

fn first_number(name: &str) -> Option<u32> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits = &name[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

/// One replayable assignment of a texture unit to a binding variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUnitBinding {
    pub unit: TextureUnit,
    pub variable: VariableHandle,
}

/// Texture unit assignments of one resource binding, in VS then PS order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureUnitTable {
    entries: Vec<TextureUnitBinding>,
}

impl TextureUnitTable {
    pub fn entries(&self) -> &[TextureUnitBinding] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextureUnitBinding> {
        self.entries.iter()
    }
}

/// Builds the [`TextureUnitTable`] of a freshly created resource binding.
pub struct ResourceBindingResolver;

impl ResourceBindingResolver {
    pub fn resolve<B: GraphicsBackend>(
        backend: &B,
        binding: ResourceBindingHandle,
        names: &TextureUnitNames,
    ) -> TextureUnitTable {
        let mut entries = Vec::new();

        for stage in ShaderStage::ALL {
            for variable in backend.binding_variables(binding, stage) {
                match names.resolve(&variable.name) {
                    Some(unit) => entries.push(TextureUnitBinding {
                        unit,
                        variable: variable.variable,
                    }),
                    None => log::trace!(
                        "Texture variable {} of {:?} maps to no texture unit",
                        variable.name,
                        stage
                    ),
                }
            }
        }

        TextureUnitTable { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names() {
        let names = TextureUnitNames::new();
        assert_eq!(names.resolve("tDiffMap"), Some(TextureUnit::DIFFUSE));
        assert_eq!(names.resolve("tShadowMap"), Some(TextureUnit::SHADOWMAP));
        assert_eq!(names.resolve("tZoneVolumeMap"), Some(TextureUnit::ZONE));
        assert_eq!(names.resolve("LightBuffer"), Some(TextureUnit::LIGHTBUFFER));
    }

    #[test]
    fn test_numeric_fallback() {
        let names = TextureUnitNames::new();
        assert_eq!(names.resolve("tCustom7Map"), Some(TextureUnit(7)));
        assert_eq!(names.resolve("tUnit12"), Some(TextureUnit(12)));
        assert_eq!(names.resolve("tUnit16"), None);
        assert_eq!(names.resolve("tNoDigits"), None);
    }

    #[test]
    fn test_first_number() {
        assert_eq!(first_number("a12b34"), Some(12));
        assert_eq!(first_number("abc"), None);
    }
}
