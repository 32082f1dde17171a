//! 2D and cube textures, their views and data upload validation.

use std::sync::Arc;

use crate::backend::{
    AddressMode, CompareMode, FilterMode, GraphicsBackend, SamplerDescriptor, SamplerHandle,
    TextureDescriptor, TextureDimension, TextureFormat, TextureHandle, TextureRegion,
    TextureUsage, TextureViewDescriptor, TextureViewHandle, TextureViewKind,
};
use crate::error::{GraphicsError, GraphicsResult};

/// How a texture is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureUsageKind {
    #[default]
    Static,
    Dynamic,
    RenderTarget,
    DepthStencil,
}

/// Parameters for [`Texture::create`]
#[derive(Debug, Clone)]
pub struct Texture2DDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsageKind,
    /// Requested mip levels, 0 for a full chain
    pub levels: u32,
    pub sample_count: u32,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
    /// Depth comparison for shadow map sampling
    pub shadow_compare: bool,
}

impl Default for Texture2DDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsageKind::Static,
            levels: 1,
            sample_count: 1,
            filter: FilterMode::default(),
            address_mode: AddressMode::default(),
            shadow_compare: false,
        }
    }
}

/// Parameters for [`Texture::create_cube`]
#[derive(Debug, Clone)]
pub struct TextureCubeDescriptor {
    pub label: Option<String>,
    /// Width and height of every face
    pub size: u32,
    pub format: TextureFormat,
    pub usage: TextureUsageKind,
    pub levels: u32,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for TextureCubeDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsageKind::Static,
            levels: 1,
            filter: FilterMode::default(),
            address_mode: AddressMode::Clamp,
        }
    }
}

/// Cube map face, in array layer order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeMapFace {
    PositiveX = 0,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl CubeMapFace {
    pub const ALL: [CubeMapFace; 6] = [
        CubeMapFace::PositiveX,
        CubeMapFace::NegativeX,
        CubeMapFace::PositiveY,
        CubeMapFace::NegativeY,
        CubeMapFace::PositiveZ,
        CubeMapFace::NegativeZ,
    ];

    pub fn layer(&self) -> u32 {
        *self as u32
    }
}

/// A 2D or cube texture with its shader resource view, sampler and target views
#[derive(Debug)]
pub struct Texture {
    handle: TextureHandle,
    dimension: TextureDimension,
    width: u32,
    height: u32,
    levels: u32,
    format: TextureFormat,
    usage: TextureUsageKind,
    sample_count: u32,
    shader_resource_view: Option<TextureViewHandle>,
    sampler: SamplerHandle,
    render_target_view: Option<TextureViewHandle>,
    read_only_view: Option<TextureViewHandle>,
    backup: Option<Arc<Texture>>,
}

fn full_mip_chain(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

impl Texture {
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        desc: &Texture2DDescriptor,
    ) -> GraphicsResult<Self> {
        Self::create_with_dimension(backend, desc, TextureDimension::D2)
    }

    /// Create a cube texture. Faces are filled with [`Texture::set_face_data`].
    pub fn create_cube<B: GraphicsBackend>(
        backend: &mut B,
        desc: &TextureCubeDescriptor,
    ) -> GraphicsResult<Self> {
        if matches!(desc.usage, TextureUsageKind::RenderTarget | TextureUsageKind::DepthStencil) {
            log::error!("Cube textures can not be render targets or depth-stencil buffers");
            return Err(GraphicsError::InvalidParameter(format!(
                "cube texture usage {:?}",
                desc.usage
            )));
        }
        Self::create_with_dimension(
            backend,
            &Texture2DDescriptor {
                label: desc.label.clone(),
                width: desc.size,
                height: desc.size,
                format: desc.format,
                usage: desc.usage,
                levels: desc.levels,
                sample_count: 1,
                filter: desc.filter,
                address_mode: desc.address_mode,
                shadow_compare: false,
            },
            TextureDimension::Cube,
        )
    }

    fn create_with_dimension<B: GraphicsBackend>(
        backend: &mut B,
        desc: &Texture2DDescriptor,
        dimension: TextureDimension,
    ) -> GraphicsResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            log::error!("Zero texture dimensions");
            return Err(GraphicsError::InvalidParameter("zero texture dimensions".into()));
        }
        let is_depth = desc.usage == TextureUsageKind::DepthStencil;
        if is_depth != desc.format.is_depth() {
            log::error!("Texture format {:?} does not match usage {:?}", desc.format, desc.usage);
            return Err(GraphicsError::InvalidParameter(format!(
                "format {:?} incompatible with usage {:?}",
                desc.format, desc.usage
            )));
        }

        let max_levels = full_mip_chain(desc.width, desc.height);
        let levels = match desc.usage {
            TextureUsageKind::DepthStencil | TextureUsageKind::RenderTarget => 1,
            _ if desc.levels == 0 => max_levels,
            _ => desc.levels.min(max_levels),
        };
        let sample_count = if desc.usage == TextureUsageKind::Static || desc.usage == TextureUsageKind::Dynamic {
            1
        } else {
            desc.sample_count.max(1)
        };

        let mut usage = TextureUsage::TEXTURE_BINDING;
        match desc.usage {
            TextureUsageKind::Static | TextureUsageKind::Dynamic => usage |= TextureUsage::COPY_DST,
            TextureUsageKind::RenderTarget | TextureUsageKind::DepthStencil => {
                usage |= TextureUsage::RENDER_ATTACHMENT
            }
        }

        let handle = backend.create_texture(&TextureDescriptor {
            label: desc.label.clone(),
            width: desc.width,
            height: desc.height,
            dimension,
            mip_levels: levels,
            sample_count,
            format: desc.format,
            usage,
        })?;

        // Multisampled textures are only resolved, never sampled directly
        let shader_resource_view = if sample_count == 1 {
            Some(backend.create_texture_view(
                handle,
                &TextureViewDescriptor::new(TextureViewKind::ShaderResource),
            )?)
        } else {
            None
        };

        let (render_target_view, read_only_view) = match desc.usage {
            TextureUsageKind::RenderTarget => (
                Some(backend.create_texture_view(
                    handle,
                    &TextureViewDescriptor::new(TextureViewKind::RenderTarget),
                )?),
                None,
            ),
            TextureUsageKind::DepthStencil => (
                Some(backend.create_texture_view(
                    handle,
                    &TextureViewDescriptor::new(TextureViewKind::DepthStencil),
                )?),
                Some(backend.create_texture_view(
                    handle,
                    &TextureViewDescriptor::new(TextureViewKind::ReadOnlyDepthStencil),
                )?),
            ),
            _ => (None, None),
        };

        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: desc.label.clone(),
            filter: desc.filter,
            address_mode_u: desc.address_mode,
            address_mode_v: desc.address_mode,
            address_mode_w: desc.address_mode,
            compare: desc.shadow_compare.then_some(CompareMode::LessEqual),
        })?;

        log::debug!(
            "Created {:?} texture {:?} {}x{} {:?} ({} levels)",
            dimension,
            desc.label,
            desc.width,
            desc.height,
            desc.format,
            levels
        );

        Ok(Self {
            handle,
            dimension,
            width: desc.width,
            height: desc.height,
            levels,
            format: desc.format,
            usage: desc.usage,
            sample_count,
            shader_resource_view,
            sampler,
            render_target_view,
            read_only_view,
            backup: None,
        })
    }

    /// Upload a rectangle of pixels to one mip level of a 2D texture.
    ///
    /// Compressed formats have the region widened to cover whole 4x4 blocks.
    #[allow(clippy::too_many_arguments)]
    pub fn set_data<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> GraphicsResult<()> {
        if self.dimension != TextureDimension::D2 {
            log::error!("Cube texture data must be set per face");
            return Err(GraphicsError::InvalidParameter("texture is a cube map".into()));
        }
        self.write_region(backend, 0, level, x, y, width, height, data)
    }

    /// Upload a rectangle of pixels to one face and mip level of a cube texture.
    #[allow(clippy::too_many_arguments)]
    pub fn set_face_data<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        face: CubeMapFace,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> GraphicsResult<()> {
        if self.dimension != TextureDimension::Cube {
            log::error!("Face data can only be set on a cube texture");
            return Err(GraphicsError::InvalidParameter("texture is not a cube map".into()));
        }
        self.write_region(backend, face.layer(), level, x, y, width, height, data)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_region<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        layer: u32,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> GraphicsResult<()> {
        if data.is_empty() {
            log::error!("Null source for setting data");
            return Err(GraphicsError::EmptyData("texture".into()));
        }
        if matches!(self.usage, TextureUsageKind::RenderTarget | TextureUsageKind::DepthStencil) {
            log::error!("Can not set data on a render target or depth-stencil texture");
            return Err(GraphicsError::InvalidParameter("texture is not writable".into()));
        }
        if level >= self.levels {
            log::error!("Illegal mip level for setting data");
            return Err(GraphicsError::InvalidMipLevel {
                level,
                levels: self.levels,
            });
        }

        let level_width = self.level_width(level);
        let level_height = self.level_height(level);
        let (Some(right), Some(bottom)) = (x.checked_add(width), y.checked_add(height)) else {
            log::error!("Illegal dimensions for setting data");
            return Err(GraphicsError::InvalidRange(format!(
                "{}x{} at ({}, {}) overflows",
                width, height, x, y
            )));
        };
        if width == 0 || height == 0 || right > level_width || bottom > level_height {
            log::error!("Illegal dimensions for setting data");
            return Err(GraphicsError::InvalidRange(format!(
                "{}x{} at ({}, {}) outside {}x{} level {}",
                width, height, x, y, level_width, level_height, level
            )));
        }

        // Compressed levels are stored in whole blocks, so the widened region
        // stays inside the level rounded up to the block size.
        let (x, y, width, height) = if self.format.is_compressed() {
            let (x0, y0) = (x & !3, y & !3);
            let (x1, y1) = (right.next_multiple_of(4), bottom.next_multiple_of(4));
            (x0, y0, x1 - x0, y1 - y0)
        } else {
            (x, y, width, height)
        };

        let bytes_per_row = self.row_data_size(width);
        let rows = if self.format.is_compressed() { height.div_ceil(4) } else { height };
        let required = bytes_per_row as usize * rows as usize;
        if data.len() < required {
            log::error!("Texture data too short ({} < {} bytes)", data.len(), required);
            return Err(GraphicsError::InvalidRange(format!(
                "{} bytes supplied for {} byte region",
                data.len(),
                required
            )));
        }

        backend.write_texture(
            self.handle,
            &TextureRegion {
                mip_level: level,
                layer,
                x,
                y,
                width,
                height,
            },
            &data[..required],
            bytes_per_row,
        );
        Ok(())
    }

    /// Bytes in one row (one block row for compressed formats) of `width` pixels.
    pub fn row_data_size(&self, width: u32) -> u32 {
        if self.format.is_compressed() {
            width.div_ceil(4) * self.format.bytes_per_pixel()
        } else {
            width * self.format.bytes_per_pixel()
        }
    }

    pub fn level_width(&self, level: u32) -> u32 {
        if level >= self.levels {
            return 0;
        }
        (self.width >> level).max(1)
    }

    pub fn level_height(&self, level: u32) -> u32 {
        if level >= self.levels {
            return 0;
        }
        (self.height >> level).max(1)
    }

    /// Texture substituted when this one is bound as the active render target
    pub fn set_backup_texture(&mut self, backup: Option<Arc<Texture>>) {
        self.backup = backup;
    }

    pub fn backup_texture(&self) -> Option<&Arc<Texture>> {
        self.backup.as_ref()
    }

    pub fn release<B: GraphicsBackend>(self, backend: &mut B) {
        backend.destroy_texture(self.handle);
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn dimension(&self) -> TextureDimension {
        self.dimension
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsageKind {
        self.usage
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn shader_resource_view(&self) -> Option<TextureViewHandle> {
        self.shader_resource_view
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Color or depth-stencil target view
    pub fn render_target_view(&self) -> Option<TextureViewHandle> {
        self.render_target_view
    }

    /// Depth-stencil view usable while depth writes are off
    pub fn read_only_view(&self) -> Option<TextureViewHandle> {
        self.read_only_view
    }
}
