//! Current render state and per-category dirty tracking.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::{BlendMode, CompareMode, CullMode, FillMode, IntRect, PrimitiveType, StencilOp};
use crate::shader::ShaderVariation;
use crate::texture::Texture;
use crate::vertex::VertexStream;
use crate::{MAX_RENDERTARGETS, MAX_TEXTURE_UNITS, MAX_VERTEX_STREAMS};

bitflags! {
    /// State categories changed since they were last resolved
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const BLEND = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const RASTERIZER = 1 << 2;
        const VERTEX_DECLARATION = 1 << 3;
        const VERTEX_SHADER = 1 << 4;
        const PIXEL_SHADER = 1 << 5;
        const PRIMITIVE_TYPE = 1 << 6;
        const RENDER_TARGETS = 1 << 7;
        const TEXTURES = 1 << 8;
        const SCISSOR_RECT = 1 << 9;
        const STENCIL_REF = 1 << 10;

        /// Categories that feed the pipeline key
        const PIPELINE = Self::BLEND.bits()
            | Self::DEPTH_STENCIL.bits()
            | Self::RASTERIZER.bits()
            | Self::VERTEX_DECLARATION.bits()
            | Self::VERTEX_SHADER.bits()
            | Self::PIXEL_SHADER.bits()
            | Self::PRIMITIVE_TYPE.bits();
    }
}

/// Inclusive range of dirty slot indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRange {
    pub first: usize,
    pub last: usize,
}

impl DirtyRange {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.first && index <= self.last
    }
}

fn extend_range(range: &mut Option<DirtyRange>, index: usize) {
    *range = Some(match *range {
        None => DirtyRange {
            first: index,
            last: index,
        },
        Some(r) => DirtyRange {
            first: r.first.min(index),
            last: r.last.max(index),
        },
    });
}

fn same_texture(a: &Option<Arc<Texture>>, b: &Option<Arc<Texture>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_shader(a: &Option<Arc<ShaderVariation>>, b: &Option<Arc<ShaderVariation>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id() == b.id(),
        (None, None) => true,
        _ => false,
    }
}

/// Every independent render state field
#[derive(Debug, Clone)]
pub struct RenderState {
    pub blend_mode: BlendMode,
    pub alpha_to_coverage: bool,
    pub color_write: bool,
    pub cull_mode: CullMode,
    pub fill_mode: FillMode,
    pub depth_test_mode: CompareMode,
    pub depth_write: bool,
    pub line_anti_alias: bool,
    pub constant_depth_bias: f32,
    pub slope_scaled_depth_bias: f32,
    pub stencil_test: bool,
    pub stencil_test_mode: CompareMode,
    pub stencil_pass: StencilOp,
    pub stencil_fail: StencilOp,
    pub stencil_z_fail: StencilOp,
    pub stencil_ref: u32,
    pub stencil_compare_mask: u32,
    pub stencil_write_mask: u32,
    pub scissor_test: bool,
    pub scissor_rect: IntRect,
    pub primitive_type: PrimitiveType,
    pub vertex_shader: Option<Arc<ShaderVariation>>,
    pub pixel_shader: Option<Arc<ShaderVariation>>,
    pub vertex_buffers: [Option<VertexStream>; MAX_VERTEX_STREAMS],
    pub textures: [Option<Arc<Texture>>; MAX_TEXTURE_UNITS],
    pub render_targets: [Option<Arc<Texture>>; MAX_RENDERTARGETS],
    pub depth_stencil: Option<Arc<Texture>>,
    pub viewport: IntRect,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::Replace,
            alpha_to_coverage: false,
            color_write: true,
            cull_mode: CullMode::Ccw,
            fill_mode: FillMode::Solid,
            depth_test_mode: CompareMode::LessEqual,
            depth_write: true,
            line_anti_alias: false,
            constant_depth_bias: 0.0,
            slope_scaled_depth_bias: 0.0,
            stencil_test: false,
            stencil_test_mode: CompareMode::Always,
            stencil_pass: StencilOp::Keep,
            stencil_fail: StencilOp::Keep,
            stencil_z_fail: StencilOp::Keep,
            stencil_ref: 0,
            stencil_compare_mask: u32::MAX,
            stencil_write_mask: u32::MAX,
            scissor_test: false,
            scissor_rect: IntRect::ZERO,
            primitive_type: PrimitiveType::TriangleList,
            vertex_shader: None,
            pixel_shader: None,
            vertex_buffers: Default::default(),
            textures: Default::default(),
            render_targets: Default::default(),
            depth_stencil: None,
            viewport: IntRect::ZERO,
        }
    }
}

/// Stencil test parameters for [`StateFieldTracker::set_stencil_test`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilTest {
    pub mode: CompareMode,
    pub pass: StencilOp,
    pub fail: StencilOp,
    pub z_fail: StencilOp,
    pub reference: u32,
    pub compare_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilTest {
    fn default() -> Self {
        Self {
            mode: CompareMode::Always,
            pass: StencilOp::Keep,
            fail: StencilOp::Keep,
            z_fail: StencilOp::Keep,
            reference: 0,
            compare_mask: u32::MAX,
            write_mask: u32::MAX,
        }
    }
}

/// Owns the [`RenderState`] and raises [`DirtyFlags`] when a setter changes it.
///
/// Setters never touch the GPU. A setter called with the stored value is a no-op.
#[derive(Debug)]
pub struct StateFieldTracker {
    state: RenderState,
    dirty: DirtyFlags,
    dirty_textures: Option<DirtyRange>,
    dirty_vertex_buffers: Option<DirtyRange>,
    backbuffer_size: (u32, u32),
}

impl StateFieldTracker {
    pub fn new(backbuffer_width: u32, backbuffer_height: u32) -> Self {
        let viewport = IntRect::new(0, 0, backbuffer_width as i32, backbuffer_height as i32);
        Self {
            state: RenderState {
                viewport,
                ..Default::default()
            },
            dirty: DirtyFlags::all(),
            dirty_textures: None,
            dirty_vertex_buffers: None,
            backbuffer_size: (backbuffer_width, backbuffer_height),
        }
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.intersects(flags)
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty.remove(flags);
    }

    pub fn dirty_textures(&self) -> Option<DirtyRange> {
        self.dirty_textures
    }

    /// Clear the texture flag and its range
    pub fn clear_dirty_textures(&mut self) {
        self.dirty_textures = None;
        self.dirty.remove(DirtyFlags::TEXTURES);
    }

    /// Take and clear the dirty vertex buffer range
    pub fn take_dirty_vertex_buffers(&mut self) -> Option<DirtyRange> {
        self.dirty_vertex_buffers.take()
    }

    pub fn set_backbuffer_size(&mut self, width: u32, height: u32) {
        self.backbuffer_size = (width, height);
    }

    /// Size of the current color target, the depth-stencil if no color target
    /// is bound, or the backbuffer.
    pub fn render_target_dimensions(&self) -> (i32, i32) {
        let (w, h) = if let Some(rt) = &self.state.render_targets[0] {
            (rt.width(), rt.height())
        } else if let Some(ds) = &self.state.depth_stencil {
            (ds.width(), ds.height())
        } else {
            self.backbuffer_size
        };
        (w as i32, h as i32)
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode, alpha_to_coverage: bool) {
        if mode != self.state.blend_mode || alpha_to_coverage != self.state.alpha_to_coverage {
            self.state.blend_mode = mode;
            self.state.alpha_to_coverage = alpha_to_coverage;
            self.dirty |= DirtyFlags::BLEND;
        }
    }

    pub fn set_color_write(&mut self, enable: bool) {
        if enable != self.state.color_write {
            self.state.color_write = enable;
            self.dirty |= DirtyFlags::BLEND;
        }
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        if mode != self.state.cull_mode {
            self.state.cull_mode = mode;
            self.dirty |= DirtyFlags::RASTERIZER;
        }
    }

    pub fn set_depth_bias(&mut self, constant_bias: f32, slope_scaled_bias: f32) {
        if constant_bias != self.state.constant_depth_bias
            || slope_scaled_bias != self.state.slope_scaled_depth_bias
        {
            self.state.constant_depth_bias = constant_bias;
            self.state.slope_scaled_depth_bias = slope_scaled_bias;
            self.dirty |= DirtyFlags::RASTERIZER;
        }
    }

    pub fn set_depth_test(&mut self, mode: CompareMode) {
        if mode != self.state.depth_test_mode {
            self.state.depth_test_mode = mode;
            self.dirty |= DirtyFlags::DEPTH_STENCIL;
        }
    }

    /// Also dirties render targets: a read-only depth view may be bound while
    /// depth writes are off.
    pub fn set_depth_write(&mut self, enable: bool) {
        if enable != self.state.depth_write {
            self.state.depth_write = enable;
            self.dirty |= DirtyFlags::DEPTH_STENCIL | DirtyFlags::RENDER_TARGETS;
        }
    }

    pub fn set_fill_mode(&mut self, mode: FillMode) {
        if mode != self.state.fill_mode {
            self.state.fill_mode = mode;
            self.dirty |= DirtyFlags::RASTERIZER;
        }
    }

    pub fn set_line_anti_alias(&mut self, enable: bool) {
        if enable != self.state.line_anti_alias {
            self.state.line_anti_alias = enable;
            self.dirty |= DirtyFlags::RASTERIZER;
        }
    }

    /// Enable or disable the scissor test.
    ///
    /// `rect` is relative to the viewport origin and is clamped to the render
    /// target. A rect that is inverted after clamping disables the test.
    pub fn set_scissor_test(&mut self, enable: bool, rect: IntRect) {
        let mut enable = enable;
        if enable {
            let (rt_width, rt_height) = self.render_target_dimensions();
            let view = self.state.viewport;
            let mut clamped = IntRect {
                left: (rect.left + view.left).clamp(0, (rt_width - 1).max(0)),
                top: (rect.top + view.top).clamp(0, (rt_height - 1).max(0)),
                right: (rect.right + view.left).clamp(0, rt_width),
                bottom: (rect.bottom + view.top).clamp(0, rt_height),
            };
            if clamped.right == clamped.left {
                clamped.right += 1;
            }
            if clamped.bottom == clamped.top {
                clamped.bottom += 1;
            }

            if clamped.right < clamped.left || clamped.bottom < clamped.top {
                enable = false;
            }
            if enable && clamped != self.state.scissor_rect {
                self.state.scissor_rect = clamped;
                self.dirty |= DirtyFlags::SCISSOR_RECT;
            }
        }

        if enable != self.state.scissor_test {
            self.state.scissor_test = enable;
            self.dirty |= DirtyFlags::RASTERIZER;
        }
    }

    /// Enable or disable the stencil test. The remaining parameters are only
    /// compared and stored while the test is enabled.
    pub fn set_stencil_test(&mut self, enable: bool, test: StencilTest) {
        if enable != self.state.stencil_test {
            self.state.stencil_test = enable;
            self.dirty |= DirtyFlags::DEPTH_STENCIL;
        }
        if !enable {
            return;
        }

        let state = &mut self.state;
        if test.mode != state.stencil_test_mode
            || test.pass != state.stencil_pass
            || test.fail != state.stencil_fail
            || test.z_fail != state.stencil_z_fail
            || test.compare_mask != state.stencil_compare_mask
            || test.write_mask != state.stencil_write_mask
        {
            state.stencil_test_mode = test.mode;
            state.stencil_pass = test.pass;
            state.stencil_fail = test.fail;
            state.stencil_z_fail = test.z_fail;
            state.stencil_compare_mask = test.compare_mask;
            state.stencil_write_mask = test.write_mask;
            self.dirty |= DirtyFlags::DEPTH_STENCIL;
        }
        if test.reference != state.stencil_ref {
            state.stencil_ref = test.reference;
            self.dirty |= DirtyFlags::STENCIL_REF | DirtyFlags::DEPTH_STENCIL;
        }
    }

    pub fn set_primitive_type(&mut self, primitive_type: PrimitiveType) {
        if primitive_type != self.state.primitive_type {
            self.state.primitive_type = primitive_type;
            self.dirty |= DirtyFlags::PRIMITIVE_TYPE;
        }
    }

    /// Set the shader pair. A vertex shader change also dirties the vertex
    /// declaration, since input layouts are validated against it.
    pub fn set_shaders(
        &mut self,
        vertex_shader: Option<Arc<ShaderVariation>>,
        pixel_shader: Option<Arc<ShaderVariation>>,
    ) {
        if !same_shader(&vertex_shader, &self.state.vertex_shader) {
            self.state.vertex_shader = vertex_shader;
            self.dirty |= DirtyFlags::VERTEX_SHADER | DirtyFlags::VERTEX_DECLARATION;
        }
        if !same_shader(&pixel_shader, &self.state.pixel_shader) {
            self.state.pixel_shader = pixel_shader;
            self.dirty |= DirtyFlags::PIXEL_SHADER;
        }
    }

    /// Bind vertex streams to slots `0..streams.len()` and unbind the rest.
    pub fn set_vertex_buffers(&mut self, streams: &[Option<VertexStream>]) {
        for slot in 0..MAX_VERTEX_STREAMS {
            let stream = streams.get(slot).cloned().flatten();
            if stream != self.state.vertex_buffers[slot] {
                self.state.vertex_buffers[slot] = stream;
                extend_range(&mut self.dirty_vertex_buffers, slot);
                self.dirty |= DirtyFlags::VERTEX_DECLARATION;
            }
        }
    }

    /// Bind a texture to a unit. Out of range units are ignored. The current
    /// first render target is replaced by its backup texture, or unbound.
    pub fn set_texture(&mut self, unit: usize, texture: Option<Arc<Texture>>) {
        if unit >= MAX_TEXTURE_UNITS {
            return;
        }
        let texture = match (texture, &self.state.render_targets[0]) {
            (Some(t), Some(target)) if Arc::ptr_eq(&t, target) => t.backup_texture().cloned(),
            (texture, _) => texture,
        };
        if !same_texture(&texture, &self.state.textures[unit]) {
            self.state.textures[unit] = texture;
            extend_range(&mut self.dirty_textures, unit);
            self.dirty |= DirtyFlags::TEXTURES;
        }
    }

    /// Set a color render target. Any texture unit sampling the same texture
    /// is switched to its backup texture, or unbound.
    pub fn set_render_target(&mut self, index: usize, texture: Option<Arc<Texture>>) {
        if index >= MAX_RENDERTARGETS {
            return;
        }
        if same_texture(&texture, &self.state.render_targets[index]) {
            return;
        }

        if let Some(target) = &texture {
            for unit in 0..MAX_TEXTURE_UNITS {
                let aliased = self.state.textures[unit]
                    .as_ref()
                    .is_some_and(|t| Arc::ptr_eq(t, target));
                if aliased {
                    self.set_texture(unit, target.backup_texture().cloned());
                }
            }
        }

        self.state.render_targets[index] = texture;
        self.dirty |= DirtyFlags::RENDER_TARGETS;
    }

    /// Also dirties the rasterizer: the constant bias scale depends on the
    /// depth format.
    pub fn set_depth_stencil(&mut self, texture: Option<Arc<Texture>>) {
        if !same_texture(&texture, &self.state.depth_stencil) {
            self.state.depth_stencil = texture;
            self.dirty |= DirtyFlags::RENDER_TARGETS | DirtyFlags::RASTERIZER;
        }
    }

    /// Set the viewport, clamped to the render target. Disables the scissor test.
    pub fn set_viewport(&mut self, rect: IntRect) {
        let (rt_width, rt_height) = self.render_target_dimensions();
        let mut viewport = rect;
        if viewport.right <= viewport.left {
            viewport.right = viewport.left + 1;
        }
        if viewport.bottom <= viewport.top {
            viewport.bottom = viewport.top + 1;
        }
        viewport.left = viewport.left.clamp(0, rt_width);
        viewport.top = viewport.top.clamp(0, rt_height);
        viewport.right = viewport.right.clamp(0, rt_width);
        viewport.bottom = viewport.bottom.clamp(0, rt_height);

        self.state.viewport = viewport;
        self.set_scissor_test(false, IntRect::ZERO);
    }

    /// Reset the viewport to cover the whole render target.
    pub fn reset_viewport(&mut self) {
        let (w, h) = self.render_target_dimensions();
        self.set_viewport(IntRect::new(0, 0, w, h));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::texture::{Texture2DDescriptor, TextureUsageKind};

    fn tracker() -> StateFieldTracker {
        let mut tracker = StateFieldTracker::new(800, 600);
        tracker.clear_dirty(DirtyFlags::all());
        tracker
    }

    #[test]
    fn test_no_op_setters_raise_nothing() {
        let mut tracker = tracker();
        tracker.set_blend_mode(BlendMode::Replace, false);
        tracker.set_color_write(true);
        tracker.set_cull_mode(CullMode::Ccw);
        tracker.set_depth_bias(0.0, 0.0);
        tracker.set_depth_test(CompareMode::LessEqual);
        tracker.set_depth_write(true);
        tracker.set_fill_mode(FillMode::Solid);
        tracker.set_line_anti_alias(false);
        tracker.set_primitive_type(PrimitiveType::TriangleList);
        tracker.set_stencil_test(false, StencilTest::default());
        tracker.set_shaders(None, None);
        tracker.set_texture(0, None);
        assert!(tracker.dirty().is_empty());
        assert!(tracker.dirty_textures().is_none());
    }

    #[test]
    fn test_setters_raise_their_category() {
        let mut tracker = tracker();
        tracker.set_blend_mode(BlendMode::Add, false);
        assert_eq!(tracker.dirty(), DirtyFlags::BLEND);

        let mut tracker = self::tracker();
        tracker.set_cull_mode(CullMode::None);
        assert_eq!(tracker.dirty(), DirtyFlags::RASTERIZER);

        let mut tracker = self::tracker();
        tracker.set_depth_test(CompareMode::Always);
        assert_eq!(tracker.dirty(), DirtyFlags::DEPTH_STENCIL);
    }

    #[test]
    fn test_depth_write_dirties_render_targets() {
        let mut tracker = tracker();
        tracker.set_depth_write(false);
        assert!(tracker.is_dirty(DirtyFlags::RENDER_TARGETS));
        assert!(tracker.is_dirty(DirtyFlags::DEPTH_STENCIL));
    }

    #[test]
    fn test_stencil_fields_ignored_while_disabled() {
        let mut tracker = tracker();
        let test = StencilTest {
            mode: CompareMode::Equal,
            reference: 3,
            ..Default::default()
        };
        tracker.set_stencil_test(false, test);
        assert!(tracker.dirty().is_empty());
        assert_eq!(tracker.state().stencil_ref, 0);

        tracker.set_stencil_test(true, test);
        assert!(tracker.is_dirty(DirtyFlags::STENCIL_REF));
        assert_eq!(tracker.state().stencil_test_mode, CompareMode::Equal);

        tracker.clear_dirty(DirtyFlags::all());
        tracker.set_stencil_test(true, StencilTest { reference: 4, ..test });
        assert_eq!(tracker.dirty(), DirtyFlags::STENCIL_REF | DirtyFlags::DEPTH_STENCIL);
    }

    #[test]
    fn test_scissor_is_offset_and_clamped() {
        let mut tracker = tracker();
        tracker.set_viewport(IntRect::new(100, 50, 800, 600));
        tracker.clear_dirty(DirtyFlags::all());

        tracker.set_scissor_test(true, IntRect::new(10, 10, 900, 20));
        assert_eq!(tracker.state().scissor_rect, IntRect::new(110, 60, 800, 70));
        assert!(tracker.state().scissor_test);
        assert_eq!(tracker.dirty(), DirtyFlags::SCISSOR_RECT | DirtyFlags::RASTERIZER);

        tracker.clear_dirty(DirtyFlags::all());
        tracker.set_scissor_test(true, IntRect::new(10, 10, 900, 20));
        assert!(tracker.dirty().is_empty());
    }

    #[test]
    fn test_zero_size_scissor_widened() {
        let mut tracker = tracker();
        tracker.set_scissor_test(true, IntRect::new(5, 5, 5, 5));
        assert_eq!(tracker.state().scissor_rect, IntRect::new(5, 5, 6, 6));
    }

    #[test]
    fn test_inverted_scissor_disables_test() {
        let mut tracker = tracker();
        tracker.set_scissor_test(true, IntRect::new(50, 50, 10, 10));
        assert!(!tracker.state().scissor_test);
        assert!(tracker.dirty().is_empty());
    }

    #[test]
    fn test_viewport_clamped_and_disables_scissor() {
        let mut tracker = tracker();
        tracker.set_scissor_test(true, IntRect::new(0, 0, 10, 10));
        tracker.set_viewport(IntRect::new(-10, 20, 2000, 20));
        assert_eq!(tracker.state().viewport, IntRect::new(0, 20, 800, 21));
        assert!(!tracker.state().scissor_test);
    }

    fn render_target(backend: &mut DummyBackend, label: &str) -> Texture {
        Texture::create(
            backend,
            &Texture2DDescriptor {
                label: Some(label.into()),
                width: 64,
                height: 64,
                usage: TextureUsageKind::RenderTarget,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_current_render_target_not_sampled() {
        let mut backend = DummyBackend::new();
        let backup = Arc::new(render_target(&mut backend, "Backup"));
        let mut target = render_target(&mut backend, "Target");
        target.set_backup_texture(Some(backup.clone()));
        let target = Arc::new(target);
        let plain = Arc::new(render_target(&mut backend, "Plain"));

        let mut tracker = tracker();
        tracker.set_render_target(0, Some(target.clone()));
        tracker.set_texture(0, Some(target.clone()));
        let bound = tracker.state().textures[0].as_ref().unwrap();
        assert!(Arc::ptr_eq(bound, &backup));

        tracker.set_render_target(0, Some(plain.clone()));
        tracker.set_texture(1, Some(plain.clone()));
        assert!(tracker.state().textures[1].is_none());

        // Only the first target is substituted
        tracker.set_render_target(1, Some(target.clone()));
        tracker.set_texture(2, Some(target.clone()));
        assert!(Arc::ptr_eq(tracker.state().textures[2].as_ref().unwrap(), &target));
    }

    #[test]
    fn test_texture_range_tracking() {
        let mut tracker = tracker();
        tracker.set_texture(3, None);
        assert!(tracker.dirty_textures().is_none());

        tracker.set_texture(MAX_TEXTURE_UNITS, None);
        assert!(tracker.dirty().is_empty());
    }
}
