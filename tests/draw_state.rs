//! Draw path integration tests on the recording dummy backend.
//!
//! Each test drives [`Graphics`] through state setters and draws, then checks
//! which pipelines were built and which backend calls were issued.

mod common;

use std::sync::Arc;

use rstest::rstest;

use common::{
    count_calls, depth_texture, dummy_graphics, graphics_with_shaders, normal_element,
    pixel_shader, position_element, shader, texture, vertex_buffer, vertex_shader,
};
use pipeline_state_engine::backend::dummy::{BackendCall, DummyBackend};
use pipeline_state_engine::backend::{
    BlendMode, CompareMode, CullMode, FillMode, IntRect, PrimitiveType, ShaderStage, StencilOp,
};
use pipeline_state_engine::shader::{ResourceDimension, ShaderReflection};
use pipeline_state_engine::state::hasher::{blend_hash, depth_stencil_hash, rasterizer_hash};
use pipeline_state_engine::vertex::VertexElementSemantic;
use pipeline_state_engine::{
    DirtyFlags, Graphics, GraphicsError, StencilTest, Texture, Texture2DDescriptor,
    TextureCubeDescriptor, TextureUnit, TextureUsageKind,
};

fn draw(graphics: &mut Graphics<DummyBackend>) {
    graphics
        .draw(PrimitiveType::TriangleList, 0, 3)
        .expect("draw succeeds");
}

fn current_pipeline(graphics: &Graphics<DummyBackend>) -> Arc<pipeline_state_engine::CachedPipeline> {
    graphics
        .preparer()
        .current_pipeline()
        .cloned()
        .expect("a pipeline is bound")
}

#[rstest]
#[case::blend(|g: &mut Graphics<DummyBackend>| g.set_blend_mode(BlendMode::Add, false))]
#[case::color_write(|g: &mut Graphics<DummyBackend>| g.set_color_write(false))]
#[case::cull(|g: &mut Graphics<DummyBackend>| g.set_cull_mode(CullMode::Cw))]
#[case::depth_bias(|g: &mut Graphics<DummyBackend>| g.set_depth_bias(0.0001, 1.5))]
#[case::depth_test(|g: &mut Graphics<DummyBackend>| g.set_depth_test(CompareMode::Less))]
#[case::depth_write(|g: &mut Graphics<DummyBackend>| g.set_depth_write(false))]
#[case::fill(|g: &mut Graphics<DummyBackend>| g.set_fill_mode(FillMode::Wireframe))]
#[case::line_anti_alias(|g: &mut Graphics<DummyBackend>| g.set_line_anti_alias(true))]
#[case::scissor(|g: &mut Graphics<DummyBackend>| g.set_scissor_test(true, IntRect::new(10, 20, 100, 200)))]
#[case::stencil(|g: &mut Graphics<DummyBackend>| g.set_stencil_test(
    true,
    StencilTest {
        mode: CompareMode::Equal,
        pass: StencilOp::Ref,
        reference: 3,
        ..Default::default()
    },
))]
fn test_repeated_setter_raises_nothing(#[case] apply: fn(&mut Graphics<DummyBackend>)) {
    let mut graphics = graphics_with_shaders();
    draw(&mut graphics);
    assert!(graphics.dirty().is_empty());

    apply(&mut graphics);
    assert!(!graphics.dirty().is_empty());
    draw(&mut graphics);
    assert!(graphics.dirty().is_empty());

    apply(&mut graphics);
    assert_eq!(graphics.dirty(), DirtyFlags::empty());
}

#[test]
fn test_unchanged_state_reuses_pipeline() {
    let mut graphics = graphics_with_shaders();
    draw(&mut graphics);
    let first = current_pipeline(&graphics);

    draw(&mut graphics);
    let second = current_pipeline(&graphics);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(graphics.backend().pipelines_created(), 1);
    assert_eq!(graphics.pipeline_cache().created_count(), 1);
}

#[test]
fn test_equal_state_by_different_paths_shares_pipeline() {
    let mut graphics = graphics_with_shaders();
    draw(&mut graphics);

    graphics.set_blend_mode(BlendMode::Alpha, false);
    graphics.set_cull_mode(CullMode::Cw);
    draw(&mut graphics);
    let alpha_cw = current_pipeline(&graphics);
    assert_eq!(graphics.backend().pipelines_created(), 2);

    graphics.set_blend_mode(BlendMode::Replace, false);
    graphics.set_cull_mode(CullMode::Ccw);
    draw(&mut graphics);
    assert_eq!(graphics.backend().pipelines_created(), 2);

    // Same destination, opposite order
    graphics.set_cull_mode(CullMode::Cw);
    graphics.set_blend_mode(BlendMode::Alpha, false);
    draw(&mut graphics);
    assert_eq!(graphics.backend().pipelines_created(), 2);
    assert!(Arc::ptr_eq(&alpha_cw, &current_pipeline(&graphics)));
}

#[test]
fn test_disabling_depth_write_binds_read_only_view() {
    let mut graphics = graphics_with_shaders();
    let depth = depth_texture(&mut graphics, 1280, 720);
    graphics.set_depth_stencil(Some(depth.clone()));
    draw(&mut graphics);
    graphics.backend_mut().clear_calls();

    graphics.set_depth_write(false);
    assert!(graphics.dirty().contains(DirtyFlags::RENDER_TARGETS));
    draw(&mut graphics);

    let read_only = depth.read_only_view();
    assert!(read_only.is_some());
    assert!(graphics.backend().calls().iter().any(|call| matches!(
        call,
        BackendCall::SetRenderTargets { depth_stencil, .. } if *depth_stencil == read_only
    )));
}

#[test]
fn test_hashes_are_deterministic() {
    let mut graphics = graphics_with_shaders();
    graphics.set_blend_mode(BlendMode::PremulAlpha, true);
    graphics.set_depth_bias(0.00002, 2.0);
    graphics.set_stencil_test(
        true,
        StencilTest {
            mode: CompareMode::NotEqual,
            fail: StencilOp::Zero,
            ..Default::default()
        },
    );
    draw(&mut graphics);

    let state = graphics.state().clone();
    assert_eq!(blend_hash(&state), blend_hash(&state));
    assert_eq!(depth_stencil_hash(&state), depth_stencil_hash(&state));
    assert_eq!(rasterizer_hash(&state, 24), rasterizer_hash(&state, 24));

    let preparer = graphics.preparer();
    assert_eq!(preparer.blend_hash(), blend_hash(&state));
    assert_eq!(preparer.depth_hash(), depth_stencil_hash(&state));
    assert_eq!(preparer.rasterizer_hash(), rasterizer_hash(&state, 24));
}

#[test]
fn test_higher_slot_overrides_vertex_element() {
    let mut graphics = graphics_with_shaders();
    let positions = vertex_buffer(&mut graphics, 3, &[position_element()]);
    let normals_then_positions =
        vertex_buffer(&mut graphics, 3, &[normal_element(), position_element()]);

    graphics
        .set_vertex_buffers(&[&positions, &normals_then_positions], 0)
        .unwrap();
    draw(&mut graphics);

    let pipeline = current_pipeline(&graphics);
    let desc = graphics
        .backend()
        .pipeline_descriptor(pipeline.pipeline)
        .unwrap();
    let position_entries: Vec<_> = desc
        .input_layout
        .elements
        .iter()
        .filter(|e| e.semantic == VertexElementSemantic::Position && e.semantic_index == 0)
        .collect();

    assert_eq!(position_entries.len(), 1);
    assert_eq!(position_entries[0].buffer_slot, 1);
    assert_eq!(position_entries[0].offset, 12);
    assert_eq!(desc.input_layout.strides, vec![12, 24]);
}

#[test]
fn test_blend_change_builds_one_pipeline() {
    let mut graphics = graphics_with_shaders();
    draw(&mut graphics);
    assert_eq!(graphics.preparer().blend_hash(), 1);
    let created = graphics.backend().pipelines_created();

    graphics.set_blend_mode(BlendMode::Replace, false);
    graphics.set_blend_mode(BlendMode::Add, false);
    assert!(graphics.dirty().contains(DirtyFlags::BLEND));
    draw(&mut graphics);

    assert_eq!(graphics.preparer().blend_hash(), 1 | (BlendMode::Add as u32) << 2);
    assert_eq!(graphics.preparer().blend_hash(), 5);
    assert_eq!(graphics.backend().pipelines_created(), created + 1);
}

#[test]
fn test_returning_to_shader_pair_reuses_pipeline() {
    let mut graphics = dummy_graphics();
    let vs1 = vertex_shader(&mut graphics, "VS1");
    let ps1 = pixel_shader(&mut graphics, "PS1");
    let ps2 = pixel_shader(&mut graphics, "PS2");

    graphics.set_shaders(Some(vs1.clone()), Some(ps1.clone())).unwrap();
    draw(&mut graphics);
    let first = current_pipeline(&graphics);

    graphics.set_shaders(Some(vs1.clone()), Some(ps2)).unwrap();
    draw(&mut graphics);
    let second = current_pipeline(&graphics);
    assert!(!Arc::ptr_eq(&first, &second));

    graphics.set_shaders(Some(vs1), Some(ps1)).unwrap();
    draw(&mut graphics);

    assert_eq!(graphics.backend().pipelines_created(), 2);
    assert!(Arc::ptr_eq(&first, &current_pipeline(&graphics)));
}

#[test]
fn test_only_changed_texture_unit_is_rebound() {
    let mut graphics = graphics_with_shaders();
    let textures: Vec<Arc<Texture>> = (0..5)
        .map(|i| texture(&mut graphics, &format!("Texture{}", i)))
        .collect();
    for (unit, t) in textures.iter().enumerate() {
        graphics.set_texture(unit, Some(t.clone()));
    }
    draw(&mut graphics);

    // Freshly built pipeline receives the whole table
    assert_eq!(
        count_calls(&graphics, |c| matches!(c, BackendCall::SetBindingVariable { .. })),
        5
    );

    let replacement = texture(&mut graphics, "Replacement");
    graphics.backend_mut().clear_calls();
    graphics.set_texture(3, Some(replacement.clone()));
    draw(&mut graphics);

    let rebinds: Vec<_> = graphics
        .backend()
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::SetBindingVariable { view, .. } => Some(*view),
            _ => None,
        })
        .collect();
    assert_eq!(rebinds, vec![replacement.shader_resource_view().unwrap()]);
    assert_eq!(graphics.backend().pipelines_created(), 1);
}

#[test]
fn test_failed_pipeline_is_retried() {
    let mut graphics = graphics_with_shaders();
    graphics.backend_mut().set_fail_pipeline_creation(true);

    let result = graphics.draw(PrimitiveType::TriangleList, 0, 3);
    assert!(matches!(result, Err(GraphicsError::PipelineCreationFailed(_))));
    assert_eq!(graphics.stats().batches, 0);
    assert!(graphics.preparer().current_pipeline().is_none());
    assert!(graphics.pipeline_cache().is_empty());

    graphics.backend_mut().set_fail_pipeline_creation(false);
    draw(&mut graphics);
    assert_eq!(graphics.stats().batches, 1);
    assert_eq!(graphics.pipeline_cache().len(), 1);
}

#[test]
fn test_render_target_switch_sets_viewport_and_drops_default_depth() {
    let mut graphics = graphics_with_shaders();
    let target = Arc::new(
        Texture::create(
            graphics.backend_mut(),
            &Texture2DDescriptor {
                label: Some("Offscreen".into()),
                width: 256,
                height: 128,
                usage: TextureUsageKind::RenderTarget,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    draw(&mut graphics);
    let backbuffer_pipeline = current_pipeline(&graphics);
    graphics.backend_mut().clear_calls();

    graphics.set_render_target(0, Some(target.clone()));
    graphics.set_viewport(IntRect::new(0, 0, 1024, 1024));
    assert_eq!(graphics.state().viewport, IntRect::new(0, 0, 256, 128));
    draw(&mut graphics);

    let calls = graphics.backend().calls();
    assert!(calls.contains(&BackendCall::SetRenderTargets {
        colors: vec![target.render_target_view()],
        depth_stencil: None,
    }));
    assert!(calls.contains(&BackendCall::SetViewport(IntRect::new(0, 0, 256, 128))));
    // Target formats are part of the key
    assert!(!Arc::ptr_eq(&backbuffer_pipeline, &current_pipeline(&graphics)));
}

#[test]
fn test_scissor_and_stencil_reference_pushed_without_new_pipeline() {
    let mut graphics = graphics_with_shaders();
    graphics.set_scissor_test(true, IntRect::new(10, 20, 100, 200));
    graphics.set_stencil_test(
        true,
        StencilTest {
            reference: 1,
            ..Default::default()
        },
    );
    draw(&mut graphics);
    assert!(graphics
        .backend()
        .calls()
        .contains(&BackendCall::SetScissorRect(IntRect::new(10, 20, 100, 200))));
    let created = graphics.backend().pipelines_created();

    graphics.backend_mut().clear_calls();
    graphics.set_stencil_test(
        true,
        StencilTest {
            reference: 7,
            ..Default::default()
        },
    );
    draw(&mut graphics);

    assert!(graphics
        .backend()
        .calls()
        .contains(&BackendCall::SetStencilReference(7)));
    assert_eq!(graphics.backend().pipelines_created(), created);
}

#[test]
fn test_release_pipelines_rebuilds_on_next_draw() {
    let mut graphics = graphics_with_shaders();
    draw(&mut graphics);
    assert_eq!(graphics.backend().live_pipelines(), 1);

    graphics.release_pipelines();
    assert_eq!(graphics.backend().live_pipelines(), 0);
    assert!(graphics.preparer().current_pipeline().is_none());

    draw(&mut graphics);
    assert_eq!(graphics.backend().live_pipelines(), 1);
    assert_eq!(graphics.backend().pipelines_created(), 2);
}

#[test]
fn test_cube_texture_binds_to_environment_unit() {
    let mut graphics = dummy_graphics();
    let vs = vertex_shader(&mut graphics, "Skybox");
    let ps = shader(
        &mut graphics,
        "Skybox",
        ShaderStage::Pixel,
        ShaderReflection::new()
            .with_texture_dimension("tEnvCubeMap", ResourceDimension::Cube, 1, 0)
            .with_sampler("sEnvCubeMap", 1, 1),
    );
    graphics.set_shaders(Some(vs), Some(ps)).unwrap();

    let cube = Arc::new(
        Texture::create_cube(
            graphics.backend_mut(),
            &TextureCubeDescriptor {
                label: Some("Sky".into()),
                size: 16,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    graphics.set_texture(TextureUnit::ENVIRONMENT.index(), Some(cube.clone()));
    draw(&mut graphics);

    let views: Vec<_> = graphics
        .backend()
        .calls()
        .iter()
        .filter_map(|c| match c {
            BackendCall::SetBindingVariable { view, .. } => Some(*view),
            _ => None,
        })
        .collect();
    assert_eq!(views, vec![cube.shader_resource_view().unwrap()]);
}
