//! Headless rendering through the wgpu backend.
//!
//! Tests return early when no adapter is available on the machine.

#![cfg(feature = "wgpu-backend")]

mod common;

use std::sync::Arc;

use glam::Vec4;
use rstest::rstest;

use pipeline_state_engine::backend::{BlendMode, CullMode, IntRect, PrimitiveType, ShaderStage};
use pipeline_state_engine::{Graphics, GraphicsConfig, ShaderVariation, WgpuBackend};

const SIZE: u32 = 64;

const FULLSCREEN_VS: &str = r#"
@vertex
fn main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
}
"#;

const SOLID_PS: &str = r#"
struct MaterialPSBlock {
    cMatDiffColor: vec4<f32>,
}

@group(0) @binding(0) var<uniform> MaterialPS: MaterialPSBlock;

@fragment
fn main() -> @location(0) vec4<f32> {
    return MaterialPS.cMatDiffColor;
}
"#;

fn wgpu_graphics() -> Option<Graphics<WgpuBackend>> {
    common::init_logging();
    match WgpuBackend::new(&GraphicsConfig::default().with_size(SIZE, SIZE)) {
        Ok(backend) => Some(Graphics::new(backend)),
        Err(e) => {
            eprintln!("Skipping wgpu test: {}", e);
            None
        }
    }
}

fn solid_shaders(graphics: &mut Graphics<WgpuBackend>) {
    let vs = ShaderVariation::from_wgsl(
        graphics.backend_mut(),
        "Fullscreen",
        ShaderStage::Vertex,
        FULLSCREEN_VS,
        "main",
    )
    .unwrap();
    let ps = ShaderVariation::from_wgsl(
        graphics.backend_mut(),
        "Solid",
        ShaderStage::Pixel,
        SOLID_PS,
        "main",
    )
    .unwrap();
    graphics.set_shaders(Some(vs), Some(ps)).unwrap();
    graphics.set_cull_mode(CullMode::None);
}

fn pixel_at(pixels: &[u8], x: u32, y: u32) -> [u8; 4] {
    let index = ((y * SIZE + x) * 4) as usize;
    [
        pixels[index],
        pixels[index + 1],
        pixels[index + 2],
        pixels[index + 3],
    ]
}

fn center_pixel(pixels: &[u8]) -> [u8; 4] {
    pixel_at(pixels, SIZE / 2, SIZE / 2)
}

#[rstest]
#[case::red(Vec4::new(1.0, 0.0, 0.0, 1.0), [255, 0, 0, 255])]
#[case::green(Vec4::new(0.0, 1.0, 0.0, 1.0), [0, 255, 0, 255])]
#[case::white(Vec4::ONE, [255, 255, 255, 255])]
fn test_fullscreen_triangle_color(#[case] color: Vec4, #[case] expected: [u8; 4]) {
    let Some(mut graphics) = wgpu_graphics() else {
        return;
    };
    solid_shaders(&mut graphics);
    assert!(graphics.has_shader_parameter("MatDiffColor"));

    graphics.set_shader_parameter("MatDiffColor", &color);
    graphics
        .draw(PrimitiveType::TriangleList, 0, 3)
        .expect("draw succeeds");

    let pixels = graphics.backend_mut().read_backbuffer().unwrap();
    assert_eq!(pixels.len(), (SIZE * SIZE * 4) as usize);
    assert_eq!(center_pixel(&pixels), expected);
}

#[test]
fn test_repeated_draws_build_one_pipeline() {
    let Some(mut graphics) = wgpu_graphics() else {
        return;
    };
    solid_shaders(&mut graphics);
    graphics.set_shader_parameter("MatDiffColor", &Vec4::new(0.0, 0.0, 1.0, 1.0));

    for _ in 0..4 {
        graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
    }
    let first = graphics.preparer().current_pipeline().cloned().unwrap();
    assert_eq!(graphics.pipeline_cache().created_count(), 1);
    assert_eq!(graphics.stats().batches, 4);

    graphics.set_blend_mode(BlendMode::Add, false);
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
    assert_eq!(graphics.pipeline_cache().created_count(), 2);

    graphics.set_blend_mode(BlendMode::Replace, false);
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();
    assert_eq!(graphics.pipeline_cache().created_count(), 2);
    assert!(Arc::ptr_eq(
        &first,
        graphics.preparer().current_pipeline().unwrap()
    ));

    graphics.flush().unwrap();
}

#[test]
fn test_color_write_disabled_leaves_target_untouched() {
    let Some(mut graphics) = wgpu_graphics() else {
        return;
    };
    solid_shaders(&mut graphics);
    graphics.set_shader_parameter("MatDiffColor", &Vec4::ONE);
    graphics.set_color_write(false);
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();

    let pixels = graphics.backend_mut().read_backbuffer().unwrap();
    assert_eq!(center_pixel(&pixels), [0, 0, 0, 0]);
}

#[test]
fn test_draws_in_one_pass_keep_their_own_constants() {
    let Some(mut graphics) = wgpu_graphics() else {
        return;
    };
    solid_shaders(&mut graphics);
    let half = (SIZE / 2) as i32;

    graphics.set_viewport(IntRect::new(0, 0, half, SIZE as i32));
    graphics.set_shader_parameter("MatDiffColor", &Vec4::new(1.0, 0.0, 0.0, 1.0));
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();

    graphics.set_viewport(IntRect::new(half, 0, SIZE as i32, SIZE as i32));
    graphics.set_shader_parameter("MatDiffColor", &Vec4::new(0.0, 1.0, 0.0, 1.0));
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();

    let pixels = graphics.backend_mut().read_backbuffer().unwrap();
    assert_eq!(pixel_at(&pixels, SIZE / 4, SIZE / 2), [255, 0, 0, 255]);
    assert_eq!(pixel_at(&pixels, SIZE * 3 / 4, SIZE / 2), [0, 255, 0, 255]);
}

#[test]
fn test_later_constants_do_not_leak_into_earlier_draw() {
    let Some(mut graphics) = wgpu_graphics() else {
        return;
    };
    solid_shaders(&mut graphics);
    graphics.set_shader_parameter("MatDiffColor", &Vec4::new(1.0, 0.0, 0.0, 1.0));
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();

    graphics.set_color_write(false);
    graphics.set_shader_parameter("MatDiffColor", &Vec4::new(0.0, 1.0, 0.0, 1.0));
    graphics.draw(PrimitiveType::TriangleList, 0, 3).unwrap();

    let pixels = graphics.backend_mut().read_backbuffer().unwrap();
    assert_eq!(center_pixel(&pixels), [255, 0, 0, 255]);
}
