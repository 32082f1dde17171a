//! Common utilities for the draw path integration tests.
//!
//! Fixtures build a [`Graphics`] context on the recording dummy backend, with
//! a small shader pair, vertex buffers and textures.

#![allow(dead_code)]

use std::sync::Arc;

use pipeline_state_engine::backend::dummy::{BackendCall, DummyBackend};
use pipeline_state_engine::backend::{ShaderDescriptor, ShaderSource, ShaderStage};
use pipeline_state_engine::shader::{ShaderParameterGroup, ShaderReflection};
use pipeline_state_engine::vertex::{VertexElementSemantic, VertexElementType};
use pipeline_state_engine::{
    Graphics, ShaderVariation, Texture, Texture2DDescriptor, TextureUsageKind, VertexBuffer,
    VertexElement,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A context on the dummy backend with a 1280x720 backbuffer.
pub fn dummy_graphics() -> Graphics<DummyBackend> {
    init_logging();
    Graphics::new(DummyBackend::new())
}

pub fn shader(
    graphics: &mut Graphics<DummyBackend>,
    name: &str,
    stage: ShaderStage,
    reflection: ShaderReflection,
) -> Arc<ShaderVariation> {
    ShaderVariation::create(
        graphics.backend_mut(),
        name,
        ShaderDescriptor {
            label: Some(name.to_string()),
            stage,
            source: ShaderSource::Wgsl(String::new()),
            entry_point: "main".into(),
            reflection,
        },
    )
    .expect("dummy shader creation")
}

/// Vertex shader reading the camera and object parameter groups.
pub fn vertex_shader(graphics: &mut Graphics<DummyBackend>, name: &str) -> Arc<ShaderVariation> {
    shader(
        graphics,
        name,
        ShaderStage::Vertex,
        ShaderReflection::new()
            .with_constant_buffer(ShaderParameterGroup::Camera, "CameraVS", 64, 0, 0)
            .with_constant_buffer(ShaderParameterGroup::Object, "ObjectVS", 64, 0, 1)
            .with_parameter("ViewProj", ShaderParameterGroup::Camera, 0, 64)
            .with_parameter("Model", ShaderParameterGroup::Object, 0, 64),
    )
}

/// Pixel shader sampling the first five material texture units.
pub fn pixel_shader(graphics: &mut Graphics<DummyBackend>, name: &str) -> Arc<ShaderVariation> {
    shader(
        graphics,
        name,
        ShaderStage::Pixel,
        ShaderReflection::new()
            .with_constant_buffer(ShaderParameterGroup::Material, "MaterialPS", 16, 0, 2)
            .with_parameter("MatDiffColor", ShaderParameterGroup::Material, 0, 16)
            .with_texture("tDiffMap", 1, 0)
            .with_sampler("sDiffMap", 1, 1)
            .with_texture("tNormalMap", 1, 2)
            .with_sampler("sNormalMap", 1, 3)
            .with_texture("tSpecMap", 1, 4)
            .with_sampler("sSpecMap", 1, 5)
            .with_texture("tEmissiveMap", 1, 6)
            .with_sampler("sEmissiveMap", 1, 7)
            .with_texture("tEnvMap", 1, 8)
            .with_sampler("sEnvMap", 1, 9),
    )
}

/// Context with a linked shader pair bound.
pub fn graphics_with_shaders() -> Graphics<DummyBackend> {
    let mut graphics = dummy_graphics();
    let vs = vertex_shader(&mut graphics, "LitSolid");
    let ps = pixel_shader(&mut graphics, "LitSolid");
    graphics
        .set_shaders(Some(vs), Some(ps))
        .expect("shader pair links");
    graphics
}

pub fn vertex_buffer(
    graphics: &mut Graphics<DummyBackend>,
    vertex_count: u32,
    elements: &[VertexElement],
) -> VertexBuffer {
    let mut buffer = VertexBuffer::new(true);
    buffer
        .set_size(graphics.backend_mut(), vertex_count, elements, false)
        .expect("vertex buffer creation");
    let data = vec![0u8; (buffer.vertex_size() * vertex_count) as usize];
    buffer
        .set_data(graphics.backend_mut(), &data)
        .expect("vertex buffer upload");
    buffer
}

pub fn position_element() -> VertexElement {
    VertexElement::new(VertexElementType::Vector3, VertexElementSemantic::Position)
}

pub fn normal_element() -> VertexElement {
    VertexElement::new(VertexElementType::Vector3, VertexElementSemantic::Normal)
}

pub fn texture(graphics: &mut Graphics<DummyBackend>, label: &str) -> Arc<Texture> {
    Arc::new(
        Texture::create(
            graphics.backend_mut(),
            &Texture2DDescriptor {
                label: Some(label.to_string()),
                width: 4,
                height: 4,
                ..Default::default()
            },
        )
        .expect("texture creation"),
    )
}

pub fn depth_texture(graphics: &mut Graphics<DummyBackend>, width: u32, height: u32) -> Arc<Texture> {
    Arc::new(
        Texture::create(
            graphics.backend_mut(),
            &Texture2DDescriptor {
                label: Some("Depth".into()),
                width,
                height,
                format: pipeline_state_engine::TextureFormat::Depth24PlusStencil8,
                usage: TextureUsageKind::DepthStencil,
                ..Default::default()
            },
        )
        .expect("depth texture creation"),
    )
}

/// Number of recorded calls matching `predicate`.
pub fn count_calls(graphics: &Graphics<DummyBackend>, predicate: impl Fn(&BackendCall) -> bool) -> usize {
    graphics
        .backend()
        .calls()
        .iter()
        .filter(|call| predicate(call))
        .count()
}
