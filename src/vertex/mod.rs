//! Vertex data: element descriptions, buffers and input layout resolution.

mod buffer;
mod element;
mod layout;

pub use buffer::{IndexBuffer, VertexBuffer, VertexStream};
pub use element::{
    element_hash, update_offsets, VertexElement, VertexElementSemantic, VertexElementType,
};
pub use layout::{LayoutElement, VertexLayoutDescription, VertexLayoutResolver};
