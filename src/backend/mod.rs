//! Graphics backend abstraction and implementations

pub mod traits;
pub mod types;

pub mod dummy;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use traits::*;
pub use types::*;
