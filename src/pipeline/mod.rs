//! Pipeline state caching and texture unit resolution.
//!
//! - [`PipelineCache`]: one immutable pipeline per [`PipelineKey`]
//! - [`ResourceBindingResolver`]: maps shader texture variables to [`TextureUnit`]s

mod binding;
mod cache;
mod key;

pub use binding::{
    ResourceBindingResolver, TextureUnit, TextureUnitBinding, TextureUnitNames, TextureUnitTable,
};
pub use cache::{CachedPipeline, PipelineCache, PipelineRequest};
pub use key::PipelineKey;
