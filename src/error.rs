//! Graphics error types.

use crate::backend::BackendError;
use thiserror::Error;

/// Errors that can occur while preparing state or uploading data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// A backend object could not be created.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// A pipeline state or its resource binding could not be built.
    #[error("pipeline creation failed: {0}")]
    PipelineCreationFailed(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A mip level outside the texture's chain was addressed.
    #[error("illegal mip level {level} (texture has {levels})")]
    InvalidMipLevel { level: u32, levels: u32 },
    /// A rectangle or element range falls outside the resource.
    #[error("illegal range: {0}")]
    InvalidRange(String),
    /// The source data was empty.
    #[error("no data to upload: {0}")]
    EmptyData(String),
    /// The resource is already locked.
    #[error("resource already locked")]
    AlreadyLocked,
    /// The GPU object has not been created yet.
    #[error("{0} not created")]
    NotCreated(String),
    /// More vertex buffers than the engine supports.
    #[error("too many vertex buffers: {count} (max {max})")]
    TooManyVertexBuffers { count: usize, max: usize },
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::AlreadyLocked;
        assert_eq!(err.to_string(), "resource already locked");

        let err = GraphicsError::InvalidMipLevel { level: 3, levels: 2 };
        assert_eq!(err.to_string(), "illegal mip level 3 (texture has 2)");
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let err: GraphicsError = BackendError::OutOfMemory.into();
        assert_eq!(err.to_string(), "Out of memory");
    }
}
