use std::io;

/// All error types for the atlas optimization pipeline.
#[derive(thiserror::Error, Debug)]
pub enum AtlasError {
    #[error("Invalid container: {0}")]
    InvalidContainer(String),
    #[error("Unsupported schema: {0}")]
    UnsupportedSchema(String),
    #[error("Invalid texture {texture}: {reason}")]
    InvalidTexture { texture: u32, reason: String },
    #[error("No eligible materials")]
    NoEligibleMaterials,
    #[error("Packing failed at scale {scale:.4}")]
    PackingFailed { scale: f64 },
    #[error("Composite failed: {0}")]
    CompositeFailed(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<image::ImageError> for AtlasError {
    fn from(e: image::ImageError) -> Self {
        AtlasError::Unknown(format!("image: {e}"))
    }
}

impl From<serde_json::Error> for AtlasError {
    fn from(e: serde_json::Error) -> Self {
        AtlasError::Unknown(format!("json: {e}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AtlasError>;
