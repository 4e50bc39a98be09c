pub mod atlas;
pub mod config;
pub mod container;
pub mod error;
pub mod material;
pub mod pipeline;
pub mod scene;

#[cfg(test)]
mod test_fixtures;

pub use config::{AtlasFormat, OptimizeOptions, PipelineConfig};
pub use error::AtlasError;
pub use pipeline::{OptimizeReport, Pipeline};
