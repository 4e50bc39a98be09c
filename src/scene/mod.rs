pub mod buffer;
pub mod graph;
pub mod ids;
pub mod refs;
pub mod schema;

pub use buffer::Vec2Layout;
pub use graph::{ImageData, Scenegraph};
pub use ids::{AccessorId, ImageId, MaterialId, TextureId};
pub use refs::{MaterialTextureLocation, MaterialTextureSite, TextureUsage};
pub use schema::{SchemaVersion, detect_schema_version};
