pub mod compositor;
pub mod image_codec;
pub mod packer;
pub mod rewriter;
pub mod uv_remap;

pub use compositor::composite;
pub use image_codec::{EncodedImage, ImageCodec, ImageCrateCodec};
pub use packer::{PackingResult, Placement, RectSize, pack, pack_textures_nfdh};
pub use rewriter::{AtlasResult, AtlasSession, FlushReport, SessionState, SlotAtlas};
pub use uv_remap::{RemapReport, UvPlacement, remap, uv_eligibility};
