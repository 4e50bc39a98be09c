pub mod glb;
pub mod vendor;

pub use glb::{GlbContainer, decode, encode};
pub use vendor::{VENDOR_EXTENSION_KEYS, VendorBlock};
