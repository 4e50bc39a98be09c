pub mod resolver;
pub mod slots;

pub use resolver::{MaterialDescriptor, build_descriptors, write_slot};
pub use slots::{CanonicalSlot, MaterialTextureSlots, SlotField, TextureRef, field_for_slot};
