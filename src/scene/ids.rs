//! Typed integer handles into the document's top-level arrays.

use std::fmt;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Position in the backing JSON array.
            pub fn index(self) -> usize {
                self.0 as usize
            }

            /// Build a handle from a JSON number, rejecting values that do
            /// not fit a `u32`.
            pub fn from_json(value: &serde_json::Value) -> Option<Self> {
                value.as_u64().and_then(|v| u32::try_from(v).ok()).map(Self)
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// Index into `materials[]`.
    MaterialId,
    "material"
);
handle!(
    /// Index into `textures[]`.
    TextureId,
    "texture"
);
handle!(
    /// Index into `images[]`.
    ImageId,
    "image"
);
handle!(
    /// Index into `accessors[]`.
    AccessorId,
    "accessor"
);
