use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::scene::{SchemaVersion, TextureId};

/// Material extension holding the VRM 1.0 MToon parameters.
pub const MTOON_EXTENSION: &str = "VRMC_materials_mtoon";

const CUSTOM_PREFIX: &str = "custom:";

/// Schema-independent name of a material texture slot.
///
/// Ordering puts the fixed slots first, which also makes `BaseColor` the
/// primary slot whenever a material has one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalSlot {
    BaseColor,
    Normal,
    Emissive,
    /// Shader-specific slot, e.g. `custom:shadeMultiply`.
    Custom(String),
}

impl CanonicalSlot {
    pub fn custom(name: impl Into<String>) -> Self {
        CanonicalSlot::Custom(name.into())
    }
}

impl fmt::Display for CanonicalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalSlot::BaseColor => write!(f, "baseColor"),
            CanonicalSlot::Normal => write!(f, "normal"),
            CanonicalSlot::Emissive => write!(f, "emissive"),
            CanonicalSlot::Custom(name) => write!(f, "{CUSTOM_PREFIX}{name}"),
        }
    }
}

impl FromStr for CanonicalSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseColor" => Ok(CanonicalSlot::BaseColor),
            "normal" => Ok(CanonicalSlot::Normal),
            "emissive" => Ok(CanonicalSlot::Emissive),
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(name) if !name.is_empty() => Ok(CanonicalSlot::custom(name)),
                _ => Err(format!(
                    "Unknown slot '{other}': expected baseColor, normal, emissive or custom:<name>"
                )),
            },
        }
    }
}

impl Serialize for CanonicalSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A material's reference to a texture through one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRef {
    pub texture: TextureId,
    pub tex_coord: u32,
}

/// At most one texture per slot.
pub type MaterialTextureSlots = BTreeMap<CanonicalSlot, TextureRef>;

/// Where a slot is stored for a given schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotField {
    /// A textureInfo object at a JSON pointer relative to the material.
    TextureInfo(&'static str),
    /// A key of the VRM 0.x `textureProperties` map.
    Property(&'static str),
}

/// VRM 1.0 slot locations, in canonical text form.
const VRM1_FIELDS: [(&str, &str); 9] = [
    ("baseColor", "/pbrMetallicRoughness/baseColorTexture"),
    ("normal", "/normalTexture"),
    ("emissive", "/emissiveTexture"),
    (
        "custom:shadeMultiply",
        "/extensions/VRMC_materials_mtoon/shadeMultiplyTexture",
    ),
    (
        "custom:shadingShift",
        "/extensions/VRMC_materials_mtoon/shadingShiftTexture",
    ),
    ("custom:matcap", "/extensions/VRMC_materials_mtoon/matcapTexture"),
    (
        "custom:rimMultiply",
        "/extensions/VRMC_materials_mtoon/rimMultiplyTexture",
    ),
    (
        "custom:outlineWidth",
        "/extensions/VRMC_materials_mtoon/outlineWidthMultiplyTexture",
    ),
    (
        "custom:uvAnimationMask",
        "/extensions/VRMC_materials_mtoon/uvAnimationMaskTexture",
    ),
];

/// VRM 0.x `textureProperties` keys, in canonical text form.
const VRM0_PROPERTIES: [(&str, &str); 9] = [
    ("baseColor", "_MainTex"),
    ("normal", "_BumpMap"),
    ("emissive", "_EmissionMap"),
    ("custom:shadeMultiply", "_ShadeTexture"),
    ("custom:shadingShift", "_ShadingGradeTexture"),
    ("custom:matcap", "_SphereAdd"),
    ("custom:rimMultiply", "_RimTexture"),
    ("custom:outlineWidth", "_OutlineWidthTexture"),
    ("custom:uvAnimationMask", "_UvAnimMaskTexture"),
];

fn table(schema: SchemaVersion) -> impl Iterator<Item = (&'static str, SlotField)> {
    let (fields, wrap): (&'static [(&str, &str)], fn(&'static str) -> SlotField) = match schema {
        SchemaVersion::Vrm1 => (&VRM1_FIELDS, SlotField::TextureInfo),
        SchemaVersion::Vrm0 => (&VRM0_PROPERTIES, SlotField::Property),
    };
    fields.iter().map(move |&(slot, field)| (slot, wrap(field)))
}

/// Every slot the schema knows about, with its storage location.
pub fn slot_fields(schema: SchemaVersion) -> Vec<(CanonicalSlot, SlotField)> {
    table(schema)
        .filter_map(|(slot, field)| slot.parse().ok().map(|slot| (slot, field)))
        .collect()
}

/// Storage location of `slot` for `schema`, if the schema has one.
pub fn field_for_slot(schema: SchemaVersion, slot: &CanonicalSlot) -> Option<SlotField> {
    let text = slot.to_string();
    table(schema).find(|(name, _)| *name == text).map(|(_, field)| field)
}

/// Canonical slot of a VRM 0.x `textureProperties` key.
pub fn slot_for_property(property: &str) -> Option<CanonicalSlot> {
    VRM0_PROPERTIES
        .iter()
        .find(|(_, key)| *key == property)
        .and_then(|(slot, _)| slot.parse().ok())
}

/// Core glTF textureInfo pointer that mirrors a slot, for the three slots the
/// base format knows.
pub fn core_field(slot: &CanonicalSlot) -> Option<&'static str> {
    match slot {
        CanonicalSlot::BaseColor => Some(VRM1_FIELDS[0].1),
        CanonicalSlot::Normal => Some(VRM1_FIELDS[1].1),
        CanonicalSlot::Emissive => Some(VRM1_FIELDS[2].1),
        CanonicalSlot::Custom(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_text_round_trip() {
        for text in ["baseColor", "normal", "emissive", "custom:rimMultiply"] {
            let slot: CanonicalSlot = text.parse().unwrap();
            assert_eq!(slot.to_string(), text);
        }
        assert!("custom:".parse::<CanonicalSlot>().is_err());
        assert!("diffuse".parse::<CanonicalSlot>().is_err());
    }

    #[test]
    fn base_color_sorts_first() {
        let mut slots = vec![
            CanonicalSlot::custom("matcap"),
            CanonicalSlot::Emissive,
            CanonicalSlot::BaseColor,
        ];
        slots.sort();
        assert_eq!(slots[0], CanonicalSlot::BaseColor);
        assert_eq!(slots[2], CanonicalSlot::custom("matcap"));
    }

    #[test]
    fn both_schemas_cover_the_same_slots() {
        let vrm1: Vec<_> = slot_fields(SchemaVersion::Vrm1)
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        let vrm0: Vec<_> = slot_fields(SchemaVersion::Vrm0)
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(vrm1.len(), 9);
        assert_eq!(vrm1, vrm0);
    }

    #[test]
    fn field_lookup_per_schema() {
        let shade = CanonicalSlot::custom("shadeMultiply");
        assert_eq!(
            field_for_slot(SchemaVersion::Vrm1, &shade),
            Some(SlotField::TextureInfo(
                "/extensions/VRMC_materials_mtoon/shadeMultiplyTexture"
            ))
        );
        assert_eq!(
            field_for_slot(SchemaVersion::Vrm0, &shade),
            Some(SlotField::Property("_ShadeTexture"))
        );
        assert_eq!(
            field_for_slot(SchemaVersion::Vrm1, &CanonicalSlot::custom("sparkle")),
            None
        );
    }

    #[test]
    fn property_and_core_lookups() {
        assert_eq!(slot_for_property("_MainTex"), Some(CanonicalSlot::BaseColor));
        assert_eq!(
            slot_for_property("_SphereAdd"),
            Some(CanonicalSlot::custom("matcap"))
        );
        assert_eq!(slot_for_property("_Unknown"), None);
        assert_eq!(core_field(&CanonicalSlot::Normal), Some("/normalTexture"));
        assert_eq!(core_field(&CanonicalSlot::custom("matcap")), None);
    }

    #[test]
    fn slot_serializes_as_text() {
        let json = serde_json::to_string(&CanonicalSlot::custom("matcap")).unwrap();
        assert_eq!(json, "\"custom:matcap\"");
    }
}
