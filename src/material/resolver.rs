//! Builds schema-independent texture descriptors for materials and writes
//! slot assignments back into the schema-specific fields.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::material::slots::{
    self, CanonicalSlot, MTOON_EXTENSION, MaterialTextureSlots, SlotField, TextureRef,
};
use crate::scene::schema::VRM0_MARKER;
use crate::scene::{MaterialId, Scenegraph, SchemaVersion, TextureId};

/// Textures one eligible material samples, keyed by canonical slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDescriptor {
    pub id: MaterialId,
    pub name: Option<String>,
    pub slots: MaterialTextureSlots,
}

impl MaterialDescriptor {
    /// The first slot in canonical order; sizes the material's atlas region.
    pub fn primary(&self) -> Option<(&CanonicalSlot, &TextureRef)> {
        self.slots.iter().next()
    }
}

/// Walk `materials[]` and describe every eligible material with at least one
/// resolvable texture slot.
pub fn build_descriptors(scene: &Scenegraph) -> Vec<MaterialDescriptor> {
    let descriptors: Vec<MaterialDescriptor> = (0..scene.materials().len())
        .map(MaterialId::from)
        .filter_map(|id| {
            let slots = match scene.schema() {
                SchemaVersion::Vrm1 => vrm1_slots(scene, id)?,
                SchemaVersion::Vrm0 => vrm0_slots(scene, id)?,
            };
            if slots.is_empty() {
                debug!(material = id.0, "No resolvable texture slots, skipping");
                return None;
            }
            let name = scene
                .material(id)
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(MaterialDescriptor { id, name, slots })
        })
        .collect();

    debug!(
        schema = %scene.schema(),
        count = descriptors.len(),
        "Built material descriptors"
    );
    descriptors
}

fn texture_ref(scene: &Scenegraph, index: Option<&Value>, tex_coord: u32) -> Option<TextureRef> {
    let texture = TextureId::from_json(index?)?;
    (texture.index() < scene.texture_count()).then_some(TextureRef { texture, tex_coord })
}

fn vrm1_slots(scene: &Scenegraph, id: MaterialId) -> Option<MaterialTextureSlots> {
    let material = scene.material(id)?;
    material.get("extensions")?.get(MTOON_EXTENSION)?;

    let mut slots = MaterialTextureSlots::new();
    for (slot, field) in slots::slot_fields(SchemaVersion::Vrm1) {
        let SlotField::TextureInfo(pointer) = field else {
            continue;
        };
        let Some(info) = material.pointer(pointer) else {
            continue;
        };
        let tex_coord = info
            .get("texCoord")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if let Some(texture) = texture_ref(scene, info.get("index"), tex_coord) {
            slots.insert(slot, texture);
        }
    }
    Some(slots)
}

fn material_properties(scene: &Scenegraph) -> &[Value] {
    scene
        .vendor(VRM0_MARKER)
        .and_then(|vrm| vrm.get("materialProperties"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Position of the VRM 0.x `materialProperties` entry describing a material:
/// matched by name, else by the material's own index.
pub fn material_property_index(scene: &Scenegraph, id: MaterialId) -> Option<usize> {
    let properties = material_properties(scene);
    let name = scene
        .material(id)
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str);

    name.and_then(|name| {
        properties
            .iter()
            .position(|p| p.get("name").and_then(Value::as_str) == Some(name))
    })
    .or_else(|| (id.index() < properties.len()).then_some(id.index()))
}

fn vrm0_slots(scene: &Scenegraph, id: MaterialId) -> Option<MaterialTextureSlots> {
    scene.material(id)?;
    let property = &material_properties(scene)[material_property_index(scene, id)?];

    let mut slots = MaterialTextureSlots::new();
    if let Some(textures) = property.get("textureProperties").and_then(Value::as_object) {
        for (key, value) in textures {
            let Some(slot) = slots::slot_for_property(key) else {
                continue;
            };
            if let Some(texture) = texture_ref(scene, Some(value), 0) {
                slots.insert(slot, texture);
            }
        }
    }
    Some(slots)
}

/// Walk `pointer` from `root`, creating empty objects along the way.
fn ensure_object<'a>(root: &'a mut Value, pointer: &str) -> &'a mut Value {
    pointer
        .split('/')
        .filter(|t| !t.is_empty())
        .fold(root, |node, token| {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let child = &mut node[token];
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            child
        })
}

fn write_texture_info(material: &mut Value, pointer: &str, texture: TextureRef) {
    let info = ensure_object(material, pointer);
    info["index"] = Value::from(texture.texture.0);
    if texture.tex_coord != 0 || info.get("texCoord").is_some() {
        info["texCoord"] = Value::from(texture.tex_coord);
    }
}

/// Point `slot` of material `id` at `texture`, in the field the scene's
/// schema uses for that slot. Other keys of an existing textureInfo are kept.
pub fn write_slot(
    scene: &mut Scenegraph,
    id: MaterialId,
    slot: &CanonicalSlot,
    texture: TextureRef,
) -> Result<()> {
    let schema = scene.schema();
    let field = slots::field_for_slot(schema, slot)
        .ok_or_else(|| AtlasError::InvalidState(format!("{schema} has no field for slot {slot}")))?;

    match field {
        SlotField::TextureInfo(pointer) => {
            let material = scene
                .material_mut(id)
                .ok_or_else(|| AtlasError::InvalidState(format!("{id} out of range")))?;
            write_texture_info(material, pointer, texture);
        }
        SlotField::Property(key) => {
            let property_index = material_property_index(scene, id).ok_or_else(|| {
                AtlasError::InvalidState(format!("{id} has no VRM materialProperties entry"))
            })?;
            let properties = scene
                .vendor_mut(VRM0_MARKER)
                .and_then(|vrm| vrm.get_mut("materialProperties"))
                .and_then(|p| p.get_mut(property_index))
                .ok_or_else(|| AtlasError::InvalidState("VRM block vanished".into()))?;
            let textures = ensure_object(properties, "/textureProperties");
            let previous = textures.get(key).and_then(TextureId::from_json);
            textures[key] = Value::from(texture.texture.0);

            // Keep the core glTF field in step when it mirrored the property.
            if let (Some(pointer), Some(previous)) = (slots::core_field(slot), previous) {
                if let Some(material) = scene.material_mut(id) {
                    let mirrored = material
                        .pointer(pointer)
                        .and_then(|info| info.get("index"))
                        .and_then(TextureId::from_json);
                    if mirrored == Some(previous) {
                        write_texture_info(material, pointer, texture);
                    }
                }
            }
        }
    }

    debug!(material = id.0, %slot, texture = texture.texture.0, "Assigned slot");
    Ok(())
}
