//! Accessor views into the BIN payload and binary compaction.

use std::collections::{BTreeSet, HashMap};

use gltf_json::accessor::{ComponentType, GenericComponentType, Type as AccessorType};
use gltf_json::validation::Checked;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::scene::graph::Scenegraph;
use crate::scene::ids::AccessorId;

/// Extensions whose payload points at bufferViews outside the places
/// `compact_binary` knows how to renumber.
const VIEW_REFERENCING_EXTENSIONS: [&str; 3] = [
    "KHR_draco_mesh_compression",
    "EXT_meshopt_compression",
    "KHR_meshopt_compression",
];

const VEC2_F32_SIZE: usize = 8;

/// Byte layout of a dense `VEC2`/`FLOAT` accessor inside the BIN payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vec2Layout {
    pub offset: usize,
    pub stride: usize,
    pub count: usize,
}

impl Vec2Layout {
    fn element_offset(&self, i: usize) -> usize {
        self.offset + i * self.stride
    }
}

fn as_usize(value: Option<&Value>) -> Option<usize> {
    value.and_then(Value::as_u64).map(|v| v as usize)
}

impl Scenegraph {
    /// Layout of accessor `id` if it is a non-sparse `VEC2` of 32-bit floats
    /// stored in the embedded buffer and fully inside the BIN payload.
    pub fn vec2_f32_layout(&self, id: AccessorId) -> Option<Vec2Layout> {
        let accessor = self.accessors().get(id.index())?;
        if accessor.get("sparse").is_some() {
            return None;
        }

        let ty: Checked<AccessorType> = serde_json::from_value(accessor.get("type")?.clone()).ok()?;
        let component: Checked<GenericComponentType> =
            serde_json::from_value(accessor.get("componentType")?.clone()).ok()?;
        if !matches!(ty, Checked::Valid(AccessorType::Vec2))
            || !matches!(
                component,
                Checked::Valid(GenericComponentType(ComponentType::F32))
            )
        {
            return None;
        }

        let view_index = as_usize(accessor.get("bufferView"))?;
        let view = self.array("bufferViews").get(view_index)?;
        if as_usize(view.get("buffer")).unwrap_or(0) != 0 {
            return None;
        }

        let view_offset = as_usize(view.get("byteOffset")).unwrap_or(0);
        let view_length = as_usize(view.get("byteLength"))?;
        let stride = as_usize(view.get("byteStride")).unwrap_or(VEC2_F32_SIZE);
        if stride < VEC2_F32_SIZE {
            return None;
        }
        let layout = Vec2Layout {
            offset: view_offset + as_usize(accessor.get("byteOffset")).unwrap_or(0),
            stride,
            count: as_usize(accessor.get("count"))?,
        };

        if layout.count > 0 {
            let end = layout.element_offset(layout.count - 1) + VEC2_F32_SIZE;
            if end > view_offset + view_length || end > self.bin().len() {
                return None;
            }
        }
        Some(layout)
    }

    pub fn read_vec2(&self, layout: &Vec2Layout, i: usize) -> Option<[f32; 2]> {
        let start = layout.element_offset(i);
        let bytes = self.bin().get(start..start + VEC2_F32_SIZE)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub(crate) fn write_vec2(&mut self, layout: &Vec2Layout, i: usize, value: [f32; 2]) {
        let start = layout.element_offset(i);
        if let Some(slot) = self.bin_mut().get_mut(start..start + VEC2_F32_SIZE) {
            slot.copy_from_slice(bytemuck::bytes_of(&value));
        }
    }

    /// Overwrite `min`/`max` of an accessor, only where they already exist.
    pub(crate) fn update_accessor_bounds(&mut self, id: AccessorId, min: [f32; 2], max: [f32; 2]) {
        let Some(accessor) = self
            .document_mut()
            .get_mut("accessors")
            .and_then(Value::as_array_mut)
            .and_then(|a| a.get_mut(id.index()))
        else {
            return;
        };
        if accessor.get("min").is_some() {
            accessor["min"] = serde_json::json!(min);
        }
        if accessor.get("max").is_some() {
            accessor["max"] = serde_json::json!(max);
        }
    }

    fn uses_view_referencing_extension(&self) -> bool {
        self.array("extensionsUsed")
            .iter()
            .filter_map(Value::as_str)
            .any(|ext| VIEW_REFERENCING_EXTENSIONS.contains(&ext))
    }

    /// Drop bufferViews that nothing references any more, rebuild the BIN
    /// payload from the survivors (4-byte aligned) and renumber references.
    ///
    /// Returns the number of bytes reclaimed. Assets with views on other
    /// buffers or with mesh compression extensions are left untouched.
    pub fn compact_binary(&mut self) -> Result<usize> {
        if self.bin().is_empty() {
            return Ok(0);
        }
        if self.uses_view_referencing_extension() {
            debug!("Skipping binary compaction: compressed mesh extension in use");
            return Ok(0);
        }

        let views = self.array("bufferViews").to_vec();
        if views
            .iter()
            .any(|v| as_usize(v.get("buffer")).unwrap_or(usize::MAX) != 0)
        {
            debug!("Skipping binary compaction: views reference external buffers");
            return Ok(0);
        }

        let sites = self.buffer_view_ref_sites();
        let referenced: BTreeSet<u32> = sites.iter().filter_map(|s| self.read_site(s)).collect();
        if referenced.len() == views.len() {
            return Ok(0);
        }

        let old_bin = self.bin();
        let mut new_bin = Vec::with_capacity(old_bin.len());
        let mut kept = Vec::with_capacity(referenced.len());
        let mut remap = HashMap::with_capacity(referenced.len());

        for (i, view) in views.iter().enumerate() {
            if !referenced.contains(&(i as u32)) {
                continue;
            }
            let offset = as_usize(view.get("byteOffset")).unwrap_or(0);
            let length = as_usize(view.get("byteLength")).unwrap_or(0);
            let Some(bytes) = old_bin.get(offset..offset + length) else {
                warn!(view = i, "bufferView exceeds the BIN chunk, skipping compaction");
                return Ok(0);
            };

            while new_bin.len() % 4 != 0 {
                new_bin.push(0);
            }
            let mut view = view.clone();
            view["byteOffset"] = Value::from(new_bin.len() as u64);
            new_bin.extend_from_slice(bytes);

            remap.insert(i as u32, kept.len() as u32);
            kept.push(view);
        }

        let reclaimed = old_bin.len().saturating_sub(new_bin.len());
        let dropped = views.len() - kept.len();
        let new_len = new_bin.len();

        *self.array_mut("bufferViews") = kept;
        self.renumber_sites(&sites, |index| remap.get(&index).copied());
        self.replace_bin(new_bin);
        self.sync_embedded_buffer(new_len)?;

        debug!(views_dropped = dropped, bytes = reclaimed, "Compacted BIN payload");
        Ok(reclaimed)
    }
}
