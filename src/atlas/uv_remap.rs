//! Moves texture coordinates of atlased materials into their atlas region.

use std::collections::{HashMap, HashSet};
use std::fmt;

use glam::{Affine2, Vec2};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::scene::{AccessorId, MaterialId, Scenegraph};

/// UVs this far outside `[0,1]` still count as in range.
const UV_TOLERANCE: f32 = 1e-3;

/// Transform for the primitives of one material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvPlacement {
    pub material: MaterialId,
    pub tex_coord: u32,
    pub transform: Affine2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemapReport {
    pub accessors_transformed: usize,
    pub vertices_transformed: usize,
    /// Bound attributes that were not `VEC2`/`FLOAT` data in the BIN chunk.
    pub accessors_skipped: usize,
}

/// Why a material's UVs cannot be moved into an atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvIneligibility {
    NoPrimitives,
    MissingTexcoord,
    UnsupportedAccessor,
    SharedAccessor,
    OutOfRange,
}

impl fmt::Display for UvIneligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UvIneligibility::NoPrimitives => write!(f, "no mesh primitive uses the material"),
            UvIneligibility::MissingTexcoord => write!(f, "a primitive lacks the texcoord set"),
            UvIneligibility::UnsupportedAccessor => {
                write!(f, "texcoords are not dense VEC2 floats")
            }
            UvIneligibility::SharedAccessor => {
                write!(f, "texcoords are shared with another material")
            }
            UvIneligibility::OutOfRange => write!(f, "texcoords leave the [0,1] range"),
        }
    }
}

fn texcoord_key(set: u32) -> String {
    format!("TEXCOORD_{set}")
}

/// `(material, attributes)` of every primitive in the document.
fn primitives(scene: &Scenegraph) -> impl Iterator<Item = (Option<MaterialId>, &Value)> {
    scene
        .meshes()
        .iter()
        .filter_map(|mesh| mesh.get("primitives").and_then(Value::as_array))
        .flatten()
        .map(|prim| {
            let material = prim.get("material").and_then(MaterialId::from_json);
            (material, prim.get("attributes").unwrap_or(&Value::Null))
        })
}

fn texcoord_accessors(scene: &Scenegraph, material: MaterialId, set: u32) -> Vec<Option<AccessorId>> {
    let key = texcoord_key(set);
    primitives(scene)
        .filter(|(m, _)| *m == Some(material))
        .map(|(_, attrs)| attrs.get(&key).and_then(AccessorId::from_json))
        .collect()
}

/// Check that the UVs of `material` can be transformed into an atlas
/// region without affecting anything else.
pub fn uv_eligibility(
    scene: &Scenegraph,
    material: MaterialId,
    set: u32,
) -> std::result::Result<(), UvIneligibility> {
    let accessors = texcoord_accessors(scene, material, set);
    if accessors.is_empty() {
        return Err(UvIneligibility::NoPrimitives);
    }
    let accessors: Vec<AccessorId> = accessors
        .into_iter()
        .collect::<Option<_>>()
        .ok_or(UvIneligibility::MissingTexcoord)?;

    let shared = primitives(scene)
        .filter(|(m, _)| *m != Some(material))
        .filter_map(|(_, attrs)| attrs.as_object())
        .flat_map(|attrs| attrs.values())
        .filter_map(AccessorId::from_json)
        .any(|a| accessors.contains(&a));
    if shared {
        return Err(UvIneligibility::SharedAccessor);
    }

    for accessor in accessors {
        let layout = scene
            .vec2_f32_layout(accessor)
            .ok_or(UvIneligibility::UnsupportedAccessor)?;
        let in_range = (0..layout.count).all(|i| {
            scene.read_vec2(&layout, i).is_some_and(|[u, v]| {
                (-UV_TOLERANCE..=1.0 + UV_TOLERANCE).contains(&u)
                    && (-UV_TOLERANCE..=1.0 + UV_TOLERANCE).contains(&v)
            })
        });
        if !in_range {
            return Err(UvIneligibility::OutOfRange);
        }
    }
    Ok(())
}

/// Apply each material's transform to the texcoord accessors its primitives
/// bind. Every accessor is transformed at most once even when shared.
pub fn remap(scene: &mut Scenegraph, placements: &[UvPlacement]) -> RemapReport {
    let by_material: HashMap<MaterialId, &UvPlacement> =
        placements.iter().map(|p| (p.material, p)).collect();

    let targets: Vec<(AccessorId, Affine2)> = primitives(scene)
        .filter_map(|(material, attrs)| {
            let placement = by_material.get(&material?)?;
            let accessor = attrs
                .get(texcoord_key(placement.tex_coord))
                .and_then(AccessorId::from_json)?;
            Some((accessor, placement.transform))
        })
        .collect();

    let mut report = RemapReport::default();
    let mut processed = HashSet::new();
    for (accessor, transform) in targets {
        if !processed.insert(accessor) {
            continue;
        }
        let Some(layout) = scene.vec2_f32_layout(accessor) else {
            debug!(accessor = accessor.0, "Texcoord attribute is not VEC2 float, skipping");
            report.accessors_skipped += 1;
            continue;
        };

        let mut min = Vec2::splat(f32::INFINITY);
        let mut max = Vec2::splat(f32::NEG_INFINITY);
        for i in 0..layout.count {
            let Some(uv) = scene.read_vec2(&layout, i) else {
                continue;
            };
            let moved = transform.transform_point2(Vec2::from(uv));
            min = min.min(moved);
            max = max.max(moved);
            scene.write_vec2(&layout, i, moved.to_array());
        }
        if layout.count > 0 {
            scene.update_accessor_bounds(accessor, min.to_array(), max.to_array());
        }

        report.accessors_transformed += 1;
        report.vertices_transformed += layout.count;
    }

    debug!(
        accessors = report.accessors_transformed,
        skipped = report.accessors_skipped,
        "Remapped texcoords"
    );
    report
}
