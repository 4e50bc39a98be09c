use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::time::{Duration, Instant};

use image::RgbaImage;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::atlas::{
    self, AtlasResult, AtlasSession, FlushReport, ImageCodec, ImageCrateCodec, PackingResult,
    RectSize, RemapReport, SlotAtlas, UvPlacement,
};
use crate::config::{OptimizeOptions, PipelineConfig};
use crate::error::{AtlasError, Result};
use crate::material::resolver::material_property_index;
use crate::material::slots::core_field;
use crate::material::{CanonicalSlot, MaterialDescriptor, SlotField, TextureRef, field_for_slot};
use crate::scene::schema::VRM0_MARKER;
use crate::scene::{
    MaterialId, MaterialTextureLocation, MaterialTextureSite, Scenegraph, SchemaVersion, TextureId,
};

const TEXTURE_TRANSFORM_EXTENSION: &str = "KHR_texture_transform";

/// A material that was left out of the atlas, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedMaterial {
    pub material: u32,
    pub name: Option<String>,
    pub reason: String,
}

/// One generated atlas image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtlasSummary {
    pub slot: CanonicalSlot,
    pub width: u32,
    pub height: u32,
    pub materials: usize,
    pub bytes: usize,
    pub mime_type: String,
}

/// Everything one optimization run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizeReport {
    pub schema: String,
    pub materials_total: usize,
    pub materials_atlased: usize,
    pub skipped: Vec<SkippedMaterial>,
    /// Retry-ladder factor the packer settled on.
    pub pack_scale: f64,
    pub atlases: Vec<AtlasSummary>,
    pub flush: FlushReport,
    pub remap: RemapReport,
    pub bin_bytes_reclaimed: usize,
    pub input_bytes: usize,
    pub output_bytes: usize,
}

/// Summary of a completed pipeline run.
#[derive(Debug)]
pub struct ProcessingResult {
    pub report: OptimizeReport,
    pub duration: Duration,
}

/// A material that passed every eligibility check.
struct Candidate {
    id: MaterialId,
    tex_coord: u32,
    /// Included slots sharing the primary slot's texcoord set, canonical order.
    slots: Vec<(CanonicalSlot, TextureRef)>,
}

impl Candidate {
    fn primary(&self) -> TextureId {
        self.slots[0].1.texture
    }

    fn texture_for(&self, slot: &CanonicalSlot) -> Option<TextureId> {
        self.slots
            .iter()
            .find(|(s, _)| s == slot)
            .map(|(_, r)| r.texture)
    }
}

/// Pipeline orchestrator: read, optimize, write.
pub struct Pipeline;

impl Pipeline {
    /// Run the file-to-file pipeline described by `config`.
    pub fn run(config: &PipelineConfig) -> Result<ProcessingResult> {
        let start = Instant::now();
        info!(input = %config.input.display(), "Starting pipeline");

        let input = fs::read(&config.input)?;
        let codec = ImageCrateCodec {
            format: config.options.format,
            compress: config.options.compress_textures,
            quality: config.options.quality,
        };

        let (output, report) = Self::optimize(&input, &config.options, &codec)?;

        if config.json_report {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report, config.dry_run);
        }

        if config.dry_run {
            info!("--dry-run: output not written");
        } else {
            info!(output = %config.output.display(), bytes = output.len(), "Writing avatar");
            fs::write(&config.output, &output)?;
        }

        let duration = start.elapsed();
        info!(elapsed = ?duration, "Pipeline complete");
        Ok(ProcessingResult { report, duration })
    }

    /// Merge the material textures of a GLB avatar into per-slot atlases
    /// and return the rewritten GLB.
    pub fn optimize(
        bytes: &[u8],
        options: &OptimizeOptions,
        codec: &dyn ImageCodec,
    ) -> Result<(Vec<u8>, OptimizeReport)> {
        if options.reduce_meshes || options.target_polygon_count.is_some() {
            warn!("Mesh reduction is not supported; --reduce-meshes and --target-polygon-count are ignored");
        }

        info!("Stage 1/6: Decode container");
        let mut scene = Scenegraph::from_glb(bytes)?;
        let mut report = OptimizeReport {
            schema: scene.schema().to_string(),
            materials_total: scene.materials().len(),
            input_bytes: bytes.len(),
            ..Default::default()
        };
        info!(
            schema = %scene.schema(),
            materials = report.materials_total,
            textures = scene.texture_count(),
            "Loaded avatar"
        );

        let mut session = AtlasSession::new(&mut scene);

        info!("Stage 2/6: Resolve materials");
        let descriptors = session.build_descriptors()?.to_vec();
        let mut candidates = select_candidates(session.scene(), &descriptors, options, &mut report);

        info!("Stage 3/6: Decode textures");
        let decoded = decode_textures(session.scene(), &candidates, codec);
        candidates.retain(|c| {
            let failure = c.slots.iter().find_map(|(_, r)| decoded[&r.texture].as_ref().err());
            match failure {
                Some(e) => {
                    warn!(material = c.id.0, error = %e, "Skipping material with undecodable texture");
                    skip(&mut report, session.scene(), c.id, e.to_string());
                    false
                }
                None => true,
            }
        });
        if candidates.is_empty() {
            return Err(AtlasError::NoEligibleMaterials);
        }
        let images: HashMap<TextureId, &RgbaImage> = decoded
            .iter()
            .filter_map(|(id, r)| r.as_ref().ok().map(|img| (*id, img)))
            .collect();

        info!(materials = candidates.len(), "Stage 4/6: Pack and composite");
        let sizes: Vec<RectSize> = candidates
            .iter()
            .map(|c| {
                let (w, h) = images[&c.primary()].dimensions();
                RectSize::new(w, h).scaled(options.texture_scale)
            })
            .collect();
        let packing = atlas::pack_textures_nfdh(
            &sizes,
            options.max_texture_size,
            options.max_texture_size,
            options.padding,
        )?;
        info!(
            width = packing.width,
            height = packing.height,
            scale = packing.scale,
            "Packed material regions"
        );

        let result = build_slot_atlases(
            session.scene(),
            &candidates,
            &images,
            &packing,
            options,
            codec,
        )?;
        report.pack_scale = packing.scale;
        report.materials_atlased = candidates.len();
        report.atlases = result
            .atlases
            .iter()
            .map(|a| AtlasSummary {
                slot: a.slot.clone(),
                width: a.image.width,
                height: a.image.height,
                materials: a.materials.len(),
                bytes: a.image.bytes.len(),
                mime_type: a.image.mime_type.clone(),
            })
            .collect();
        drop(images);
        drop(decoded);

        info!("Stage 5/6: Rewrite references");
        session.apply_atlas_result(result)?;
        report.flush = session.flush()?;

        let uv_placements: Vec<UvPlacement> = candidates
            .iter()
            .zip(&packing.placements)
            .map(|(c, p)| UvPlacement {
                material: c.id,
                tex_coord: c.tex_coord,
                transform: p.uv_transform(packing.width, packing.height),
            })
            .collect();
        report.remap = atlas::remap(&mut scene, &uv_placements);
        report.bin_bytes_reclaimed = scene.compact_binary()?;

        info!("Stage 6/6: Encode container");
        let output = scene.to_glb()?;
        report.output_bytes = output.len();
        info!(
            input_bytes = report.input_bytes,
            output_bytes = report.output_bytes,
            atlases = report.atlases.len(),
            "Optimization complete"
        );
        Ok((output, report))
    }
}

fn skip(report: &mut OptimizeReport, scene: &Scenegraph, id: MaterialId, reason: String) {
    let name = scene
        .material(id)
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    debug!(material = id.0, %reason, "Material skipped");
    report.skipped.push(SkippedMaterial {
        material: id.0,
        name,
        reason,
    });
}

fn contains_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key) || map.values().any(|v| contains_key(v, key)),
        Value::Array(items) => items.iter().any(|v| contains_key(v, key)),
        _ => false,
    }
}

/// Whether a material scales or offsets its texture lookups, which an atlas
/// region cannot reproduce.
fn has_texture_transform(scene: &Scenegraph, id: MaterialId) -> bool {
    if scene
        .material(id)
        .is_some_and(|m| contains_key(m, TEXTURE_TRANSFORM_EXTENSION))
    {
        return true;
    }
    if scene.schema() != SchemaVersion::Vrm0 {
        return false;
    }

    // VRM 0.x keeps tiling/offset as [offsetX, offsetY, scaleX, scaleY].
    let Some(property) = material_property_index(scene, id).and_then(|i| {
        scene
            .vendor(VRM0_MARKER)
            .and_then(|vrm| vrm.get("materialProperties"))
            .and_then(|p| p.get(i))
    }) else {
        return false;
    };
    let Some(textures) = property.get("textureProperties").and_then(Value::as_object) else {
        return false;
    };
    textures.keys().any(|key| {
        property
            .get("vectorProperties")
            .and_then(|v| v.get(key))
            .and_then(Value::as_array)
            .is_some_and(|st| {
                let st: Vec<f64> = st.iter().filter_map(Value::as_f64).collect();
                st.len() == 4 && st != [0.0, 0.0, 1.0, 1.0]
            })
    })
}

/// Whether writing the atlas for `slot` rewrites `site`.
fn slot_rewrites_site(
    schema: SchemaVersion,
    slot: &CanonicalSlot,
    old: &TextureRef,
    site: &MaterialTextureSite,
) -> bool {
    match (field_for_slot(schema, slot), &site.location) {
        (Some(SlotField::TextureInfo(field)), MaterialTextureLocation::Field(pointer)) => {
            field == pointer
        }
        (Some(SlotField::Property(key)), MaterialTextureLocation::Property(name)) => key == name,
        // VRM 0.x core fields follow their property only while they agree.
        (Some(SlotField::Property(_)), MaterialTextureLocation::Field(pointer)) => {
            core_field(slot) == Some(pointer.as_str()) && site.texture == old.texture
        }
        _ => false,
    }
}

/// First texture reference of `material` that samples the moved texcoord set
/// but keeps its old image, which would then be sampled at the wrong place.
fn unatlased_site(
    scene: &Scenegraph,
    material: MaterialId,
    tex_coord: u32,
    slots: &[(CanonicalSlot, TextureRef)],
) -> Option<MaterialTextureSite> {
    let property = match scene.schema() {
        SchemaVersion::Vrm0 => material_property_index(scene, material),
        SchemaVersion::Vrm1 => None,
    };
    scene
        .material_texture_sites(material, property)
        .into_iter()
        .filter(|site| site.tex_coord == tex_coord)
        .find(|site| {
            !slots
                .iter()
                .any(|(slot, old)| slot_rewrites_site(scene.schema(), slot, old, site))
        })
}

fn select_candidates(
    scene: &Scenegraph,
    descriptors: &[MaterialDescriptor],
    options: &OptimizeOptions,
    report: &mut OptimizeReport,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for descriptor in descriptors {
        let included: Vec<(CanonicalSlot, TextureRef)> = descriptor
            .slots
            .iter()
            .filter(|(slot, _)| options.includes_slot(slot))
            .map(|(slot, r)| (slot.clone(), *r))
            .collect();
        let Some(tex_coord) = included.first().map(|(_, r)| r.tex_coord) else {
            skip(report, scene, descriptor.id, "no selected slots".into());
            continue;
        };
        let slots: Vec<_> = included
            .into_iter()
            .filter(|(_, r)| r.tex_coord == tex_coord)
            .collect();

        if has_texture_transform(scene, descriptor.id) {
            skip(report, scene, descriptor.id, "texture transform in use".into());
            continue;
        }
        if let Some(site) = unatlased_site(scene, descriptor.id, tex_coord, &slots) {
            let reason = format!(
                "{} samples TEXCOORD_{tex_coord} but is not atlased",
                site.location
            );
            skip(report, scene, descriptor.id, reason);
            continue;
        }
        if let Err(reason) = atlas::uv_eligibility(scene, descriptor.id, tex_coord) {
            skip(report, scene, descriptor.id, reason.to_string());
            continue;
        }

        candidates.push(Candidate {
            id: descriptor.id,
            tex_coord,
            slots,
        });
    }

    info!(
        eligible = candidates.len(),
        skipped = report.skipped.len(),
        "Selected materials"
    );
    candidates
}

fn decode_texture(scene: &Scenegraph, codec: &dyn ImageCodec, id: TextureId) -> Result<RgbaImage> {
    let data = scene.texture_image_data(id)?;
    codec
        .decode(data.bytes, data.mime_type)
        .map_err(|e| AtlasError::InvalidTexture {
            texture: id.0,
            reason: e.to_string(),
        })
}

/// Decode every texture the candidates use, in parallel.
fn decode_textures(
    scene: &Scenegraph,
    candidates: &[Candidate],
    codec: &dyn ImageCodec,
) -> HashMap<TextureId, Result<RgbaImage>> {
    let ids: BTreeSet<TextureId> = candidates
        .iter()
        .flat_map(|c| c.slots.iter().map(|(_, r)| r.texture))
        .collect();

    let decoded: HashMap<TextureId, Result<RgbaImage>> = ids
        .into_par_iter()
        .map(|id| (id, decode_texture(scene, codec, id)))
        .collect();
    debug!(textures = decoded.len(), "Decoded source textures");
    decoded
}

/// Filter and wrap modes of a sampler; absent fields take glTF defaults.
fn sampler_settings(scene: &Scenegraph, sampler: Option<u32>) -> [Option<u64>; 4] {
    let entry = sampler.and_then(|i| scene.array("samplers").get(i as usize));
    ["magFilter", "minFilter", "wrapS", "wrapT"]
        .map(|key| entry.and_then(|s| s.get(key)).and_then(Value::as_u64))
}

/// Sampler of the first candidate using `slot`, with the number of distinct
/// sampler settings among all candidates using it.
fn slot_sampler(
    scene: &Scenegraph,
    candidates: &[Candidate],
    slot: &CanonicalSlot,
) -> (Option<u32>, usize) {
    let samplers: Vec<Option<u32>> = candidates
        .iter()
        .filter_map(|c| c.texture_for(slot))
        .map(|t| scene.texture_sampler(t))
        .collect();
    let variants: BTreeSet<[Option<u64>; 4]> = samplers
        .iter()
        .map(|&s| sampler_settings(scene, s))
        .collect();
    (samplers.first().copied().flatten(), variants.len())
}

/// Composite and encode one atlas per slot, slots in parallel.
fn build_slot_atlases(
    scene: &Scenegraph,
    candidates: &[Candidate],
    images: &HashMap<TextureId, &RgbaImage>,
    packing: &PackingResult,
    options: &OptimizeOptions,
    codec: &dyn ImageCodec,
) -> Result<AtlasResult> {
    let slots: BTreeSet<CanonicalSlot> = candidates
        .iter()
        .flat_map(|c| c.slots.iter().map(|(s, _)| s.clone()))
        .collect();

    let atlases = slots
        .into_par_iter()
        .map(|slot| {
            let sources: Vec<Option<RgbaImage>> = candidates
                .iter()
                .zip(&packing.placements)
                .map(|(c, p)| {
                    c.texture_for(&slot)
                        .map(|t| codec.resize(images[&t], p.width, p.height))
                })
                .collect();
            let pixels = atlas::composite(packing, &sources, options.padding)?;
            let image = codec.encode(&pixels)?;

            let materials: BTreeSet<MaterialId> = candidates
                .iter()
                .filter(|c| c.texture_for(&slot).is_some())
                .map(|c| c.id)
                .collect();
            let (sampler, variants) = slot_sampler(scene, candidates, &slot);
            if variants > 1 {
                warn!(
                    %slot,
                    variants,
                    "Merged textures use different sampler settings; the atlas keeps the first"
                );
            }

            debug!(%slot, bytes = image.bytes.len(), materials = materials.len(), "Encoded atlas");
            Ok(SlotAtlas {
                slot,
                image,
                materials,
                sampler,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AtlasResult { atlases })
}

/// Print a human-readable run summary.
fn print_report(report: &OptimizeReport, dry_run: bool) {
    println!(
        "=== {} ===",
        if dry_run { "Dry Run Summary" } else { "Atlas Summary" }
    );
    println!("  Schema:    {}", report.schema);
    println!(
        "  Materials: {} atlased / {} total",
        report.materials_atlased, report.materials_total
    );
    for skipped in &report.skipped {
        println!(
            "    skipped #{} {}: {}",
            skipped.material,
            skipped.name.as_deref().unwrap_or("<unnamed>"),
            skipped.reason
        );
    }
    if report.pack_scale < 1.0 {
        println!("  Scale:     {:.3} (downscaled to fit)", report.pack_scale);
    }
    for atlas in &report.atlases {
        println!(
            "  Atlas {:<24} {}x{} {} ({} materials, {} bytes)",
            atlas.slot.to_string(),
            atlas.width,
            atlas.height,
            atlas.mime_type,
            atlas.materials,
            atlas.bytes
        );
    }
    println!(
        "  Textures:  +{} / -{} ({} kept)",
        report.flush.textures_added, report.flush.textures_removed, report.flush.textures_retained
    );
    println!("  UVs:       {} accessors moved", report.remap.accessors_transformed);
    println!(
        "  Size:      {} -> {} bytes",
        report.input_bytes, report.output_bytes
    );
}
