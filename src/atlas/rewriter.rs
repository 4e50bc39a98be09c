//! Two-phase rewrite of material texture references.
//!
//! An [`AtlasSession`] queues new atlas textures and slot assignments when an
//! atlas result is applied, and only touches the scenegraph on `flush`, which
//! also deletes the textures nothing references any more.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::atlas::image_codec::EncodedImage;
use crate::error::{AtlasError, Result};
use crate::material::{self, CanonicalSlot, MaterialDescriptor, TextureRef};
use crate::scene::{MaterialId, Scenegraph, TextureId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    DescriptorsBuilt,
    AtlasApplied,
    Flushed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::DescriptorsBuilt => "descriptors built",
            SessionState::AtlasApplied => "atlas applied",
            SessionState::Flushed => "flushed",
        };
        f.write_str(name)
    }
}

/// One encoded atlas image for one slot, shared by `materials`.
#[derive(Debug, Clone)]
pub struct SlotAtlas {
    pub slot: CanonicalSlot,
    pub image: EncodedImage,
    pub materials: BTreeSet<MaterialId>,
    pub sampler: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AtlasResult {
    pub atlases: Vec<SlotAtlas>,
}

/// A queued atlas texture, not yet inserted into the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingTextureHandle(usize);

#[derive(Debug, Clone)]
struct PendingTexture {
    image: EncodedImage,
    sampler: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAssignment {
    pub material: MaterialId,
    pub slot: CanonicalSlot,
    pub texture: PendingTextureHandle,
    pub tex_coord: u32,
}

/// Assignments keyed by `(material, slot)`; the first one queued wins.
#[derive(Debug, Clone, Default)]
pub struct PendingAssignments {
    entries: BTreeMap<(MaterialId, CanonicalSlot), PendingAssignment>,
}

impl PendingAssignments {
    /// Queue `assignment`; returns `false` and keeps the earlier entry when
    /// the `(material, slot)` pair is already queued.
    pub fn insert(&mut self, assignment: PendingAssignment) -> bool {
        let key = (assignment.material, assignment.slot.clone());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, assignment);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAssignment> {
        self.entries.values()
    }

    pub fn references(&self, texture: PendingTextureHandle) -> bool {
        self.iter().any(|a| a.texture == texture)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What `flush` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub textures_added: usize,
    pub assignments_written: usize,
    pub textures_removed: usize,
    pub images_removed: usize,
    /// Replaced textures kept because something else still uses them.
    pub textures_retained: usize,
}

/// Rewrite state for one optimization run over a scenegraph.
pub struct AtlasSession<'a> {
    scene: &'a mut Scenegraph,
    state: SessionState,
    descriptors: Vec<MaterialDescriptor>,
    pending_textures: Vec<PendingTexture>,
    assignments: PendingAssignments,
    candidates: BTreeSet<TextureId>,
}

impl<'a> AtlasSession<'a> {
    pub fn new(scene: &'a mut Scenegraph) -> Self {
        Self {
            scene,
            state: SessionState::Idle,
            descriptors: Vec::new(),
            pending_textures: Vec::new(),
            assignments: PendingAssignments::default(),
            candidates: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn scene(&self) -> &Scenegraph {
        self.scene
    }

    pub fn descriptors(&self) -> &[MaterialDescriptor] {
        &self.descriptors
    }

    pub fn pending(&self) -> &PendingAssignments {
        &self.assignments
    }

    fn expect_state(&self, operation: &str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(AtlasError::InvalidState(format!(
                "{operation} called while {}",
                self.state
            )))
        }
    }

    /// Resolve the material descriptors for this run.
    pub fn build_descriptors(&mut self) -> Result<&[MaterialDescriptor]> {
        self.expect_state("build_descriptors", &[SessionState::Idle])?;
        self.descriptors = material::build_descriptors(self.scene);
        self.state = SessionState::DescriptorsBuilt;
        Ok(&self.descriptors)
    }

    /// Queue the atlas textures and the slot assignments they imply. Old
    /// textures of reassigned slots become removal candidates.
    pub fn apply_atlas_result(&mut self, result: AtlasResult) -> Result<()> {
        self.expect_state(
            "apply_atlas_result",
            &[SessionState::DescriptorsBuilt, SessionState::AtlasApplied],
        )?;

        let by_id: HashMap<MaterialId, &MaterialDescriptor> =
            self.descriptors.iter().map(|d| (d.id, d)).collect();

        for atlas in result.atlases {
            let handle = PendingTextureHandle(self.pending_textures.len());
            let mut queued = 0;

            for material in &atlas.materials {
                let Some(old) = by_id.get(material).and_then(|d| d.slots.get(&atlas.slot)) else {
                    continue;
                };
                let assignment = PendingAssignment {
                    material: *material,
                    slot: atlas.slot.clone(),
                    texture: handle,
                    tex_coord: old.tex_coord,
                };
                if self.assignments.insert(assignment) {
                    self.candidates.insert(old.texture);
                    queued += 1;
                } else {
                    debug!(material = material.0, slot = %atlas.slot, "Assignment already queued");
                }
            }

            debug!(slot = %atlas.slot, assignments = queued, "Queued atlas texture");
            self.pending_textures.push(PendingTexture {
                image: atlas.image,
                sampler: atlas.sampler,
            });
        }

        self.state = SessionState::AtlasApplied;
        Ok(())
    }

    /// Commit queued work: insert atlas textures, write assignments, then
    /// delete every removal candidate with no remaining reference, highest
    /// index first.
    pub fn flush(&mut self) -> Result<FlushReport> {
        self.expect_state("flush", &[SessionState::AtlasApplied])?;
        let mut report = FlushReport::default();

        let mut materialized = HashMap::new();
        for (i, pending) in self.pending_textures.drain(..).enumerate() {
            let handle = PendingTextureHandle(i);
            if !self.assignments.references(handle) {
                continue;
            }
            let image = self
                .scene
                .push_image(&pending.image.bytes, &pending.image.mime_type)?;
            let texture = self.scene.push_texture(image, pending.sampler)?;
            materialized.insert(handle, texture);
            report.textures_added += 1;
        }

        for assignment in self.assignments.iter() {
            let texture = *materialized.get(&assignment.texture).ok_or_else(|| {
                AtlasError::InvalidState("assignment refers to an unknown texture".into())
            })?;
            material::write_slot(
                self.scene,
                assignment.material,
                &assignment.slot,
                TextureRef {
                    texture,
                    tex_coord: assignment.tex_coord,
                },
            )?;
            report.assignments_written += 1;
        }
        self.assignments.clear();

        let usage = self.scene.texture_usage();
        let candidates = std::mem::take(&mut self.candidates);
        for texture in candidates.into_iter().rev() {
            if usage.is_unused(texture) {
                let images = self.scene.delete_texture(texture)?;
                report.textures_removed += 1;
                report.images_removed += images.len();
            } else {
                debug!(
                    texture = texture.0,
                    references = usage.count(texture),
                    "Texture still referenced, keeping"
                );
                report.textures_retained += 1;
            }
        }

        info!(
            added = report.textures_added,
            assigned = report.assignments_written,
            removed = report.textures_removed,
            retained = report.textures_retained,
            "Flushed atlas rewrite"
        );
        self.state = SessionState::Flushed;
        Ok(report)
    }

    /// Reset for another run over the same scenegraph.
    pub fn begin_run(&mut self) -> Result<()> {
        self.expect_state("begin_run", &[SessionState::Idle, SessionState::Flushed])?;
        self.descriptors.clear();
        self.pending_textures.clear();
        self.assignments.clear();
        self.candidates.clear();
        self.state = SessionState::Idle;
        Ok(())
    }
}
