//! Cross-reference bookkeeping.
//!
//! Every place in the document (or in the vendor blocks) that stores a
//! texture, image or bufferView index is enumerated here as a [`RefSite`].
//! Usage counting, deletion and compaction all walk the same site lists, so a
//! reference class cannot be counted in one place and forgotten in another.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::scene::graph::Scenegraph;
use crate::scene::ids::{ImageId, MaterialId, TextureId};
use crate::scene::schema::{VRM0_MARKER, VRM1_MARKER};

/// Core material fields holding a textureInfo, as JSON pointer suffixes.
pub(crate) const CORE_TEXTURE_FIELDS: [&str; 5] = [
    "pbrMetallicRoughness/baseColorTexture",
    "pbrMetallicRoughness/metallicRoughnessTexture",
    "normalTexture",
    "occlusionTexture",
    "emissiveTexture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiteRoot {
    Document,
    Vendor(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiteKind {
    /// An object carrying the index under `"index"`.
    TextureInfo,
    /// A bare integer.
    Index,
}

/// Location of one stored index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefSite {
    pub root: SiteRoot,
    pub pointer: String,
    pub kind: SiteKind,
}

impl RefSite {
    fn document(pointer: String, kind: SiteKind) -> Self {
        Self {
            root: SiteRoot::Document,
            pointer,
            kind,
        }
    }

    fn vendor(key: &'static str, pointer: String, kind: SiteKind) -> Self {
        Self {
            root: SiteRoot::Vendor(key),
            pointer,
            kind,
        }
    }
}

/// Escape a key for use as a JSON pointer token.
pub(crate) fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// New value of an index after the entry at `removed` was deleted:
/// cleared when equal, decremented when above.
pub(crate) fn shift_after_removal(index: u32, removed: u32) -> Option<u32> {
    use std::cmp::Ordering;
    match index.cmp(&removed) {
        Ordering::Less => Some(index),
        Ordering::Equal => None,
        Ordering::Greater => Some(index - 1),
    }
}

/// Reference counts per texture, from a full scan of every texture site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureUsage {
    counts: HashMap<TextureId, usize>,
}

impl TextureUsage {
    pub fn count(&self, id: TextureId) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn is_unused(&self, id: TextureId) -> bool {
        self.count(id) == 0
    }

    /// Number of distinct textures referenced at least once.
    pub fn referenced_len(&self) -> usize {
        self.counts.len()
    }
}

/// Where a material keeps one of its texture references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialTextureLocation {
    /// textureInfo at a JSON pointer relative to the material.
    Field(String),
    /// Key of the material's VRM 0.x `textureProperties`.
    Property(String),
}

impl fmt::Display for MaterialTextureLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterialTextureLocation::Field(pointer) => write!(f, "{pointer}"),
            MaterialTextureLocation::Property(key) => write!(f, "textureProperties.{key}"),
        }
    }
}

/// One texture reference held by a material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialTextureSite {
    pub location: MaterialTextureLocation,
    pub texture: TextureId,
    /// `TEXCOORD_n` set the reference samples with; always 0 for properties.
    pub tex_coord: u32,
}

impl Scenegraph {
    fn site_root(&self, root: SiteRoot) -> Option<&Value> {
        match root {
            SiteRoot::Document => Some(self.document()),
            SiteRoot::Vendor(key) => self.vendor(key),
        }
    }

    fn site_root_mut(&mut self, root: SiteRoot) -> Option<&mut Value> {
        match root {
            SiteRoot::Document => Some(self.document_mut()),
            SiteRoot::Vendor(key) => self.vendor_mut(key),
        }
    }

    /// Current index stored at `site`.
    pub(crate) fn read_site(&self, site: &RefSite) -> Option<u32> {
        let value = self.site_root(site.root)?.pointer(&site.pointer)?;
        let raw = match site.kind {
            SiteKind::TextureInfo => value.get("index")?.as_u64()?,
            SiteKind::Index => value.as_u64()?,
        };
        u32::try_from(raw).ok()
    }

    /// Store `index` at `site`, or remove the site's key when `None`.
    fn write_site(&mut self, site: &RefSite, index: Option<u32>) {
        let Some(root) = self.site_root_mut(site.root) else {
            return;
        };

        match index {
            Some(index) => {
                let Some(target) = root.pointer_mut(&site.pointer) else {
                    return;
                };
                match site.kind {
                    SiteKind::TextureInfo => target["index"] = Value::from(index),
                    SiteKind::Index => *target = Value::from(index),
                }
            }
            None => {
                let Some((parent, token)) = site.pointer.rsplit_once('/') else {
                    return;
                };
                if let Some(Value::Object(map)) = root.pointer_mut(parent) {
                    map.remove(&unescape_token(token));
                }
            }
        }
    }

    /// Apply `remap` to every site; `None` clears the reference.
    pub(crate) fn renumber_sites<F>(&mut self, sites: &[RefSite], remap: F)
    where
        F: Fn(u32) -> Option<u32>,
    {
        for site in sites {
            let Some(current) = self.read_site(site) else {
                continue;
            };
            let next = remap(current);
            if next != Some(current) {
                self.write_site(site, next);
            }
        }
    }

    /// Every place that references a texture by index.
    pub(crate) fn texture_ref_sites(&self) -> Vec<RefSite> {
        let mut sites = Vec::new();

        for (mi, material) in self.materials().iter().enumerate() {
            for field in CORE_TEXTURE_FIELDS {
                let pointer = format!("/{field}");
                if material.pointer(&pointer).is_some_and(Value::is_object) {
                    sites.push(RefSite::document(
                        format!("/materials/{mi}{pointer}"),
                        SiteKind::TextureInfo,
                    ));
                }
            }

            let Some(extensions) = material.get("extensions").and_then(Value::as_object) else {
                continue;
            };
            for (ext_name, ext) in extensions {
                let Some(fields) = ext.as_object() else {
                    continue;
                };
                for (field, value) in fields {
                    if value.get("index").is_some_and(Value::is_u64) {
                        sites.push(RefSite::document(
                            format!(
                                "/materials/{mi}/extensions/{}/{}",
                                escape_token(ext_name),
                                escape_token(field)
                            ),
                            SiteKind::TextureInfo,
                        ));
                    }
                }
            }
        }

        if let Some(vrm) = self.vendor(VRM0_MARKER) {
            if let Some(properties) = vrm.get("materialProperties").and_then(Value::as_array) {
                for (pi, property) in properties.iter().enumerate() {
                    let Some(textures) = property.get("textureProperties").and_then(Value::as_object)
                    else {
                        continue;
                    };
                    for (name, value) in textures {
                        if value.is_u64() {
                            sites.push(RefSite::vendor(
                                VRM0_MARKER,
                                format!(
                                    "/materialProperties/{pi}/textureProperties/{}",
                                    escape_token(name)
                                ),
                                SiteKind::Index,
                            ));
                        }
                    }
                }
            }
            if vrm.pointer("/meta/texture").is_some_and(Value::is_u64) {
                sites.push(RefSite::vendor(
                    VRM0_MARKER,
                    "/meta/texture".into(),
                    SiteKind::Index,
                ));
            }
        }

        sites
    }

    /// Every place that references an image by index.
    pub(crate) fn image_ref_sites(&self) -> Vec<RefSite> {
        let mut sites = Vec::new();

        for (ti, texture) in self.textures().iter().enumerate() {
            if texture.get("source").is_some_and(Value::is_u64) {
                sites.push(RefSite::document(
                    format!("/textures/{ti}/source"),
                    SiteKind::Index,
                ));
            }
            if let Some(extensions) = texture.get("extensions").and_then(Value::as_object) {
                for (ext_name, ext) in extensions {
                    if ext.get("source").is_some_and(Value::is_u64) {
                        sites.push(RefSite::document(
                            format!("/textures/{ti}/extensions/{}/source", escape_token(ext_name)),
                            SiteKind::Index,
                        ));
                    }
                }
            }
        }

        if self
            .vendor(VRM1_MARKER)
            .and_then(|vrm| vrm.pointer("/meta/thumbnailImage"))
            .is_some_and(Value::is_u64)
        {
            sites.push(RefSite::vendor(
                VRM1_MARKER,
                "/meta/thumbnailImage".into(),
                SiteKind::Index,
            ));
        }

        sites
    }

    /// Every place that references a bufferView by index.
    pub(crate) fn buffer_view_ref_sites(&self) -> Vec<RefSite> {
        let mut sites = Vec::new();

        for (ai, accessor) in self.accessors().iter().enumerate() {
            if accessor.get("bufferView").is_some_and(Value::is_u64) {
                sites.push(RefSite::document(
                    format!("/accessors/{ai}/bufferView"),
                    SiteKind::Index,
                ));
            }
            for part in ["indices", "values"] {
                let pointer = format!("/sparse/{part}/bufferView");
                if accessor.pointer(&pointer).is_some_and(Value::is_u64) {
                    sites.push(RefSite::document(
                        format!("/accessors/{ai}{pointer}"),
                        SiteKind::Index,
                    ));
                }
            }
        }

        for (ii, image) in self.images().iter().enumerate() {
            if image.get("bufferView").is_some_and(Value::is_u64) {
                sites.push(RefSite::document(
                    format!("/images/{ii}/bufferView"),
                    SiteKind::Index,
                ));
            }
        }

        sites
    }

    /// Every texture reference of one material, including those no slot
    /// covers. `property` is the material's VRM 0.x `materialProperties`
    /// index, if it has one.
    pub fn material_texture_sites(
        &self,
        material: MaterialId,
        property: Option<usize>,
    ) -> Vec<MaterialTextureSite> {
        let material_prefix = format!("/materials/{}", material.0);
        let property_prefix =
            property.map(|p| format!("/materialProperties/{p}/textureProperties/"));

        self.texture_ref_sites()
            .into_iter()
            .filter_map(|site| {
                let location = match site.root {
                    SiteRoot::Document => {
                        let rest = site.pointer.strip_prefix(&material_prefix)?;
                        if !rest.starts_with('/') {
                            return None;
                        }
                        MaterialTextureLocation::Field(rest.to_string())
                    }
                    SiteRoot::Vendor(_) => {
                        let key = site.pointer.strip_prefix(property_prefix.as_deref()?)?;
                        MaterialTextureLocation::Property(unescape_token(key))
                    }
                };
                let texture = TextureId(self.read_site(&site)?);
                let tex_coord = match site.kind {
                    SiteKind::TextureInfo => self
                        .site_root(site.root)
                        .and_then(|root| root.pointer(&site.pointer))
                        .and_then(|info| info.get("texCoord"))
                        .and_then(Value::as_u64)
                        .and_then(|t| u32::try_from(t).ok())
                        .unwrap_or(0),
                    SiteKind::Index => 0,
                };
                Some(MaterialTextureSite {
                    location,
                    texture,
                    tex_coord,
                })
            })
            .collect()
    }

    /// Count references to every texture across all materials (both
    /// schemas) and the vendor metadata.
    pub fn texture_usage(&self) -> TextureUsage {
        let mut counts = HashMap::new();
        for site in self.texture_ref_sites() {
            if let Some(index) = self.read_site(&site) {
                *counts.entry(TextureId(index)).or_insert(0) += 1;
            }
        }
        TextureUsage { counts }
    }

    fn image_is_referenced(&self, image: ImageId) -> bool {
        self.image_ref_sites()
            .iter()
            .any(|site| self.read_site(site) == Some(image.0))
    }

    /// Images a texture points at, core source and extension sources alike.
    fn texture_images(&self, id: TextureId) -> Vec<ImageId> {
        let prefix = format!("/textures/{}/", id.0);
        let mut images: Vec<ImageId> = self
            .image_ref_sites()
            .iter()
            .filter(|site| site.root == SiteRoot::Document && site.pointer.starts_with(&prefix))
            .filter_map(|site| self.read_site(site).map(ImageId))
            .collect();
        images.sort_unstable();
        images.dedup();
        images
    }

    /// Delete a texture and compact every texture reference: indices above
    /// the deleted one shift down, references to it are cleared. Images the
    /// texture owned are deleted the same way once nothing else uses them.
    ///
    /// Returns the images that were removed.
    pub fn delete_texture(&mut self, id: TextureId) -> Result<Vec<ImageId>> {
        if id.index() >= self.texture_count() {
            return Err(AtlasError::InvalidState(format!(
                "cannot delete {id}: only {} textures",
                self.texture_count()
            )));
        }

        let owned_images = self.texture_images(id);
        self.array_mut("textures").remove(id.index());

        let sites = self.texture_ref_sites();
        self.renumber_sites(&sites, |index| shift_after_removal(index, id.0));

        let mut removed = Vec::new();
        // Highest first so pending image indices stay valid.
        for image in owned_images.into_iter().rev() {
            if !self.image_is_referenced(image) {
                self.delete_image(image);
                removed.push(image);
            }
        }

        debug!(texture = id.0, images_removed = removed.len(), "Deleted texture");
        Ok(removed)
    }

    fn delete_image(&mut self, id: ImageId) {
        if id.index() >= self.image_count() {
            return;
        }
        self.array_mut("images").remove(id.index());
        let sites = self.image_ref_sites();
        self.renumber_sites(&sites, |index| shift_after_removal(index, id.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::AvatarBuilder;
    use serde_json::json;

    fn material_texture(scene: &Scenegraph, material: usize) -> Option<u64> {
        scene.materials()[material]
            .pointer("/pbrMetallicRoughness/baseColorTexture/index")
            .and_then(Value::as_u64)
    }

    /// Five textures, each with its own image; material i uses texture i*2 % 5.
    fn five_texture_scene() -> Scenegraph {
        let mut builder = AvatarBuilder::vrm1();
        for i in 0..5 {
            builder.add_png_texture(2, 2, [i as u8 * 40, 0, 0, 255]);
        }
        builder.add_mtoon_material("a", &[("baseColor", 2)]);
        builder.add_mtoon_material("b", &[("baseColor", 0)]);
        builder.add_mtoon_material("c", &[("baseColor", 4), ("custom:shadeMultiply", 3)]);
        builder.build()
    }

    #[test]
    fn shift_after_removal_rules() {
        assert_eq!(shift_after_removal(1, 3), Some(1));
        assert_eq!(shift_after_removal(3, 3), None);
        assert_eq!(shift_after_removal(4, 3), Some(3));
    }

    #[test]
    fn usage_counts_core_and_extension_fields() {
        let scene = five_texture_scene();
        let usage = scene.texture_usage();
        assert_eq!(usage.count(TextureId(0)), 1);
        assert_eq!(usage.count(TextureId(2)), 1);
        assert_eq!(usage.count(TextureId(3)), 1);
        assert!(usage.is_unused(TextureId(1)));
        assert_eq!(usage.referenced_len(), 4);
    }

    #[test]
    fn deleting_lower_texture_decrements_references() {
        let mut scene = five_texture_scene();
        // Material "a" references texture 2 of 5; delete texture 0.
        scene.delete_texture(TextureId(0)).unwrap();

        assert_eq!(scene.texture_count(), 4);
        assert_eq!(material_texture(&scene, 0), Some(1));
        // Material "b" pointed at the deleted texture and is cleared.
        assert!(
            scene.materials()[1]
                .pointer("/pbrMetallicRoughness/baseColorTexture")
                .is_none()
        );
        assert_eq!(material_texture(&scene, 2), Some(3));
        let shade = scene.materials()[2]
            .pointer("/extensions/VRMC_materials_mtoon/shadeMultiplyTexture/index")
            .and_then(Value::as_u64);
        assert_eq!(shade, Some(2));
    }

    #[test]
    fn deleting_texture_cascades_to_its_image() {
        let mut scene = five_texture_scene();
        let images_before = scene.image_count();

        let removed = scene.delete_texture(TextureId(1)).unwrap();
        assert_eq!(removed, vec![ImageId(1)]);
        assert_eq!(scene.image_count(), images_before - 1);

        // Every remaining texture source is in range and shifted.
        for (i, texture) in scene.textures().iter().enumerate() {
            let source = texture["source"].as_u64().unwrap() as usize;
            assert!(source < scene.image_count());
            assert_eq!(source, i);
        }
    }

    #[test]
    fn shared_image_survives_texture_deletion() {
        let mut builder = AvatarBuilder::vrm1();
        builder.add_png_texture(2, 2, [1, 2, 3, 255]);
        // A second texture sampling the same image.
        builder.doc["textures"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "source": 0 }));
        let mut scene = builder.build();

        let removed = scene.delete_texture(TextureId(0)).unwrap();
        assert!(removed.is_empty());
        assert_eq!(scene.image_count(), 1);
        assert_eq!(scene.texture_source(TextureId(0)), Some(ImageId(0)));
    }

    #[test]
    fn thumbnail_keeps_image_alive_and_is_renumbered() {
        let mut builder = AvatarBuilder::vrm1();
        builder.add_png_texture(2, 2, [1, 1, 1, 255]);
        builder.add_png_texture(2, 2, [2, 2, 2, 255]);
        builder.vendor["meta"]["thumbnailImage"] = json!(1);
        let mut scene = builder.build();

        // Image 0 is only used by texture 0: deleted, thumbnail shifts to 0.
        let removed = scene.delete_texture(TextureId(0)).unwrap();
        assert_eq!(removed, vec![ImageId(0)]);
        assert_eq!(
            scene.vendor(VRM1_MARKER).unwrap()["meta"]["thumbnailImage"],
            json!(0)
        );

        // The thumbnail image survives once its last texture goes away.
        let removed = scene.delete_texture(TextureId(0)).unwrap();
        assert!(removed.is_empty());
        assert_eq!(scene.image_count(), 1);
    }

    #[test]
    fn vrm0_properties_are_renumbered() {
        let mut builder = AvatarBuilder::vrm0();
        for _ in 0..3 {
            builder.add_png_texture(2, 2, [0, 0, 0, 255]);
        }
        builder.add_vrm0_material("body", &[("_MainTex", 2), ("_ShadeTexture", 1)]);
        builder.vendor["meta"]["texture"] = json!(0);
        let mut scene = builder.build();

        scene.delete_texture(TextureId(1)).unwrap();

        let vrm = scene.vendor(VRM0_MARKER).unwrap();
        let props = &vrm["materialProperties"][0]["textureProperties"];
        assert_eq!(props["_MainTex"], json!(1));
        assert!(props.get("_ShadeTexture").is_none());
        assert_eq!(vrm["meta"]["texture"], json!(0));
    }

    #[test]
    fn material_sites_include_fields_without_a_slot() {
        let mut builder = AvatarBuilder::vrm1();
        for _ in 0..3 {
            builder.add_png_texture(2, 2, [0, 0, 0, 255]);
        }
        builder.add_mtoon_material("a", &[("baseColor", 0)]);
        builder.add_mtoon_material("b", &[("baseColor", 1), ("custom:shadeMultiply", 2)]);
        builder.doc["materials"][1]["occlusionTexture"] = json!({ "index": 2, "texCoord": 1 });
        let scene = builder.build();

        let sites = scene.material_texture_sites(MaterialId(1), None);
        let found: Vec<(String, u32, u32)> = sites
            .iter()
            .map(|s| (s.location.to_string(), s.texture.0, s.tex_coord))
            .collect();
        assert_eq!(
            found,
            [
                ("/pbrMetallicRoughness/baseColorTexture".to_string(), 1, 0),
                ("/occlusionTexture".to_string(), 2, 1),
                ("/extensions/VRMC_materials_mtoon/shadeMultiplyTexture".to_string(), 2, 0),
            ]
        );
        assert_eq!(scene.material_texture_sites(MaterialId(0), None).len(), 1);
    }

    #[test]
    fn material_sites_include_vrm0_properties() {
        let mut builder = AvatarBuilder::vrm0();
        for _ in 0..2 {
            builder.add_png_texture(2, 2, [0, 0, 0, 255]);
        }
        builder.add_vrm0_material("body", &[("_MainTex", 0), ("_ReceiveShadowTexture", 1)]);
        let scene = builder.build();

        let sites = scene.material_texture_sites(MaterialId(0), Some(0));
        assert!(sites.contains(&MaterialTextureSite {
            location: MaterialTextureLocation::Property("_ReceiveShadowTexture".into()),
            texture: TextureId(1),
            tex_coord: 0,
        }));
        assert!(sites.contains(&MaterialTextureSite {
            location: MaterialTextureLocation::Field("/pbrMetallicRoughness/baseColorTexture".into()),
            texture: TextureId(0),
            tex_coord: 0,
        }));
        assert_eq!(sites.len(), 3);
        assert_eq!(scene.material_texture_sites(MaterialId(0), None).len(), 1);
    }

    #[test]
    fn delete_out_of_range_is_an_error() {
        let mut scene = five_texture_scene();
        let err = scene.delete_texture(TextureId(9)).unwrap_err();
        assert!(matches!(err, AtlasError::InvalidState(_)));
    }

    #[test]
    fn pointer_tokens_round_trip() {
        assert_eq!(escape_token("a/b~c"), "a~1b~0c");
        assert_eq!(unescape_token("a~1b~0c"), "a/b~c");
    }
}
