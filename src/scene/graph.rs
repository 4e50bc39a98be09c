use gltf_json::Index;
use gltf_json::validation::USize64;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::container::{self, GlbContainer};
use crate::error::{AtlasError, Result};
use crate::scene::ids::{ImageId, MaterialId, TextureId};
use crate::scene::schema::{self, SchemaVersion};

const WEBP_MIME_TYPE: &str = "image/webp";
const WEBP_EXTENSION: &str = "EXT_texture_webp";

/// Embedded bytes of an image together with its declared MIME type.
#[derive(Debug, Clone, Copy)]
pub struct ImageData<'a> {
    pub bytes: &'a [u8],
    pub mime_type: Option<&'a str>,
}

/// Index-based, in-place editable view over a decoded GLB.
///
/// The JSON document stays the source of truth; every stage mutates it
/// through this type so that index bookkeeping lives in one place.
#[derive(Debug, Clone)]
pub struct Scenegraph {
    container: GlbContainer,
    schema: SchemaVersion,
}

impl Scenegraph {
    /// Wrap a decoded container, detecting the material schema.
    pub fn from_container(container: GlbContainer) -> Result<Self> {
        if !container.document.is_object() {
            return Err(AtlasError::InvalidContainer(
                "Document root is not an object".into(),
            ));
        }
        let schema = schema::detect_schema_version(&container.document, &container.vendor)
            .ok_or_else(|| {
                AtlasError::UnsupportedSchema(
                    "neither VRMC_vrm nor VRM extension marker found".into(),
                )
            })?;

        debug!(%schema, "Detected material schema");
        Ok(Self { container, schema })
    }

    /// Decode GLB bytes straight into a scenegraph.
    pub fn from_glb(bytes: &[u8]) -> Result<Self> {
        Self::from_container(container::decode(bytes)?)
    }

    /// Hand the container back for encoding.
    pub fn into_container(self) -> GlbContainer {
        self.container
    }

    /// Encode the current state as GLB bytes.
    pub fn to_glb(&self) -> Result<Vec<u8>> {
        container::encode(&self.container)
    }

    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    pub fn document(&self) -> &Value {
        &self.container.document
    }

    pub(crate) fn document_mut(&mut self) -> &mut Value {
        &mut self.container.document
    }

    /// Opaque vendor metadata stored under `key`.
    pub fn vendor(&self, key: &str) -> Option<&Value> {
        self.container.vendor_block(key).map(|b| &b.value)
    }

    pub(crate) fn vendor_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.container
            .vendor
            .iter_mut()
            .find(|b| b.key == key)
            .map(|b| &mut b.value)
    }

    /// Keys of the vendor blocks, in storage order.
    pub(crate) fn vendor_keys(&self) -> Vec<String> {
        self.container.vendor.iter().map(|b| b.key.clone()).collect()
    }

    pub fn bin(&self) -> &[u8] {
        self.container.bin.as_deref().unwrap_or(&[])
    }

    pub(crate) fn bin_mut(&mut self) -> &mut [u8] {
        self.container.bin.as_deref_mut().unwrap_or(&mut [])
    }

    pub(crate) fn replace_bin(&mut self, bin: Vec<u8>) {
        self.container.bin = Some(bin);
    }

    /// Top-level array `key`, empty when absent.
    pub(crate) fn array(&self, key: &str) -> &[Value] {
        self.container
            .document
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Top-level array `key`, created when absent.
    pub(crate) fn array_mut(&mut self, key: &str) -> &mut Vec<Value> {
        let slot = &mut self.container.document[key];
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        match slot {
            Value::Array(items) => items,
            _ => unreachable!("slot was just replaced by an array"),
        }
    }

    pub fn materials(&self) -> &[Value] {
        self.array("materials")
    }

    pub fn material(&self, id: MaterialId) -> Option<&Value> {
        self.materials().get(id.index())
    }

    pub(crate) fn material_mut(&mut self, id: MaterialId) -> Option<&mut Value> {
        self.container
            .document
            .get_mut("materials")
            .and_then(Value::as_array_mut)
            .and_then(|m| m.get_mut(id.index()))
    }

    pub fn textures(&self) -> &[Value] {
        self.array("textures")
    }

    pub fn texture_count(&self) -> usize {
        self.textures().len()
    }

    pub fn images(&self) -> &[Value] {
        self.array("images")
    }

    pub fn image_count(&self) -> usize {
        self.images().len()
    }

    pub fn meshes(&self) -> &[Value] {
        self.array("meshes")
    }

    pub fn accessors(&self) -> &[Value] {
        self.array("accessors")
    }

    /// Image feeding a texture: the core `source`, falling back to the
    /// first extension-provided source (e.g. `EXT_texture_webp`).
    pub fn texture_source(&self, id: TextureId) -> Option<ImageId> {
        let texture = self.textures().get(id.index())?;
        if let Some(source) = texture.get("source").and_then(ImageId::from_json) {
            return Some(source);
        }
        texture
            .get("extensions")
            .and_then(Value::as_object)?
            .values()
            .find_map(|ext| ext.get("source").and_then(ImageId::from_json))
    }

    pub fn texture_sampler(&self, id: TextureId) -> Option<u32> {
        self.textures()
            .get(id.index())?
            .get("sampler")?
            .as_u64()
            .and_then(|s| u32::try_from(s).ok())
    }

    /// Embedded bytes behind a texture's image.
    pub fn texture_image_data(&self, id: TextureId) -> Result<ImageData<'_>> {
        let invalid = |reason: String| AtlasError::InvalidTexture {
            texture: id.0,
            reason,
        };

        let image_id = self
            .texture_source(id)
            .ok_or_else(|| invalid("texture has no image source".into()))?;
        let image = self
            .images()
            .get(image_id.index())
            .ok_or_else(|| invalid(format!("{image_id} out of range")))?;
        let mime_type = image.get("mimeType").and_then(Value::as_str);

        let view_index = image
            .get("bufferView")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid(format!("{image_id} is not stored in a bufferView")))?
            as usize;
        let view = self
            .array("bufferViews")
            .get(view_index)
            .ok_or_else(|| invalid(format!("bufferView {view_index} out of range")))?;

        let offset = view.get("byteOffset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let length = view.get("byteLength").and_then(Value::as_u64).unwrap_or(0) as usize;
        let bytes = self
            .bin()
            .get(offset..offset.saturating_add(length))
            .ok_or_else(|| invalid(format!("bufferView {view_index} exceeds the BIN chunk")))?;

        Ok(ImageData { bytes, mime_type })
    }

    /// Make sure `buffers[0]` is the GLB-embedded buffer and record its length.
    pub(crate) fn sync_embedded_buffer(&mut self, byte_length: usize) -> Result<()> {
        let buffers = self.array_mut("buffers");
        if buffers.is_empty() {
            let buffer = gltf_json::Buffer {
                byte_length: USize64::from(byte_length),
                uri: None,
                name: None,
                extensions: Default::default(),
                extras: Default::default(),
            };
            buffers.push(serde_json::to_value(&buffer)?);
            return Ok(());
        }
        if buffers[0].get("uri").is_some() {
            return Err(AtlasError::Unknown(
                "buffer 0 references an external URI; cannot embed images".into(),
            ));
        }
        buffers[0]["byteLength"] = Value::from(byte_length as u64);
        Ok(())
    }

    /// Append encoded image bytes to the BIN payload and register a new
    /// bufferView + image pair.
    pub fn push_image(&mut self, bytes: &[u8], mime_type: &str) -> Result<ImageId> {
        let bin = self.container.bin.get_or_insert_with(Vec::new);
        while bin.len() % 4 != 0 {
            bin.push(0);
        }
        let byte_offset = bin.len();
        bin.extend_from_slice(bytes);
        let bin_len = bin.len();
        self.sync_embedded_buffer(bin_len)?;

        let view = gltf_json::buffer::View {
            buffer: Index::new(0),
            byte_length: USize64::from(bytes.len()),
            byte_offset: Some(USize64::from(byte_offset)),
            byte_stride: None,
            name: None,
            target: None, // no target for image buffer views
            extensions: Default::default(),
            extras: Default::default(),
        };
        let view_idx = push_json(self.array_mut("bufferViews"), &view)?;

        let image = gltf_json::Image {
            buffer_view: Some(Index::new(view_idx)),
            mime_type: Some(gltf_json::image::MimeType(mime_type.to_string())),
            uri: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        };
        let image_idx = push_json(self.array_mut("images"), &image)?;

        debug!(image = image_idx, bytes = bytes.len(), mime_type, "Appended image");
        Ok(ImageId(image_idx))
    }

    /// Register a texture sampling `source`. WebP images are only valid
    /// through `EXT_texture_webp`, which is then declared as required.
    pub fn push_texture(&mut self, source: ImageId, sampler: Option<u32>) -> Result<TextureId> {
        let texture = gltf_json::Texture {
            sampler: sampler.map(Index::new),
            source: Index::new(source.0),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        };
        let mut texture = serde_json::to_value(&texture)?;

        let is_webp = self
            .images()
            .get(source.index())
            .and_then(|image| image.get("mimeType"))
            .and_then(Value::as_str)
            == Some(WEBP_MIME_TYPE);
        if is_webp {
            if let Some(map) = texture.as_object_mut() {
                map.remove("source");
            }
            texture["extensions"][WEBP_EXTENSION] = serde_json::json!({ "source": source.0 });
            self.declare_extension(WEBP_EXTENSION, true);
        }

        let idx = push_json(self.array_mut("textures"), &texture)?;
        Ok(TextureId(idx))
    }

    /// Add `name` to `extensionsUsed`, and to `extensionsRequired` when
    /// `required`, unless already listed.
    pub(crate) fn declare_extension(&mut self, name: &str, required: bool) {
        let lists: &[&str] = if required {
            &["extensionsUsed", "extensionsRequired"]
        } else {
            &["extensionsUsed"]
        };
        for list in lists {
            let entries = self.array_mut(list);
            if !entries.iter().any(|e| e.as_str() == Some(name)) {
                entries.push(Value::from(name));
            }
        }
    }
}

fn push_json<T: Serialize>(array: &mut Vec<Value>, item: &T) -> Result<u32> {
    let index = u32::try_from(array.len())
        .map_err(|_| AtlasError::Unknown("glTF array exceeds u32 indices".into()))?;
    array.push(serde_json::to_value(item)?);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::AvatarBuilder;
    use serde_json::json;

    #[test]
    fn unsupported_schema_is_rejected() {
        let container = GlbContainer::new(json!({ "asset": { "version": "2.0" } }), None);
        let err = Scenegraph::from_container(container).unwrap_err();
        assert!(matches!(err, AtlasError::UnsupportedSchema(_)));
    }

    #[test]
    fn reads_embedded_texture_bytes() {
        let mut builder = AvatarBuilder::vrm1();
        let tex = builder.add_png_texture(4, 2, [10, 20, 30, 255]);
        let scene = builder.build();

        let data = scene.texture_image_data(TextureId(tex)).unwrap();
        assert_eq!(data.mime_type, Some("image/png"));
        let decoded = image::load_from_memory(data.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 2));
    }

    #[test]
    fn texture_without_source_is_invalid() {
        let mut builder = AvatarBuilder::vrm1();
        builder.doc["textures"] = json!([{ "sampler": 0 }]);
        let scene = builder.build();

        let err = scene.texture_image_data(TextureId(0)).unwrap_err();
        assert!(matches!(err, AtlasError::InvalidTexture { texture: 0, .. }));
    }

    #[test]
    fn extension_source_is_used_as_fallback() {
        let mut builder = AvatarBuilder::vrm1();
        builder.doc["textures"] = json!([{ "extensions": { "EXT_texture_webp": { "source": 3 } } }]);
        let scene = builder.build();
        assert_eq!(scene.texture_source(TextureId(0)), Some(ImageId(3)));
    }

    #[test]
    fn push_image_and_texture_append_aligned_data() {
        let mut builder = AvatarBuilder::vrm1();
        builder.add_png_texture(2, 2, [0, 0, 0, 255]);
        let mut scene = builder.build();
        let before_images = scene.image_count();

        let image = scene.push_image(&[1, 2, 3, 4, 5], "image/png").unwrap();
        let texture = scene.push_texture(image, Some(0)).unwrap();

        assert_eq!(image.index(), before_images);
        assert_eq!(scene.texture_source(texture), Some(image));
        assert_eq!(scene.texture_sampler(texture), Some(0));
        assert!(scene.textures()[texture.index()].get("name").is_none());
        assert!(scene.images()[image.index()].get("name").is_none());

        let data = scene.texture_image_data(texture).unwrap();
        assert_eq!(data.bytes, &[1, 2, 3, 4, 5]);

        let views = scene.array("bufferViews");
        let offset = views.last().unwrap()["byteOffset"].as_u64().unwrap();
        assert_eq!(offset % 4, 0);
        assert_eq!(
            scene.array("buffers")[0]["byteLength"].as_u64().unwrap() as usize,
            scene.bin().len()
        );
    }

    #[test]
    fn webp_texture_uses_the_extension() {
        let mut builder = AvatarBuilder::vrm1();
        builder.add_png_texture(2, 2, [0, 0, 0, 255]);
        let mut scene = builder.build();

        let png = scene.push_image(&[1, 2, 3], "image/png").unwrap();
        let png_texture = scene.push_texture(png, None).unwrap();
        assert!(scene.document().get("extensionsRequired").is_none());

        let webp = scene.push_image(&[4, 5, 6], "image/webp").unwrap();
        let first = scene.push_texture(webp, Some(0)).unwrap();
        let second = scene.push_texture(webp, Some(0)).unwrap();

        let texture = &scene.textures()[first.index()];
        assert!(texture.get("source").is_none());
        assert_eq!(texture["extensions"]["EXT_texture_webp"]["source"], webp.0);
        assert_eq!(scene.texture_source(first), Some(webp));
        assert_eq!(scene.texture_source(second), Some(webp));
        assert_eq!(scene.texture_source(png_texture), Some(png));
        assert_eq!(scene.texture_image_data(first).unwrap().bytes, &[4, 5, 6]);

        let doc = scene.document();
        let declared = |list: &str| {
            doc[list]
                .as_array()
                .unwrap()
                .iter()
                .filter(|e| *e == "EXT_texture_webp")
                .count()
        };
        assert_eq!(declared("extensionsUsed"), 1);
        assert_eq!(declared("extensionsRequired"), 1);
        assert!(doc["extensionsUsed"].as_array().unwrap().contains(&json!("VRMC_vrm")));
    }

    #[test]
    fn push_image_creates_buffer_when_missing() {
        let container = GlbContainer::new(json!({ "extensionsUsed": ["VRMC_vrm"] }), None);
        let mut scene = Scenegraph::from_container(container).unwrap();

        let image = scene.push_image(&[7, 7, 7], "image/png").unwrap();
        assert_eq!(image, ImageId(0));
        assert_eq!(scene.array("buffers").len(), 1);
        assert_eq!(scene.array("buffers")[0]["byteLength"], 3);
        assert_eq!(scene.bin(), &[7, 7, 7]);
    }
}
