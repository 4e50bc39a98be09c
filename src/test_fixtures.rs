//! Synthetic avatar documents for unit tests.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};
use serde_json::{Map, Value, json};

use crate::container::GlbContainer;
use crate::scene::{SchemaVersion, Scenegraph};

/// Builds a small VRM document with an embedded BIN payload.
pub struct AvatarBuilder {
    pub doc: Value,
    /// Vendor block placed under the schema marker on `build`.
    pub vendor: Value,
    schema: SchemaVersion,
    bin: Vec<u8>,
}

impl AvatarBuilder {
    pub fn vrm1() -> Self {
        Self::new(
            SchemaVersion::Vrm1,
            json!(["VRMC_vrm", "VRMC_materials_mtoon"]),
            json!({
                "specVersion": "1.0",
                "meta": {
                    "name": "fixture",
                    "authors": ["tests"],
                    "licenseUrl": "https://vrm.dev/licenses/1.0/"
                },
                "humanoid": { "humanBones": {} }
            }),
        )
    }

    pub fn vrm0() -> Self {
        Self::new(
            SchemaVersion::Vrm0,
            json!(["VRM"]),
            json!({
                "exporterVersion": "fixture",
                "specVersion": "0.0",
                "meta": { "title": "fixture", "author": "tests" },
                "humanoid": { "humanBones": [] },
                "materialProperties": []
            }),
        )
    }

    fn new(schema: SchemaVersion, extensions_used: Value, vendor: Value) -> Self {
        let doc = json!({
            "asset": { "version": "2.0", "generator": "vrm-atlas fixtures" },
            "extensionsUsed": extensions_used,
            "extensions": {},
            "buffers": [],
            "bufferViews": [],
            "accessors": [],
            "images": [],
            "samplers": [{ "magFilter": 9729, "minFilter": 9987 }],
            "textures": [],
            "materials": [],
            "meshes": []
        });
        Self {
            doc,
            vendor,
            schema,
            bin: Vec::new(),
        }
    }

    fn push(&mut self, key: &str, item: Value) -> u32 {
        let array = self.doc[key].as_array_mut().expect("fixture arrays exist");
        array.push(item);
        (array.len() - 1) as u32
    }

    fn push_view(&mut self, bytes: &[u8]) -> u32 {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytes);
        self.push(
            "bufferViews",
            json!({ "buffer": 0, "byteOffset": offset, "byteLength": bytes.len() }),
        )
    }

    /// Embed `image` as PNG and add a texture for it. Returns the texture index.
    pub fn add_texture_image(&mut self, image: &RgbaImage) -> u32 {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .expect("encode fixture png");
        let view = self.push_view(png.get_ref());
        let source = self.push(
            "images",
            json!({ "bufferView": view, "mimeType": "image/png" }),
        );
        self.push("textures", json!({ "sampler": 0, "source": source }))
    }

    /// Solid-colour PNG texture. Returns the texture index.
    pub fn add_png_texture(&mut self, width: u32, height: u32, rgba: [u8; 4]) -> u32 {
        self.add_texture_image(&RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    /// VRM 1.0 MToon material. Slots use their canonical text form.
    pub fn add_mtoon_material(&mut self, name: &str, slots: &[(&str, u32)]) -> u32 {
        let mut material = json!({
            "name": name,
            "pbrMetallicRoughness": { "baseColorFactor": [1.0, 1.0, 1.0, 1.0] },
            "extensions": { "VRMC_materials_mtoon": { "specVersion": "1.0" } }
        });
        for &(slot, texture) in slots {
            let info = json!({ "index": texture, "texCoord": 0 });
            match slot {
                "baseColor" => material["pbrMetallicRoughness"]["baseColorTexture"] = info,
                "normal" => material["normalTexture"] = info,
                "emissive" => material["emissiveTexture"] = info,
                custom => {
                    let field = match custom {
                        "custom:shadeMultiply" => "shadeMultiplyTexture",
                        "custom:shadingShift" => "shadingShiftTexture",
                        "custom:matcap" => "matcapTexture",
                        "custom:rimMultiply" => "rimMultiplyTexture",
                        "custom:outlineWidth" => "outlineWidthMultiplyTexture",
                        "custom:uvAnimationMask" => "uvAnimationMaskTexture",
                        other => panic!("unknown fixture slot {other}"),
                    };
                    material["extensions"]["VRMC_materials_mtoon"][field] = info;
                }
            }
        }
        self.push("materials", material)
    }

    /// Plain glTF material without any shader extension.
    pub fn add_plain_material(&mut self, name: &str, base_color: Option<u32>) -> u32 {
        let mut material = json!({ "name": name, "pbrMetallicRoughness": {} });
        if let Some(texture) = base_color {
            material["pbrMetallicRoughness"]["baseColorTexture"] = json!({ "index": texture });
        }
        self.push("materials", material)
    }

    /// VRM 0.x material: a glTF material plus a matching `materialProperties`
    /// entry. Core fields mirror `_MainTex`, `_BumpMap` and `_EmissionMap`.
    pub fn add_vrm0_material(&mut self, name: &str, properties: &[(&str, u32)]) -> u32 {
        let mut material = json!({ "name": name, "pbrMetallicRoughness": {} });
        let mut texture_properties = Map::new();
        for &(property, texture) in properties {
            texture_properties.insert(property.to_string(), json!(texture));
            let info = json!({ "index": texture, "texCoord": 0 });
            match property {
                "_MainTex" => material["pbrMetallicRoughness"]["baseColorTexture"] = info,
                "_BumpMap" => material["normalTexture"] = info,
                "_EmissionMap" => material["emissiveTexture"] = info,
                _ => {}
            }
        }
        self.vendor["materialProperties"]
            .as_array_mut()
            .expect("vrm0 fixture")
            .push(json!({
                "name": name,
                "shader": "VRM/MToon",
                "renderQueue": 2000,
                "floatProperties": {},
                "vectorProperties": {},
                "textureProperties": texture_properties,
                "keywordMap": {},
                "tagMap": {}
            }));
        self.push("materials", material)
    }

    /// Add a mesh with one triangle-list primitive using `material`, with a
    /// POSITION accessor followed by a TEXCOORD_0 accessor holding `uvs`.
    /// Returns the TEXCOORD_0 accessor index.
    pub fn add_primitive(&mut self, material: u32, uvs: &[[f32; 2]]) -> u32 {
        let positions: Vec<[f32; 3]> = (0..uvs.len()).map(|i| [i as f32, 0.0, 0.0]).collect();
        let position_view = self.push_view(bytemuck::cast_slice(&positions));
        let max_x = uvs.len().saturating_sub(1) as f32;
        let position = self.push(
            "accessors",
            json!({
                "bufferView": position_view,
                "componentType": 5126,
                "count": uvs.len(),
                "type": "VEC3",
                "min": [0.0, 0.0, 0.0],
                "max": [max_x, 0.0, 0.0]
            }),
        );

        let uv_view = self.push_view(bytemuck::cast_slice(uvs));
        let uv = self.push(
            "accessors",
            json!({
                "bufferView": uv_view,
                "componentType": 5126,
                "count": uvs.len(),
                "type": "VEC2"
            }),
        );

        self.add_primitive_reusing(material, uv);
        uv
    }

    /// Add a mesh whose primitive reuses the accessors created by an earlier
    /// `add_primitive` call.
    pub fn add_primitive_reusing(&mut self, material: u32, uv: u32) {
        self.push(
            "meshes",
            json!({
                "primitives": [{
                    "attributes": { "POSITION": uv - 1, "TEXCOORD_0": uv },
                    "material": material
                }]
            }),
        );
    }

    /// Final document with the vendor block attached, as the JSON a GLB
    /// would carry.
    pub fn document(&self) -> Value {
        let mut doc = self.doc.clone();
        doc["extensions"][self.schema.marker()] = self.vendor.clone();

        if !self.bin.is_empty() {
            doc["buffers"] = json!([{ "byteLength": self.bin.len() }]);
        }

        let mesh_count = doc["meshes"].as_array().map_or(0, Vec::len);
        if mesh_count > 0 {
            let nodes: Vec<Value> = (0..mesh_count).map(|m| json!({ "mesh": m })).collect();
            doc["nodes"] = Value::Array(nodes);
            doc["scenes"] = json!([{ "nodes": (0..mesh_count).collect::<Vec<_>>() }]);
            doc["scene"] = json!(0);
        }

        if let Some(root) = doc.as_object_mut() {
            root.retain(|_, v| !matches!(v, Value::Array(a) if a.is_empty()));
        }
        doc
    }

    pub fn build(&self) -> Scenegraph {
        let bin = (!self.bin.is_empty()).then(|| self.bin.clone());
        let container = GlbContainer::new(self.document(), bin);
        Scenegraph::from_container(container).expect("fixture is a valid avatar")
    }

    pub fn build_glb(&self) -> Vec<u8> {
        self.build().to_glb().expect("encode fixture")
    }
}
