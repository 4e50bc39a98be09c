use serde_json::{Map, Value};

/// Top-level extension keys carrying the humanoid-avatar vendor metadata.
///
/// `VRMC_vrm` is the 1.0 profile, `VRM` the 0.x profile.
pub const VENDOR_EXTENSION_KEYS: [&str; 2] = ["VRMC_vrm", "VRM"];

/// An opaque vendor metadata object lifted out of the document's
/// top-level `extensions` map.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorBlock {
    pub key: String,
    pub value: Value,
}

/// Remove every known vendor block from `document.extensions`.
///
/// The `extensions` map itself is left in place (possibly empty) so that
/// re-attaching restores the original shape.
pub fn extract_vendor_blocks(document: &mut Value) -> Vec<VendorBlock> {
    let Some(extensions) = document
        .get_mut("extensions")
        .and_then(Value::as_object_mut)
    else {
        return Vec::new();
    };

    VENDOR_EXTENSION_KEYS
        .iter()
        .filter_map(|key| {
            extensions.remove(*key).map(|value| VendorBlock {
                key: (*key).to_string(),
                value,
            })
        })
        .collect()
}

/// Put vendor blocks back under `document.extensions`, creating the map when
/// the document has none.
pub fn attach_vendor_blocks(document: &mut Value, blocks: &[VendorBlock]) {
    if blocks.is_empty() {
        return;
    }
    let Some(root) = document.as_object_mut() else {
        return;
    };

    let extensions = root
        .entry("extensions")
        .or_insert_with(|| Value::Object(Map::new()));
    if !extensions.is_object() {
        *extensions = Value::Object(Map::new());
    }
    if let Some(map) = extensions.as_object_mut() {
        for block in blocks {
            map.insert(block.key.clone(), block.value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_and_attach_restore_document() {
        let original = json!({
            "asset": { "version": "2.0" },
            "extensions": {
                "VRMC_vrm": { "specVersion": "1.0", "meta": { "name": "Alicia" } },
                "VRMC_springBone": { "specVersion": "1.0" }
            }
        });

        let mut doc = original.clone();
        let blocks = extract_vendor_blocks(&mut doc);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].key, "VRMC_vrm");
        assert!(doc["extensions"].get("VRMC_vrm").is_none());
        // Unrelated extensions stay in the document.
        assert!(doc["extensions"].get("VRMC_springBone").is_some());

        attach_vendor_blocks(&mut doc, &blocks);
        assert_eq!(doc, original);
    }

    #[test]
    fn no_extensions_yields_nothing() {
        let mut doc = json!({ "asset": { "version": "2.0" } });
        assert!(extract_vendor_blocks(&mut doc).is_empty());
        attach_vendor_blocks(&mut doc, &[]);
        assert!(doc.get("extensions").is_none());
    }

    #[test]
    fn attach_creates_extension_map() {
        let mut doc = json!({ "asset": { "version": "2.0" } });
        let block = VendorBlock {
            key: "VRM".into(),
            value: json!({ "exporterVersion": "UniVRM-0.99" }),
        };
        attach_vendor_blocks(&mut doc, &[block]);
        assert_eq!(doc["extensions"]["VRM"]["exporterVersion"], "UniVRM-0.99");
    }
}
