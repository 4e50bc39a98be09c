use std::fmt;

use serde_json::Value;

use crate::container::VendorBlock;

/// Marker of the VRM 1.0 profile (schema A).
pub const VRM1_MARKER: &str = "VRMC_vrm";
/// Marker of the VRM 0.x profile (schema B).
pub const VRM0_MARKER: &str = "VRM";

/// Material-extension schema in use by an asset.
///
/// Decided once when the scenegraph is built and never re-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    /// VRM 1.0: MToon lives in `materials[*].extensions.VRMC_materials_mtoon`.
    Vrm1,
    /// VRM 0.x: shader parameters live in `extensions.VRM.materialProperties`.
    Vrm0,
}

impl SchemaVersion {
    /// Top-level extension key that marks this schema.
    pub fn marker(self) -> &'static str {
        match self {
            SchemaVersion::Vrm1 => VRM1_MARKER,
            SchemaVersion::Vrm0 => VRM0_MARKER,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Vrm1 => write!(f, "VRM 1.0"),
            SchemaVersion::Vrm0 => write!(f, "VRM 0.x"),
        }
    }
}

fn has_marker(document: &Value, vendor: &[VendorBlock], marker: &str) -> bool {
    let used = document
        .get("extensionsUsed")
        .and_then(Value::as_array)
        .is_some_and(|list| list.iter().any(|e| e.as_str() == Some(marker)));
    let in_map = document
        .get("extensions")
        .and_then(|e| e.get(marker))
        .is_some();
    let in_vendor = vendor.iter().any(|b| b.key == marker);

    used || in_map || in_vendor
}

/// Detect which schema the document uses. VRM 1.0 takes precedence when
/// both markers are present.
pub fn detect_schema_version(document: &Value, vendor: &[VendorBlock]) -> Option<SchemaVersion> {
    if has_marker(document, vendor, VRM1_MARKER) {
        Some(SchemaVersion::Vrm1)
    } else if has_marker(document, vendor, VRM0_MARKER) {
        Some(SchemaVersion::Vrm0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_vrm1_from_extensions_used() {
        let doc = json!({ "extensionsUsed": ["VRMC_vrm", "VRMC_materials_mtoon"] });
        assert_eq!(detect_schema_version(&doc, &[]), Some(SchemaVersion::Vrm1));
    }

    #[test]
    fn detects_vrm0_from_vendor_block() {
        let doc = json!({ "asset": { "version": "2.0" } });
        let vendor = vec![VendorBlock {
            key: "VRM".into(),
            value: json!({ "materialProperties": [] }),
        }];
        assert_eq!(detect_schema_version(&doc, &vendor), Some(SchemaVersion::Vrm0));
    }

    #[test]
    fn detects_vrm0_from_extension_map() {
        let doc = json!({ "extensions": { "VRM": {} } });
        assert_eq!(detect_schema_version(&doc, &[]), Some(SchemaVersion::Vrm0));
    }

    #[test]
    fn vrm1_wins_when_both_present() {
        let doc = json!({ "extensionsUsed": ["VRM", "VRMC_vrm"] });
        assert_eq!(detect_schema_version(&doc, &[]), Some(SchemaVersion::Vrm1));
    }

    #[test]
    fn plain_gltf_is_unsupported() {
        let doc = json!({ "extensionsUsed": ["KHR_materials_unlit"] });
        assert_eq!(detect_schema_version(&doc, &[]), None);
    }

    #[test]
    fn marker_and_display() {
        assert_eq!(SchemaVersion::Vrm1.marker(), "VRMC_vrm");
        assert_eq!(SchemaVersion::Vrm0.marker(), "VRM");
        assert_eq!(SchemaVersion::Vrm0.to_string(), "VRM 0.x");
    }
}
