use serde_json::Value;
use tracing::debug;

use crate::container::vendor::{self, VendorBlock};
use crate::error::{AtlasError, Result};

pub const GLB_MAGIC: u32 = 0x46546C67; // "glTF"
pub const GLB_VERSION: u32 = 2;
pub const CHUNK_JSON: u32 = 0x4E4F534A; // "JSON"
pub const CHUNK_BIN: u32 = 0x004E4942; // "BIN\0"

const HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

/// Position of a chunk in the original file.
#[derive(Debug, Clone, PartialEq)]
enum ChunkEntry {
    Json,
    Bin,
    Opaque { chunk_type: u32, data: Vec<u8> },
}

/// A decoded GLB: the JSON document, the BIN payload, the vendor blocks
/// lifted out of the document and the original chunk order.
#[derive(Debug, Clone)]
pub struct GlbContainer {
    pub version: u32,
    pub document: Value,
    pub bin: Option<Vec<u8>>,
    pub vendor: Vec<VendorBlock>,
    layout: Vec<ChunkEntry>,
}

impl GlbContainer {
    /// Build a container from an in-memory document. Vendor blocks are
    /// extracted the same way `decode` does.
    pub fn new(mut document: Value, bin: Option<Vec<u8>>) -> Self {
        let vendor = vendor::extract_vendor_blocks(&mut document);
        let mut layout = vec![ChunkEntry::Json];
        if bin.is_some() {
            layout.push(ChunkEntry::Bin);
        }
        Self {
            version: GLB_VERSION,
            document,
            bin,
            vendor,
            layout,
        }
    }

    /// Vendor block stored under `key`, if any.
    pub fn vendor_block(&self, key: &str) -> Option<&VendorBlock> {
        self.vendor.iter().find(|b| b.key == key)
    }

    /// Number of chunks that `encode` will emit.
    pub fn chunk_count(&self) -> usize {
        let mut count = self.layout.len();
        if self.bin.is_some() && !self.layout.contains(&ChunkEntry::Bin) {
            count += 1;
        }
        if self.bin.is_none() && self.layout.contains(&ChunkEntry::Bin) {
            count -= 1;
        }
        count
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse GLB bytes into a [`GlbContainer`].
pub fn decode(data: &[u8]) -> Result<GlbContainer> {
    if data.len() < HEADER_LEN {
        return Err(AtlasError::InvalidContainer(
            "File too small for GLB header".into(),
        ));
    }

    let magic = read_u32_le(data, 0);
    let version = read_u32_le(data, 4);
    let length = read_u32_le(data, 8) as usize;

    if magic != GLB_MAGIC {
        return Err(AtlasError::InvalidContainer(format!(
            "Invalid GLB magic 0x{magic:08X}"
        )));
    }
    if length > data.len() {
        return Err(AtlasError::InvalidContainer(format!(
            "File truncated: header declares {length} bytes, got {}",
            data.len()
        )));
    }

    let mut offset = HEADER_LEN;
    let mut layout = Vec::new();
    let mut json_chunk: Option<&[u8]> = None;
    let mut bin: Option<Vec<u8>> = None;

    while offset + CHUNK_HEADER_LEN <= length {
        let chunk_length = read_u32_le(data, offset) as usize;
        let chunk_type = read_u32_le(data, offset + 4);
        offset += CHUNK_HEADER_LEN;

        if offset + chunk_length > length {
            return Err(AtlasError::InvalidContainer(
                "Chunk extends past file end".into(),
            ));
        }
        let chunk_data = &data[offset..offset + chunk_length];
        offset += chunk_length;

        match chunk_type {
            CHUNK_JSON => {
                if json_chunk.is_some() {
                    return Err(AtlasError::InvalidContainer(
                        "Multiple JSON chunks".into(),
                    ));
                }
                json_chunk = Some(chunk_data);
                layout.push(ChunkEntry::Json);
            }
            CHUNK_BIN if bin.is_none() => {
                bin = Some(chunk_data.to_vec());
                layout.push(ChunkEntry::Bin);
            }
            _ => layout.push(ChunkEntry::Opaque {
                chunk_type,
                data: chunk_data.to_vec(),
            }),
        }
    }

    let json_data =
        json_chunk.ok_or_else(|| AtlasError::InvalidContainer("No JSON chunk".into()))?;
    let trimmed_len = json_data
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    let mut document: Value = serde_json::from_slice(&json_data[..trimmed_len])
        .map_err(|e| AtlasError::InvalidContainer(format!("Malformed JSON chunk: {e}")))?;
    if !document.is_object() {
        return Err(AtlasError::InvalidContainer(
            "JSON chunk is not an object".into(),
        ));
    }

    let vendor = vendor::extract_vendor_blocks(&mut document);

    debug!(
        version,
        chunks = layout.len(),
        bin_len = bin.as_ref().map_or(0, Vec::len),
        vendor_blocks = vendor.len(),
        "Decoded GLB container"
    );

    Ok(GlbContainer {
        version,
        document,
        bin,
        vendor,
        layout,
    })
}

fn push_chunk(out: &mut Vec<u8>, chunk_type: u32, payload: &[u8], pad: u8) {
    let padding = (4 - payload.len() % 4) % 4;
    out.extend_from_slice(&((payload.len() + padding) as u32).to_le_bytes());
    out.extend_from_slice(&chunk_type.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend(std::iter::repeat_n(pad, padding));
}

/// Serialize a container back to GLB bytes, re-attaching the vendor blocks
/// and re-emitting every chunk in its original order.
pub fn encode(container: &GlbContainer) -> Result<Vec<u8>> {
    let mut document = container.document.clone();
    vendor::attach_vendor_blocks(&mut document, &container.vendor);
    let json_bytes = serde_json::to_vec(&document)?;

    let mut body = Vec::with_capacity(
        json_bytes.len() + container.bin.as_ref().map_or(0, Vec::len) + 64,
    );

    let mut bin_written = false;
    for entry in &container.layout {
        match entry {
            ChunkEntry::Json => {
                push_chunk(&mut body, CHUNK_JSON, &json_bytes, b' ');
                // A payload created during the run goes right after JSON.
                if !container.layout.contains(&ChunkEntry::Bin) {
                    if let Some(bin) = &container.bin {
                        push_chunk(&mut body, CHUNK_BIN, bin, 0);
                        bin_written = true;
                    }
                }
            }
            ChunkEntry::Bin => {
                if let Some(bin) = &container.bin {
                    push_chunk(&mut body, CHUNK_BIN, bin, 0);
                    bin_written = true;
                }
            }
            ChunkEntry::Opaque { chunk_type, data } => {
                push_chunk(&mut body, *chunk_type, data, 0);
            }
        }
    }
    debug_assert!(bin_written || container.bin.is_none());

    let total_length = HEADER_LEN + body.len();
    let total_length_u32 = u32::try_from(total_length).map_err(|_| {
        AtlasError::InvalidContainer(format!("Output of {total_length} bytes exceeds GLB limit"))
    })?;

    let mut out = Vec::with_capacity(total_length);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&container.version.to_le_bytes());
    out.extend_from_slice(&total_length_u32.to_le_bytes());
    out.extend_from_slice(&body);

    debug!(bytes = out.len(), "Encoded GLB container");
    Ok(out)
}
