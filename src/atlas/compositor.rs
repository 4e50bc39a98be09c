use image::{RgbaImage, imageops};
use tracing::debug;

use crate::atlas::packer::{PackingResult, Rect};
use crate::error::{AtlasError, Result};

/// Copy each source into the atlas at its placement.
///
/// `sources` is indexed by `Placement::source_index`; a `None` entry leaves
/// that region transparent. Sources must already have the placement's
/// (scaled) dimensions, and rotated placements are turned 90° clockwise.
/// Edge texels are then replicated `bleed` pixels outward.
pub fn composite(
    result: &PackingResult,
    sources: &[Option<RgbaImage>],
    bleed: u32,
) -> Result<RgbaImage> {
    let mut atlas = RgbaImage::new(result.width, result.height);

    for placement in &result.placements {
        let Some(Some(source)) = sources.get(placement.source_index) else {
            continue;
        };
        if source.dimensions() != (placement.width, placement.height) {
            return Err(AtlasError::CompositeFailed(format!(
                "source {} is {}x{} but its placement is {}x{}",
                placement.source_index,
                source.width(),
                source.height(),
                placement.width,
                placement.height
            )));
        }

        let fp = placement.footprint();
        if fp.right() > atlas.width() || fp.bottom() > atlas.height() {
            return Err(AtlasError::CompositeFailed(format!(
                "placement {fp:?} exceeds the {}x{} atlas",
                atlas.width(),
                atlas.height()
            )));
        }

        if placement.rotated {
            let turned = imageops::rotate90(source);
            imageops::replace(&mut atlas, &turned, fp.x as i64, fp.y as i64);
        } else {
            imageops::replace(&mut atlas, source, fp.x as i64, fp.y as i64);
        }
        fill_bleed(&mut atlas, &fp, bleed);
    }

    debug!(
        width = atlas.width(),
        height = atlas.height(),
        placements = result.placements.len(),
        "Composited atlas"
    );
    Ok(atlas)
}

/// Replicate edge pixels of `rect` up to `bleed` pixels outward, corners
/// included, clipped to the atlas.
fn fill_bleed(atlas: &mut RgbaImage, rect: &Rect, bleed: u32) {
    if bleed == 0 || rect.width == 0 || rect.height == 0 {
        return;
    }
    let (atlas_w, atlas_h) = atlas.dimensions();

    // Top and bottom rows
    for x in rect.x..rect.right() {
        let top = *atlas.get_pixel(x, rect.y);
        let bottom = *atlas.get_pixel(x, rect.bottom() - 1);
        for p in 1..=bleed {
            if rect.y >= p {
                atlas.put_pixel(x, rect.y - p, top);
            }
            let y = rect.bottom() - 1 + p;
            if y < atlas_h {
                atlas.put_pixel(x, y, bottom);
            }
        }
    }

    // Left and right columns, across the bled rows too
    let y_start = rect.y.saturating_sub(bleed);
    let y_end = (rect.bottom() + bleed).min(atlas_h);
    for y in y_start..y_end {
        let left = *atlas.get_pixel(rect.x, y);
        let right = *atlas.get_pixel(rect.right() - 1, y);
        for p in 1..=bleed {
            if rect.x >= p {
                atlas.put_pixel(rect.x - p, y, left);
            }
            let x = rect.right() - 1 + p;
            if x < atlas_w {
                atlas.put_pixel(x, y, right);
            }
        }
    }
}
