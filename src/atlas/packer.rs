//! Next-Fit-Decreasing-Height shelf packer with floor/ceiling filling.
//!
//! Packing runs in normalized `[0,1]` space relative to the bound so the
//! same code path serves any target resolution. Placements are converted
//! back to whole pixels at the end.

use glam::{Affine2, Vec2};
use tracing::debug;

use crate::error::{AtlasError, Result};

/// Shrink factor applied per retry.
pub const RETRY_SCALE_STEP: f64 = 0.9;

const EPS: f64 = 1e-9;

/// Pixel size of one rectangle to pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectSize {
    pub width: u32,
    pub height: u32,
}

impl RectSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both sides, rounding down, never below one pixel.
    pub fn scaled(self, scale: f64) -> Self {
        let side = |v: u32| ((v as f64 * scale).floor() as u32).max(1);
        Self {
            width: side(self.width),
            height: side(self.height),
        }
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Where one source rectangle landed.
///
/// `width`/`height` are in the source's own orientation (after any retry
/// scaling); `original_*` are the sizes the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub source_index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    /// The source is stored rotated 90° clockwise.
    pub rotated: bool,
}

impl Placement {
    /// Rectangle the placement occupies in the atlas.
    pub fn footprint(&self) -> Rect {
        let (width, height) = if self.rotated {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        };
        Rect {
            x: self.x,
            y: self.y,
            width,
            height,
        }
    }

    /// Affine map from the source texture's UV space into the atlas.
    pub fn uv_transform(&self, atlas_width: u32, atlas_height: u32) -> Affine2 {
        let aw = atlas_width as f32;
        let ah = atlas_height as f32;
        let fp = self.footprint();
        let (x, y) = (fp.x as f32, fp.y as f32);
        let (fw, fh) = (fp.width as f32, fp.height as f32);

        if self.rotated {
            // Clockwise: source u runs down the footprint, v runs right to left.
            Affine2::from_cols(
                Vec2::new(0.0, fh / ah),
                Vec2::new(-fw / aw, 0.0),
                Vec2::new((x + fw) / aw, y / ah),
            )
        } else {
            Affine2::from_cols(
                Vec2::new(fw / aw, 0.0),
                Vec2::new(0.0, fh / ah),
                Vec2::new(x / aw, y / ah),
            )
        }
    }
}

/// Outcome of a successful packing run.
#[derive(Debug, Clone, PartialEq)]
pub struct PackingResult {
    /// Atlas size: used extent rounded up to a power of two, clamped to the bound.
    pub width: u32,
    pub height: u32,
    /// Factor applied to every source size to make them fit.
    pub scale: f64,
    /// One placement per input, in input order.
    pub placements: Vec<Placement>,
}

/// Padded rectangle in normalized space: `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy)]
struct NormRect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl NormRect {
    fn overlaps(&self, other: &NormRect) -> bool {
        self.x0 < other.x1 - EPS
            && other.x0 < self.x1 - EPS
            && self.y0 < other.y1 - EPS
            && other.y0 < self.y1 - EPS
    }
}

struct Shelf {
    top: f64,
    height: f64,
    /// Right edge of the floor run, growing left to right.
    floor_cursor: f64,
    /// Left edge of the ceiling run, growing right to left.
    ceiling_cursor: f64,
    floor: Vec<NormRect>,
    ceiling: Vec<NormRect>,
}

impl Shelf {
    fn new(top: f64, height: f64) -> Self {
        Self {
            top,
            height,
            floor_cursor: 0.0,
            ceiling_cursor: 1.0,
            floor: Vec::new(),
            ceiling: Vec::new(),
        }
    }

    /// Bottom-aligned slot after the last floor item.
    fn try_floor(&mut self, w: f64, h: f64) -> Option<NormRect> {
        if h > self.height + EPS || self.floor_cursor + w > 1.0 + EPS {
            return None;
        }
        let bottom = self.top + self.height;
        let rect = NormRect {
            x0: self.floor_cursor,
            y0: bottom - h,
            x1: self.floor_cursor + w,
            y1: bottom,
        };
        if self.ceiling.iter().any(|c| c.overlaps(&rect)) {
            return None;
        }
        self.floor_cursor = rect.x1;
        self.floor.push(rect);
        Some(rect)
    }

    /// Top-aligned slot before the last ceiling item.
    fn try_ceiling(&mut self, w: f64, h: f64) -> Option<NormRect> {
        if h > self.height + EPS || self.ceiling_cursor - w < -EPS {
            return None;
        }
        let rect = NormRect {
            x0: self.ceiling_cursor - w,
            y0: self.top,
            x1: self.ceiling_cursor,
            y1: self.top + h,
        };
        if self.floor.iter().any(|f| f.overlaps(&rect)) {
            return None;
        }
        self.ceiling_cursor = rect.x0;
        self.ceiling.push(rect);
        Some(rect)
    }
}

/// Pack `sizes` once, without scaling. Fails with `PackingFailed` when the
/// shelves overflow the bound.
pub fn pack(sizes: &[RectSize], bound_w: u32, bound_h: u32, padding: u32) -> Result<PackingResult> {
    pack_scaled(sizes, sizes, 1.0, bound_w, bound_h, padding)
}

/// Pack `sizes`, shrinking every rectangle by [`RETRY_SCALE_STEP`] per retry
/// until the layout fits or the smallest side would drop below one pixel.
pub fn pack_textures_nfdh(
    sizes: &[RectSize],
    bound_w: u32,
    bound_h: u32,
    padding: u32,
) -> Result<PackingResult> {
    let smallest_side = sizes
        .iter()
        .map(|s| s.width.min(s.height))
        .min()
        .unwrap_or(1) as f64;

    let mut scale = 1.0;
    loop {
        let scaled: Vec<RectSize> = if scale < 1.0 {
            sizes.iter().map(|s| s.scaled(scale)).collect()
        } else {
            sizes.to_vec()
        };

        match pack_scaled(&scaled, sizes, scale, bound_w, bound_h, padding) {
            Ok(result) => {
                if scale < 1.0 {
                    debug!(scale, "Packed after downscaling");
                }
                return Ok(result);
            }
            Err(AtlasError::PackingFailed { .. }) => {}
            Err(e) => return Err(e),
        }

        let next = scale * RETRY_SCALE_STEP;
        if smallest_side * next < 1.0 {
            return Err(AtlasError::PackingFailed { scale });
        }
        scale = next;
    }
}

fn pack_scaled(
    sizes: &[RectSize],
    originals: &[RectSize],
    scale: f64,
    bound_w: u32,
    bound_h: u32,
    padding: u32,
) -> Result<PackingResult> {
    if bound_w == 0 || bound_h == 0 {
        return Err(AtlasError::PackingFailed { scale });
    }
    if sizes.is_empty() {
        return Ok(PackingResult {
            width: 0,
            height: 0,
            scale,
            placements: Vec::new(),
        });
    }

    let bw = bound_w as f64;
    let bh = bound_h as f64;
    let pad_x = padding as f64 / bw;
    let pad_y = padding as f64 / bh;

    // Landscape orientation for every rectangle, then tallest first.
    let mut order: Vec<(usize, bool, f64, f64)> = sizes
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let rotated = s.height > s.width;
            let (w, h) = if rotated {
                (s.height, s.width)
            } else {
                (s.width, s.height)
            };
            (i, rotated, w as f64 / bw + 2.0 * pad_x, h as f64 / bh + 2.0 * pad_y)
        })
        .collect();
    order.sort_by(|a, b| b.3.total_cmp(&a.3));

    let mut shelves: Vec<Shelf> = Vec::new();
    let mut slots: Vec<Option<(NormRect, bool)>> = vec![None; sizes.len()];

    for &(index, rotated, w, h) in &order {
        let placed = shelves
            .iter_mut()
            .find_map(|shelf| shelf.try_floor(w, h).or_else(|| shelf.try_ceiling(w, h)));

        let rect = match placed {
            Some(rect) => rect,
            None => {
                let top = shelves.last().map_or(0.0, |s| s.top + s.height);
                if top + h > 1.0 + EPS || w > 1.0 + EPS {
                    return Err(AtlasError::PackingFailed { scale });
                }
                let mut shelf = Shelf::new(top, h);
                let rect = shelf
                    .try_floor(w, h)
                    .ok_or(AtlasError::PackingFailed { scale })?;
                shelves.push(shelf);
                rect
            }
        };
        slots[index] = Some((rect, rotated));
    }

    let mut placements = Vec::with_capacity(sizes.len());
    let (mut used_w, mut used_h) = (0u32, 0u32);
    for (index, slot) in slots.into_iter().enumerate() {
        let (rect, rotated) = slot.ok_or(AtlasError::PackingFailed { scale })?;
        let placement = Placement {
            source_index: index,
            x: (rect.x0 * bw).round() as u32 + padding,
            y: (rect.y0 * bh).round() as u32 + padding,
            width: sizes[index].width,
            height: sizes[index].height,
            original_width: originals[index].width,
            original_height: originals[index].height,
            rotated,
        };
        let fp = placement.footprint();
        used_w = used_w.max(fp.right() + padding);
        used_h = used_h.max(fp.bottom() + padding);
        placements.push(placement);
    }

    Ok(PackingResult {
        width: used_w.next_power_of_two().min(bound_w),
        height: used_h.next_power_of_two().min(bound_h),
        scale,
        placements,
    })
}
