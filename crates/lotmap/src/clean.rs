//! Probability raster -> cleaned binary mask.
//!
//! Stages, in order: threshold, small-object removal, hole filling, closing.
//! Connectivity is 8-neighbour everywhere.

use log::debug;
use serde::Serialize;

use crate::config::CleanOptions;
use crate::raster::{BinaryMask, ProbabilityRaster};

const NEIGH_8: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Pixel bookkeeping for one cleaned tile:
/// `cleaned = raw - removed + filled + closed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub raw_foreground_px: usize,
    pub removed_objects: usize,
    pub removed_px: usize,
    pub filled_holes: usize,
    pub filled_px: usize,
    /// Gaps bridged by closing; closing only ever adds pixels.
    pub closed_px: usize,
    pub cleaned_foreground_px: usize,
}

#[derive(Debug, Clone)]
pub struct RasterCleaner {
    opts: CleanOptions,
}

impl RasterCleaner {
    pub fn new(opts: CleanOptions) -> Self {
        Self { opts }
    }

    /// Never fails: an all-background raster cleans to an all-background mask.
    pub fn clean(&self, raster: &ProbabilityRaster) -> (BinaryMask, CleanReport) {
        let mut mask = threshold(raster, self.opts.threshold);
        let raw_foreground_px = mask.foreground_count();

        let (removed_objects, removed_px) = remove_small_objects(&mut mask, self.opts.min_area_px);
        let (filled_holes, filled_px) = fill_small_holes(&mut mask, self.opts.fill_holes_px);
        let before_closing = mask.foreground_count();
        let mask = close(&mask, self.opts.closing_radius_px);
        let cleaned_foreground_px = mask.foreground_count();

        let report = CleanReport {
            raw_foreground_px,
            removed_objects,
            removed_px,
            filled_holes,
            filled_px,
            closed_px: cleaned_foreground_px.saturating_sub(before_closing),
            cleaned_foreground_px,
        };
        debug!("clean: {report:?}");
        (mask, report)
    }
}

/// `p >= t` is foreground; NaN is background.
pub fn threshold(raster: &ProbabilityRaster, t: f32) -> BinaryMask {
    let data = raster
        .as_slice()
        .iter()
        .map(|&p| u8::from(p >= t))
        .collect();
    BinaryMask::from_raw(raster.width(), raster.height(), data)
}

struct Component {
    pixels: Vec<usize>,
    touches_border: bool,
}

/// Flood-fills every 8-connected component of pixels equal to `value`.
fn components(mask: &BinaryMask, value: bool) -> Vec<Component> {
    let (w, h) = (mask.width(), mask.height());
    let data = mask.as_slice();
    let mut seen = vec![false; w * h];
    let mut stack = Vec::new();
    let mut out = Vec::new();

    for start in 0..w * h {
        if seen[start] || (data[start] != 0) != value {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let mut comp = Component {
            pixels: Vec::new(),
            touches_border: false,
        };

        while let Some(idx) = stack.pop() {
            comp.pixels.push(idx);
            let (x, y) = ((idx % w) as isize, (idx / w) as isize);
            if x == 0 || y == 0 || x as usize == w - 1 || y as usize == h - 1 {
                comp.touches_border = true;
            }
            for (dx, dy) in NEIGH_8 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx as usize >= w || ny as usize >= h {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if !seen[n] && (data[n] != 0) == value {
                    seen[n] = true;
                    stack.push(n);
                }
            }
        }
        out.push(comp);
    }
    out
}

/// Erases foreground components with fewer than `min_area` pixels.
/// Returns `(components removed, pixels removed)`.
pub fn remove_small_objects(mask: &mut BinaryMask, min_area: usize) -> (usize, usize) {
    if min_area <= 1 {
        return (0, 0);
    }
    let small: Vec<Component> = components(mask, true)
        .into_iter()
        .filter(|c| c.pixels.len() < min_area)
        .collect();
    let data = mask.as_mut_slice();
    let mut px = 0;
    for c in &small {
        for &i in &c.pixels {
            data[i] = 0;
        }
        px += c.pixels.len();
    }
    (small.len(), px)
}

/// Fills enclosed background components (not touching the raster edge) with
/// fewer than `max_hole` pixels. Returns `(holes filled, pixels added)`.
pub fn fill_small_holes(mask: &mut BinaryMask, max_hole: usize) -> (usize, usize) {
    if max_hole <= 1 {
        return (0, 0);
    }
    let holes: Vec<Component> = components(mask, false)
        .into_iter()
        .filter(|c| !c.touches_border && c.pixels.len() < max_hole)
        .collect();
    let data = mask.as_mut_slice();
    let mut px = 0;
    for c in &holes {
        for &i in &c.pixels {
            data[i] = 1;
        }
        px += c.pixels.len();
    }
    (holes.len(), px)
}

/// Closing with a `(2r+1)²` square: dilate, then erode.
///
/// Outside the raster counts as background while dilating and as foreground
/// while eroding, so shapes cut by the tile edge keep their edge pixels.
pub fn close(mask: &BinaryMask, radius: usize) -> BinaryMask {
    if radius == 0 {
        return mask.clone();
    }
    let dilated = morph(mask, radius, true);
    morph(&dilated, radius, false)
}

fn morph(mask: &BinaryMask, radius: usize, dilate: bool) -> BinaryMask {
    let (w, h) = (mask.width(), mask.height());
    // Square element is separable: rows, then columns.
    let rows = line_pass(mask.as_slice(), w, h, radius, true, dilate);
    BinaryMask::from_raw(w, h, line_pass(&rows, w, h, radius, false, dilate))
}

fn line_pass(
    src: &[u8],
    w: usize,
    h: usize,
    radius: usize,
    horizontal: bool,
    dilate: bool,
) -> Vec<u8> {
    let (lines, len) = if horizontal { (h, w) } else { (w, h) };
    let at = |line: usize, i: usize| {
        if horizontal {
            line * w + i
        } else {
            i * w + line
        }
    };

    let mut out = vec![0u8; src.len()];
    let mut prefix = vec![0usize; len + 1];
    for line in 0..lines {
        for i in 0..len {
            prefix[i + 1] = prefix[i] + usize::from(src[at(line, i)] != 0);
        }
        for i in 0..len {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius).min(len - 1);
            let ones = prefix[hi + 1] - prefix[lo];
            let on = if dilate {
                ones > 0
            } else {
                ones == hi - lo + 1
            };
            out[at(line, i)] = u8::from(on);
        }
    }
    out
}
