//! Binary mask -> pixel-space polygons.
//!
//! Boundaries are traced along pixel cracks, so ring vertices sit on pixel
//! corners and a traced ring encloses exactly its component's pixels.
//! Directed crack edges keep foreground on their left (image axes, y down):
//!
//! ```text
//!   top    (x+1,y)   -> (x,y)       bottom (x,y+1)   -> (x+1,y+1)
//!   left   (x,y)     -> (x,y+1)     right  (x+1,y+1) -> (x+1,y)
//! ```
//!
//! At a checkerboard corner the tracer turns right, which joins diagonally
//! touching pixels into one ring (8-connectivity); the emitted vertex is
//! nudged by `SADDLE_OFFSET` into the turn so rings never touch themselves.
//! Outer rings come out with negative shoelace area, holes positive.

use geo::{coord, Coord, LineString, Polygon, Rect};
use log::debug;

use crate::config::ExtractOptions;
use crate::geometry::{
    distinct_vertices, ring_contains, ring_is_simple, rings_cross, signed_area, simplify_ring,
};
use crate::raster::BinaryMask;

const SADDLE_OFFSET: f64 = 0.125;

// E, S, W, N
const DIRS: [(i64, i64); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];
const EAST: u8 = 0;
const SOUTH: u8 = 1;
const WEST: u8 = 2;
const NORTH: u8 = 3;

#[inline]
fn right_of(d: u8) -> u8 {
    (d + 1) % 4
}

/// One simple polygon in pixel coordinates. Rings are open (no repeated
/// closing vertex); the exterior is ordered foreground-on-the-left.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPolygon {
    pub exterior: Vec<Coord<f64>>,
    pub holes: Vec<Vec<Coord<f64>>>,
}

impl RawPolygon {
    /// Outer area minus hole areas, in square pixels.
    pub fn area_px(&self) -> f64 {
        signed_area(&self.exterior).abs()
            - self
                .holes
                .iter()
                .map(|h| signed_area(h).abs())
                .sum::<f64>()
    }

    /// Inside the exterior and outside every hole.
    pub fn contains(&self, p: Coord<f64>) -> bool {
        ring_contains(&self.exterior, p) && !self.holes.iter().any(|h| ring_contains(h, p))
    }

    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        let first = *self.exterior.first()?;
        let (mut min, mut max) = (first, first);
        for c in &self.exterior {
            min = coord! { x: min.x.min(c.x), y: min.y.min(c.y) };
            max = coord! { x: max.x.max(c.x), y: max.y.max(c.y) };
        }
        Some(Rect::new(min, max))
    }

    /// Every ring, exterior first; used for even-odd scanlines.
    pub fn rings(&self) -> impl Iterator<Item = &[Coord<f64>]> {
        std::iter::once(self.exterior.as_slice()).chain(self.holes.iter().map(Vec::as_slice))
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(self.exterior.clone()),
            self.holes.iter().cloned().map(LineString::from).collect(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PolygonExtractor {
    opts: ExtractOptions,
}

impl PolygonExtractor {
    pub fn new(opts: ExtractOptions) -> Self {
        Self { opts }
    }

    /// Traces every ring of `mask` up front, then simplifies and yields one
    /// polygon at a time. Calling `extract` again restarts from scratch.
    pub fn extract(&self, mask: &BinaryMask) -> RawPolygons {
        let rings = trace_rings(mask);
        let traced = rings.len();
        let (outers, dropped_holes) = assemble(rings, self.opts.min_hole_px);
        debug!(
            "extract: {traced} rings -> {} outers ({dropped_holes} holes below {} px²)",
            outers.len(),
            self.opts.min_hole_px
        );
        RawPolygons {
            pending: outers.into_iter(),
            tolerance: self.opts.tolerance_px,
            dropped: 0,
            dropped_holes: 0,
        }
    }
}

/// Lazy sequence returned by [`PolygonExtractor::extract`].
pub struct RawPolygons {
    pending: std::vec::IntoIter<RawPolygon>,
    tolerance: f64,
    dropped: usize,
    dropped_holes: usize,
}

impl RawPolygons {
    /// Polygons discarded as degenerate so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Holes that fit neither the simplified nor the traced shell.
    pub fn dropped_holes(&self) -> usize {
        self.dropped_holes
    }
}

impl Iterator for RawPolygons {
    type Item = RawPolygon;

    fn next(&mut self) -> Option<RawPolygon> {
        for traced in self.pending.by_ref() {
            match finalize(traced, self.tolerance) {
                Some((poly, lost_holes)) => {
                    self.dropped_holes += lost_holes;
                    return Some(poly);
                }
                None => self.dropped += 1,
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.pending.len()))
    }
}

#[inline]
fn degenerate(ring: &[Coord<f64>]) -> bool {
    distinct_vertices(ring) < 3 || signed_area(ring).abs() <= f64::EPSILON
}

/// Simplifies every ring. A shell that collapses drops the polygon. When a
/// hole cannot be placed inside the simplified shell the traced shell is used
/// instead, so no undetected background ends up inside a lot. Returns the
/// polygon and the number of holes that still had to go.
fn finalize(traced: RawPolygon, tolerance: f64) -> Option<(RawPolygon, usize)> {
    let exterior = simplify_or_keep(&traced.exterior, tolerance);
    if degenerate(&exterior) {
        return None;
    }

    let fitted: Option<Vec<_>> = traced
        .holes
        .iter()
        .map(|h| fit_hole(&exterior, h, tolerance))
        .collect();
    let (poly, lost) = match fitted {
        Some(holes) => (RawPolygon { exterior, holes }, 0),
        None => {
            let mut holes = Vec::with_capacity(traced.holes.len());
            let mut lost = 0;
            for h in &traced.holes {
                match fit_hole(&traced.exterior, h, tolerance) {
                    Some(h) => holes.push(h),
                    None => lost += 1,
                }
            }
            let poly = RawPolygon {
                exterior: traced.exterior,
                holes,
            };
            (poly, lost)
        }
    };
    (poly.area_px() > 0.0).then_some((poly, lost))
}

/// The simplified hole if it is usable inside `exterior`, else the traced one.
fn fit_hole(
    exterior: &[Coord<f64>],
    hole: &[Coord<f64>],
    tolerance: f64,
) -> Option<Vec<Coord<f64>>> {
    let simplified = simplify_or_keep(hole, tolerance);
    if !degenerate(&simplified) && !rings_cross(exterior, &simplified) {
        return Some(simplified);
    }
    (!degenerate(hole) && !rings_cross(exterior, hole)).then(|| hole.to_vec())
}

fn simplify_or_keep(ring: &[Coord<f64>], tolerance: f64) -> Vec<Coord<f64>> {
    let simplified = simplify_ring(ring, tolerance);
    if simplified.len() == ring.len() || degenerate(&simplified) || ring_is_simple(&simplified) {
        simplified
    } else {
        ring.to_vec()
    }
}

// ---------------------------------------------------------------------------
// Crack tracing
// ---------------------------------------------------------------------------

/// All boundary rings of `mask`, in row-major order of their first edge.
pub(crate) fn trace_rings(mask: &BinaryMask) -> Vec<Vec<Coord<f64>>> {
    let (w, h) = (mask.width(), mask.height());
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let vw = w + 1;
    let vid = |x: usize, y: usize| y * vw + x;

    // Outgoing crack directions per corner vertex, one bit per direction.
    let mut out = vec![0u8; vw * (h + 1)];
    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) {
                continue;
            }
            let (xi, yi) = (x as isize, y as isize);
            if !mask.get_or_bg(xi, yi - 1) {
                out[vid(x + 1, y)] |= 1 << WEST;
            }
            if !mask.get_or_bg(xi, yi + 1) {
                out[vid(x, y + 1)] |= 1 << EAST;
            }
            if !mask.get_or_bg(xi - 1, yi) {
                out[vid(x, y)] |= 1 << SOUTH;
            }
            if !mask.get_or_bg(xi + 1, yi) {
                out[vid(x + 1, y + 1)] |= 1 << NORTH;
            }
        }
    }

    let mut used = vec![0u8; out.len()];
    let mut rings = Vec::new();
    for start in 0..out.len() {
        for d in 0..4u8 {
            let bit = 1 << d;
            if out[start] & bit != 0 && used[start] & bit == 0 {
                rings.push(follow(&out, &mut used, vw, start, d));
            }
        }
    }
    rings
}

fn follow(out: &[u8], used: &mut [u8], vw: usize, start: usize, start_dir: u8) -> Vec<Coord<f64>> {
    let mut ring = Vec::new();
    let (mut v, mut dir) = (start, start_dir);
    used[v] |= 1 << dir;

    loop {
        let (dx, dy) = DIRS[dir as usize];
        let (x, y) = ((v % vw) as i64 + dx, (v / vw) as i64 + dy);
        let next = y as usize * vw + x as usize;

        let saddle = out[next].count_ones() == 2;
        let next_dir = if saddle {
            right_of(dir)
        } else {
            out[next].trailing_zeros() as u8
        };

        if saddle {
            let (ox, oy) = DIRS[next_dir as usize];
            ring.push(coord! {
                x: x as f64 + SADDLE_OFFSET * (ox - dx) as f64,
                y: y as f64 + SADDLE_OFFSET * (oy - dy) as f64,
            });
        } else if next_dir != dir {
            ring.push(coord! { x: x as f64, y: y as f64 });
        }

        if next == start && next_dir == start_dir {
            break;
        }
        used[next] |= 1 << next_dir;
        v = next;
        dir = next_dir;
    }
    ring
}

/// Splits traced rings into outers and holes and hangs each hole on the
/// smallest outer ring containing it.
fn assemble(rings: Vec<Vec<Coord<f64>>>, min_hole_px: f64) -> (Vec<RawPolygon>, usize) {
    let mut outers: Vec<RawPolygon> = Vec::new();
    let mut outer_area = Vec::new();
    let mut outer_box = Vec::new();
    let mut holes = Vec::new();

    for ring in rings {
        let a = signed_area(&ring);
        if a < 0.0 {
            let poly = RawPolygon {
                exterior: ring,
                holes: Vec::new(),
            };
            outer_box.push(poly.bounding_rect());
            outer_area.push(-a);
            outers.push(poly);
        } else if a > 0.0 {
            holes.push((a, ring));
        }
    }

    let mut dropped = 0;
    for (area, hole) in holes {
        if area < min_hole_px {
            dropped += 1;
            continue;
        }
        let anchor = hole[0];
        let owner = (0..outers.len())
            .filter(|&i| {
                outer_box[i].is_some_and(|r| {
                    r.min().x <= anchor.x
                        && anchor.x <= r.max().x
                        && r.min().y <= anchor.y
                        && anchor.y <= r.max().y
                })
            })
            .filter(|&i| ring_contains(&outers[i].exterior, anchor))
            .min_by(|&i, &j| outer_area[i].total_cmp(&outer_area[j]));
        match owner {
            Some(i) => outers[i].holes.push(hole),
            None => dropped += 1,
        }
    }
    (outers, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(tolerance_px: f64) -> PolygonExtractor {
        PolygonExtractor::new(ExtractOptions {
            tolerance_px,
            min_hole_px: 1.0,
        })
    }

    #[test]
    fn test_single_pixel_ring() {
        let m = BinaryMask::from_ascii(&["...", ".#.", "..."]);
        let rings = trace_rings(&m);
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].len(), 4);
        assert_eq!(signed_area(&rings[0]), -1.0);
    }

    #[test]
    fn test_full_block_is_one_rectangle() {
        let m = BinaryMask::from_vec(100, 100, vec![1; 100 * 100]).unwrap();
        let polys: Vec<_> = extractor(1.0).extract(&m).collect();
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].exterior.len(), 4);
        assert_eq!(polys[0].area_px(), 10_000.0);
    }

    #[test]
    fn test_hole_is_attached() {
        let m = BinaryMask::from_ascii(&[
            "......", //
            ".####.",
            ".#..#.",
            ".#..#.",
            ".####.",
            "......",
        ]);
        let polys: Vec<_> = extractor(0.0).extract(&m).collect();
        assert_eq!(polys.len(), 1);
        assert_eq!(polys[0].holes.len(), 1);
        assert_eq!(polys[0].area_px(), 12.0);
        assert!(!polys[0].contains(coord! { x: 2.5, y: 2.5 }));
        assert!(polys[0].contains(coord! { x: 1.5, y: 1.5 }));
    }

    #[test]
    fn test_small_hole_ignored() {
        let m = BinaryMask::from_ascii(&["...", "#.#", "..."]);
        // No enclosed hole at all here; now one that is enclosed but tiny.
        assert_eq!(trace_rings(&m).len(), 2);
        let m = BinaryMask::from_ascii(&["###", "#.#", "###"]);
        let ex = PolygonExtractor::new(ExtractOptions {
            tolerance_px: 0.0,
            min_hole_px: 4.0,
        });
        let polys: Vec<_> = ex.extract(&m).collect();
        assert_eq!(polys.len(), 1);
        assert!(polys[0].holes.is_empty());
        assert_eq!(polys[0].area_px(), 9.0);
    }

    #[test]
    fn test_diagonal_touch_joins() {
        let m = BinaryMask::from_ascii(&["#.", ".#"]);
        let polys: Vec<_> = extractor(0.0).extract(&m).collect();
        assert_eq!(polys.len(), 1);
        assert!(ring_is_simple(&polys[0].exterior));
        let a = polys[0].area_px();
        assert!(a > 2.0 && a < 2.5, "area {a}");
    }

    #[test]
    fn test_separate_blobs() {
        let m = BinaryMask::from_ascii(&["##...##", "##...##"]);
        let polys: Vec<_> = extractor(1.0).extract(&m).collect();
        assert_eq!(polys.len(), 2);
        assert!(polys.iter().all(|p| p.area_px() == 4.0));
    }

    #[test]
    fn test_empty_mask() {
        let m = BinaryMask::empty(10, 10);
        assert_eq!(extractor(1.0).extract(&m).count(), 0);
        let m = BinaryMask::empty(0, 0);
        assert_eq!(extractor(1.0).extract(&m).count(), 0);
    }

    #[test]
    fn test_degenerate_dropped_and_counted() {
        // A lone pixel collapses to a segment under a 1 px tolerance.
        let m = BinaryMask::from_ascii(&["....", ".#..", "...."]);
        let mut it = extractor(1.0).extract(&m);
        assert!(it.next().is_none());
        assert_eq!(it.dropped(), 1);
    }

    #[test]
    fn test_restartable() {
        let m = BinaryMask::from_ascii(&["##..##", "##..##", "....##"]);
        let ex = extractor(1.0);
        let a: Vec<_> = ex.extract(&m).collect();
        let b: Vec<_> = ex.extract(&m).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_hole_near_chamfered_shell_keeps_traced_shell() {
        // The shallow roof vertex sits 0.8 px above the chord, so a 1 px
        // tolerance flattens it right through the hole below.
        let pts = |v: &[(f64, f64)]| -> Vec<Coord<f64>> {
            v.iter().map(|&(x, y)| coord! { x: x, y: y }).collect()
        };
        let exterior = pts(&[(0.0, 0.0), (20.0, 0.0), (20.0, 4.0), (10.0, 4.8), (0.0, 4.0)]);
        let hole = pts(&[(9.0, 3.5), (9.0, 4.5), (11.0, 4.5), (11.0, 3.5)]);
        assert_eq!(simplify_or_keep(&exterior, 1.0).len(), 4);

        let traced = RawPolygon {
            exterior: exterior.clone(),
            holes: vec![hole.clone()],
        };
        let (poly, lost) = finalize(traced, 1.0).unwrap();
        assert_eq!(lost, 0);
        assert_eq!(poly.exterior, exterior);
        assert_eq!(poly.holes, vec![hole]);
        assert!((poly.area_px() - 86.0).abs() < 1e-9);
    }

    #[test]
    fn test_hole_outside_shell_is_counted() {
        let square = |x0: f64, y0: f64, s: f64| -> Vec<Coord<f64>> {
            vec![
                coord! { x: x0, y: y0 },
                coord! { x: x0 + s, y: y0 },
                coord! { x: x0 + s, y: y0 + s },
                coord! { x: x0, y: y0 + s },
            ]
        };
        // A hole straddling the shell fits neither shell and is dropped.
        let traced = RawPolygon {
            exterior: square(0.0, 0.0, 10.0),
            holes: vec![square(8.0, 2.0, 4.0), square(2.0, 2.0, 3.0)],
        };
        let (poly, lost) = finalize(traced, 0.0).unwrap();
        assert_eq!(lost, 1);
        assert_eq!(poly.holes, vec![square(2.0, 2.0, 3.0)]);
    }

    #[test]
    fn test_rings_stay_simple_on_checkerboard() {
        let m = BinaryMask::from_ascii(&["#.#.#", ".#.#.", "#.#.#", ".#.#."]);
        let rings = trace_rings(&m);
        assert!(!rings.is_empty());
        for r in &rings {
            assert!(ring_is_simple(r));
        }
        let polys: Vec<_> = extractor(0.0).extract(&m).collect();
        assert_eq!(polys.len(), 1);
    }
}
