//! Planar ring helpers shared by extraction, attributes and merging.
//!
//! Rings are passed *open* (`&[Coord]` without the repeated closing vertex)
//! unless stated otherwise; `signed_area` and `ring_contains` accept both.

use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{Coord, Line, LineString, MultiPolygon, Polygon};

/// Shoelace area. In image space (y down) outer boundaries traced with the
/// foreground on the left come out negative; in lon/lat (y up) CCW is positive.
pub fn signed_area(ring: &[Coord<f64>]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..n {
        let (p, q) = (ring[i], ring[(i + 1) % n]);
        twice += p.x * q.y - q.x * p.y;
    }
    0.5 * twice
}

/// Even-odd point-in-ring.
pub fn ring_contains(ring: &[Coord<f64>], p: Coord<f64>) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Number of vertices left after dropping consecutive repeats.
pub fn distinct_vertices(ring: &[Coord<f64>]) -> usize {
    dedup(ring).len()
}

/// Drops consecutive repeats, including a trailing copy of the first vertex.
pub fn dedup(ring: &[Coord<f64>]) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(ring.len());
    for &c in ring {
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

/// Distance from `p` to the segment `a..b`.
#[inline]
pub fn segment_distance(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return ((p.x - a.x).powi(2) + (p.y - a.y).powi(2)).sqrt();
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    let (cx, cy) = (a.x + t * dx, a.y + t * dy);
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

/// Douglas–Peucker on an open polyline; both endpoints survive.
pub fn douglas_peucker(pts: &[Coord<f64>], tolerance: f64) -> Vec<Coord<f64>> {
    let n = pts.len();
    if n < 3 {
        return pts.to_vec();
    }
    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;

    // Explicit stack; long rings would otherwise recurse deeply on worker threads.
    let mut stack = vec![(0usize, n - 1)];
    while let Some((s, e)) = stack.pop() {
        if e <= s + 1 {
            continue;
        }
        let (mut idx, mut dmax) = (s, 0.0);
        for (i, &p) in pts.iter().enumerate().take(e).skip(s + 1) {
            let d = segment_distance(p, pts[s], pts[e]);
            if d > dmax {
                idx = i;
                dmax = d;
            }
        }
        if dmax > tolerance {
            keep[idx] = true;
            stack.push((s, idx));
            stack.push((idx, e));
        }
    }

    pts.iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

/// Closed-ring Douglas–Peucker anchored at vertex 0 and the vertex farthest from it.
/// Every dropped vertex stays within `tolerance` of the returned ring.
pub fn simplify_ring(ring: &[Coord<f64>], tolerance: f64) -> Vec<Coord<f64>> {
    let n = ring.len();
    if tolerance <= 0.0 || n < 4 {
        return ring.to_vec();
    }
    let origin = ring[0];
    let far = (1..n)
        .max_by(|&i, &j| {
            let di = (ring[i].x - origin.x).hypot(ring[i].y - origin.y);
            let dj = (ring[j].x - origin.x).hypot(ring[j].y - origin.y);
            // Ties resolve to the lowest index.
            di.total_cmp(&dj).then(j.cmp(&i))
        })
        .unwrap_or(0);
    if far == 0 {
        return ring.to_vec();
    }

    let first = douglas_peucker(&ring[..=far], tolerance);
    let mut tail = ring[far..].to_vec();
    tail.push(origin);
    let second = douglas_peucker(&tail, tolerance);

    let mut out = Vec::with_capacity(first.len() + second.len());
    out.extend_from_slice(&first[..first.len() - 1]);
    out.extend_from_slice(&second[..second.len() - 1]);
    out
}

#[inline]
fn bbox_overlap(a: Line<f64>, b: Line<f64>) -> bool {
    a.start.x.min(a.end.x) <= b.start.x.max(b.end.x)
        && b.start.x.min(b.end.x) <= a.start.x.max(a.end.x)
        && a.start.y.min(a.end.y) <= b.start.y.max(b.end.y)
        && b.start.y.min(b.end.y) <= a.start.y.max(a.end.y)
}

#[inline]
fn edge(ring: &[Coord<f64>], i: usize) -> Line<f64> {
    Line::new(ring[i], ring[(i + 1) % ring.len()])
}

/// No edge touches a non-adjacent edge and adjacent edges never fold back.
pub fn ring_is_simple(ring: &[Coord<f64>]) -> bool {
    let ring = dedup(ring);
    let n = ring.len();
    if n < 3 {
        return false;
    }
    for i in 0..n {
        let a = edge(&ring, i);
        for j in (i + 1)..n {
            let b = edge(&ring, j);
            if !bbox_overlap(a, b) {
                continue;
            }
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(a, b) {
                None => {}
                Some(LineIntersection::Collinear { .. }) => return false,
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(LineIntersection::SinglePoint { .. }) => return false,
            }
        }
    }
    true
}

/// True if any edge of `a` touches any edge of `b`.
pub fn rings_cross(a: &[Coord<f64>], b: &[Coord<f64>]) -> bool {
    if a.len() < 2 || b.len() < 2 {
        return false;
    }
    (0..a.len()).any(|i| {
        let ea = edge(a, i);
        (0..b.len()).any(|j| {
            let eb = edge(b, j);
            bbox_overlap(ea, eb) && line_intersection(ea, eb).is_some()
        })
    })
}

/// Open view of a closed `LineString`.
#[inline]
pub fn open_ring(ls: &LineString<f64>) -> &[Coord<f64>] {
    let c = &ls.0;
    if c.len() > 1 && c.first() == c.last() {
        &c[..c.len() - 1]
    } else {
        c
    }
}

/// Closed, finite, simple rings with non-zero area; holes inside the shell
/// and not touching it or each other.
pub fn polygon_is_valid(p: &Polygon<f64>) -> bool {
    let ring_ok = |ls: &LineString<f64>| {
        ls.0.len() >= 4
            && ls.0.first() == ls.0.last()
            && ls.0.iter().all(|c| c.x.is_finite() && c.y.is_finite())
            && signed_area(open_ring(ls)).abs() > 0.0
            && ring_is_simple(open_ring(ls))
    };

    let shell = open_ring(p.exterior());
    if !ring_ok(p.exterior()) {
        return false;
    }
    for (k, hole) in p.interiors().iter().enumerate() {
        let h = open_ring(hole);
        if !ring_ok(hole) || !ring_contains(shell, h[0]) || rings_cross(shell, h) {
            return false;
        }
        if p.interiors()[..k]
            .iter()
            .any(|other| rings_cross(open_ring(other), h))
        {
            return false;
        }
    }
    true
}

/// Each part valid; parts are not checked against each other.
pub fn multipolygon_is_valid(mp: &MultiPolygon<f64>) -> bool {
    !mp.0.is_empty() && mp.0.iter().all(polygon_is_valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    fn ring(pts: &[(f64, f64)]) -> Vec<Coord<f64>> {
        pts.iter().map(|&(x, y)| coord! { x: x, y: y }).collect()
    }

    #[test]
    fn test_signed_area_orientation() {
        // Clockwise on screen (y down) is counter-clockwise in math axes.
        let sq = ring(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        assert_eq!(signed_area(&sq), 1.0);
        let rev: Vec<_> = sq.iter().rev().copied().collect();
        assert_eq!(signed_area(&rev), -1.0);
    }

    #[test]
    fn test_ring_contains() {
        let sq = ring(&[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]);
        assert!(ring_contains(&sq, coord! { x: 2.0, y: 2.0 }));
        assert!(!ring_contains(&sq, coord! { x: 5.0, y: 2.0 }));
    }

    #[test]
    fn test_simplify_keeps_square_corners() {
        let mut pts = Vec::new();
        for i in 0..10 {
            pts.push((i as f64, 0.0));
        }
        for i in 0..10 {
            pts.push((10.0, i as f64));
        }
        for i in 0..10 {
            pts.push((10.0 - i as f64, 10.0));
        }
        for i in 0..10 {
            pts.push((0.0, 10.0 - i as f64));
        }
        let simplified = simplify_ring(&ring(&pts), 0.5);
        assert_eq!(simplified.len(), 4);
        assert_eq!(signed_area(&simplified), 100.0);
    }

    #[test]
    fn test_simplified_staircase_within_tolerance() {
        let mut pts = vec![(0.0, 0.0)];
        for i in 0..8 {
            let f = i as f64;
            pts.push((f + 1.0, f));
            pts.push((f + 1.0, f + 1.0));
        }
        pts.push((0.0, 8.0));
        let raw = ring(&pts);
        let simplified = simplify_ring(&raw, 1.0);
        assert!(simplified.len() < raw.len());
        for p in &raw {
            let d = (0..simplified.len())
                .map(|i| {
                    segment_distance(*p, simplified[i], simplified[(i + 1) % simplified.len()])
                })
                .fold(f64::INFINITY, f64::min);
            assert!(d <= 1.0 + 1e-9, "vertex {p:?} is {d} away");
        }
    }

    #[test]
    fn test_zero_tolerance_is_identity() {
        let r = ring(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        assert_eq!(simplify_ring(&r, 0.0), r);
    }

    #[test]
    fn test_bowtie_not_simple() {
        let bow = ring(&[(0.0, 0.0), (2.0, 2.0), (2.0, 0.0), (0.0, 2.0)]);
        assert!(!ring_is_simple(&bow));
        let sq = ring(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)]);
        assert!(ring_is_simple(&sq));
    }

    #[test]
    fn test_polygon_validity() {
        let shell = LineString::from(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]);
        let hole = LineString::from(vec![(1.0, 1.0), (1.0, 2.0), (2.0, 2.0), (2.0, 1.0)]);
        assert!(polygon_is_valid(&Polygon::new(shell.clone(), vec![hole])));

        let outside = LineString::from(vec![(5.0, 5.0), (5.0, 6.0), (6.0, 6.0)]);
        assert!(!polygon_is_valid(&Polygon::new(shell, vec![outside])));
    }
}
