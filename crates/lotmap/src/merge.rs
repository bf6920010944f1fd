//! Cross-tile deduplication.
//!
//! A lot straddling overlapping tiles is detected once per tile. Candidates
//! come from an R-tree over bounding boxes; pairs that overlap enough are
//! joined with union-find; each group becomes one feature.

use std::sync::Arc;

use geo::{Area, BooleanOps, BoundingRect, Centroid, Coord, CoordsIter, MultiPolygon, Polygon};
use hashbrown::HashMap;
use log::{debug, info, warn};
use nohash_hasher::BuildNoHashHasher;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use serde::Serialize;
use smallvec::SmallVec;

use crate::attributes::{AttributeEstimator, LotAttributes};
use crate::config::MergeOptions;
use crate::geometry::{multipolygon_is_valid, polygon_is_valid};
use crate::georef::GeoPolygon;

/// One physical lot, ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct ParkingLotFeature {
    pub lot_id: u64,
    pub geometry: Polygon<f64>,
    pub attributes: LotAttributes,
    /// Lon/lat of the geometry centroid.
    pub centroid: Coord<f64>,
    /// Tiles that contributed, sorted and unique.
    pub source_tiles: Vec<Arc<str>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub input_polygons: usize,
    pub candidate_pairs: usize,
    pub merged_pairs: usize,
    pub groups: usize,
    /// Groups with more than one member.
    pub merged_groups: usize,
    /// Groups whose union stayed invalid and fell back to the largest member.
    pub degraded_groups: usize,
}

/// Arena-backed disjoint sets over `0..n`.
#[derive(Debug, Clone)]
pub struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving.
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns false if `a` and `b` were already together.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

#[derive(Clone)]
struct IndexedBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

#[inline]
fn multi(p: &Polygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![p.clone()])
}

#[derive(Debug, Clone)]
pub struct TileMerger {
    opts: MergeOptions,
    estimator: AttributeEstimator,
}

impl TileMerger {
    pub fn new(opts: MergeOptions, estimator: AttributeEstimator) -> Self {
        Self { opts, estimator }
    }

    /// Groups duplicate detections and emits one feature per group, with
    /// `lot_id` assigned in (centroid lon, centroid lat) order.
    pub fn merge(&self, polygons: Vec<GeoPolygon>) -> (Vec<ParkingLotFeature>, MergeReport) {
        let mut report = MergeReport {
            input_polygons: polygons.len(),
            ..MergeReport::default()
        };

        // ----------------------------------------------------------------
        // Spatial index over bounding boxes.
        // ----------------------------------------------------------------
        let boxes: Vec<IndexedBox> = polygons
            .iter()
            .enumerate()
            .filter_map(|(idx, p)| {
                let r = p.geometry.bounding_rect()?;
                Some(IndexedBox {
                    idx,
                    env: AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]),
                })
            })
            .collect();
        let tree = RTree::bulk_load(boxes.clone());

        // ----------------------------------------------------------------
        // Candidate pairs and the exact overlap test, in parallel.
        // ----------------------------------------------------------------
        let candidates: Vec<(usize, usize)> = boxes
            .par_iter()
            .flat_map_iter(|b| {
                tree.locate_in_envelope_intersecting(&b.env)
                    .filter(|o| o.idx > b.idx)
                    .filter(|o| polygons[o.idx].tile_id != polygons[b.idx].tile_id)
                    .map(|o| (b.idx, o.idx))
                    .collect::<Vec<_>>()
            })
            .collect();
        report.candidate_pairs = candidates.len();

        let mut pairs: Vec<(usize, usize)> = candidates
            .into_par_iter()
            .filter(|&(i, j)| {
                let ratio = overlap_ratio(&polygons[i], &polygons[j]);
                debug!(
                    "overlap {}#{i} / {}#{j}: {ratio:.3}",
                    polygons[i].tile_id, polygons[j].tile_id
                );
                ratio > 0.0 && ratio >= self.opts.overlap_threshold
            })
            .collect();
        pairs.sort_unstable();
        report.merged_pairs = pairs.len();

        // ----------------------------------------------------------------
        // Union-find, single threaded.
        // ----------------------------------------------------------------
        let mut sets = DisjointSets::new(polygons.len());
        for &(i, j) in &pairs {
            sets.union(i, j);
        }

        let mut by_root: HashMap<usize, SmallVec<[usize; 4]>, BuildNoHashHasher<usize>> =
            HashMap::with_hasher(BuildNoHashHasher::default());
        for i in 0..polygons.len() {
            by_root.entry(sets.find(i)).or_default().push(i);
        }
        let mut groups: Vec<SmallVec<[usize; 4]>> = by_root.into_values().collect();
        groups.sort_unstable_by_key(|g| g[0]);
        report.groups = groups.len();
        report.merged_groups = groups.iter().filter(|g| g.len() > 1).count();

        // ----------------------------------------------------------------
        // Dissolve each group.
        // ----------------------------------------------------------------
        let dissolved: Vec<(ParkingLotFeature, bool)> = groups
            .par_iter()
            .map(|members| self.dissolve(&polygons, members))
            .collect();
        report.degraded_groups = dissolved.iter().filter(|(_, degraded)| *degraded).count();

        let mut features: Vec<ParkingLotFeature> =
            dissolved.into_iter().map(|(f, _)| f).collect();
        features.sort_by(|a, b| {
            a.centroid
                .x
                .total_cmp(&b.centroid.x)
                .then(a.centroid.y.total_cmp(&b.centroid.y))
                .then(a.attributes.area_m2.total_cmp(&b.attributes.area_m2))
        });
        for (id, f) in features.iter_mut().enumerate() {
            f.lot_id = id as u64;
            if f.source_tiles.len() > 1 {
                debug!("lot {id}: merged from {:?}", f.source_tiles);
            }
        }

        info!(
            "merge: {} polygons -> {} lots ({} merged groups, {} degraded)",
            report.input_polygons, report.groups, report.merged_groups, report.degraded_groups
        );
        (features, report)
    }

    /// Returns the feature and whether it had to fall back to one member.
    fn dissolve(&self, polygons: &[GeoPolygon], members: &[usize]) -> (ParkingLotFeature, bool) {
        let mut tiles: Vec<Arc<str>> = members
            .iter()
            .map(|&i| Arc::clone(&polygons[i].tile_id))
            .collect();
        tiles.sort();
        tiles.dedup();

        if let [only] = members {
            let p = &polygons[*only];
            return (feature(p.geometry.clone(), p.attributes.clone(), tiles), false);
        }

        match union_all(polygons, members) {
            Some(geometry) => {
                let scale_weight: f64 =
                    members.iter().map(|&i| polygons[i].attributes.area_m2).sum();
                let m2_per_unit = if scale_weight > 0.0 {
                    members
                        .iter()
                        .map(|&i| polygons[i].m2_per_unit * polygons[i].attributes.area_m2)
                        .sum::<f64>()
                        / scale_weight
                } else {
                    members.iter().map(|&i| polygons[i].m2_per_unit).sum::<f64>()
                        / members.len() as f64
                };
                let area_m2 = geometry.unsigned_area() * m2_per_unit;

                let confidence = if scale_weight > 0.0 {
                    members
                        .iter()
                        .map(|&i| {
                            polygons[i].attributes.mean_confidence * polygons[i].attributes.area_m2
                        })
                        .sum::<f64>()
                        / scale_weight
                } else {
                    0.0
                };
                let low = members.iter().all(|&i| polygons[i].attributes.low_confidence);
                let attributes = self.estimator.attributes_for(area_m2, confidence, low);
                (feature(geometry, attributes, tiles), false)
            }
            None => {
                let largest = largest_member(polygons, members);
                let p = &polygons[largest];
                warn!(
                    "merge: union of {} polygons from {:?} is invalid; keeping {}#{largest}",
                    members.len(),
                    tiles,
                    p.tile_id
                );
                (feature(p.geometry.clone(), p.attributes.clone(), tiles), true)
            }
        }
    }
}

/// Member with the largest area; ties go to the earliest index.
fn largest_member(polygons: &[GeoPolygon], members: &[usize]) -> usize {
    members
        .iter()
        .copied()
        .max_by(|&a, &b| {
            polygons[a]
                .attributes
                .area_m2
                .total_cmp(&polygons[b].attributes.area_m2)
                .then(b.cmp(&a))
        })
        .unwrap_or(members[0])
}

fn feature(
    geometry: Polygon<f64>,
    attributes: LotAttributes,
    source_tiles: Vec<Arc<str>>,
) -> ParkingLotFeature {
    let centroid = geometry
        .centroid()
        .map(|p| p.0)
        .or_else(|| geometry.bounding_rect().map(|r| r.center()))
        .unwrap_or(Coord { x: 0.0, y: 0.0 });
    ParkingLotFeature {
        lot_id: 0,
        geometry,
        attributes,
        centroid,
        source_tiles,
    }
}

/// `|A ∩ B| / min(|A'|, |B'|)` where `A'`, `B'` are the parts of each
/// polygon inside both tile footprints. A lot cut by a tile edge is only
/// seen by the other tile inside the overlap strip, so that is where the
/// two detections are comparable. Whole areas are used when the clipped
/// ones vanish.
pub fn overlap_ratio(a: &GeoPolygon, b: &GeoPolygon) -> f64 {
    let (ma, mb) = (multi(&a.geometry), multi(&b.geometry));
    let inter = ma.intersection(&mb).unsigned_area();
    if inter <= 0.0 {
        return 0.0;
    }

    let shared = multi(&a.footprint).intersection(&multi(&b.footprint));
    let a_in = ma.intersection(&shared).unsigned_area();
    let b_in = mb.intersection(&shared).unsigned_area();
    let denom = if a_in > 0.0 && b_in > 0.0 {
        a_in.min(b_in)
    } else {
        a.geometry.unsigned_area().min(b.geometry.unsigned_area())
    };
    if denom > 0.0 {
        (inter / denom).min(1.0)
    } else {
        0.0
    }
}

/// Unions the members; `None` when no valid single polygon comes out even
/// after one repair pass.
fn union_all(polygons: &[GeoPolygon], members: &[usize]) -> Option<Polygon<f64>> {
    let finite = |p: &Polygon<f64>| p.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite());
    if !members.iter().all(|&i| finite(&polygons[i].geometry)) {
        return None;
    }

    let mut acc = multi(&polygons[members[0]].geometry);
    for &i in &members[1..] {
        acc = acc.union(&multi(&polygons[i].geometry));
    }

    if !multipolygon_is_valid(&acc) {
        // Re-run the overlay against nothing to rebuild the topology.
        acc = acc.union(&MultiPolygon::new(Vec::new()));
        if !multipolygon_is_valid(&acc) {
            return None;
        }
    }

    // Slivers can split off along the seam; keep the dominant part.
    let part = acc
        .0
        .into_iter()
        .max_by(|p, q| p.unsigned_area().total_cmp(&q.unsigned_area()))?;
    (polygon_is_valid(&part) && part.unsigned_area() > 0.0).then_some(part)
}
