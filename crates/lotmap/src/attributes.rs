use std::fmt;

use geo::Area;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::AttributeOptions;
use crate::extract::RawPolygon;
use crate::georef::GeoPolygon;
use crate::raster::ProbabilityRaster;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    #[default]
    Small,
    Medium,
    Large,
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LotAttributes {
    pub area_m2: f64,
    pub estimated_spot_count: u64,
    /// Mean probability of the pixels inside the lot, in [0, 1].
    pub mean_confidence: f64,
    pub size_category: SizeCategory,
    /// Set when no pixel centre fell inside the polygon.
    pub low_confidence: bool,
}

#[derive(Debug, Clone)]
pub struct AttributeEstimator {
    opts: AttributeOptions,
}

impl AttributeEstimator {
    pub fn new(opts: AttributeOptions) -> Self {
        Self { opts }
    }

    /// Fills `poly.attributes` from its pixel outline and the tile's raster.
    pub fn annotate(&self, mut poly: GeoPolygon, confidence: &ProbabilityRaster) -> GeoPolygon {
        let area_m2 = poly.pixel.area_px() * poly.pixel_area_m2;
        let (sum, n) = sample_inside(&poly.pixel, confidence);
        let low_confidence = n == 0;
        let mean = if low_confidence { 0.0 } else { sum / n as f64 };

        poly.attributes = self.attributes_for(area_m2, mean, low_confidence);
        let geo_area = poly.geometry.unsigned_area();
        poly.m2_per_unit = if geo_area > 0.0 { area_m2 / geo_area } else { 0.0 };
        if low_confidence {
            debug!(
                "tile {}: polygon of {area_m2:.1} m² covers no pixel centre",
                poly.tile_id
            );
        }
        poly
    }

    /// Spot count and size class for an already known area and confidence.
    pub fn attributes_for(
        &self,
        area_m2: f64,
        mean_confidence: f64,
        low_confidence: bool,
    ) -> LotAttributes {
        let estimated_spot_count = self.spot_count(area_m2);
        LotAttributes {
            area_m2,
            estimated_spot_count,
            mean_confidence: mean_confidence.clamp(0.0, 1.0),
            size_category: self.size_category(estimated_spot_count),
            low_confidence,
        }
    }

    #[inline]
    pub fn spot_count(&self, area_m2: f64) -> u64 {
        (area_m2 / self.opts.spot_area_m2).round().max(0.0) as u64
    }

    #[inline]
    pub fn size_category(&self, spots: u64) -> SizeCategory {
        if spots < self.opts.small_threshold {
            SizeCategory::Small
        } else if spots >= self.opts.large_threshold {
            SizeCategory::Large
        } else {
            SizeCategory::Medium
        }
    }
}

/// Sums probabilities at pixel centres strictly inside `poly` (holes
/// excluded) with an even-odd scanline over all rings. NaN counts as 0,
/// everything else is clamped to [0, 1].
fn sample_inside(poly: &RawPolygon, raster: &ProbabilityRaster) -> (f64, usize) {
    let Some(rect) = poly.bounding_rect() else {
        return (0.0, 0);
    };
    let (w, h) = (raster.width(), raster.height());
    if w == 0 || h == 0 {
        return (0.0, 0);
    }
    let y0 = rect.min().y.floor().max(0.0) as usize;
    let y1 = (rect.max().y.ceil().max(0.0) as usize).min(h);

    let mut sum = 0.0;
    let mut n = 0usize;
    let mut xs: Vec<f64> = Vec::new();
    for y in y0..y1 {
        let yc = y as f64 + 0.5;
        xs.clear();
        for ring in poly.rings() {
            let len = ring.len();
            for i in 0..len {
                let (p, q) = (ring[i], ring[(i + 1) % len]);
                if (p.y > yc) != (q.y > yc) {
                    xs.push(p.x + (yc - p.y) * (q.x - p.x) / (q.y - p.y));
                }
            }
        }
        xs.sort_by(f64::total_cmp);

        for span in xs.chunks_exact(2) {
            // Pixel x is inside when its centre x + 0.5 lies in (span[0], span[1]).
            let lo = (span[0] - 0.5).floor() + 1.0;
            let hi = (span[1] - 0.5).ceil() - 1.0;
            if hi < 0.0 || lo > hi {
                continue;
            }
            let lo = lo.max(0.0) as usize;
            let hi = (hi as usize).min(w - 1);
            for x in lo..=hi {
                let p = raster.get(x, y);
                sum += if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) as f64 };
                n += 1;
            }
        }
    }
    (sum, n)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use geo::{coord, LineString, Polygon};

    use super::*;

    fn square(x0: f64, y0: f64, s: f64) -> Vec<geo::Coord<f64>> {
        vec![
            coord! { x: x0, y: y0 + s },
            coord! { x: x0 + s, y: y0 + s },
            coord! { x: x0 + s, y: y0 },
            coord! { x: x0, y: y0 },
        ]
    }

    fn geo_polygon(pixel: RawPolygon, pixel_area_m2: f64) -> GeoPolygon {
        let footprint = Polygon::new(LineString::from(square(0.0, 0.0, 1000.0)), vec![]);
        GeoPolygon {
            tile_id: Arc::from("t"),
            geometry: pixel.to_polygon(),
            footprint: Arc::new(footprint),
            pixel_area_m2,
            m2_per_unit: 0.0,
            attributes: LotAttributes::default(),
            pixel,
        }
    }

    fn raster(w: usize, h: usize, v: f32) -> ProbabilityRaster {
        ProbabilityRaster::new(w, h, vec![v; w * h]).unwrap()
    }

    #[test]
    fn test_full_square_concrete_scenario() {
        let est = AttributeEstimator::new(AttributeOptions::default());
        let poly = RawPolygon {
            exterior: square(0.0, 0.0, 100.0),
            holes: vec![],
        };
        let out = est.annotate(geo_polygon(poly, 1.0), &raster(100, 100, 0.8));
        let a = &out.attributes;
        assert_eq!(a.area_m2, 10_000.0);
        assert_eq!(a.estimated_spot_count, 333);
        assert_eq!(a.size_category, SizeCategory::Large);
        assert!((a.mean_confidence - 0.8).abs() < 1e-6);
        assert!(!a.low_confidence);
        assert_eq!(out.m2_per_unit, 1.0);
    }

    #[test]
    fn test_hole_excluded_from_confidence() {
        let mut data = vec![1.0f32; 10 * 10];
        for y in 3..7 {
            for x in 3..7 {
                data[y * 10 + x] = 0.0;
            }
        }
        let r = ProbabilityRaster::new(10, 10, data).unwrap();
        let mut hole = square(3.0, 3.0, 4.0);
        hole.reverse();
        let poly = RawPolygon {
            exterior: square(0.0, 0.0, 10.0),
            holes: vec![hole],
        };
        let (sum, n) = sample_inside(&poly, &r);
        assert_eq!(n, 100 - 16);
        assert_eq!(sum, 84.0);
        assert_eq!(poly.area_px(), 84.0);
    }

    #[test]
    fn test_no_pixel_centre_is_low_confidence() {
        let est = AttributeEstimator::new(AttributeOptions::default());
        // A sliver between two pixel-centre rows.
        let poly = RawPolygon {
            exterior: vec![
                coord! { x: 0.0, y: 0.6 },
                coord! { x: 10.0, y: 0.6 },
                coord! { x: 10.0, y: 0.9 },
                coord! { x: 0.0, y: 0.9 },
            ],
            holes: vec![],
        };
        let out = est.annotate(geo_polygon(poly, 1.0), &raster(10, 10, 0.9));
        assert!(out.attributes.low_confidence);
        assert_eq!(out.attributes.mean_confidence, 0.0);
    }

    #[test]
    fn test_spot_count_rounding_and_categories() {
        let est = AttributeEstimator::new(AttributeOptions::default());
        assert_eq!(est.spot_count(44.9), 1);
        assert_eq!(est.spot_count(45.0), 2);
        assert_eq!(est.spot_count(0.0), 0);
        assert_eq!(est.size_category(49), SizeCategory::Small);
        assert_eq!(est.size_category(50), SizeCategory::Medium);
        assert_eq!(est.size_category(199), SizeCategory::Medium);
        assert_eq!(est.size_category(200), SizeCategory::Large);
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let est = AttributeEstimator::new(AttributeOptions {
            spot_area_m2: 10.0,
            small_threshold: 5,
            large_threshold: 10,
        });
        let a = est.attributes_for(75.0, 0.5, false);
        assert_eq!(a.estimated_spot_count, 8);
        assert_eq!(a.size_category, SizeCategory::Medium);
    }

    #[test]
    fn test_annotate_is_deterministic() {
        let est = AttributeEstimator::new(AttributeOptions::default());
        let poly = RawPolygon {
            exterior: square(2.0, 2.0, 7.0),
            holes: vec![],
        };
        let r = raster(12, 12, 0.7);
        let a = est.annotate(geo_polygon(poly.clone(), 2.5), &r).attributes;
        let b = est.annotate(geo_polygon(poly, 2.5), &r).attributes;
        assert_eq!(a, b);
        assert_eq!(a.estimated_spot_count, (49.0f64 * 2.5 / 30.0).round() as u64);
    }
}
