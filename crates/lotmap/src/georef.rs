//! Pixel space -> EPSG:4326.
//!
//! Tiles carry a 6-parameter affine transform (`X = a·x + b·y + c`,
//! `Y = d·x + e·y + f`) into their CRS. Geographic CRSs map straight to
//! lon/lat; projected CRSs are reprojected vertex by vertex with proj4rs.
//!
//! Pixel area uses one scale per tile. For geographic tiles that is the
//! equirectangular approximation at the tile-centre latitude: fine at NAIP
//! tile sizes, not geodesic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geo::{coord, Coord, LineString, Polygon};
use proj4rs::proj::Proj;
use serde::{Deserialize, Serialize};

use crate::attributes::LotAttributes;
use crate::error::{LotError, Result};
use crate::extract::RawPolygon;

pub const METERS_PER_DEG_LAT: f64 = 110_574.0;
pub const METERS_PER_DEG_LON_EQUATOR: f64 = 111_320.0;

const WGS84_PROJ4: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// `[a, b, c, d, e, f]` in rasterio order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 6]", into = "[f64; 6]")]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl From<[f64; 6]> for AffineTransform {
    fn from([a, b, c, d, e, f]: [f64; 6]) -> Self {
        Self { a, b, c, d, e, f }
    }
}

impl From<AffineTransform> for [f64; 6] {
    fn from(t: AffineTransform) -> Self {
        [t.a, t.b, t.c, t.d, t.e, t.f]
    }
}

impl AffineTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        e: 1.0,
        f: 0.0,
    };

    /// North-up transform with square-ish pixels.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_w: f64, pixel_h: f64) -> Self {
        Self {
            a: pixel_w,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -pixel_h,
            f: origin_y,
        }
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.c,
            self.d * x + self.e * y + self.f,
        )
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    fn degeneracy(&self) -> Option<&'static str> {
        let all = [self.a, self.b, self.c, self.d, self.e, self.f];
        if all.iter().any(|v| !v.is_finite()) {
            Some("non-finite coefficient")
        } else if *self == Self::IDENTITY {
            Some("identity transform, tile was never georeferenced")
        } else if self.determinant() == 0.0 {
            Some("zero determinant")
        } else {
            None
        }
    }
}

/// Georeferencing metadata for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub tile_id: String,
    pub pixel_width: usize,
    pub pixel_height: usize,
    pub affine_transform: AffineTransform,
    pub crs: String,
    /// Imagery acquisition time, when the inference stage knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

/// Where tile coordinates live before they become lon/lat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// Degrees on (or close enough to) WGS 84.
    Geographic,
    /// Any EPSG code known to `crs-definitions` that is not lon/lat.
    Projected(u16),
}

impl Crs {
    /// Accepts `EPSG:4326`, `CRS:84`, `OGC:CRS84`, `WGS84` and `EPSG:<code>`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_uppercase();
        if matches!(
            s.as_str(),
            "CRS:84" | "CRS84" | "OGC:CRS84" | "WGS84" | "EPSG:4326"
        ) {
            return Some(Self::Geographic);
        }
        let code: u16 = s.strip_prefix("EPSG:")?.parse().ok()?;
        let def = crs_definitions::from_code(code)?;
        if def.proj4.contains("+proj=longlat") {
            Some(Self::Geographic)
        } else {
            Some(Self::Projected(code))
        }
    }
}

struct Reprojection {
    source: Proj,
    target: Proj,
    /// Metres per CRS linear unit.
    unit_m: f64,
}

fn linear_unit_m(proj4: &str) -> f64 {
    for token in proj4.split_whitespace() {
        if let Some(v) = token.strip_prefix("+to_meter=") {
            if let Ok(m) = v.parse::<f64>() {
                return m;
            }
        }
        match token {
            "+units=us-ft" => return 1200.0 / 3937.0,
            "+units=ft" => return 0.3048,
            "+units=km" => return 1000.0,
            _ => {}
        }
    }
    1.0
}

fn projection_error(tile_id: &str, e: impl std::fmt::Debug) -> LotError {
    LotError::Projection {
        tile_id: tile_id.to_string(),
        reason: format!("{e:?}"),
    }
}

/// Per-tile projector. Built once per tile by the worker that owns it.
pub struct Georeferencer {
    tile_id: Arc<str>,
    transform: AffineTransform,
    width: usize,
    height: usize,
    reprojection: Option<Reprojection>,
}

impl Georeferencer {
    /// Resolves the CRS. The transform itself is checked lazily by
    /// [`Self::pixel_area_to_m2`].
    pub fn new(tile: &Tile) -> Result<Self> {
        let unsupported = || LotError::UnsupportedCrs {
            tile_id: tile.tile_id.clone(),
            crs: tile.crs.clone(),
        };
        let reprojection = match Crs::parse(&tile.crs).ok_or_else(unsupported)? {
            Crs::Geographic => None,
            Crs::Projected(code) => {
                let def = crs_definitions::from_code(code).ok_or_else(unsupported)?;
                Some(Reprojection {
                    source: Proj::from_proj_string(def.proj4)
                        .map_err(|e| projection_error(&tile.tile_id, e))?,
                    target: Proj::from_proj_string(WGS84_PROJ4)
                        .map_err(|e| projection_error(&tile.tile_id, e))?,
                    unit_m: linear_unit_m(def.proj4),
                })
            }
        };

        Ok(Self {
            tile_id: Arc::from(tile.tile_id.as_str()),
            transform: tile.affine_transform,
            width: tile.pixel_width,
            height: tile.pixel_height,
            reprojection,
        })
    }

    pub fn tile_id(&self) -> &str {
        &self.tile_id
    }

    /// Fractional pixel coordinates are fine; `(0, 0)` is the top-left corner
    /// of the top-left pixel.
    pub fn pixel_to_geo(&self, px: Coord<f64>) -> Result<Coord<f64>> {
        let (x, y) = self.transform.apply(px.x, px.y);
        match &self.reprojection {
            None => Ok(coord! { x: x, y: y }),
            Some(r) => {
                let mut p = (x, y, 0.0);
                proj4rs::transform::transform(&r.source, &r.target, &mut p)
                    .map_err(|e| projection_error(&self.tile_id, e))?;
                Ok(coord! { x: p.0.to_degrees(), y: p.1.to_degrees() })
            }
        }
    }

    /// Square metres covered by `pixel_area` square pixels.
    pub fn pixel_area_to_m2(&self, pixel_area: f64) -> Result<f64> {
        if let Some(reason) = self.transform.degeneracy() {
            return Err(self.degenerate(reason));
        }
        let det = self.transform.determinant().abs();
        let m2_per_px = match &self.reprojection {
            Some(r) => det * r.unit_m * r.unit_m,
            None => {
                let (_, lat) = self
                    .transform
                    .apply(self.width as f64 / 2.0, self.height as f64 / 2.0);
                if !(-90.0..=90.0).contains(&lat) {
                    return Err(self.degenerate("tile centre latitude out of range"));
                }
                let m_lon = METERS_PER_DEG_LON_EQUATOR * lat.to_radians().cos();
                det * m_lon * METERS_PER_DEG_LAT
            }
        };
        if !m2_per_px.is_finite() || m2_per_px <= 0.0 {
            return Err(self.degenerate("pixel covers no ground area"));
        }
        Ok(pixel_area * m2_per_px)
    }

    /// Tile outline in lon/lat.
    pub fn footprint(&self) -> Result<Polygon<f64>> {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
            .into_iter()
            .map(|(x, y)| self.pixel_to_geo(coord! { x: x, y: y }))
            .collect::<Result<Vec<_>>>()?;
        Ok(Polygon::new(LineString::from(corners), Vec::new()))
    }

    /// Projects one extracted polygon. Attributes are left for
    /// [`crate::attributes::AttributeEstimator::annotate`]. A shell that does
    /// not survive projection is reported as `DegenerateInput`.
    pub fn project(
        &self,
        raw: RawPolygon,
        footprint: &Arc<Polygon<f64>>,
    ) -> Result<GeoPolygon> {
        let ring = |r: &[Coord<f64>]| -> Result<LineString<f64>> {
            r.iter()
                .map(|&c| self.pixel_to_geo(c))
                .collect::<Result<Vec<_>>>()
                .map(LineString::from)
        };
        let exterior = ring(raw.exterior.as_slice())?;
        if exterior.0.len() < 3 || exterior.coords().any(|c| !c.x.is_finite() || !c.y.is_finite())
        {
            return Err(LotError::DegenerateInput(format!(
                "tile {}: exterior ring with {} vertices does not project to a polygon",
                self.tile_id,
                exterior.0.len()
            )));
        }
        let holes = raw
            .holes
            .iter()
            .map(|h| ring(h.as_slice()))
            .collect::<Result<Vec<_>>>()?;

        Ok(GeoPolygon {
            tile_id: Arc::clone(&self.tile_id),
            geometry: Polygon::new(exterior, holes),
            footprint: Arc::clone(footprint),
            pixel_area_m2: self.pixel_area_to_m2(1.0)?,
            m2_per_unit: 0.0,
            attributes: LotAttributes::default(),
            pixel: raw,
        })
    }

    fn degenerate(&self, reason: &str) -> LotError {
        LotError::DegenerateTransform {
            tile_id: self.tile_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A detected lot in lon/lat, still tied to the tile it came from.
#[derive(Debug, Clone)]
pub struct GeoPolygon {
    pub tile_id: Arc<str>,
    pub geometry: Polygon<f64>,
    /// Outline of the source tile, shared by all its polygons.
    pub footprint: Arc<Polygon<f64>>,
    /// Ground area of one pixel of the source tile.
    pub pixel_area_m2: f64,
    /// Square metres per square degree of `geometry`; set by `annotate`.
    pub m2_per_unit: f64,
    pub attributes: LotAttributes,
    /// The pixel-space polygon this was projected from.
    pub pixel: RawPolygon,
}
