//! GeoJSON output for the map front end (EPSG:4326, RFC 7946 winding).

use std::io::Write;

use geo::orient::{Direction, Orient};
use geo::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::attributes::SizeCategory;
use crate::merge::ParkingLotFeature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionType {
    FeatureCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryType {
    Polygon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub geometry: Geometry,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: GeometryType,
    /// Exterior ring first, then holes; every ring closed.
    pub coordinates: Vec<Vec<[f64; 2]>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub lot_id: u64,
    pub num_spots: u64,
    pub area_m2: f64,
    pub confidence: f64,
    pub size_category: SizeCategory,
    pub center_lat: f64,
    pub center_lon: f64,
}

/// Pure shape mapping; keeps the order it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureCollectionBuilder;

impl FeatureCollectionBuilder {
    pub fn build(features: Vec<ParkingLotFeature>) -> FeatureCollection {
        FeatureCollection {
            kind: CollectionType::FeatureCollection,
            features: features.into_iter().map(to_feature).collect(),
        }
    }
}

fn ring_coords(ls: &LineString<f64>) -> Vec<[f64; 2]> {
    ls.coords().map(|c| [c.x, c.y]).collect()
}

fn to_feature(f: ParkingLotFeature) -> Feature {
    let poly = f.geometry.orient(Direction::Default);
    let mut coordinates = Vec::with_capacity(1 + poly.interiors().len());
    coordinates.push(ring_coords(poly.exterior()));
    coordinates.extend(poly.interiors().iter().map(ring_coords));

    Feature {
        kind: FeatureType::Feature,
        geometry: Geometry {
            kind: GeometryType::Polygon,
            coordinates,
        },
        properties: Properties {
            lot_id: f.lot_id,
            num_spots: f.attributes.estimated_spot_count,
            area_m2: f.attributes.area_m2,
            confidence: f.attributes.mean_confidence,
            size_category: f.attributes.size_category,
            center_lat: f.centroid.y,
            center_lon: f.centroid.x,
        },
    }
}

impl Feature {
    /// Geometry back as a `geo` polygon; `None` without an exterior ring.
    pub fn polygon(&self) -> Option<Polygon<f64>> {
        let mut rings = self.geometry.coordinates.iter().map(|r| {
            LineString::from(
                r.iter()
                    .map(|&[x, y]| Coord { x, y })
                    .collect::<Vec<_>>(),
            )
        });
        let exterior = rings.next()?;
        Some(Polygon::new(exterior, rings.collect()))
    }
}

impl FeatureCollection {
    pub fn to_writer<W: Write>(&self, w: W, pretty: bool) -> serde_json::Result<()> {
        if pretty {
            serde_json::to_writer_pretty(w, self)
        } else {
            serde_json::to_writer(w, self)
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
