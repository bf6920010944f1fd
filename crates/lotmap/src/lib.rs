//! lotmap: parking-lot probability rasters -> deduplicated lot polygons.
//!
//! Per tile (parallel, no shared state):
//!   ProbabilityRaster --clean--> BinaryMask --extract--> RawPolygon (pixels)
//!     --project--> GeoPolygon (lon/lat) --annotate--> GeoPolygon + attributes
//!
//! Across tiles (single reduction point):
//!   Vec<GeoPolygon> --merge--> ParkingLotFeature --build--> FeatureCollection
//!
//! - Masks are 8-connected; boundaries follow pixel cracks.
//! - Areas are planar with one metres-per-pixel scale per tile.
//! - Output is EPSG:4326 GeoJSON with stable 0-based `lot_id`s.
//! - The same input always yields byte-identical output.

pub mod attributes;
pub mod clean;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod geometry;
pub mod georef;
pub mod merge;
pub mod pipeline;
pub mod raster;

pub use attributes::{AttributeEstimator, LotAttributes, SizeCategory};
pub use clean::{CleanReport, RasterCleaner};
pub use config::{AttributeOptions, CleanOptions, ExtractOptions, MergeOptions, PipelineConfig};
pub use error::{LotError, Result};
pub use export::{Feature, FeatureCollection, FeatureCollectionBuilder, Properties};
pub use extract::{PolygonExtractor, RawPolygon};
pub use georef::{AffineTransform, Crs, GeoPolygon, Georeferencer, Tile};
pub use merge::{MergeReport, ParkingLotFeature, TileMerger};
pub use pipeline::{
    Pipeline, PipelineOutput, PipelineStats, TileFailure, TileInput, TilePolygons, TileResult,
};
pub use raster::{BinaryMask, ProbabilityRaster};
