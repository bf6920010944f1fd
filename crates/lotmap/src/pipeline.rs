//! Tile set -> feature collection.
//!
//! Tiles are processed independently on the rayon pool; each worker owns its
//! raster, mask and polygons. [`Pipeline::finish`] is the single reduction
//! point: it concatenates per-tile output in input order and runs the merge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeEstimator;
use crate::clean::{CleanReport, RasterCleaner};
use crate::config::PipelineConfig;
use crate::error::{LotError, Result};
use crate::export::{FeatureCollection, FeatureCollectionBuilder};
use crate::extract::PolygonExtractor;
use crate::georef::{GeoPolygon, Georeferencer, Tile};
use crate::merge::{MergeReport, TileMerger};
use crate::raster::ProbabilityRaster;

/// One inference record: tile metadata plus `float[height][width]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileInput {
    #[serde(flatten)]
    pub tile: Tile,
    pub probability_raster: Vec<Vec<f32>>,
}

impl TileInput {
    pub fn into_parts(self) -> Result<(Tile, ProbabilityRaster)> {
        let raster = ProbabilityRaster::from_rows(self.probability_raster)?;
        Ok((self.tile, raster))
    }
}

/// Everything one tile contributes to the merge.
#[derive(Debug, Clone)]
pub struct TilePolygons {
    pub tile_id: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub polygons: Vec<GeoPolygon>,
    pub clean: CleanReport,
    pub dropped: usize,
    pub dropped_holes: usize,
}

/// A tile that produced nothing; the run carries on without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileFailure {
    pub tile_id: String,
    pub reason: String,
}

impl TileFailure {
    pub fn new(tile_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            tile_id: tile_id.into(),
            reason: err.to_string(),
        }
    }
}

pub type TileResult = std::result::Result<TilePolygons, TileFailure>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub tiles_total: usize,
    pub tiles_processed: usize,
    pub tiles_failed: usize,
    pub failures: Vec<TileFailure>,
    pub raw_foreground_px: usize,
    pub cleaned_foreground_px: usize,
    pub polygons_extracted: usize,
    pub polygons_dropped: usize,
    pub holes_dropped: usize,
    pub low_confidence_polygons: usize,
    pub merge: MergeReport,
    pub features: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_capture: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_capture: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub collection: FeatureCollection,
    pub stats: PipelineStats,
}

pub struct Pipeline {
    cleaner: RasterCleaner,
    extractor: PolygonExtractor,
    estimator: AttributeEstimator,
    merger: TileMerger,
}

impl Pipeline {
    /// Validates `config`; a bad value is fatal here, before any tile runs.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let estimator = AttributeEstimator::new(config.attributes);
        Ok(Self {
            cleaner: RasterCleaner::new(config.clean),
            extractor: PolygonExtractor::new(config.extract),
            merger: TileMerger::new(config.merge, estimator.clone()),
            estimator,
        })
    }

    /// clean -> extract -> project -> annotate for one tile.
    pub fn process_tile(&self, tile: Tile, raster: ProbabilityRaster) -> Result<TilePolygons> {
        if raster.width() != tile.pixel_width || raster.height() != tile.pixel_height {
            return Err(LotError::RasterShape {
                width: tile.pixel_width,
                height: tile.pixel_height,
                len: raster.width() * raster.height(),
            });
        }

        let georef = Georeferencer::new(&tile)?;
        // Fails fast on a degenerate transform, before any tracing.
        georef.pixel_area_to_m2(1.0)?;
        let footprint = Arc::new(georef.footprint()?);

        let (mask, clean) = self.cleaner.clean(&raster);
        let mut raws = self.extractor.extract(&mask);
        drop(mask);

        let mut polygons = Vec::new();
        let mut unprojectable = 0;
        for raw in raws.by_ref() {
            match georef.project(raw, &footprint) {
                Ok(poly) => polygons.push(self.estimator.annotate(poly, &raster)),
                Err(LotError::DegenerateInput(reason)) => {
                    debug!("{reason}");
                    unprojectable += 1;
                }
                Err(e) => return Err(e),
            }
        }
        let dropped = raws.dropped() + unprojectable;
        let dropped_holes = raws.dropped_holes();
        if dropped > 0 || dropped_holes > 0 {
            debug!(
                "tile {}: dropped {dropped} degenerate polygons, {dropped_holes} holes",
                tile.tile_id
            );
        }

        Ok(TilePolygons {
            tile_id: tile.tile_id,
            captured_at: tile.captured_at,
            polygons,
            clean,
            dropped,
            dropped_holes,
        })
    }

    /// [`Self::process_tile`] on a raw inference record, with the failure
    /// already attributed to its tile.
    pub fn process_input(&self, input: TileInput) -> TileResult {
        let tile_id = input.tile.tile_id.clone();
        input
            .into_parts()
            .and_then(|(tile, raster)| self.process_tile(tile, raster))
            .map_err(|e| TileFailure::new(tile_id, e))
    }

    /// Per-tile stages in parallel, then the merge.
    pub fn run(&self, inputs: Vec<TileInput>) -> PipelineOutput {
        let results: Vec<_> = inputs
            .into_par_iter()
            .map(|input| self.process_input(input))
            .collect();
        self.finish(results)
    }

    /// Explicit reduction over per-tile results, in the order given.
    pub fn finish(&self, results: Vec<TileResult>) -> PipelineOutput {
        let mut stats = PipelineStats {
            tiles_total: results.len(),
            ..PipelineStats::default()
        };

        let mut all = Vec::new();
        for result in results {
            match result {
                Ok(t) => {
                    stats.tiles_processed += 1;
                    stats.raw_foreground_px += t.clean.raw_foreground_px;
                    stats.cleaned_foreground_px += t.clean.cleaned_foreground_px;
                    stats.polygons_extracted += t.polygons.len();
                    stats.polygons_dropped += t.dropped;
                    stats.holes_dropped += t.dropped_holes;
                    stats.low_confidence_polygons += t
                        .polygons
                        .iter()
                        .filter(|p| p.attributes.low_confidence)
                        .count();
                    if let Some(at) = t.captured_at {
                        let first = stats.earliest_capture.map_or(at, |e| e.min(at));
                        let last = stats.latest_capture.map_or(at, |l| l.max(at));
                        stats.earliest_capture = Some(first);
                        stats.latest_capture = Some(last);
                    }
                    all.extend(t.polygons);
                }
                Err(failure) => {
                    warn!("tile {} skipped: {}", failure.tile_id, failure.reason);
                    stats.tiles_failed += 1;
                    stats.failures.push(failure);
                }
            }
        }

        let (features, merge) = self.merger.merge(all);
        stats.merge = merge;
        stats.features = features.len();

        if stats.polygons_dropped > 0 || stats.holes_dropped > 0 || merge.degraded_groups > 0 {
            warn!(
                "{} degenerate polygons and {} holes dropped, {} merge groups degraded",
                stats.polygons_dropped, stats.holes_dropped, merge.degraded_groups
            );
        }
        info!(
            "OK {} of {} tiles -> {} lots",
            stats.tiles_processed, stats.tiles_total, stats.features
        );

        PipelineOutput {
            collection: FeatureCollectionBuilder::build(features),
            stats,
        }
    }
}
