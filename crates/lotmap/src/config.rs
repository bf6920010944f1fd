//! Tunables for every stage. All knobs have defaults and are validated once,
//! up front; nothing downstream clamps a bad value.

use serde::{Deserialize, Serialize};

use crate::error::{LotError, Result};

/// Thresholding and mask cleanup (see [`crate::clean`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanOptions {
    /// A pixel is foreground iff its probability is `>=` this value.
    pub threshold: f32,
    /// 8-connected foreground components smaller than this are erased.
    pub min_area_px: usize,
    /// Enclosed background components smaller than this are filled.
    pub fill_holes_px: usize,
    /// Half-width of the square closing element; 0 disables closing.
    pub closing_radius_px: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_area_px: 20,
            fill_holes_px: 64,
            closing_radius_px: 1,
        }
    }
}

/// Boundary tracing and ring simplification (see [`crate::extract`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    /// Maximum deviation of a simplified ring from the traced boundary, in pixels.
    pub tolerance_px: f64,
    /// Holes enclosing less than this many square pixels are not emitted.
    pub min_hole_px: f64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            tolerance_px: 1.0,
            min_hole_px: 4.0,
        }
    }
}

/// Area, spot-count and size-category rules (see [`crate::attributes`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeOptions {
    /// Ground area budgeted per parking space, aisles included.
    pub spot_area_m2: f64,
    /// Lots with fewer spots than this are `small`.
    pub small_threshold: u64,
    /// Lots with at least this many spots are `large`.
    pub large_threshold: u64,
}

impl Default for AttributeOptions {
    fn default() -> Self {
        Self {
            spot_area_m2: 30.0,
            small_threshold: 50,
            large_threshold: 200,
        }
    }
}

/// Cross-tile deduplication (see [`crate::merge`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Two detections are the same lot when `intersection / min(area)` reaches this.
    pub overlap_threshold: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub clean: CleanOptions,
    pub extract: ExtractOptions,
    pub attributes: AttributeOptions,
    pub merge: MergeOptions,
}

impl PipelineConfig {
    /// Reject out-of-range values instead of silently clamping them.
    pub fn validate(&self) -> Result<()> {
        let c = &self.clean;
        if !c.threshold.is_finite() || !(0.0..=1.0).contains(&c.threshold) {
            return Err(bad(format!("threshold must be in [0, 1], got {}", c.threshold)));
        }

        let e = &self.extract;
        if !e.tolerance_px.is_finite() || e.tolerance_px < 0.0 {
            return Err(bad(format!(
                "tolerance_px must be a non-negative number, got {}",
                e.tolerance_px
            )));
        }
        if !e.min_hole_px.is_finite() || e.min_hole_px < 0.0 {
            return Err(bad(format!(
                "min_hole_px must be a non-negative number, got {}",
                e.min_hole_px
            )));
        }

        let a = &self.attributes;
        if !a.spot_area_m2.is_finite() || a.spot_area_m2 <= 0.0 {
            return Err(bad(format!(
                "spot_area_m2 must be positive, got {}",
                a.spot_area_m2
            )));
        }
        if a.small_threshold > a.large_threshold {
            return Err(bad(format!(
                "small_threshold ({}) exceeds large_threshold ({})",
                a.small_threshold, a.large_threshold
            )));
        }

        let m = &self.merge;
        if !m.overlap_threshold.is_finite() || !(0.0..=1.0).contains(&m.overlap_threshold) {
            return Err(bad(format!(
                "overlap_threshold must be in [0, 1], got {}",
                m.overlap_threshold
            )));
        }

        Ok(())
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| bad(format!("unreadable config: {e}")))
    }
}

#[inline]
fn bad(msg: String) -> LotError {
    LotError::Configuration(msg)
}
