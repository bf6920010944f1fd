use thiserror::Error;

/// Everything that can go wrong between a probability raster and an exported lot.
///
/// `Configuration` is fatal at startup. Tile-scoped variants (`DegenerateTransform`,
/// `RasterShape`, `UnsupportedCrs`, `Projection`) fail only the tile that raised them.
/// `DegenerateInput` is recovered locally by dropping or degrading geometry.
#[derive(Debug, Error)]
pub enum LotError {
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    #[error("tile {tile_id}: degenerate transform ({reason})")]
    DegenerateTransform { tile_id: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("raster holds {len} values, expected {width}x{height}")]
    RasterShape {
        width: usize,
        height: usize,
        len: usize,
    },

    #[error("tile {tile_id}: unsupported CRS {crs:?}")]
    UnsupportedCrs { tile_id: String, crs: String },

    #[error("tile {tile_id}: reprojection failed: {reason}")]
    Projection { tile_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, LotError>;
