use crate::error::{LotError, Result};

/// Per-pixel "parking lot" likelihood for one tile, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityRaster {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ProbabilityRaster {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if width.checked_mul(height) != Some(data.len()) {
            return Err(LotError::RasterShape {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Builds a raster from `float[height][width]`; ragged rows are rejected.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(width * height);
        for row in rows {
            if row.len() != width {
                return Err(LotError::RasterShape {
                    width,
                    height,
                    len: data.len() + row.len(),
                });
            }
            data.extend(row);
        }
        Self::new(width, height, data)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Foreground/background mask; 1 = parking lot, 0 = background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl BinaryMask {
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    /// Any non-zero byte counts as foreground.
    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        if width.checked_mul(height) != Some(data.len()) {
            return Err(LotError::RasterShape {
                width,
                height,
                len: data.len(),
            });
        }
        let data = data.into_iter().map(|v| u8::from(v != 0)).collect();
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// `data` must already be 0/1 and `width * height` long.
    pub(crate) fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    /// Convenience for tests and fixtures: `'#'` is foreground, anything else background.
    pub fn from_ascii(rows: &[&str]) -> Self {
        let height = rows.len();
        let width = rows.first().map_or(0, |r| r.len());
        let mut mask = Self::empty(width, height);
        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.bytes().take(width).enumerate() {
                mask.set(x, y, ch == b'#');
            }
        }
        mask
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x] != 0
    }

    /// Out-of-range coordinates read as background.
    #[inline]
    pub fn get_or_bg(&self, x: isize, y: isize) -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < self.width
            && (y as usize) < self.height
            && self.get(x as usize, y as usize)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, on: bool) {
        self.data[y * self.width + x] = u8::from(on);
    }

    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
