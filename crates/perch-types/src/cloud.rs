//! Organized point clouds.
//!
//! An [`OrganizedCloud`] is a row-major `width × height` grid of
//! [`PointSample`]s whose grid position matches the sensor pixel.  Stages
//! never remove samples from the grid; they mark them invalid instead, so
//! per-pixel correspondence between frames survives the whole pipeline.

use crate::PerchError;

/// A single sensor sample.  A sample is valid when its depth (`z`) is finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PointSample {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            r: 0,
            g: 0,
            b: 0,
        }
    }

    pub fn with_color(mut self, r: u8, g: u8, b: u8) -> Self {
        self.r = r;
        self.g = g;
        self.b = b;
        self
    }

    /// A "no return" sample: NaN position, black.
    pub fn no_return() -> Self {
        Self::new(f32::NAN, f32::NAN, f32::NAN)
    }

    pub fn is_valid(&self) -> bool {
        self.z.is_finite()
    }

    /// Mark the sample as filtered out.  Colour is left untouched.
    pub fn invalidate(&mut self) {
        self.x = f32::NAN;
        self.y = f32::NAN;
        self.z = f32::NAN;
    }
}

/// A fixed-shape grid of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizedCloud {
    width: u32,
    height: u32,
    points: Vec<PointSample>,
    /// `true` when the grid holds no invalid samples.
    pub is_dense: bool,
}

impl OrganizedCloud {
    /// Build a cloud from row-major samples.
    ///
    /// # Errors
    ///
    /// Returns [`PerchError::MalformedCloud`] when `points.len()` is not
    /// `width * height`.
    pub fn new(
        width: u32,
        height: u32,
        points: Vec<PointSample>,
        is_dense: bool,
    ) -> Result<Self, PerchError> {
        let expected = width as usize * height as usize;
        if points.len() != expected {
            return Err(PerchError::MalformedCloud(format!(
                "{width}x{height} grid needs {expected} samples, got {}",
                points.len()
            )));
        }
        Ok(Self {
            width,
            height,
            points,
            is_dense,
        })
    }

    /// A grid filled with copies of `sample`.
    pub fn filled(width: u32, height: u32, sample: PointSample) -> Self {
        Self {
            width,
            height,
            points: vec![sample; width as usize * height as usize],
            is_dense: sample.is_valid(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[PointSample] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [PointSample] {
        &mut self.points
    }

    /// Flat index of grid cell `(row, col)`.
    pub fn index(&self, row: u32, col: u32) -> usize {
        row as usize * self.width as usize + col as usize
    }

    pub fn at(&self, row: u32, col: u32) -> Option<&PointSample> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.points.get(self.index(row, col))
    }

    pub fn at_mut(&mut self, row: u32, col: u32) -> Option<&mut PointSample> {
        if row >= self.height || col >= self.width {
            return None;
        }
        let idx = self.index(row, col);
        self.points.get_mut(idx)
    }

    pub fn valid_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_valid()).count()
    }

    /// Recompute [`is_dense`][Self::is_dense] from the samples.
    pub fn refresh_density(&mut self) {
        self.is_dense = self.points.iter().all(PointSample::is_valid);
    }
}
