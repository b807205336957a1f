//! Packed point buffers as they travel over the wire.
//!
//! A [`PackedCloud`] is a byte buffer plus a list of named [`PointField`]s
//! describing where each coordinate lives inside one `point_step`-sized
//! record.  Only little-endian buffers are supported.
//!
//! Colour is the usual packed `rgb` field: a 32-bit word holding
//! `0x00RRGGBB`, declared either as `FLOAT32` or `UINT32`.

use serde::{Deserialize, Serialize};

use crate::PerchError;
use crate::cloud::{OrganizedCloud, PointSample};

/// Field datatype codes.
pub mod datatype {
    pub const INT8: u8 = 1;
    pub const UINT8: u8 = 2;
    pub const INT16: u8 = 3;
    pub const UINT16: u8 = 4;
    pub const INT32: u8 = 5;
    pub const UINT32: u8 = 6;
    pub const FLOAT32: u8 = 7;
    pub const FLOAT64: u8 = 8;
}

/// Record layout produced by [`PackedCloud::encode`]: x, y, z, rgb.
const ENCODED_POINT_STEP: u32 = 16;

/// Description of one field inside a point record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointField {
    pub name: String,
    /// Byte offset inside the record.
    pub offset: u32,
    pub datatype: u8,
    /// Number of elements; some producers leave this at 0.
    #[serde(default)]
    pub count: u32,
}

impl PointField {
    pub fn new(name: &str, offset: u32, datatype: u8) -> Self {
        Self {
            name: name.to_string(),
            offset,
            datatype,
            count: 1,
        }
    }
}

/// A packed, organized point buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedCloud {
    pub height: u32,
    pub width: u32,
    pub fields: Vec<PointField>,
    #[serde(default)]
    pub is_bigendian: bool,
    pub point_step: u32,
    pub row_step: u32,
    pub data: Vec<u8>,
    #[serde(default)]
    pub is_dense: bool,
}

impl PackedCloud {
    /// Default every missing (`0`) field count to 1.
    pub fn normalize_field_counts(&mut self) {
        for field in &mut self.fields {
            if field.count == 0 {
                field.count = 1;
            }
        }
    }

    fn field(&self, name: &str) -> Option<&PointField> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn coordinate_field(&self, name: &str) -> Result<&PointField, PerchError> {
        let field = self
            .field(name)
            .ok_or_else(|| PerchError::MalformedCloud(format!("missing field '{name}'")))?;
        if field.count == 0 {
            return Err(PerchError::MalformedCloud(format!(
                "field '{name}' has count 0"
            )));
        }
        if field.datatype != datatype::FLOAT32 {
            return Err(PerchError::MalformedCloud(format!(
                "field '{name}' must be FLOAT32, got datatype {}",
                field.datatype
            )));
        }
        if !word_fits(field.offset, self.point_step) {
            return Err(PerchError::MalformedCloud(format!(
                "field '{name}' overruns point_step {}",
                self.point_step
            )));
        }
        Ok(field)
    }

    /// Decode into an [`OrganizedCloud`].
    ///
    /// # Errors
    ///
    /// Returns [`PerchError::MalformedCloud`] when a coordinate field is
    /// missing, has a zero count or a non-float type, or when the buffer is
    /// shorter than the declared layout.
    pub fn decode(&self) -> Result<OrganizedCloud, PerchError> {
        if self.is_bigendian {
            return Err(PerchError::MalformedCloud(
                "big-endian point buffers are not supported".to_string(),
            ));
        }
        let x = self.coordinate_field("x")?.offset as usize;
        let y = self.coordinate_field("y")?.offset as usize;
        let z = self.coordinate_field("z")?.offset as usize;
        let rgb = match self.field("rgb") {
            Some(f)
                if f.count > 0
                    && matches!(f.datatype, datatype::FLOAT32 | datatype::UINT32)
                    && word_fits(f.offset, self.point_step) =>
            {
                Some(f.offset as usize)
            }
            _ => None,
        };

        let point_step = self.point_step as usize;
        let row_step = self.row_step as usize;
        if row_step < point_step * self.width as usize {
            return Err(PerchError::MalformedCloud(format!(
                "row_step {row_step} is smaller than width x point_step"
            )));
        }
        let needed = row_step * self.height as usize;
        if self.data.len() < needed {
            return Err(PerchError::MalformedCloud(format!(
                "buffer holds {} bytes, layout needs {needed}",
                self.data.len()
            )));
        }

        let mut points = Vec::with_capacity(self.width as usize * self.height as usize);
        for row in 0..self.height as usize {
            for col in 0..self.width as usize {
                let base = row * row_step + col * point_step;
                let record = &self.data[base..base + point_step];
                let mut sample =
                    PointSample::new(read_f32(record, x), read_f32(record, y), read_f32(record, z));
                if let Some(offset) = rgb {
                    let [b, g, r, _] = read_word(record, offset);
                    sample = sample.with_color(r, g, b);
                }
                points.push(sample);
            }
        }
        OrganizedCloud::new(self.width, self.height, points, self.is_dense)
    }

    /// Pack an [`OrganizedCloud`] as x, y, z, rgb (`FLOAT32` each).
    pub fn encode(cloud: &OrganizedCloud) -> Self {
        let mut data = Vec::with_capacity(cloud.len() * ENCODED_POINT_STEP as usize);
        for p in cloud.points() {
            data.extend_from_slice(&p.x.to_le_bytes());
            data.extend_from_slice(&p.y.to_le_bytes());
            data.extend_from_slice(&p.z.to_le_bytes());
            data.extend_from_slice(&[p.b, p.g, p.r, 0]);
        }
        Self {
            height: cloud.height(),
            width: cloud.width(),
            fields: vec![
                PointField::new("x", 0, datatype::FLOAT32),
                PointField::new("y", 4, datatype::FLOAT32),
                PointField::new("z", 8, datatype::FLOAT32),
                PointField::new("rgb", 12, datatype::FLOAT32),
            ],
            is_bigendian: false,
            point_step: ENCODED_POINT_STEP,
            row_step: ENCODED_POINT_STEP * cloud.width(),
            data,
            is_dense: cloud.is_dense,
        }
    }
}

/// Whether a 4-byte word at `offset` lies inside a `point_step` record.
fn word_fits(offset: u32, point_step: u32) -> bool {
    offset.checked_add(4).is_some_and(|end| end <= point_step)
}

fn read_word(record: &[u8], offset: usize) -> [u8; 4] {
    let mut word = [0u8; 4];
    word.copy_from_slice(&record[offset..offset + 4]);
    word
}

fn read_f32(record: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(read_word(record, offset))
}
