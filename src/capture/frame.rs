//! Frame data structures for camera input

use image::RgbaImage;
use std::time::Instant;
use uuid::Uuid;

use crate::error::InputError;

/// Clockwise rotation needed to bring a sensor frame upright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parse a rotation in degrees. Negative and >360 values are normalized;
    /// anything that is not a multiple of 90 is rejected.
    pub fn from_degrees(degrees: i32) -> Result<Self, InputError> {
        if degrees % 90 != 0 {
            return Err(InputError::InvalidRotation(degrees));
        }
        Ok(match degrees.rem_euclid(360) {
            0 => Rotation::Deg0,
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            _ => Rotation::Deg270,
        })
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one
    pub fn inverse(self) -> Rotation {
        match self {
            Rotation::Deg0 => Rotation::Deg0,
            Rotation::Deg90 => Rotation::Deg270,
            Rotation::Deg180 => Rotation::Deg180,
            Rotation::Deg270 => Rotation::Deg90,
        }
    }

    /// Whether width and height swap under this rotation
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Dimensions of a `width`x`height` image after rotation
    pub fn rotated_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

/// A single camera frame awaiting processing
#[derive(Debug, Clone)]
pub struct Frame {
    /// Unique frame identifier
    pub id: Uuid,
    /// Raw RGBA pixels in sensor orientation
    pub image: RgbaImage,
    /// Rotation to apply before inference
    pub rotation: Rotation,
    /// Timestamp when the frame was captured
    pub timestamp: Instant,
}

impl Frame {
    /// Create a frame from an RGBA image and a rotation in degrees
    pub fn new(image: RgbaImage, rotation_degrees: i32) -> Result<Self, InputError> {
        let rotation = Rotation::from_degrees(rotation_degrees)?;
        Ok(Self {
            id: Uuid::new_v4(),
            image,
            rotation,
            timestamp: Instant::now(),
        })
    }

    /// Create a frame from a raw RGBA buffer
    pub fn from_rgba(
        data: Vec<u8>,
        width: u32,
        height: u32,
        rotation_degrees: i32,
    ) -> Result<Self, InputError> {
        let expected = width as usize * height as usize * 4;
        let actual = data.len();
        let image = RgbaImage::from_raw(width, height, data).ok_or(InputError::BufferSize {
            width,
            height,
            expected,
            actual,
        })?;
        Self::new(image, rotation_degrees)
    }

    /// Get frame dimensions as (width, height) in sensor orientation
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Dimensions after rotation correction
    pub fn upright_dimensions(&self) -> (u32, u32) {
        let (w, h) = self.dimensions();
        self.rotation.rotated_dimensions(w, h)
    }

    /// Reject frames that cannot be fed to inference
    pub fn validate(&self) -> Result<(), InputError> {
        let (width, height) = self.dimensions();
        if width == 0 || height == 0 {
            return Err(InputError::EmptyImage { width, height });
        }
        Ok(())
    }
}
