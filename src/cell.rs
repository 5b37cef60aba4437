use std::sync::Arc;

use num_complex::Complex;

pub type CfPixel = Complex<f32>;

/// Pixel storage of one cached plane.
#[derive(Clone, Debug, Default)]
pub enum PixelBuffer {
    #[default]
    Unloaded,
    Loaded(Arc<Vec<CfPixel>>),
}

impl PixelBuffer {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PixelBuffer::Loaded(_))
    }

    pub fn as_slice(&self) -> Option<&[CfPixel]> {
        match self {
            PixelBuffer::Loaded(pixels) => Some(pixels.as_slice()),
            PixelBuffer::Unloaded => None,
        }
    }
}

/// Metadata attached to a cell, independent of its pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct CellParams {
    pub x_support: i32,
    pub y_support: i32,
    pub sampling: f32,
    /// Plane shape as (nx, ny).
    pub shape: [usize; 2],
    /// Frequency whose plane this one mirrors under conjugation.
    pub conj_freq_hz: f64,
    /// Mueller index whose plane this one mirrors under conjugation.
    pub conj_poln: i32,
    /// Source artifact, when the cell came from (or went to) disk.
    pub file_name: Option<String>,
}

/// One cached plane at a fixed (frequency, w, Mueller) position of a [`crate::buffer::CfBuffer`].
#[derive(Clone, Debug)]
pub struct CfCell {
    pub freq_hz: f64,
    pub w_value: f64,
    pub mueller: i32,
    pub params: Option<CellParams>,
    pub pixels: PixelBuffer,
}

impl CfCell {
    pub fn empty(freq_hz: f64, w_value: f64, mueller: i32) -> Self {
        Self {
            freq_hz,
            w_value,
            mueller,
            params: None,
            pixels: PixelBuffer::Unloaded,
        }
    }

    /// True once support/sampling metadata has been attached.
    pub fn is_set(&self) -> bool {
        self.params.is_some()
    }

    pub fn support(&self) -> Option<(i32, i32)> {
        self.params.as_ref().map(|p| (p.x_support, p.y_support))
    }

    pub fn pixel_bytes(&self) -> usize {
        self.pixels
            .as_slice()
            .map(|p| p.len() * std::mem::size_of::<CfPixel>())
            .unwrap_or(0)
    }
}
