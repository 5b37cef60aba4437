use std::cmp::Ordering;
use std::sync::Arc;

use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::error::Error;

pub type DynError = Box<dyn Error + Send + Sync>;

/// Index of the entry nearest to `value`.
///
/// Ties resolve to the lower index, so on a sorted list the smaller value wins.
/// Returns `None` for an empty list or a non-finite `value`.
pub fn nearest_index(list: &[f64], value: f64) -> Option<usize> {
    if list.is_empty() || !value.is_finite() {
        return None;
    }
    let mut best = 0usize;
    let mut best_diff = f64::INFINITY;
    for (idx, &entry) in list.iter().enumerate() {
        let diff = (entry - value).abs();
        if diff < best_diff {
            best_diff = diff;
            best = idx;
        }
    }
    Some(best)
}

/// Sort and de-duplicate raw axis values discovered across artifacts.
pub fn sorted_unique_f64(values: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    out.dedup_by(|a, b| a == b);
    out
}

pub fn sorted_unique_i32(values: &[i32]) -> Vec<i32> {
    let mut out = values.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Merge `extra` into an already sorted unique list, keeping it sorted and unique.
pub fn merge_sorted_f64(base: &[f64], extra: &[f64]) -> Vec<f64> {
    let mut all = base.to_vec();
    all.extend_from_slice(extra);
    sorted_unique_f64(&all)
}

pub fn merge_sorted_i32(base: &[i32], extra: &[i32]) -> Vec<i32> {
    let mut all = base.to_vec();
    all.extend_from_slice(extra);
    sorted_unique_i32(&all)
}

/// Square 2-D complex FFT built from row and column passes of a 1-D plan.
pub struct FftHelper2d {
    len: usize,
    pub forward: Arc<dyn Fft<f64>>,
    pub inverse: Arc<dyn Fft<f64>>,
}

impl FftHelper2d {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        Self {
            len,
            forward,
            inverse,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// In-place forward transform of a row-major `len x len` plane.
    pub fn forward_2d(&self, plane: &mut [Complex<f64>]) -> Result<(), DynError> {
        self.process_2d(plane, &self.forward)
    }

    /// In-place inverse transform, normalised by `1 / len^2`.
    pub fn inverse_2d(&self, plane: &mut [Complex<f64>]) -> Result<(), DynError> {
        self.process_2d(plane, &self.inverse)?;
        let scale = 1.0 / (self.len * self.len) as f64;
        for value in plane.iter_mut() {
            *value *= scale;
        }
        Ok(())
    }

    fn process_2d(&self, plane: &mut [Complex<f64>], fft: &Arc<dyn Fft<f64>>) -> Result<(), DynError> {
        let n = self.len;
        if plane.len() != n * n {
            return Err(format!(
                "plane length {} does not match {}x{} FFT configuration",
                plane.len(),
                n,
                n
            )
            .into());
        }
        plane.par_chunks_mut(n).for_each(|row| fft.process(row));
        transpose_square(plane, n);
        plane.par_chunks_mut(n).for_each(|row| fft.process(row));
        transpose_square(plane, n);
        Ok(())
    }
}

fn transpose_square(plane: &mut [Complex<f64>], n: usize) {
    for y in 0..n {
        for x in (y + 1)..n {
            plane.swap(y * n + x, x * n + y);
        }
    }
}

/// Swap quadrants so the zero-frequency pixel lands at `(n/2, n/2)`.
pub fn fftshift_2d(plane: &mut [Complex<f64>], n: usize) {
    let half = n / 2;
    let mut shifted = vec![Complex::new(0.0, 0.0); plane.len()];
    for y in 0..n {
        for x in 0..n {
            let sy = (y + half) % n;
            let sx = (x + half) % n;
            shifted[sy * n + sx] = plane[y * n + x];
        }
    }
    plane.copy_from_slice(&shifted);
}
