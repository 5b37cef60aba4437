use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use crate::artifact;
use crate::cell::{CellParams, CfCell, CfPixel, PixelBuffer};
use crate::error::{CfCacheError, CfResult};
use crate::utils::{merge_sorted_f64, merge_sorted_i32, nearest_index};

/// Mueller-element map: one row per polarisation product.
pub type PolMap = Vec<Vec<i32>>;

/// Dense frequency x w x Mueller array of cells for one (PA bucket, baseline type).
#[derive(Clone, Debug)]
pub struct CfBuffer {
    bucket: usize,
    pa_deg: f64,
    baseline_type: i32,
    w_incr: f64,
    freq_list: Vec<f64>,
    w_list: Vec<f64>,
    mueller_list: Vec<i32>,
    cells: Vec<CfCell>,
    lazy: bool,
    dir: Option<PathBuf>,
    primed: bool,
}

impl CfBuffer {
    pub fn new(bucket: usize, pa_deg: f64, baseline_type: i32) -> Self {
        Self {
            bucket,
            pa_deg,
            baseline_type,
            w_incr: 0.0,
            freq_list: Vec::new(),
            w_list: Vec::new(),
            mueller_list: Vec::new(),
            cells: Vec::new(),
            lazy: false,
            dir: None,
            primed: false,
        }
    }

    /// Where unloaded pixels are read from, and whether reads are deferred.
    pub fn set_storage(&mut self, dir: Option<PathBuf>, lazy: bool) {
        self.dir = dir;
        self.lazy = lazy;
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn pa_deg(&self) -> f64 {
        self.pa_deg
    }

    pub fn baseline_type(&self) -> i32 {
        self.baseline_type
    }

    pub fn w_incr(&self) -> f64 {
        self.w_incr
    }

    pub fn set_w_incr(&mut self, w_incr: f64) {
        self.w_incr = w_incr;
    }

    pub fn freq_list(&self) -> &[f64] {
        &self.freq_list
    }

    pub fn w_list(&self) -> &[f64] {
        &self.w_list
    }

    pub fn mueller_list(&self) -> &[i32] {
        &self.mueller_list
    }

    pub fn cells(&self) -> &[CfCell] {
        &self.cells
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn lazy_fill(&self) -> bool {
        self.lazy
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// (n_freq, n_w, n_mueller)
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.freq_list.len(),
            self.w_list.len(),
            self.mueller_list.len(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// True once any cell carries metadata, from disk or from a fresh computation.
    pub fn is_materialized(&self) -> bool {
        self.cells.iter().any(CfCell::is_set)
    }

    fn index(&self, fi: usize, wi: usize, mi: usize) -> usize {
        (fi * self.w_list.len() + wi) * self.mueller_list.len() + mi
    }

    /// Extend the axis lists and allocate cells for new combinations.
    ///
    /// Never shrinks: existing values and their cells are kept.
    pub fn resize(&mut self, w_values: &[f64], freq_values: &[f64], mueller_maps: &[Vec<i32>]) {
        let flat_mueller: Vec<i32> = mueller_maps.iter().flatten().copied().collect();
        let freq_list = merge_sorted_f64(&self.freq_list, freq_values);
        let w_list = merge_sorted_f64(&self.w_list, w_values);
        let mueller_list = merge_sorted_i32(&self.mueller_list, &flat_mueller);
        if freq_list == self.freq_list && w_list == self.w_list && mueller_list == self.mueller_list
        {
            return;
        }

        let mut old_cells: Vec<Option<CfCell>> =
            std::mem::take(&mut self.cells).into_iter().map(Some).collect();
        let old_freq = std::mem::replace(&mut self.freq_list, freq_list);
        let old_w = std::mem::replace(&mut self.w_list, w_list);
        let old_mueller = std::mem::replace(&mut self.mueller_list, mueller_list);

        let mut cells = Vec::with_capacity(
            self.freq_list.len() * self.w_list.len() * self.mueller_list.len(),
        );
        for &f in &self.freq_list {
            for &w in &self.w_list {
                for &m in &self.mueller_list {
                    let old = match (
                        old_freq.iter().position(|&v| v == f),
                        old_w.iter().position(|&v| v == w),
                        old_mueller.iter().position(|&v| v == m),
                    ) {
                        (Some(fi), Some(wi), Some(mi)) => {
                            old_cells[(fi * old_w.len() + wi) * old_mueller.len() + mi].take()
                        }
                        _ => None,
                    };
                    cells.push(old.unwrap_or_else(|| CfCell::empty(f, w, m)));
                }
            }
        }
        self.cells = cells;
        self.primed = false;
    }

    /// Per-axis position of the cell nearest to (freq, w) with exactly this Mueller index.
    pub fn cell_position(&self, freq: f64, w: f64, mueller: i32) -> Option<(usize, usize, usize)> {
        if self.cells.is_empty() {
            return None;
        }
        let fi = nearest_index(&self.freq_list, freq)?;
        let wi = nearest_index(&self.w_list, w)?;
        let mi = self.mueller_list.iter().position(|&m| m == mueller)?;
        Some((fi, wi, mi))
    }

    pub fn get_cf_cell(&self, freq: f64, w: f64, mueller: i32) -> Option<&CfCell> {
        let (fi, wi, mi) = self.cell_position(freq, w, mueller)?;
        self.cells.get(self.index(fi, wi, mi))
    }

    pub fn get_cf_cell_mut(&mut self, freq: f64, w: f64, mueller: i32) -> Option<&mut CfCell> {
        let (fi, wi, mi) = self.cell_position(freq, w, mueller)?;
        let idx = self.index(fi, wi, mi);
        self.cells.get_mut(idx)
    }

    /// Direct lookup, falling back to a cell that records this plane as its conjugate.
    ///
    /// The flag is true when the returned cell must be conjugated before use.
    pub fn get_cf_cell_or_conjugate(&self, freq: f64, w: f64, mueller: i32) -> Option<(&CfCell, bool)> {
        if let Some(cell) = self.get_cf_cell(freq, w, mueller) {
            if cell.is_set() {
                return Some((cell, false));
            }
        }
        let wi = nearest_index(&self.w_list, w)?;
        let mut best: Option<(&CfCell, f64)> = None;
        for fi in 0..self.freq_list.len() {
            for mi in 0..self.mueller_list.len() {
                let cell = &self.cells[self.index(fi, wi, mi)];
                let Some(params) = &cell.params else {
                    continue;
                };
                if params.conj_poln != mueller {
                    continue;
                }
                let diff = (params.conj_freq_hz - freq).abs();
                if best.map(|(_, d)| diff < d).unwrap_or(true) {
                    best = Some((cell, diff));
                }
            }
        }
        best.map(|(cell, _)| (cell, true))
    }

    fn missing(freq: f64, w: f64, mueller: i32) -> CfCacheError {
        CfCacheError::MissingCell { freq, w, mueller }
    }

    /// Attach support/sampling/source metadata without touching pixels.
    pub fn set_params(&mut self, freq: f64, w: f64, mueller: i32, params: CellParams) -> CfResult<()> {
        let cell = self
            .get_cf_cell_mut(freq, w, mueller)
            .ok_or_else(|| Self::missing(freq, w, mueller))?;
        cell.params = Some(params);
        self.primed = false;
        Ok(())
    }

    pub fn set_pixels(&mut self, freq: f64, w: f64, mueller: i32, pixels: Vec<CfPixel>) -> CfResult<()> {
        let cell = self
            .get_cf_cell_mut(freq, w, mueller)
            .ok_or_else(|| Self::missing(freq, w, mueller))?;
        cell.pixels = PixelBuffer::Loaded(Arc::new(pixels));
        Ok(())
    }

    /// Pixels of one cell, reading them from disk on first access when unloaded.
    pub fn pixels(&mut self, freq: f64, w: f64, mueller: i32) -> CfResult<Arc<Vec<CfPixel>>> {
        let dir = self.dir.clone();
        let cell = self
            .get_cf_cell_mut(freq, w, mueller)
            .ok_or_else(|| Self::missing(freq, w, mueller))?;
        if let PixelBuffer::Loaded(pixels) = &cell.pixels {
            return Ok(pixels.clone());
        }
        let dir = dir.ok_or_else(|| Self::missing(freq, w, mueller))?;
        if load_cell(&dir, cell)? == 0 {
            return Err(Self::missing(freq, w, mueller));
        }
        match &cell.pixels {
            PixelBuffer::Loaded(pixels) => Ok(pixels.clone()),
            PixelBuffer::Unloaded => Err(Self::missing(freq, w, mueller)),
        }
    }

    /// Load every unloaded cell that names a source artifact. Returns the number loaded.
    pub fn load_all_pixels(&mut self) -> CfResult<usize> {
        let Some(dir) = self.dir.clone() else {
            return Ok(0);
        };
        let loaded = self
            .cells
            .par_iter_mut()
            .filter(|cell| !cell.pixels.is_loaded())
            .map(|cell| load_cell(&dir, cell))
            .collect::<CfResult<Vec<usize>>>()?;
        Ok(loaded.into_iter().sum())
    }

    /// Verify the metadata of every set cell once.
    pub fn prime(&mut self) -> CfResult<()> {
        if self.primed {
            return Ok(());
        }
        for cell in &self.cells {
            let Some(params) = &cell.params else {
                continue;
            };
            let origin = params
                .file_name
                .clone()
                .unwrap_or_else(|| format!("<memory bucket {}>", self.bucket));
            if params.x_support <= 0 || params.y_support <= 0 || params.sampling <= 0.0 {
                return Err(CfCacheError::parse(
                    origin,
                    format!(
                        "cell (f={}, w={}, m={}) has support ({}, {}) sampling {}",
                        cell.freq_hz,
                        cell.w_value,
                        cell.mueller,
                        params.x_support,
                        params.y_support,
                        params.sampling
                    ),
                ));
            }
            if let Some(pixels) = cell.pixels.as_slice() {
                if pixels.len() != params.shape[0] * params.shape[1] {
                    return Err(CfCacheError::parse(
                        origin,
                        format!(
                            "{} pixels loaded for a {}x{} plane",
                            pixels.len(),
                            params.shape[0],
                            params.shape[1]
                        ),
                    ));
                }
            }
        }
        self.primed = true;
        Ok(())
    }

    /// Bytes held by loaded pixel buffers.
    pub fn mem_usage(&self) -> usize {
        self.cells.iter().map(CfCell::pixel_bytes).sum()
    }

    /// Support of the first set cell on w-plane `wi`.
    pub fn support_for_w(&self, wi: usize) -> Option<(i32, i32)> {
        if wi >= self.w_list.len() {
            return None;
        }
        (0..self.freq_list.len())
            .flat_map(|fi| (0..self.mueller_list.len()).map(move |mi| (fi, mi)))
            .find_map(|(fi, mi)| self.cells[self.index(fi, wi, mi)].support())
    }

    pub fn sampling(&self) -> Option<f32> {
        self.cells
            .iter()
            .find_map(|c| c.params.as_ref().map(|p| p.sampling))
    }
}

fn load_cell(dir: &Path, cell: &mut CfCell) -> CfResult<usize> {
    let Some(params) = &cell.params else {
        return Ok(0);
    };
    let Some(name) = &params.file_name else {
        return Ok(0);
    };
    let (_, pixels) = artifact::read_artifact(dir, name)?;
    if pixels.len() != params.shape[0] * params.shape[1] {
        return Err(CfCacheError::parse(
            name.clone(),
            format!(
                "payload holds {} pixels, cell expects {}x{}",
                pixels.len(),
                params.shape[0],
                params.shape[1]
            ),
        ));
    }
    cell.pixels = PixelBuffer::Loaded(Arc::new(pixels));
    Ok(1)
}
