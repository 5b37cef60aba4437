//! Reference CF computer: a circular aperture with central blockage and four
//! feed-leg struts, rotated by the parallactic angle.

use std::f64::consts::PI;

use num_complex::Complex;

use crate::cache::{FreshCf, FreshPlane};
use crate::cell::CfPixel;
use crate::error::{CfCacheError, CfResult};
use crate::pipeline::{CfComputer, CfRequest};
use crate::utils::{fftshift_2d, sorted_unique_i32, FftHelper2d};

#[derive(Clone, Debug)]
pub struct ApertureModel {
    /// Aperture radius in uv pixels at `reference_freq_hz`, before oversampling.
    pub radius_px: f64,
    /// Blockage radius as a fraction of the aperture radius.
    pub blockage_fraction: f64,
    /// Strut half-width in uv pixels; zero disables struts.
    pub strut_half_width_px: f64,
    pub reference_freq_hz: f64,
    /// Nominal support (uv pixels) of the plane before oversampling.
    pub support: usize,
    pub oversampling: usize,
    /// Largest |w| in wavelengths; planes are spaced evenly from zero.
    pub max_w_lambda: f64,
    /// Relative amplitude that bounds the support.
    pub threshold: f64,
}

impl ApertureModel {
    pub fn new(support: usize, oversampling: usize, reference_freq_hz: f64) -> Self {
        Self {
            radius_px: support as f64 / 4.0,
            blockage_fraction: 0.1,
            strut_half_width_px: 0.5,
            reference_freq_hz,
            support,
            oversampling: oversampling.max(1),
            max_w_lambda: 2000.0,
            threshold: 1.0e-3,
        }
    }

    fn plane_len(&self) -> usize {
        let n = self.support.max(2) * self.oversampling;
        n + n % 2
    }

    fn w_incr(&self, w_planes: usize) -> f64 {
        if w_planes > 1 {
            self.max_w_lambda / (w_planes - 1) as f64
        } else {
            0.0
        }
    }
}

pub struct ApertureCfComputer {
    model: ApertureModel,
    fft: Option<FftHelper2d>,
}

impl ApertureCfComputer {
    pub fn new(model: ApertureModel) -> Self {
        Self { model, fft: None }
    }

    fn fft(&mut self, n: usize) -> &FftHelper2d {
        if self.fft.as_ref().map(|f| f.len() != n).unwrap_or(false) {
            self.fft = None;
        }
        self.fft.get_or_insert_with(|| FftHelper2d::new(n))
    }
}

fn fft_err(e: crate::utils::DynError) -> CfCacheError {
    CfCacheError::Compute(e.to_string())
}

/// Aperture illumination on an oversampled `n x n` uv grid, centred at `n/2`.
fn illumination(model: &ApertureModel, n: usize, pa_deg: f64, ref_freq_hz: f64) -> Vec<Complex<f64>> {
    let scale = ref_freq_hz / model.reference_freq_hz * model.oversampling as f64;
    let outer = model.radius_px * scale;
    let inner = outer * model.blockage_fraction;
    let strut = model.strut_half_width_px * scale;
    let (sin_pa, cos_pa) = pa_deg.to_radians().sin_cos();
    let centre = (n / 2) as f64;

    let mut plane = vec![Complex::new(0.0, 0.0); n * n];
    for y in 0..n {
        for x in 0..n {
            let u = x as f64 - centre;
            let v = y as f64 - centre;
            let r = u.hypot(v);
            if r > outer || r < inner {
                continue;
            }
            // Struts lie along the diagonals of the antenna frame.
            let ur = u * cos_pa + v * sin_pa;
            let vr = -u * sin_pa + v * cos_pa;
            let d1 = (ur - vr).abs() / 2f64.sqrt();
            let d2 = (ur + vr).abs() / 2f64.sqrt();
            if strut > 0.0 && r > inner && (d1 < strut || d2 < strut) {
                continue;
            }
            plane[y * n + x] = Complex::new(1.0, 0.0);
        }
    }
    plane
}

/// Half-width (in un-oversampled pixels) enclosing everything above `threshold * peak`.
fn support_of(plane: &[Complex<f64>], n: usize, oversampling: usize, threshold: f64) -> i32 {
    let peak = plane.iter().map(|z| z.norm()).fold(0.0, f64::max);
    if peak <= 0.0 {
        return 1;
    }
    let centre = (n / 2) as f64;
    let mut radius: f64 = 0.0;
    for y in 0..n {
        for x in 0..n {
            if plane[y * n + x].norm() > threshold * peak {
                radius = radius.max((x as f64 - centre).abs().max((y as f64 - centre).abs()));
            }
        }
    }
    ((radius / oversampling as f64).ceil() as i32).max(1)
}

fn normalise(plane: &mut [Complex<f64>]) {
    let peak = plane.iter().map(|z| z.norm()).fold(0.0, f64::max);
    if peak > 0.0 {
        for z in plane.iter_mut() {
            *z /= peak;
        }
    }
}

fn to_pixels(plane: &[Complex<f64>]) -> Vec<CfPixel> {
    plane
        .iter()
        .map(|z| CfPixel::new(z.re as f32, z.im as f32))
        .collect()
}

impl CfComputer for ApertureCfComputer {
    fn compute(&mut self, request: &CfRequest) -> CfResult<FreshCf> {
        if request.w_planes == 0 {
            return Err(CfCacheError::Compute("zero w-planes requested".into()));
        }
        if !(request.ref_freq_hz.is_finite() && request.ref_freq_hz > 0.0) {
            return Err(CfCacheError::Compute(format!(
                "invalid reference frequency {} Hz",
                request.ref_freq_hz
            )));
        }
        let model = self.model.clone();
        let n = model.plane_len();
        let muellers = sorted_unique_i32(
            &request.pol_map.iter().flatten().copied().collect::<Vec<_>>(),
        );
        if muellers.is_empty() {
            return Err(CfCacheError::Compute("empty polarisation map".into()));
        }

        // Image-domain power pattern: |FT(aperture)|^2.
        let mut voltage = illumination(&model, n, request.pa_deg, request.ref_freq_hz);
        fftshift_2d(&mut voltage, n);
        let fft = self.fft(n);
        fft.inverse_2d(&mut voltage).map_err(fft_err)?;
        fftshift_2d(&mut voltage, n);
        let power: Vec<f64> = voltage.iter().map(|z| z.norm_sqr()).collect();

        // Direction cosine per image pixel, spanning the sky image field of view.
        let fov = request.sky.cell_size_rad * request.sky.nx.max(request.sky.ny) as f64;
        let dl = fov / n as f64;
        let centre = (n / 2) as f64;
        let w_incr = model.w_incr(request.w_planes);

        let mut weight_plane: Vec<Complex<f64>> =
            power.iter().map(|&p| Complex::new(p * p, 0.0)).collect();
        fftshift_2d(&mut weight_plane, n);
        fft.forward_2d(&mut weight_plane).map_err(fft_err)?;
        fftshift_2d(&mut weight_plane, n);
        normalise(&mut weight_plane);
        let weight_support = support_of(&weight_plane, n, model.oversampling, model.threshold);
        let weight_pixels = to_pixels(&weight_plane);

        let mut fresh = FreshCf::default();
        for wi in 0..request.w_planes {
            let w_value = wi as f64 * w_incr;
            let mut plane = vec![Complex::new(0.0, 0.0); n * n];
            for y in 0..n {
                let m = (y as f64 - centre) * dl;
                for x in 0..n {
                    let l = (x as f64 - centre) * dl;
                    let nterm = (1.0 - l * l - m * m).max(0.0).sqrt() - 1.0;
                    let phase = 2.0 * PI * w_value * nterm;
                    plane[y * n + x] = Complex::from_polar(power[y * n + x], phase);
                }
            }
            fftshift_2d(&mut plane, n);
            fft.forward_2d(&mut plane).map_err(fft_err)?;
            fftshift_2d(&mut plane, n);
            normalise(&mut plane);
            let support = support_of(&plane, n, model.oversampling, model.threshold);
            let pixels = to_pixels(&plane);

            for &mueller in &muellers {
                let base = FreshPlane {
                    w_index: wi as u32,
                    w_value,
                    w_incr,
                    freq_hz: request.ref_freq_hz,
                    mueller,
                    conj_freq_hz: request.ref_freq_hz,
                    conj_poln: mueller,
                    x_support: support,
                    y_support: support,
                    sampling: model.oversampling as f32,
                    shape: [n, n],
                    pixels: pixels.clone(),
                };
                fresh.weight.push(FreshPlane {
                    x_support: weight_support,
                    y_support: weight_support,
                    pixels: weight_pixels.clone(),
                    ..base.clone()
                });
                fresh.signal.push(base);
            }
        }
        Ok(fresh)
    }
}
