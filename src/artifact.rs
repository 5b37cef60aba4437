//! On-disk CF artifacts: one plane per file, a fixed-offset header followed by
//! the complex pixel payload. Also the average-PB image written at flush time.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::cell::CfPixel;
use crate::error::{CfCacheError, CfResult};

pub const ARTIFACT_HEADER_SIZE: usize = 128;
const ARTIFACT_MAGIC: [u8; 4] = *b"CFCA";
const AVG_PB_MAGIC: [u8; 4] = *b"CFPB";
const AVG_PB_HEADER_SIZE: usize = 16;
const FORMAT_VERSION: u32 = 1;

const VERSION_OFFSET: usize = 4;
const PA_OFFSET: usize = 8;
const W_VALUE_OFFSET: usize = 16;
const W_INDEX_OFFSET: usize = 24;
const MUELLER_OFFSET: usize = 28;
const REF_FREQ_OFFSET: usize = 32;
const X_SUPPORT_OFFSET: usize = 40;
const Y_SUPPORT_OFFSET: usize = 44;
const SAMPLING_OFFSET: usize = 48;
const CONJ_POLN_OFFSET: usize = 52;
const CONJ_FREQ_OFFSET: usize = 56;
const W_INCR_OFFSET: usize = 64;
const NX_OFFSET: usize = 72;
const NY_OFFSET: usize = 76;
const BASELINE_TYPE_OFFSET: usize = 80;
const BUCKET_INDEX_OFFSET: usize = 84;

/// Which of the two parallel caches an artifact belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CfKind {
    Signal,
    Weight,
}

impl CfKind {
    pub fn prefix(self) -> &'static str {
        match self {
            CfKind::Signal => "CFS",
            CfKind::Weight => "WTCFS",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CfKind::Signal => "CF",
            CfKind::Weight => "WTCF",
        }
    }
}

/// Deterministic artifact name for one plane.
pub fn artifact_name(
    kind: CfKind,
    w_index: usize,
    bucket_index: usize,
    mueller: i32,
    freq_index: usize,
) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        kind.prefix(),
        w_index,
        bucket_index,
        mueller,
        freq_index
    )
}

pub fn is_artifact_of(name: &str, kind: CfKind) -> bool {
    name.strip_prefix(kind.prefix())
        .map(|rest| rest.starts_with('_'))
        .unwrap_or(false)
}

/// Header record of one persisted plane.
#[derive(Clone, Debug, PartialEq)]
pub struct ArtifactHeader {
    pub pa_deg: f64,
    pub w_value: f64,
    pub w_index: u32,
    pub mueller: i32,
    pub ref_freq_hz: f64,
    pub x_support: i32,
    pub y_support: i32,
    pub sampling: f32,
    pub conj_poln: i32,
    pub conj_freq_hz: f64,
    pub w_incr: f64,
    pub nx: u32,
    pub ny: u32,
    pub baseline_type: i32,
    pub bucket_index: u32,
}

impl ArtifactHeader {
    pub fn pixel_count(&self) -> usize {
        self.nx as usize * self.ny as usize
    }

    fn validate(&self) -> Result<(), String> {
        if !self.pa_deg.is_finite() {
            return Err("parallactic angle is not finite".into());
        }
        if !self.w_value.is_finite() {
            return Err("w value is not finite".into());
        }
        if !(self.ref_freq_hz.is_finite() && self.ref_freq_hz > 0.0) {
            return Err(format!("reference frequency {} Hz is invalid", self.ref_freq_hz));
        }
        if self.x_support <= 0 || self.y_support <= 0 {
            return Err(format!(
                "support ({}, {}) must be positive",
                self.x_support, self.y_support
            ));
        }
        if !(self.sampling.is_finite() && self.sampling > 0.0) {
            return Err(format!("sampling {} must be positive", self.sampling));
        }
        if !self.conj_freq_hz.is_finite() || !self.w_incr.is_finite() {
            return Err("conjugate frequency or w increment is not finite".into());
        }
        if self.nx == 0 || self.ny == 0 {
            return Err(format!("plane shape {}x{} is empty", self.nx, self.ny));
        }
        Ok(())
    }
}

fn write_i32_le(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_f32_le(buf: &mut [u8], offset: usize, value: f32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_f64_le(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn read_i32_le(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_4(buf, offset))
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_4(buf, offset))
}

fn read_f32_le(buf: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(read_4(buf, offset))
}

fn read_f64_le(buf: &[u8], offset: usize) -> f64 {
    f64::from_le_bytes(read_8(buf, offset))
}

fn build_header(name: &str, header: &ArtifactHeader) -> CfResult<[u8; ARTIFACT_HEADER_SIZE]> {
    header
        .validate()
        .map_err(|reason| CfCacheError::parse(name, reason))?;

    let mut out = [0u8; ARTIFACT_HEADER_SIZE];
    out[0..4].copy_from_slice(&ARTIFACT_MAGIC);
    write_u32_le(&mut out, VERSION_OFFSET, FORMAT_VERSION);
    write_f64_le(&mut out, PA_OFFSET, header.pa_deg);
    write_f64_le(&mut out, W_VALUE_OFFSET, header.w_value);
    write_u32_le(&mut out, W_INDEX_OFFSET, header.w_index);
    write_i32_le(&mut out, MUELLER_OFFSET, header.mueller);
    write_f64_le(&mut out, REF_FREQ_OFFSET, header.ref_freq_hz);
    write_i32_le(&mut out, X_SUPPORT_OFFSET, header.x_support);
    write_i32_le(&mut out, Y_SUPPORT_OFFSET, header.y_support);
    write_f32_le(&mut out, SAMPLING_OFFSET, header.sampling);
    write_i32_le(&mut out, CONJ_POLN_OFFSET, header.conj_poln);
    write_f64_le(&mut out, CONJ_FREQ_OFFSET, header.conj_freq_hz);
    write_f64_le(&mut out, W_INCR_OFFSET, header.w_incr);
    write_u32_le(&mut out, NX_OFFSET, header.nx);
    write_u32_le(&mut out, NY_OFFSET, header.ny);
    write_i32_le(&mut out, BASELINE_TYPE_OFFSET, header.baseline_type);
    write_u32_le(&mut out, BUCKET_INDEX_OFFSET, header.bucket_index);
    Ok(out)
}

fn parse_header(name: &str, buf: &[u8]) -> CfResult<ArtifactHeader> {
    if buf.len() < ARTIFACT_HEADER_SIZE {
        return Err(CfCacheError::parse(
            name,
            format!(
                "truncated header ({} of {} bytes)",
                buf.len(),
                ARTIFACT_HEADER_SIZE
            ),
        ));
    }
    if buf[0..4] != ARTIFACT_MAGIC {
        return Err(CfCacheError::parse(name, "bad magic, not a CF artifact"));
    }
    let version = read_u32_le(buf, VERSION_OFFSET);
    if version != FORMAT_VERSION {
        return Err(CfCacheError::parse(
            name,
            format!("unsupported format version {}", version),
        ));
    }
    let header = ArtifactHeader {
        pa_deg: read_f64_le(buf, PA_OFFSET),
        w_value: read_f64_le(buf, W_VALUE_OFFSET),
        w_index: read_u32_le(buf, W_INDEX_OFFSET),
        mueller: read_i32_le(buf, MUELLER_OFFSET),
        ref_freq_hz: read_f64_le(buf, REF_FREQ_OFFSET),
        x_support: read_i32_le(buf, X_SUPPORT_OFFSET),
        y_support: read_i32_le(buf, Y_SUPPORT_OFFSET),
        sampling: read_f32_le(buf, SAMPLING_OFFSET),
        conj_poln: read_i32_le(buf, CONJ_POLN_OFFSET),
        conj_freq_hz: read_f64_le(buf, CONJ_FREQ_OFFSET),
        w_incr: read_f64_le(buf, W_INCR_OFFSET),
        nx: read_u32_le(buf, NX_OFFSET),
        ny: read_u32_le(buf, NY_OFFSET),
        baseline_type: read_i32_le(buf, BASELINE_TYPE_OFFSET),
        bucket_index: read_u32_le(buf, BUCKET_INDEX_OFFSET),
    };
    header
        .validate()
        .map_err(|reason| CfCacheError::parse(name, reason))?;
    Ok(header)
}

#[cfg(target_os = "linux")]
fn advise_file_sequential(file: &File) {
    let fd = file.as_raw_fd();
    unsafe {
        let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_file_sequential(_file: &File) {}

/// Write failures on the cache directory are configuration errors, not I/O noise.
fn create_in_cache_dir(dir: &Path, path: &Path) -> CfResult<File> {
    File::create(path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::NotFound => CfCacheError::config(
            dir,
            format!("cannot create \"{}\": {}", path.display(), e),
        ),
        _ => CfCacheError::io(path, e),
    })
}

/// Persist one plane. Returns the path written.
pub fn write_artifact(
    dir: &Path,
    name: &str,
    header: &ArtifactHeader,
    pixels: &[CfPixel],
) -> CfResult<PathBuf> {
    if pixels.len() != header.pixel_count() {
        return Err(CfCacheError::parse(
            name,
            format!(
                "payload has {} pixels, header declares {}x{}",
                pixels.len(),
                header.nx,
                header.ny
            ),
        ));
    }
    let raw_header = build_header(name, header)?;
    let path = dir.join(name);
    let file = create_in_cache_dir(dir, &path)?;
    let mut writer = BufWriter::new(file);
    let io_err = |e| CfCacheError::io(&path, e);
    writer.write_all(&raw_header).map_err(io_err)?;
    for z in pixels {
        writer.write_all(&z.re.to_le_bytes()).map_err(io_err)?;
        writer.write_all(&z.im.to_le_bytes()).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(path)
}

/// Read only the header of an artifact.
pub fn read_header(dir: &Path, name: &str) -> CfResult<ArtifactHeader> {
    let path = dir.join(name);
    let file = File::open(&path).map_err(|e| CfCacheError::io(&path, e))?;
    let mut buf = Vec::with_capacity(ARTIFACT_HEADER_SIZE);
    file.take(ARTIFACT_HEADER_SIZE as u64)
        .read_to_end(&mut buf)
        .map_err(|e| CfCacheError::io(&path, e))?;
    parse_header(name, &buf)
}

/// Read header and pixel payload.
pub fn read_artifact(dir: &Path, name: &str) -> CfResult<(ArtifactHeader, Vec<CfPixel>)> {
    let path = dir.join(name);
    let file = File::open(&path).map_err(|e| CfCacheError::io(&path, e))?;
    advise_file_sequential(&file);
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    reader
        .read_to_end(&mut raw)
        .map_err(|e| CfCacheError::io(&path, e))?;
    let header = parse_header(name, &raw)?;

    let payload = &raw[ARTIFACT_HEADER_SIZE..];
    let expected = header.pixel_count() * 8;
    if payload.len() != expected {
        return Err(CfCacheError::parse(
            name,
            format!(
                "payload is {} bytes, expected {} for a {}x{} plane",
                payload.len(),
                expected,
                header.nx,
                header.ny
            ),
        ));
    }
    let pixels = payload
        .chunks_exact(8)
        .map(|c| CfPixel::new(read_f32_le(c, 0), read_f32_le(c, 4)))
        .collect();
    Ok((header, pixels))
}

/// Average primary-beam image persisted next to the CFs.
#[derive(Clone, Debug, PartialEq)]
pub struct AvgPb {
    pub nx: usize,
    pub ny: usize,
    pub pixels: Vec<f32>,
}

pub fn avg_pb_name(qualifier: &str) -> String {
    format!("avgPB{}", qualifier)
}

pub fn write_avg_pb(dir: &Path, qualifier: &str, pb: &AvgPb) -> CfResult<PathBuf> {
    let name = avg_pb_name(qualifier);
    if pb.pixels.len() != pb.nx * pb.ny {
        return Err(CfCacheError::parse(
            &name,
            format!("{} pixels for a {}x{} image", pb.pixels.len(), pb.nx, pb.ny),
        ));
    }
    let nx = u32::try_from(pb.nx).map_err(|_| CfCacheError::parse(&name, "nx out of range"))?;
    let ny = u32::try_from(pb.ny).map_err(|_| CfCacheError::parse(&name, "ny out of range"))?;

    let mut header = [0u8; AVG_PB_HEADER_SIZE];
    header[0..4].copy_from_slice(&AVG_PB_MAGIC);
    write_u32_le(&mut header, 4, FORMAT_VERSION);
    write_u32_le(&mut header, 8, nx);
    write_u32_le(&mut header, 12, ny);

    let path = dir.join(&name);
    let file = create_in_cache_dir(dir, &path)?;
    let mut writer = BufWriter::new(file);
    let io_err = |e| CfCacheError::io(&path, e);
    writer.write_all(&header).map_err(io_err)?;
    for v in &pb.pixels {
        writer.write_all(&v.to_le_bytes()).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(path)
}

/// `Ok(None)` when no average PB was saved under this qualifier.
pub fn read_avg_pb(dir: &Path, qualifier: &str) -> CfResult<Option<AvgPb>> {
    let name = avg_pb_name(qualifier);
    let path = dir.join(&name);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CfCacheError::io(&path, e)),
    };
    if raw.len() < AVG_PB_HEADER_SIZE || raw[0..4] != AVG_PB_MAGIC {
        return Err(CfCacheError::parse(&name, "bad average-PB header"));
    }
    let nx = read_u32_le(&raw, 8) as usize;
    let ny = read_u32_le(&raw, 12) as usize;
    let payload = &raw[AVG_PB_HEADER_SIZE..];
    if payload.len() != nx * ny * 4 {
        return Err(CfCacheError::parse(
            &name,
            format!("payload is {} bytes for a {}x{} image", payload.len(), nx, ny),
        ));
    }
    let pixels = payload.chunks_exact(4).map(|c| read_f32_le(c, 0)).collect();
    Ok(Some(AvgPb { nx, ny, pixels }))
}
