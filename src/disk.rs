use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::artifact::{artifact_name, is_artifact_of, read_header, ArtifactHeader, CfKind};
use crate::aux_index::AuxIndex;
use crate::buffer::CfBuffer;
use crate::cell::CellParams;
use crate::error::{CfCacheError, CfResult};
use crate::store::CfStore;
use crate::utils::sorted_unique_i32;

/// Angular range of artifacts considered for lookup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaWindow {
    pub center_deg: f64,
    pub dpa_deg: f64,
}

impl PaWindow {
    pub fn contains(&self, pa_deg: f64) -> bool {
        (pa_deg - self.center_deg).abs() <= self.dpa_deg
    }
}

fn in_window(window: Option<PaWindow>, pa_deg: f64) -> bool {
    window.map(|w| w.contains(pa_deg)).unwrap_or(true)
}

/// The cache directory must exist (or be creatable), be listable and be writable.
pub fn ensure_cache_dir(dir: &Path) -> CfResult<()> {
    if dir.as_os_str().is_empty() {
        return Err(CfCacheError::config(dir, "empty cache directory path"));
    }
    if !dir.exists() {
        fs::create_dir_all(dir)
            .map_err(|e| CfCacheError::config(dir, format!("cannot create: {}", e)))?;
        info!("created CF cache directory {}", dir.display());
    }
    let meta = fs::metadata(dir).map_err(|e| CfCacheError::config(dir, format!("cannot stat: {}", e)))?;
    if !meta.is_dir() {
        return Err(CfCacheError::config(dir, "not a directory"));
    }
    fs::read_dir(dir).map_err(|e| CfCacheError::config(dir, format!("not readable: {}", e)))?;

    let probe = dir.join(format!(".cfcache-probe-{}", std::process::id()));
    fs::write(&probe, b"")
        .map_err(|e| CfCacheError::config(dir, format!("not writable: {}", e)))?;
    fs::remove_file(&probe).map_err(|e| CfCacheError::io(&probe, e))?;
    Ok(())
}

/// Sorted names of the `kind` artifacts in `dir`.
pub fn list_artifacts(dir: &Path, kind: CfKind) -> CfResult<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| CfCacheError::io(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CfCacheError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| CfCacheError::io(entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_artifact_of(name, kind) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Clone, Debug)]
pub struct DiscoveredArtifact {
    pub name: String,
    pub header: ArtifactHeader,
    /// Memory-tier bucket, once assigned.
    pub bucket: Option<usize>,
}

/// Parsed headers of every artifact of one kind, grouped into buckets.
#[derive(Clone, Debug)]
pub struct DiskCatalog {
    dir: PathBuf,
    kind: CfKind,
    entries: Vec<DiscoveredArtifact>,
    headers_parsed: usize,
}

impl DiskCatalog {
    /// Enumerate and parse every `kind` artifact under `dir`.
    pub fn scan(dir: &Path, kind: CfKind) -> CfResult<Self> {
        let names = list_artifacts(dir, kind)?;
        Self::from_names(dir, kind, &names)
    }

    /// Parse an explicit list of artifact names. Any bad header fails the whole catalog.
    pub fn from_names(dir: &Path, kind: CfKind, names: &[String]) -> CfResult<Self> {
        let entries = names
            .par_iter()
            .map(|name| {
                let header = read_header(dir, name)?;
                debug!(
                    "{} {}: pa={} w[{}]={} mueller={} support=({}, {})",
                    kind.label(),
                    name,
                    header.pa_deg,
                    header.w_index,
                    header.w_value,
                    header.mueller,
                    header.x_support,
                    header.y_support
                );
                Ok(DiscoveredArtifact {
                    name: name.clone(),
                    header,
                    bucket: None,
                })
            })
            .collect::<CfResult<Vec<_>>>()?;
        let headers_parsed = entries.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            entries,
            headers_parsed,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> CfKind {
        self.kind
    }

    pub fn entries(&self) -> &[DiscoveredArtifact] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of headers read from disk so far.
    pub fn headers_parsed(&self) -> usize {
        self.headers_parsed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Create buckets in `store` and tag every entry with its bucket.
    ///
    /// Buckets that `aux` lists for this kind are created first, in order, so
    /// bucket indices survive across runs. Remaining angles are taken in the
    /// bucket order recorded in their headers and merged within
    /// `tolerance_deg`; each artifact then joins its nearest bucket.
    pub fn assign_buckets(&mut self, store: &mut CfStore, aux: Option<&AuxIndex>, tolerance_deg: f64) {
        if let Some(aux) = aux {
            for bucket in aux.of_kind(self.kind) {
                store.get_or_create(bucket.pa_deg, 0.0, bucket.baseline_type);
            }
        }

        let mut seeds: Vec<(u32, f64, i32)> = self
            .entries
            .iter()
            .map(|e| (e.header.bucket_index, e.header.pa_deg, e.header.baseline_type))
            .collect();
        seeds.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)).then(a.2.cmp(&b.2)));
        for (_, pa, bl) in seeds {
            store.get_or_create(pa, tolerance_deg, bl);
        }

        for entry in &mut self.entries {
            entry.bucket = store.find(
                entry.header.pa_deg,
                f64::INFINITY,
                entry.header.baseline_type,
            );
        }
    }

    fn bucket_entries(&self, bucket: usize, window: Option<PaWindow>) -> impl Iterator<Item = &DiscoveredArtifact> {
        self.entries
            .iter()
            .filter(move |e| e.bucket == Some(bucket) && in_window(window, e.header.pa_deg))
    }

    /// True when the bucket has artifacts on at least `w_planes` distinct w-planes.
    pub fn covers(&self, bucket: usize, w_planes: usize, window: Option<PaWindow>) -> bool {
        let w_indices: Vec<i32> = self
            .bucket_entries(bucket, window)
            .map(|e| e.header.w_index as i32)
            .collect();
        let distinct = sorted_unique_i32(&w_indices).len();
        distinct > 0 && distinct >= w_planes
    }

    /// Fill `buffer` with the metadata of the bucket's artifacts, optionally loading pixels.
    ///
    /// Returns the number of cells set.
    pub fn materialize(
        &self,
        bucket: usize,
        buffer: &mut CfBuffer,
        window: Option<PaWindow>,
        load_pixels: bool,
    ) -> CfResult<usize> {
        let entries: Vec<&DiscoveredArtifact> = self.bucket_entries(bucket, window).collect();
        if entries.is_empty() {
            return Ok(0);
        }
        let w_values: Vec<f64> = entries.iter().map(|e| e.header.w_value).collect();
        let freq_values: Vec<f64> = entries.iter().map(|e| e.header.ref_freq_hz).collect();
        let muellers: Vec<i32> = entries.iter().map(|e| e.header.mueller).collect();
        buffer.resize(&w_values, &freq_values, &[muellers]);
        buffer.set_storage(Some(self.dir.clone()), !load_pixels);

        for entry in &entries {
            let h = &entry.header;
            buffer.set_params(
                h.ref_freq_hz,
                h.w_value,
                h.mueller,
                CellParams {
                    x_support: h.x_support,
                    y_support: h.y_support,
                    sampling: h.sampling,
                    shape: [h.nx as usize, h.ny as usize],
                    conj_freq_hz: h.conj_freq_hz,
                    conj_poln: h.conj_poln,
                    file_name: Some(entry.name.clone()),
                },
            )?;
            if h.w_incr != 0.0 {
                buffer.set_w_incr(h.w_incr);
            }
        }
        if load_pixels {
            let loaded = buffer.load_all_pixels()?;
            debug!(
                "{} bucket {}: loaded {} planes eagerly",
                self.kind.label(),
                bucket,
                loaded
            );
        }
        Ok(entries.len())
    }

    /// Name for a new plane: the lowest frequency slot that is free or already
    /// holds this same plane of this same bucket.
    pub fn name_for(&self, w_index: u32, bucket: usize, mueller: i32, freq_hz: f64) -> String {
        let mut slot = 0usize;
        loop {
            let name = artifact_name(self.kind, w_index as usize, bucket, mueller, slot);
            match self.entries.iter().find(|e| e.name == name) {
                Some(e) if e.bucket == Some(bucket) && e.header.ref_freq_hz == freq_hz => return name,
                Some(_) => {}
                None if !self.dir.join(&name).exists() => return name,
                None => {}
            }
            slot += 1;
        }
    }

    /// Register an artifact written during this run.
    pub fn record(&mut self, name: String, header: ArtifactHeader, bucket: usize) {
        self.entries.retain(|e| e.name != name);
        self.entries.push(DiscoveredArtifact {
            name,
            header,
            bucket: Some(bucket),
        });
    }
}
