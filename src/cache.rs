//! Two-tier (memory + disk) CF cache keyed by parallactic angle.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::artifact::{write_artifact, read_avg_pb, write_avg_pb, ArtifactHeader, AvgPb, CfKind};
use crate::aux_index::{AuxIndex, AUX_INDEX_NAME};
use crate::buffer::CfBuffer;
use crate::cell::{CellParams, CfPixel};
use crate::disk::{ensure_cache_dir, DiskCatalog, PaWindow};
use crate::error::{CfCacheError, CfResult};
use crate::store::CfStore;

/// Which of the parallel caches an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tiers {
    Both,
    Signal,
    Weight,
}

impl Tiers {
    pub fn includes(self, kind: CfKind) -> bool {
        matches!(
            (self, kind),
            (Tiers::Both, _) | (Tiers::Signal, CfKind::Signal) | (Tiers::Weight, CfKind::Weight)
        )
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Defer pixel reads to the first access of each cell.
    pub lazy_fill: bool,
    /// Tolerance used when inserting freshly computed planes.
    pub pa_tolerance_deg: f64,
    /// Tolerance used to merge on-disk angles into buckets at open.
    pub bucket_tolerance_deg: f64,
    /// Only artifacts inside this window take part in lookups.
    pub pa_window: Option<PaWindow>,
    pub tiers: Tiers,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lazy_fill: false,
            pa_tolerance_deg: 1.0,
            bucket_tolerance_deg: 1.0,
            pa_window: None,
            tiers: Tiers::Both,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocateStatus {
    NotCached,
    MemoryHit,
    DiskHit,
}

/// Copies of the bucket buffers handed to the caller.
#[derive(Clone, Debug)]
pub struct CfHandles {
    pub bucket: usize,
    pub pa_deg: f64,
    pub signal: Option<CfBuffer>,
    pub weight: Option<CfBuffer>,
}

#[derive(Clone, Debug)]
pub struct Located {
    pub status: LocateStatus,
    /// `None` on a miss.
    pub handles: Option<CfHandles>,
}

/// One freshly computed plane with its metadata.
#[derive(Clone, Debug)]
pub struct FreshPlane {
    pub w_index: u32,
    pub w_value: f64,
    pub w_incr: f64,
    pub freq_hz: f64,
    pub mueller: i32,
    pub conj_freq_hz: f64,
    pub conj_poln: i32,
    pub x_support: i32,
    pub y_support: i32,
    pub sampling: f32,
    /// (nx, ny)
    pub shape: [usize; 2],
    pub pixels: Vec<CfPixel>,
}

/// Output of a fresh CF computation for one angle.
#[derive(Clone, Debug, Default)]
pub struct FreshCf {
    pub signal: Vec<FreshPlane>,
    pub weight: Vec<FreshPlane>,
}

impl FreshCf {
    fn planes(&self, kind: CfKind) -> &[FreshPlane] {
        match kind {
            CfKind::Signal => &self.signal,
            CfKind::Weight => &self.weight,
        }
    }
}

/// Per-bucket line of [`CfCache::summarize`].
#[derive(Clone, Debug, PartialEq)]
pub struct BucketSummary {
    pub kind: CfKind,
    pub bucket: usize,
    pub pa_deg: f64,
    pub baseline_type: i32,
    pub supports: Vec<(i32, i32)>,
    pub mem_bytes: usize,
}

struct TieredCache {
    kind: CfKind,
    store: CfStore,
    catalog: DiskCatalog,
}

impl TieredCache {
    fn open(
        config: &CacheConfig,
        kind: CfKind,
        aux: Option<&AuxIndex>,
        names: Option<&[String]>,
    ) -> CfResult<Self> {
        let mut catalog = match names {
            Some(names) => DiskCatalog::from_names(&config.dir, kind, names)?,
            None => DiskCatalog::scan(&config.dir, kind)?,
        };
        let mut store = CfStore::new();
        catalog.assign_buckets(&mut store, aux, config.bucket_tolerance_deg);
        info!(
            "{} cache: {} artifacts in {} buckets under {}",
            kind.label(),
            catalog.len(),
            store.len(),
            config.dir.display()
        );
        Ok(Self {
            kind,
            store,
            catalog,
        })
    }

    fn materialize(&mut self, bucket: usize, config: &CacheConfig) -> CfResult<usize> {
        let Some(buffer) = self.store.buffer_mut(bucket) else {
            return Ok(0);
        };
        let set = self
            .catalog
            .materialize(bucket, buffer, config.pa_window, !config.lazy_fill)?;
        buffer.prime()?;
        Ok(set)
    }

    fn locate(
        &mut self,
        pa_deg: f64,
        dpa_deg: f64,
        w_planes: usize,
        baseline_type: i32,
        config: &CacheConfig,
    ) -> CfResult<(LocateStatus, Option<usize>)> {
        let Some(bucket) = self.store.find(pa_deg, dpa_deg, baseline_type) else {
            return Ok((LocateStatus::NotCached, None));
        };
        if let Some(buffer) = self.store.buffer(bucket) {
            if buffer.is_materialized() && buffer.w_list().len() >= w_planes.max(1) {
                return Ok((LocateStatus::MemoryHit, Some(bucket)));
            }
        }
        if !self.catalog.covers(bucket, w_planes, config.pa_window) {
            return Ok((LocateStatus::NotCached, None));
        }
        let set = self.materialize(bucket, config)?;
        info!(
            "{} bucket {} (pa {:.3} deg): {} planes from disk{}",
            self.kind.label(),
            bucket,
            pa_deg,
            set,
            if config.lazy_fill { ", pixels deferred" } else { "" }
        );
        Ok((LocateStatus::DiskHit, Some(bucket)))
    }

    fn insert(
        &mut self,
        pa_deg: f64,
        tolerance_deg: f64,
        baseline_type: i32,
        planes: &[FreshPlane],
        dir: &Path,
    ) -> CfResult<usize> {
        let bucket = self.store.get_or_create(pa_deg, tolerance_deg, baseline_type);
        let w_values: Vec<f64> = planes.iter().map(|p| p.w_value).collect();
        let freq_values: Vec<f64> = planes.iter().map(|p| p.freq_hz).collect();
        let muellers: Vec<i32> = planes.iter().map(|p| p.mueller).collect();

        let buffer = self
            .store
            .buffer_mut(bucket)
            .ok_or_else(|| CfCacheError::ProtocolViolation(format!("bucket {} vanished", bucket)))?;
        buffer.resize(&w_values, &freq_values, &[muellers]);
        if buffer.storage_dir().is_none() {
            buffer.set_storage(Some(dir.to_path_buf()), false);
        }

        for plane in planes {
            let name = self
                .catalog
                .name_for(plane.w_index, bucket, plane.mueller, plane.freq_hz);
            let header = ArtifactHeader {
                pa_deg,
                w_value: plane.w_value,
                w_index: plane.w_index,
                mueller: plane.mueller,
                ref_freq_hz: plane.freq_hz,
                x_support: plane.x_support,
                y_support: plane.y_support,
                sampling: plane.sampling,
                conj_poln: plane.conj_poln,
                conj_freq_hz: plane.conj_freq_hz,
                w_incr: plane.w_incr,
                nx: u32::try_from(plane.shape[0])
                    .map_err(|_| CfCacheError::parse(&name, "nx out of range"))?,
                ny: u32::try_from(plane.shape[1])
                    .map_err(|_| CfCacheError::parse(&name, "ny out of range"))?,
                baseline_type,
                bucket_index: u32::try_from(bucket)
                    .map_err(|_| CfCacheError::parse(&name, "bucket index out of range"))?,
            };
            write_artifact(dir, &name, &header, &plane.pixels)?;
            debug!("{} wrote {}", self.kind.label(), name);

            buffer.set_params(
                plane.freq_hz,
                plane.w_value,
                plane.mueller,
                CellParams {
                    x_support: plane.x_support,
                    y_support: plane.y_support,
                    sampling: plane.sampling,
                    shape: plane.shape,
                    conj_freq_hz: plane.conj_freq_hz,
                    conj_poln: plane.conj_poln,
                    file_name: Some(name.clone()),
                },
            )?;
            buffer.set_pixels(plane.freq_hz, plane.w_value, plane.mueller, plane.pixels.clone())?;
            if plane.w_incr != 0.0 {
                buffer.set_w_incr(plane.w_incr);
            }
            self.catalog.record(name, header, bucket);
        }
        buffer.prime()?;
        Ok(bucket)
    }
}

/// Orchestrates the signal and weight caches over one directory.
pub struct CfCache {
    config: CacheConfig,
    signal: Option<TieredCache>,
    weight: Option<TieredCache>,
    /// Index read at open; carries the buckets of tiers that were not opened.
    aux: Option<AuxIndex>,
    lookups: usize,
    hits: usize,
}

impl CfCache {
    /// Open the cache by enumerating the directory.
    pub fn open(config: CacheConfig) -> CfResult<Self> {
        Self::open_inner(config, None, None)
    }

    /// Open the cache from explicit artifact names instead of a directory listing.
    pub fn open_from_list(config: CacheConfig, cf_names: &[String], wt_names: &[String]) -> CfResult<Self> {
        Self::open_inner(config, Some(cf_names), Some(wt_names))
    }

    fn open_inner(config: CacheConfig, cf_names: Option<&[String]>, wt_names: Option<&[String]>) -> CfResult<Self> {
        ensure_cache_dir(&config.dir)?;
        let aux = AuxIndex::read(&config.dir.join(AUX_INDEX_NAME))?;
        let signal = if config.tiers.includes(CfKind::Signal) {
            Some(TieredCache::open(&config, CfKind::Signal, aux.as_ref(), cf_names)?)
        } else {
            None
        };
        let weight = if config.tiers.includes(CfKind::Weight) {
            Some(TieredCache::open(&config, CfKind::Weight, aux.as_ref(), wt_names)?)
        } else {
            None
        };
        Ok(Self {
            config,
            signal,
            weight,
            aux,
            lookups: 0,
            hits: 0,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn tier(&self, kind: CfKind) -> Option<&TieredCache> {
        match kind {
            CfKind::Signal => self.signal.as_ref(),
            CfKind::Weight => self.weight.as_ref(),
        }
    }

    fn tier_mut(&mut self, kind: CfKind) -> Option<&mut TieredCache> {
        match kind {
            CfKind::Signal => self.signal.as_mut(),
            CfKind::Weight => self.weight.as_mut(),
        }
    }

    fn requested(&self, tiers: Tiers) -> CfResult<Vec<CfKind>> {
        let kinds: Vec<CfKind> = [CfKind::Signal, CfKind::Weight]
            .into_iter()
            .filter(|&k| tiers.includes(k) && self.tier(k).is_some())
            .collect();
        if kinds.is_empty() {
            return Err(CfCacheError::config(
                &self.config.dir,
                format!("{:?} CFs requested but the cache was opened for {:?}", tiers, self.config.tiers),
            ));
        }
        Ok(kinds)
    }

    pub fn bucket_count(&self, kind: CfKind) -> usize {
        self.tier(kind).map(|t| t.store.len()).unwrap_or(0)
    }

    /// Headers read from disk by `kind`'s catalog.
    pub fn headers_parsed(&self, kind: CfKind) -> usize {
        self.tier(kind).map(|t| t.catalog.headers_parsed()).unwrap_or(0)
    }

    fn handles(&self, bucket: usize, pa_deg: f64, kinds: &[CfKind], buckets: &[usize]) -> CfHandles {
        let mut handles = CfHandles {
            bucket,
            pa_deg,
            signal: None,
            weight: None,
        };
        for (&kind, &idx) in kinds.iter().zip(buckets) {
            let buffer = self.tier(kind).and_then(|t| t.store.buffer(idx)).cloned();
            match kind {
                CfKind::Signal => handles.signal = buffer,
                CfKind::Weight => handles.weight = buffer,
            }
        }
        if let Some(buffer) = handles.signal.as_ref().or(handles.weight.as_ref()) {
            handles.pa_deg = buffer.pa_deg();
        }
        handles
    }

    /// Find the CF set for `pa_deg` in memory, then on disk.
    ///
    /// A set counts as cached only when every requested tier has at least
    /// `w_planes` w-planes for the bucket.
    pub fn locate_conv_function(
        &mut self,
        pa_deg: f64,
        dpa_deg: f64,
        w_planes: usize,
        baseline_type: i32,
        tiers: Tiers,
    ) -> CfResult<Located> {
        let kinds = self.requested(tiers)?;
        let config = self.config.clone();
        self.lookups += 1;

        let mut status = LocateStatus::MemoryHit;
        let mut buckets = Vec::with_capacity(kinds.len());
        for &kind in &kinds {
            let Some(tier) = self.tier_mut(kind) else {
                continue;
            };
            match tier.locate(pa_deg, dpa_deg, w_planes, baseline_type, &config)? {
                (LocateStatus::NotCached, _) | (_, None) => {
                    debug!(
                        "{} miss at pa {:.3} deg (dpa {}, {} w-planes)",
                        kind.label(),
                        pa_deg,
                        dpa_deg,
                        w_planes
                    );
                    return Ok(Located {
                        status: LocateStatus::NotCached,
                        handles: None,
                    });
                }
                (LocateStatus::DiskHit, Some(idx)) => {
                    status = LocateStatus::DiskHit;
                    buckets.push(idx);
                }
                (LocateStatus::MemoryHit, Some(idx)) => buckets.push(idx),
            }
        }
        let Some(&first) = buckets.first() else {
            return Ok(Located {
                status: LocateStatus::NotCached,
                handles: None,
            });
        };
        self.hits += 1;
        let handles = self.handles(first, pa_deg, &kinds, &buckets);
        debug!("CF {:?} for pa {:.3} deg -> bucket {}", status, pa_deg, handles.bucket);
        Ok(Located {
            status,
            handles: Some(handles),
        })
    }

    /// Persist a fresh CF set and insert it into the memory tier.
    pub fn cache_conv_function(&mut self, pa_deg: f64, fresh: &FreshCf, baseline_type: i32) -> CfResult<CfHandles> {
        let tolerance = self.config.pa_tolerance_deg;
        let dir = self.config.dir.clone();
        let mut kinds = Vec::new();
        let mut buckets = Vec::new();
        for kind in [CfKind::Signal, CfKind::Weight] {
            let planes = fresh.planes(kind);
            let Some(tier) = self.tier_mut(kind) else {
                if !planes.is_empty() {
                    warn!("{} planes supplied but that tier is not open; dropped", kind.label());
                }
                continue;
            };
            if planes.is_empty() {
                continue;
            }
            buckets.push(tier.insert(pa_deg, tolerance, baseline_type, planes, &dir)?);
            kinds.push(kind);
        }
        let Some(&first) = buckets.first() else {
            return Err(CfCacheError::Compute(format!(
                "no CF planes to cache for pa {:.3} deg",
                pa_deg
            )));
        };
        Ok(self.handles(first, pa_deg, &kinds, &buckets))
    }

    /// Read any deferred pixels of the handed-out buckets into the memory tier
    /// and refresh `handles` from it. Returns the number of planes read.
    pub fn load_pixels(&mut self, handles: &mut CfHandles) -> CfResult<usize> {
        let mut loaded = 0;
        for kind in [CfKind::Signal, CfKind::Weight] {
            let slot = match kind {
                CfKind::Signal => &mut handles.signal,
                CfKind::Weight => &mut handles.weight,
            };
            let Some(bucket) = slot.as_ref().map(CfBuffer::bucket) else {
                continue;
            };
            let Some(buffer) = self.tier_mut(kind).and_then(|t| t.store.buffer_mut(bucket)) else {
                continue;
            };
            let read = buffer.load_all_pixels()?;
            if read > 0 {
                debug!("{} bucket {}: read {} deferred planes", kind.label(), bucket, read);
            }
            *slot = Some(buffer.clone());
            loaded += read;
        }
        Ok(loaded)
    }

    /// Materialize every bucket that has artifacts in the configured window.
    pub fn preload(&mut self) -> CfResult<usize> {
        let config = self.config.clone();
        let mut total = 0;
        for tier in [self.signal.as_mut(), self.weight.as_mut()].into_iter().flatten() {
            for bucket in 0..tier.store.len() {
                let pending = tier
                    .store
                    .buffer(bucket)
                    .map(|b| !b.is_materialized())
                    .unwrap_or(false);
                if pending && tier.catalog.covers(bucket, 1, config.pa_window) {
                    total += tier.materialize(bucket, &config)?;
                }
            }
        }
        info!("preloaded {} CF planes", total);
        Ok(total)
    }

    /// Log and return per-bucket support sizes and loaded memory.
    pub fn summarize(&self) -> Vec<BucketSummary> {
        let mut out = Vec::new();
        for tier in [self.signal.as_ref(), self.weight.as_ref()].into_iter().flatten() {
            for buffer in tier.store.buffers() {
                let supports: Vec<(i32, i32)> = (0..buffer.w_list().len())
                    .map(|wi| buffer.support_for_w(wi).unwrap_or((0, 0)))
                    .collect();
                info!(
                    "{} bucket {}: pa {:.3} deg, baseline type {}, {} w-planes, supports {:?}, {} bytes loaded",
                    tier.kind.label(),
                    buffer.bucket(),
                    buffer.pa_deg(),
                    buffer.baseline_type(),
                    supports.len(),
                    supports,
                    buffer.mem_usage()
                );
                out.push(BucketSummary {
                    kind: tier.kind,
                    bucket: buffer.bucket(),
                    pa_deg: buffer.pa_deg(),
                    baseline_type: buffer.baseline_type(),
                    supports,
                    mem_bytes: buffer.mem_usage(),
                });
            }
        }
        out
    }

    pub fn mem_usage(&self) -> usize {
        [self.signal.as_ref(), self.weight.as_ref()]
            .into_iter()
            .flatten()
            .map(|t| t.store.mem_usage())
            .sum()
    }

    /// Write the auxiliary index. Call after both pipeline threads have joined.
    pub fn flush(&self) -> CfResult<()> {
        ensure_cache_dir(&self.config.dir)?;
        let mut index = AuxIndex::default();
        for kind in [CfKind::Signal, CfKind::Weight] {
            match (self.tier(kind), self.aux.as_ref()) {
                (Some(tier), _) => index.extend(AuxIndex::from_store(&tier.store, kind)),
                (None, Some(aux)) => index.buckets.extend(aux.of_kind(kind).cloned()),
                (None, None) => {}
            }
        }
        let path = self.config.dir.join(AUX_INDEX_NAME);
        index.write(&path)?;
        info!(
            "wrote {} ({} buckets, {} w-planes)",
            path.display(),
            index.buckets.len(),
            index.w_planes()
        );
        if self.lookups > 0 && self.hits == 0 {
            info!(
                "all {} CF lookups missed the cache; every CF was computed fresh",
                self.lookups
            );
        }
        Ok(())
    }

    pub fn flush_avg_pb(&self, qualifier: &str, pb: &AvgPb) -> CfResult<PathBuf> {
        ensure_cache_dir(&self.config.dir)?;
        write_avg_pb(&self.config.dir, qualifier, pb)
    }

    pub fn load_avg_pb(&self, qualifier: &str) -> CfResult<(LocateStatus, Option<AvgPb>)> {
        match read_avg_pb(&self.config.dir, qualifier)? {
            Some(pb) => Ok((LocateStatus::DiskHit, Some(pb))),
            None => Ok((LocateStatus::NotCached, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::artifact_name;

    fn plane(w_index: u32, mueller: i32, support: i32) -> FreshPlane {
        FreshPlane {
            w_index,
            w_value: w_index as f64 * 50.0,
            w_incr: 50.0,
            freq_hz: 1.4e9,
            mueller,
            conj_freq_hz: 1.4e9,
            conj_poln: mueller,
            x_support: support,
            y_support: support,
            sampling: 1.0,
            shape: [4, 4],
            pixels: vec![CfPixel::new(w_index as f32, mueller as f32); 16],
        }
    }

    fn seed_artifact(dir: &Path, kind: CfKind, pa_deg: f64) {
        let header = ArtifactHeader {
            pa_deg,
            w_value: 0.0,
            w_index: 0,
            mueller: 0,
            ref_freq_hz: 1.4e9,
            x_support: 7,
            y_support: 7,
            sampling: 1.0,
            conj_poln: 0,
            conj_freq_hz: 1.4e9,
            w_incr: 0.0,
            nx: 4,
            ny: 4,
            baseline_type: 0,
            bucket_index: 0,
        };
        let name = artifact_name(kind, 0, 0, 0, 0);
        write_artifact(dir, &name, &header, &[CfPixel::new(1.0, 0.0); 16]).unwrap();
    }

    #[test]
    fn empty_directory_is_never_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        for pa in [-90.0, 0.0, 45.0] {
            let located = cache.locate_conv_function(pa, 2.0, 1, 0, Tiers::Both).unwrap();
            assert_eq!(located.status, LocateStatus::NotCached);
            assert!(located.handles.is_none());
        }
    }

    #[test]
    fn disk_hit_then_memory_hit_without_reparse() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        let mut config = CacheConfig::new(dir.path());
        config.tiers = Tiers::Signal;
        let mut cache = CfCache::open(config).unwrap();
        assert_eq!(cache.headers_parsed(CfKind::Signal), 1);

        let located = cache.locate_conv_function(31.0, 2.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        let handles = located.handles.unwrap();
        let signal = handles.signal.unwrap();
        let cell = signal.get_cf_cell(1.4e9, 0.0, 0).unwrap();
        assert_eq!(cell.support(), Some((7, 7)));
        assert!(cell.pixels.is_loaded());

        let again = cache.locate_conv_function(31.5, 2.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(again.status, LocateStatus::MemoryHit);
        assert_eq!(again.handles.unwrap().bucket, handles.bucket);
        assert_eq!(cache.bucket_count(CfKind::Signal), 1);
        assert_eq!(cache.headers_parsed(CfKind::Signal), 1);
    }

    #[test]
    fn lazy_disk_hit_defers_pixels() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        let mut config = CacheConfig::new(dir.path());
        config.lazy_fill = true;
        config.tiers = Tiers::Signal;
        let mut cache = CfCache::open(config).unwrap();

        let located = cache.locate_conv_function(30.0, 1.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        let mut signal = located.handles.unwrap().signal.unwrap();
        assert!(!signal.get_cf_cell(1.4e9, 0.0, 0).unwrap().pixels.is_loaded());
        assert_eq!(cache.mem_usage(), 0);

        let pixels = signal.pixels(1.4e9, 0.0, 0).unwrap();
        assert_eq!(pixels.len(), 16);
        assert!(signal.get_cf_cell(1.4e9, 0.0, 0).unwrap().pixels.is_loaded());
    }

    #[test]
    fn too_few_w_planes_on_disk_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        let mut config = CacheConfig::new(dir.path());
        config.tiers = Tiers::Signal;
        let mut cache = CfCache::open(config).unwrap();
        let located = cache.locate_conv_function(30.0, 1.0, 4, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::NotCached);
    }

    #[test]
    fn cached_planes_are_reusable_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let fresh = FreshCf {
            signal: vec![plane(0, 0, 9), plane(1, 0, 11)],
            weight: vec![plane(0, 0, 13), plane(1, 0, 15)],
        };
        let handles = cache.cache_conv_function(12.0, &fresh, 0).unwrap();
        let signal = handles.signal.unwrap();
        assert_eq!(signal.w_list(), &[0.0, 50.0]);
        assert!(signal.get_cf_cell(1.4e9, 50.0, 0).unwrap().pixels.is_loaded());
        assert!(handles.weight.is_some());

        let hit = cache.locate_conv_function(12.4, 1.0, 2, 0, Tiers::Both).unwrap();
        assert_eq!(hit.status, LocateStatus::MemoryHit);
        cache.flush().unwrap();
        drop(cache);

        let mut reopened = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let located = reopened.locate_conv_function(12.0, 1.0, 2, 0, Tiers::Both).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        let handles = located.handles.unwrap();
        let weight = handles.weight.unwrap();
        let cell = weight.get_cf_cell(1.4e9, 50.0, 0).unwrap();
        assert_eq!(cell.support(), Some((15, 15)));
        let params = cell.params.as_ref().unwrap();
        assert_eq!(params.conj_poln, 0);
        assert_eq!(params.sampling, 1.0);
        assert_eq!(handles.signal.unwrap().pa_deg(), 12.0);

        let summary = reopened.summarize();
        let signal = summary.iter().find(|s| s.kind == CfKind::Signal).unwrap();
        assert_eq!(signal.supports, vec![(9, 9), (11, 11)]);
    }

    #[test]
    fn flush_then_reopen_keeps_bucket_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        for pa in [50.0, -20.0, 10.0] {
            let fresh = FreshCf {
                signal: vec![plane(0, 0, 5)],
                weight: Vec::new(),
            };
            cache.cache_conv_function(pa, &fresh, 0).unwrap();
        }
        cache.flush().unwrap();

        let index = AuxIndex::read(&dir.path().join(AUX_INDEX_NAME)).unwrap().unwrap();
        let order: Vec<f64> = index.buckets.iter().map(|b| b.pa_deg).collect();
        assert_eq!(order, vec![50.0, -20.0, 10.0]);

        let reopened = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let summary = reopened.summarize();
        let order: Vec<f64> = summary
            .iter()
            .filter(|s| s.kind == CfKind::Signal)
            .map(|s| s.pa_deg)
            .collect();
        assert_eq!(order, vec![50.0, -20.0, 10.0]);
    }

    #[test]
    fn tiers_keep_their_own_bucket_order_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let signal_only = FreshCf {
            signal: vec![plane(0, 0, 5)],
            weight: Vec::new(),
        };
        let weight_only = FreshCf {
            signal: Vec::new(),
            weight: vec![plane(0, 0, 9)],
        };
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        cache.cache_conv_function(10.0, &signal_only, 0).unwrap();
        cache.cache_conv_function(50.0, &weight_only, 0).unwrap();
        cache.flush().unwrap();
        drop(cache);

        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let handles = cache.cache_conv_function(10.0, &weight_only, 0).unwrap();
        assert_eq!(handles.bucket, 1);
        let first = crate::artifact::read_header(dir.path(), &artifact_name(CfKind::Weight, 0, 0, 0, 0)).unwrap();
        assert_eq!(first.pa_deg, 50.0);
        cache.flush().unwrap();
        drop(cache);

        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        for pa in [50.0, 10.0] {
            let located = cache.locate_conv_function(pa, 1.0, 1, 0, Tiers::Weight).unwrap();
            assert_eq!(located.status, LocateStatus::DiskHit);
            assert_eq!(located.handles.unwrap().pa_deg, pa);
        }
        let located = cache.locate_conv_function(10.0, 1.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        drop(cache);

        let mut config = CacheConfig::new(dir.path());
        config.tiers = Tiers::Weight;
        CfCache::open(config).unwrap().flush().unwrap();
        let index = AuxIndex::read(&dir.path().join(AUX_INDEX_NAME)).unwrap().unwrap();
        assert_eq!(index.of_kind(CfKind::Signal).count(), 1);
        assert_eq!(index.of_kind(CfKind::Weight).count(), 2);
    }

    #[test]
    fn malformed_artifact_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        std::fs::write(dir.path().join("CFS_3_0_0_0"), b"CFCA").unwrap();
        match CfCache::open(CacheConfig::new(dir.path())) {
            Err(CfCacheError::ArtifactParse { name, .. }) => assert_eq!(name, "CFS_3_0_0_0"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("open accepted a truncated artifact"),
        }
    }

    #[test]
    fn explicit_list_and_single_tier() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        seed_artifact(dir.path(), CfKind::Weight, 30.0);
        let mut config = CacheConfig::new(dir.path());
        config.tiers = Tiers::Weight;
        let mut cache =
            CfCache::open_from_list(config, &[], &["WTCFS_0_0_0_0".to_string()]).unwrap();
        assert_eq!(cache.headers_parsed(CfKind::Signal), 0);
        assert_eq!(cache.headers_parsed(CfKind::Weight), 1);
        assert!(cache.locate_conv_function(30.0, 1.0, 1, 0, Tiers::Signal).is_err());
        let located = cache.locate_conv_function(30.0, 1.0, 1, 0, Tiers::Both).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        let handles = located.handles.unwrap();
        assert!(handles.signal.is_none());
        assert!(handles.weight.is_some());
    }

    #[test]
    fn preload_respects_the_window() {
        let dir = tempfile::tempdir().unwrap();
        seed_artifact(dir.path(), CfKind::Signal, 30.0);
        let header = ArtifactHeader {
            pa_deg: 80.0,
            ..crate::artifact::read_header(dir.path(), "CFS_0_0_0_0").unwrap()
        };
        write_artifact(dir.path(), "CFS_0_1_0_0", &header, &[CfPixel::new(0.0, 0.0); 16]).unwrap();

        let mut config = CacheConfig::new(dir.path());
        config.tiers = Tiers::Signal;
        config.pa_window = Some(PaWindow {
            center_deg: 25.0,
            dpa_deg: 10.0,
        });
        let mut cache = CfCache::open(config).unwrap();
        assert_eq!(cache.bucket_count(CfKind::Signal), 2);
        assert_eq!(cache.preload().unwrap(), 1);
        let located = cache.locate_conv_function(80.0, 1.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::NotCached);
    }

    #[test]
    fn avg_pb_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        assert_eq!(cache.load_avg_pb("_I").unwrap(), (LocateStatus::NotCached, None));
        let pb = AvgPb {
            nx: 2,
            ny: 2,
            pixels: vec![1.0, 0.5, 0.5, 0.25],
        };
        cache.flush_avg_pb("_I", &pb).unwrap();
        assert_eq!(cache.load_avg_pb("_I").unwrap(), (LocateStatus::DiskHit, Some(pb)));
    }
}
