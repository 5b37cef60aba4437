//! CF server (producer) and gridding loop (consumer) joined through a [`ThreadCoordinator`].

use std::thread;

use tracing::{debug, info, warn};

use crate::buffer::PolMap;
use crate::cache::{CfCache, CfHandles, FreshCf, LocateStatus, Tiers};
use crate::coordinator::{CfPublication, SpwHooks, ThreadCoordinator};
use crate::error::{CfCacheError, CfResult};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkyGeometry {
    pub nx: usize,
    pub ny: usize,
    pub cell_size_rad: f64,
}

/// Everything a [`CfComputer`] needs for one CF set.
#[derive(Clone, Debug)]
pub struct CfRequest {
    pub pa_deg: f64,
    pub w_planes: usize,
    pub spw_id: usize,
    pub ref_freq_hz: f64,
    pub sky: SkyGeometry,
    pub pol_map: PolMap,
}

/// Computes fresh CF planes on a cache miss.
pub trait CfComputer {
    fn compute(&mut self, request: &CfRequest) -> CfResult<FreshCf>;
}

/// Converts cached buffers into the handle the gridding engine consumes.
pub trait DeviceTransfer {
    type Handle: Send;

    fn to_device(&self, spw_id: usize, handles: &CfHandles) -> CfResult<Self::Handle>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionMode {
    AwProjection,
    /// One w-plane, wideband A-projection.
    AOnly,
    /// Several w-planes, no A-projection.
    WOnly,
}

impl ProjectionMode {
    /// A single CF set serves every spectral window.
    pub fn needs_single_set(self) -> bool {
        !matches!(self, ProjectionMode::AwProjection)
    }
}

#[derive(Clone, Debug)]
pub struct ServerPlan {
    pub spw_ids: Vec<usize>,
    /// Reference frequency per entry of `spw_ids`.
    pub ref_freqs: Vec<f64>,
    pub pa_deg: f64,
    pub dpa_deg: f64,
    pub w_planes: usize,
    pub baseline_type: i32,
    pub sky: SkyGeometry,
    pub pol_map: PolMap,
    pub mode: ProjectionMode,
    pub tiers: Tiers,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerReport {
    pub published: usize,
    pub unchanged: usize,
    pub computed: usize,
    pub memory_hits: usize,
    pub disk_hits: usize,
}

/// Producer: resolve and publish one CF set per spectral window.
///
/// Latches end-of-data when it stops for any reason, including errors, so the
/// consumer never waits on a producer that has gone.
pub fn cf_server<D: DeviceTransfer>(
    coord: &ThreadCoordinator<D::Handle>,
    cache: &mut CfCache,
    computer: &mut dyn CfComputer,
    device: &D,
    plan: &ServerPlan,
) -> CfResult<ServerReport> {
    let result = serve_windows(coord, cache, computer, device, plan);
    coord.set_eod();
    if let Err(e) = &result {
        warn!("CF server stopped: {}", e);
    }
    result
}

fn serve_windows<D: DeviceTransfer>(
    coord: &ThreadCoordinator<D::Handle>,
    cache: &mut CfCache,
    computer: &mut dyn CfComputer,
    device: &D,
    plan: &ServerPlan,
) -> CfResult<ServerReport> {
    if plan.spw_ids.len() != plan.ref_freqs.len() {
        return Err(CfCacheError::ProtocolViolation(format!(
            "{} spectral windows but {} reference frequencies",
            plan.spw_ids.len(),
            plan.ref_freqs.len()
        )));
    }
    let mut report = ServerReport::default();
    let mut last: Option<(usize, f64)> = None;

    for (&spw_id, &ref_freq_hz) in plan.spw_ids.iter().zip(&plan.ref_freqs) {
        coord.set_cf_ready(false);

        let located = cache.locate_conv_function(
            plan.pa_deg,
            plan.dpa_deg,
            plan.w_planes,
            plan.baseline_type,
            plan.tiers,
        )?;
        let mut handles = match (located.status, located.handles) {
            (LocateStatus::NotCached, _) => {
                let request = CfRequest {
                    pa_deg: plan.pa_deg,
                    w_planes: plan.w_planes,
                    spw_id,
                    ref_freq_hz,
                    sky: plan.sky,
                    pol_map: plan.pol_map.clone(),
                };
                let fresh = computer.compute(&request)?;
                report.computed += 1;
                cache.cache_conv_function(plan.pa_deg, &fresh, plan.baseline_type)?
            }
            (status, Some(handles)) => {
                match status {
                    LocateStatus::DiskHit => report.disk_hits += 1,
                    _ => report.memory_hits += 1,
                }
                handles
            }
            (status, None) => {
                return Err(CfCacheError::ProtocolViolation(format!(
                    "{:?} without a CF handle",
                    status
                )))
            }
        };

        let key = (handles.bucket, ref_freq_hz);
        let publication = if last == Some(key) {
            report.unchanged += 1;
            CfPublication::Unchanged
        } else {
            cache.load_pixels(&mut handles)?;
            CfPublication::New(device.to_device(spw_id, &handles)?)
        };
        last = Some(key);
        coord.publish(publication)?;
        report.published += 1;
        coord.set_cf_ready(true);
        coord.notify_cf_ready();
        debug!("CF set for spw {} published (bucket {})", spw_id, handles.bucket);

        if coord.is_eod() {
            debug!("end of data seen after publishing spw {}", spw_id);
            return Ok(report);
        }
        if !coord.wait_for_cf_sent() {
            return Ok(report);
        }
        coord.set_cf_sent(false);

        if plan.mode.needs_single_set() {
            debug!("{:?}: one CF set serves every window", plan.mode);
            return Ok(report);
        }
    }
    Ok(report)
}

/// A unit of visibility data tagged with its spectral window.
pub trait SpectralChunk {
    fn spectral_window(&self) -> usize;
    fn rows(&self) -> usize;
}

/// Consumes CF handles and visibility chunks.
pub trait GriddingEngine<H> {
    type Chunk: SpectralChunk;

    fn set_cf(&mut self, handle: H);
    fn has_cf(&self) -> bool;
    fn grid(&mut self, chunk: &Self::Chunk) -> CfResult<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GridReport {
    pub chunks: usize,
    pub rows: usize,
    pub windows: usize,
    pub cf_swaps: usize,
}

/// Consumer: grid every chunk, swapping CF sets on spectral-window change.
///
/// End-of-data is signalled when the stream ends or gridding fails.
pub fn grid_loop<H, E, K, I>(chunks: I, hooks: &K, engine: &mut E) -> CfResult<GridReport>
where
    E: GriddingEngine<H>,
    K: SpwHooks<H> + ?Sized,
    I: IntoIterator<Item = E::Chunk>,
{
    let result = grid_chunks(chunks, hooks, engine);
    hooks.on_end_of_data();
    result
}

fn grid_chunks<H, E, K, I>(chunks: I, hooks: &K, engine: &mut E) -> CfResult<GridReport>
where
    E: GriddingEngine<H>,
    K: SpwHooks<H> + ?Sized,
    I: IntoIterator<Item = E::Chunk>,
{
    let mut report = GridReport::default();
    let mut current_spw: Option<usize> = None;
    for chunk in chunks {
        let spw = chunk.spectral_window();
        let new_window = current_spw != Some(spw);
        if new_window {
            current_spw = Some(spw);
            report.windows += 1;
            if let Some(handle) = hooks.on_new_spectral_window()? {
                engine.set_cf(handle);
                report.cf_swaps += 1;
            }
            if !engine.has_cf() {
                return Err(CfCacheError::ProtocolViolation(format!(
                    "no CF set available for spectral window {}",
                    spw
                )));
            }
        }
        engine.grid(&chunk)?;
        report.chunks += 1;
        report.rows += chunk.rows();
        if new_window {
            hooks.on_handle_consumed();
        }
    }
    Ok(report)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineReport {
    pub server: ServerReport,
    pub grid: GridReport,
}

/// Run the CF server on a background thread and grid on this one, then flush the cache.
pub fn run_pipeline<C, D, E, I>(
    cache: &mut CfCache,
    computer: &mut C,
    device: &D,
    plan: &ServerPlan,
    chunks: I,
    engine: &mut E,
) -> CfResult<PipelineReport>
where
    C: CfComputer + Send,
    D: DeviceTransfer + Sync,
    E: GriddingEngine<D::Handle>,
    I: IntoIterator<Item = E::Chunk>,
{
    let coord: ThreadCoordinator<D::Handle> = ThreadCoordinator::new();
    let (server, grid) = thread::scope(|s| {
        let producer = s.spawn(|| cf_server(&coord, &mut *cache, &mut *computer, device, plan));
        let grid = grid_loop(chunks, &coord, engine);
        (producer.join(), grid)
    });
    let server = server
        .map_err(|_| CfCacheError::ProtocolViolation("CF server thread panicked".into()))??;
    let grid = grid?;
    info!(
        "pipeline done: {} windows published ({} computed, {} from disk, {} from memory), {} chunks gridded",
        server.published, server.computed, server.disk_hits, server.memory_hits, grid.chunks
    );
    cache.flush()?;
    Ok(PipelineReport { server, grid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, FreshPlane};
    use crate::cell::CfPixel;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Chunk {
        spw: usize,
    }

    impl SpectralChunk for Chunk {
        fn spectral_window(&self) -> usize {
            self.spw
        }

        fn rows(&self) -> usize {
            10
        }
    }

    fn chunks(spws: &[usize]) -> Vec<Chunk> {
        spws.iter().map(|&spw| Chunk { spw }).collect()
    }

    struct StubComputer {
        log: Log,
        fail: bool,
    }

    impl CfComputer for StubComputer {
        fn compute(&mut self, request: &CfRequest) -> CfResult<FreshCf> {
            self.log.lock().push(format!("compute {}", request.spw_id));
            if self.fail {
                return Err(CfCacheError::Compute("aperture model unavailable".into()));
            }
            let planes = (0..request.w_planes as u32)
                .map(|wi| FreshPlane {
                    w_index: wi,
                    w_value: wi as f64 * 10.0,
                    w_incr: 10.0,
                    freq_hz: request.ref_freq_hz,
                    mueller: 0,
                    conj_freq_hz: request.ref_freq_hz,
                    conj_poln: 0,
                    x_support: 3,
                    y_support: 3,
                    sampling: 2.0,
                    shape: [2, 2],
                    pixels: vec![CfPixel::new(1.0, 0.0); 4],
                })
                .collect::<Vec<_>>();
            Ok(FreshCf {
                signal: planes.clone(),
                weight: planes,
            })
        }
    }

    struct StubDevice {
        log: Log,
    }

    impl DeviceTransfer for StubDevice {
        type Handle = usize;

        fn to_device(&self, spw_id: usize, _handles: &CfHandles) -> CfResult<usize> {
            self.log.lock().push(format!("publish {}", spw_id));
            Ok(spw_id)
        }
    }

    struct StubEngine {
        log: Log,
        cf: Option<usize>,
    }

    impl GriddingEngine<usize> for StubEngine {
        type Chunk = Chunk;

        fn set_cf(&mut self, handle: usize) {
            self.log.lock().push(format!("set {}", handle));
            self.cf = Some(handle);
        }

        fn has_cf(&self) -> bool {
            self.cf.is_some()
        }

        fn grid(&mut self, chunk: &Chunk) -> CfResult<()> {
            self.log.lock().push(format!("grid {}", chunk.spw));
            Ok(())
        }
    }

    struct Rig {
        log: Log,
        computer: StubComputer,
        device: StubDevice,
        engine: StubEngine,
    }

    fn rig() -> Rig {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        Rig {
            computer: StubComputer {
                log: Arc::clone(&log),
                fail: false,
            },
            device: StubDevice { log: Arc::clone(&log) },
            engine: StubEngine {
                log: Arc::clone(&log),
                cf: None,
            },
            log,
        }
    }

    fn plan(spw_ids: &[usize], mode: ProjectionMode) -> ServerPlan {
        ServerPlan {
            spw_ids: spw_ids.to_vec(),
            ref_freqs: spw_ids.iter().map(|&s| 1.0e9 + s as f64 * 1.0e8).collect(),
            pa_deg: 20.0,
            dpa_deg: 1.0,
            w_planes: 2,
            baseline_type: 0,
            sky: SkyGeometry {
                nx: 64,
                ny: 64,
                cell_size_rad: 1.0e-5,
            },
            pol_map: vec![vec![0]],
            mode,
            tiers: Tiers::Both,
        }
    }

    #[test]
    fn windows_are_published_only_after_the_previous_was_sent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        let report = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0, 1], ProjectionMode::AwProjection),
            chunks(&[0, 0, 1, 1]),
            &mut r.engine,
        )
        .unwrap();

        assert_eq!(report.server.published, 2);
        assert_eq!(report.server.computed, 1);
        assert_eq!(report.server.memory_hits, 1);
        assert_eq!(report.grid.chunks, 4);
        assert_eq!(report.grid.cf_swaps, 2);

        let log = r.log.lock().clone();
        let handoffs: Vec<&str> = log
            .iter()
            .map(String::as_str)
            .filter(|e| e.starts_with("publish") || e.starts_with("set"))
            .collect();
        assert_eq!(handoffs, vec!["publish 0", "set 0", "publish 1", "set 1"]);
        let first_grid = log.iter().position(|e| e == "grid 0").unwrap();
        let second_publish = log.iter().position(|e| e == "publish 1").unwrap();
        assert!(first_grid < second_publish);
    }

    #[test]
    fn second_run_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
            let mut r = rig();
            run_pipeline(
                &mut cache,
                &mut r.computer,
                &r.device,
                &plan(&[0], ProjectionMode::AwProjection),
                chunks(&[0]),
                &mut r.engine,
            )
            .unwrap();
        }
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        let report = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0], ProjectionMode::AwProjection),
            chunks(&[0, 0]),
            &mut r.engine,
        )
        .unwrap();
        assert_eq!(report.server.computed, 0);
        assert_eq!(report.server.disk_hits, 1);
        assert!(!r.log.lock().iter().any(|e| e.starts_with("compute")));
    }

    #[test]
    fn single_set_mode_publishes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        let report = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0, 1, 2], ProjectionMode::AOnly),
            chunks(&[0, 1, 2]),
            &mut r.engine,
        )
        .unwrap();
        assert_eq!(report.server.published, 1);
        assert_eq!(report.grid.cf_swaps, 1);
        assert_eq!(report.grid.windows, 3);
        assert_eq!(report.grid.chunks, 3);
    }

    #[test]
    fn short_stream_releases_a_waiting_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        let report = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0, 1, 2, 3], ProjectionMode::AwProjection),
            chunks(&[0]),
            &mut r.engine,
        )
        .unwrap();
        assert_eq!(report.grid.chunks, 1);
        assert!(report.server.published <= 2);
    }

    #[test]
    fn extra_windows_reuse_the_last_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        let report = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0], ProjectionMode::AwProjection),
            chunks(&[0, 1, 2]),
            &mut r.engine,
        )
        .unwrap();
        assert_eq!(report.server.published, 1);
        assert_eq!(report.grid.chunks, 3);
    }

    #[test]
    fn compute_failure_stops_both_threads() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let mut r = rig();
        r.computer.fail = true;
        let err = run_pipeline(
            &mut cache,
            &mut r.computer,
            &r.device,
            &plan(&[0, 1], ProjectionMode::AwProjection),
            chunks(&[0, 1]),
            &mut r.engine,
        )
        .unwrap_err();
        assert!(matches!(err, CfCacheError::Compute(_)));
        assert!(!r.log.lock().iter().any(|e| e.starts_with("grid")));
    }

    #[test]
    fn grid_loop_without_any_cf_is_a_protocol_violation() {
        let coord: ThreadCoordinator<usize> = ThreadCoordinator::new();
        coord.set_eod();
        let mut r = rig();
        let err = grid_loop(chunks(&[0]), &coord, &mut r.engine).unwrap_err();
        assert!(matches!(err, CfCacheError::ProtocolViolation(_)));
    }
}
