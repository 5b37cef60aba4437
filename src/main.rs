mod args;

use clap::{CommandFactory, Parser};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use cfcache::aperture::{ApertureCfComputer, ApertureModel};
use cfcache::device::{HostCfArray, HostTransfer};
use cfcache::disk::PaWindow;
use cfcache::pipeline::{run_pipeline, GriddingEngine, ServerPlan, SkyGeometry, SpectralChunk};
use cfcache::utils::DynError;
use cfcache::{CacheConfig, CfCache, CfCacheError, CfResult};

const SKY_NX: usize = 512;
const SKY_CELL_RAD: f64 = 4.85e-6; // 1 arcsec

/// Synthetic visibility chunk.
struct VisChunk {
    spw: usize,
    rows: usize,
}

impl SpectralChunk for VisChunk {
    fn spectral_window(&self) -> usize {
        self.spw
    }

    fn rows(&self) -> usize {
        self.rows
    }
}

/// Gridder stand-in: counts rows and the CF footprint they would touch.
#[derive(Default)]
struct CountingGridder {
    cf: Option<HostCfArray>,
    rows: usize,
    footprint: u64,
}

impl GriddingEngine<HostCfArray> for CountingGridder {
    type Chunk = VisChunk;

    fn set_cf(&mut self, handle: HostCfArray) {
        self.cf = Some(handle);
    }

    fn has_cf(&self) -> bool {
        self.cf.is_some()
    }

    fn grid(&mut self, chunk: &VisChunk) -> CfResult<()> {
        let cf = self.cf.as_ref().ok_or_else(|| {
            CfCacheError::ProtocolViolation(format!("gridding spw {} without a CF", chunk.spw))
        })?;
        let per_row: u64 = cf
            .signal
            .iter()
            .map(|p| ((2 * p.x_support + 1) * (2 * p.y_support + 1)) as u64)
            .max()
            .unwrap_or(0);
        self.rows += chunk.rows;
        self.footprint += per_row * chunk.rows as u64;
        Ok(())
    }
}

fn simulate(args: &args::Args, cache: &mut CfCache) -> Result<(), DynError> {
    let plan = ServerPlan {
        spw_ids: (0..args.simulate_spw).collect(),
        ref_freqs: args.ref_freqs(),
        pa_deg: args.pa,
        dpa_deg: args.dpa,
        w_planes: args.w_planes,
        baseline_type: 0,
        sky: SkyGeometry {
            nx: SKY_NX,
            ny: SKY_NX,
            cell_size_rad: SKY_CELL_RAD,
        },
        pol_map: vec![vec![0], vec![3]],
        mode: args.mode.into(),
        tiers: args.tiers.into(),
    };
    let mut computer = ApertureCfComputer::new(ApertureModel::new(
        args.support,
        args.oversampling,
        args.ref_freq,
    ));
    let chunks_per_spw = args.chunks_per_spw;
    let chunks = (0..args.simulate_spw).flat_map(move |spw| {
        (0..chunks_per_spw).map(move |c| VisChunk {
            spw,
            rows: 1000 + c,
        })
    });
    let mut gridder = CountingGridder::default();

    let report = run_pipeline(
        cache,
        &mut computer,
        &HostTransfer,
        &plan,
        chunks,
        &mut gridder,
    )?;
    info!(
        "gridded {} rows in {} chunks over {} windows ({} CF swaps), CF footprint {} pixel updates",
        gridder.rows, report.grid.chunks, report.grid.windows, report.grid.cf_swaps, gridder.footprint
    );
    info!(
        "CF server: {} published, {} unchanged, {} computed, {} disk hits, {} memory hits",
        report.server.published,
        report.server.unchanged,
        report.server.computed,
        report.server.disk_hits,
        report.server.memory_hits
    );
    Ok(())
}

fn main() -> Result<(), DynError> {
    if std::env::args_os().len() == 1 {
        args::Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let args = args::Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(args.log_filter())
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    args.validate()?;

    let mut config = CacheConfig::new(&args.cache_dir);
    config.lazy_fill = args.lazy;
    config.tiers = args.tiers.into();
    config.pa_tolerance_deg = args.dpa;
    config.bucket_tolerance_deg = args.dpa;
    if args.window {
        config.pa_window = Some(PaWindow {
            center_deg: args.pa,
            dpa_deg: args.dpa,
        });
    }

    let mut cache = CfCache::open(config)?;
    if args.summary {
        cache.preload()?;
        cache.summarize();
        info!("{} bytes of CF pixels resident", cache.mem_usage());
    }
    if args.simulate_spw > 0 {
        simulate(&args, &mut cache)?;
    } else {
        cache.flush()?;
    }
    Ok(())
}
