use cfcache::cache::Tiers;
use cfcache::pipeline::ProjectionMode;
use cfcache::utils::DynError;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_SUPPORT: usize = 16;
pub const DEFAULT_OVERSAMPLING: usize = 4;
pub const DEFAULT_REF_FREQ_HZ: f64 = 1.4e9;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierArg {
    Both,
    Signal,
    Weight,
}

impl From<TierArg> for Tiers {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Both => Tiers::Both,
            TierArg::Signal => Tiers::Signal,
            TierArg::Weight => Tiers::Weight,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Aw,
    AOnly,
    WOnly,
}

impl From<ModeArg> for ProjectionMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Aw => ProjectionMode::AwProjection,
            ModeArg::AOnly => ProjectionMode::AOnly,
            ModeArg::WOnly => ProjectionMode::WOnly,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Inspect, prime and exercise an on-disk convolution-function cache",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  cfcache --cache-dir cf.cache --summary\n  cfcache --cache-dir cf.cache --pa 30 --dpa 2 --simulate-spw 4 --w-planes 8\n  cfcache --cache-dir cf.cache --lazy --tiers weight --simulate-spw 2 --mode a-only --w-planes 1\n"
)]
pub struct Args {
    /// CF cache directory (created when missing)
    #[arg(long, visible_alias = "cfcache")]
    pub cache_dir: PathBuf,

    /// Defer pixel reads until a plane is first used
    #[arg(long)]
    pub lazy: bool,

    /// Which CF sets to open
    #[arg(long, value_enum, default_value_t = TierArg::Both)]
    pub tiers: TierArg,

    /// Parallactic angle in degrees
    #[arg(long, allow_hyphen_values = true, default_value_t = 0.0)]
    pub pa: f64,

    /// PA tolerance in degrees for bucket matching
    #[arg(long, default_value_t = 1.0)]
    pub dpa: f64,

    /// Only artifacts within --dpa of --pa take part in lookups
    #[arg(long)]
    pub window: bool,

    /// Load every bucket and log support sizes and memory use
    #[arg(long)]
    pub summary: bool,

    /// Run the CF server and a counting gridder over N spectral windows
    #[arg(long, default_value_t = 0)]
    pub simulate_spw: usize,

    /// Visibility chunks per spectral window in the simulation
    #[arg(long, default_value_t = 4)]
    pub chunks_per_spw: usize,

    /// Projection mode; a-only and w-only need a single CF set
    #[arg(long, value_enum, default_value_t = ModeArg::Aw)]
    pub mode: ModeArg,

    /// Number of w-planes
    #[arg(long, default_value_t = 1)]
    pub w_planes: usize,

    /// Nominal CF support in uv pixels
    #[arg(long, default_value_t = DEFAULT_SUPPORT)]
    pub support: usize,

    /// CF oversampling factor
    #[arg(long, default_value_t = DEFAULT_OVERSAMPLING)]
    pub oversampling: usize,

    /// Reference frequency of the first spectral window in Hz
    #[arg(long, default_value_t = DEFAULT_REF_FREQ_HZ)]
    pub ref_freq: f64,

    /// Reference-frequency step between spectral windows in Hz
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub freq_step: f64,

    /// Log at debug level
    #[arg(long, short)]
    pub verbose: bool,
}

impl Args {
    /// Cross-field checks clap cannot express.
    pub fn validate(&self) -> Result<(), DynError> {
        if !self.pa.is_finite() || !(self.dpa.is_finite() && self.dpa >= 0.0) {
            return Err("--pa must be finite and --dpa non-negative".into());
        }
        if self.simulate_spw == 0 {
            return Ok(());
        }
        if self.w_planes == 0 {
            return Err("--w-planes must be at least 1".into());
        }
        if self.support < 2 || self.oversampling == 0 {
            return Err("--support must be at least 2 and --oversampling at least 1".into());
        }
        if self.chunks_per_spw == 0 {
            return Err("--chunks-per-spw must be at least 1".into());
        }
        let last = self.ref_freq + self.freq_step * (self.simulate_spw - 1) as f64;
        if !(self.ref_freq > 0.0 && last > 0.0) {
            return Err(format!(
                "reference frequencies must stay positive (first {} Hz, last {} Hz)",
                self.ref_freq, last
            )
            .into());
        }
        if self.mode == ModeArg::AOnly && self.w_planes != 1 {
            warn!("--mode a-only normally runs with a single w-plane");
        }
        Ok(())
    }

    /// RUST_LOG wins unless --verbose asks for debug output.
    pub fn log_filter(&self) -> EnvFilter {
        if self.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    }

    pub fn ref_freqs(&self) -> Vec<f64> {
        (0..self.simulate_spw)
            .map(|i| self.ref_freq + self.freq_step * i as f64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["cfcache", "--cache-dir", "/tmp/cf"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_open_both_tiers_without_simulation() {
        let args = parse(&[]);
        assert_eq!(Tiers::from(args.tiers), Tiers::Both);
        assert_eq!(args.simulate_spw, 0);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn simulation_flags_are_checked() {
        let args = parse(&["--simulate-spw", "3", "--freq-step", "1e8", "--mode", "w-only"]);
        assert_eq!(ProjectionMode::from(args.mode), ProjectionMode::WOnly);
        assert_eq!(args.ref_freqs(), vec![1.4e9, 1.5e9, 1.6e9]);
        assert!(args.validate().is_ok());

        let args = parse(&["--simulate-spw", "2", "--w-planes", "0"]);
        assert!(args.validate().is_err());
        let args = parse(&["--simulate-spw", "3", "--freq-step", "-1e9"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn verbose_forces_debug_logging() {
        assert_eq!(parse(&["-v"]).log_filter().to_string(), "debug");
    }
}
