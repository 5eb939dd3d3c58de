use cache_utils::cache_info::CacheGeometry;
use cache_utils::calibration::{HistParams, BUCKET_NUMBER};
use clap::Parser;
use tee_client::{Uuid, SECURITY_TEST_TA_UUID};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// In-process trusted application, no secure world needed
    Simulated,
    /// OP-TEE through libteec
    Optee,
}

/// Cache timing observation of a trusted execution environment.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Trials per technique (and per line for Prime+Probe)
    #[arg(long, default_value_t = 50)]
    pub trials: usize,
    /// Shared buffer size in bytes
    #[arg(long, default_value_t = 512 * 1024)]
    pub shared_size: usize,
    /// Capacity of the cache level under test, detected when absent
    #[arg(long)]
    pub cache_size: Option<usize>,
    /// Cache line size, detected when absent
    #[arg(long)]
    pub line_size: Option<usize>,
    /// Eviction buffer size, ten times the cache size by default
    #[arg(long)]
    pub scratch_size: Option<usize>,
    #[arg(long)]
    pub no_flush_reload: bool,
    #[arg(long)]
    pub no_evict_time: bool,
    /// Enable Prime+Probe (slow: one pass per line and command)
    #[arg(long)]
    pub prime_probe: bool,
    /// Skip the reference reload of the last shared byte in Flush+Reload
    #[arg(long)]
    pub no_probe_unaccessed: bool,
    /// Hit/miss calibration rounds, 0 disables calibration
    #[arg(long, default_value_t = 100)]
    pub calibration_iterations: usize,
    /// Calibration histogram bucket width in nanoseconds
    #[arg(long, default_value_t = 5)]
    pub bucket_size: u64,
    /// Print every sample as RESULT: lines
    #[arg(long)]
    pub raw: bool,
    #[arg(long, value_enum, default_value_t = Backend::Simulated)]
    pub backend: Backend,
    /// Trusted application to open a session with
    #[arg(long, default_value_t = SECURITY_TEST_TA_UUID)]
    pub ta_uuid: Uuid,
    /// Working set of the simulated trusted application, in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub internal_size: usize,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub trials: usize,
    pub shared_size: usize,
    pub geometry: CacheGeometry,
    pub scratch_size: usize,
    pub flush_reload: bool,
    pub evict_time: bool,
    pub prime_probe: bool,
    pub probe_unaccessed: bool,
    pub calibration_iterations: usize,
    pub hist: HistParams,
    pub raw: bool,
    pub backend: Backend,
    pub ta_uuid: Uuid,
    pub internal_size: usize,
}

impl RunConfig {
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let geometry = match (args.cache_size, args.line_size) {
            (Some(cache_size), Some(line_size)) => CacheGeometry {
                line_size,
                cache_size,
            },
            (cache_size, line_size) => {
                let detected = CacheGeometry::detect();
                CacheGeometry {
                    line_size: line_size.unwrap_or(detected.line_size),
                    cache_size: cache_size.unwrap_or(detected.cache_size),
                }
            }
        };
        let config = RunConfig {
            trials: args.trials,
            shared_size: args.shared_size,
            geometry,
            scratch_size: args
                .scratch_size
                .unwrap_or_else(|| geometry.cache_size.saturating_mul(10)),
            flush_reload: !args.no_flush_reload,
            evict_time: !args.no_evict_time,
            prime_probe: args.prime_probe,
            probe_unaccessed: !args.no_probe_unaccessed,
            calibration_iterations: args.calibration_iterations,
            hist: HistParams {
                bucket_size: args.bucket_size,
                bucket_number: BUCKET_NUMBER,
            },
            raw: args.raw,
            backend: args.backend,
            ta_uuid: args.ta_uuid,
            internal_size: args.internal_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations before any resource is acquired.
    pub fn validate(&self) -> Result<(), Error> {
        let line_size = self.geometry.line_size;
        if self.trials == 0 {
            return Err(Error::Config("trial count must be positive".into()));
        }
        if !line_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "line size {} is not a power of two",
                line_size
            )));
        }
        if self.shared_size < line_size || self.shared_size % line_size != 0 {
            return Err(Error::Config(format!(
                "shared size {} is not a positive multiple of the {} byte line size",
                self.shared_size, line_size
            )));
        }
        if self.scratch_size <= self.geometry.cache_size {
            return Err(Error::Config(format!(
                "scratch size {} must exceed the cache size {}",
                self.scratch_size, self.geometry.cache_size
            )));
        }
        if self.hist.bucket_size == 0 {
            return Err(Error::Config("bucket size must be positive".into()));
        }
        if self.backend == Backend::Simulated && self.internal_size == 0 {
            return Err(Error::Config("internal size must be positive".into()));
        }
        Ok(())
    }
}
