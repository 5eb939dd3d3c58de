use std::fmt;

use basic_timing_cache_channel::HardwareChannel;
use cache_side_channel::TrialEngine;
use cache_utils::stats::SampleSeries;
use cache_utils::timing::{Clock, MonotonicClock};
use evict_time::EvictTime;
use flush_reload::FlushReload;
use itertools::Itertools;
use prime_probe::PrimeProbe;
use tee_client::{SimulatedTeec, TeeSession, TeecApi, SECURITY_TEST_TA_UUID};

use crate::config::{Backend, RunConfig};
use crate::error::Error;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub techniques: Vec<&'static str>,
    pub invocations: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.techniques.is_empty() {
            write!(f, "no technique run")?;
        } else {
            write!(f, "ran {}", self.techniques.iter().format(", "))?;
        }
        write!(f, " ({} TEE invocations)", self.invocations)
    }
}

pub fn run(config: &RunConfig) -> Result<RunSummary, Error> {
    let clock = MonotonicClock::new().map_err(Error::Clock)?;
    match config.backend {
        Backend::Simulated => {
            let line_size = config.geometry.line_size;
            let teec = SimulatedTeec::new(SECURITY_TEST_TA_UUID, config.internal_size, line_size);
            run_with(config, clock, teec)
        }
        Backend::Optee => run_optee(config, clock),
    }
}

#[cfg(feature = "optee")]
fn run_optee(config: &RunConfig, clock: MonotonicClock) -> Result<RunSummary, Error> {
    run_with(config, clock, tee_client::optee::LibTeec)
}

#[cfg(not(feature = "optee"))]
fn run_optee(_config: &RunConfig, _clock: MonotonicClock) -> Result<RunSummary, Error> {
    Err(Error::Config(
        "OP-TEE backend not built in, rebuild with `--features optee`".into(),
    ))
}

fn dump_raw(name: &str, series: &SampleSeries) {
    println!("RESULT:{},{}", name, series.iter().format(","));
}

/// Opens the session, calibrates, then runs every enabled technique in turn.
/// The first failed invocation ends the run; the session is released on
/// every path.
pub fn run_with<C: Clock, A: TeecApi>(
    config: &RunConfig,
    clock: C,
    api: A,
) -> Result<RunSummary, Error> {
    let mut session = TeeSession::open(api, &config.ta_uuid, config.shared_size)?;
    // The channel lives inside the engine, which is dropped before the session
    // owning the shared buffer.
    let channel = unsafe {
        HardwareChannel::new(
            session.shared_buffer(),
            session.shared_size(),
            config.geometry,
            config.scratch_size,
        )?
    };
    let mut engine = TrialEngine::new(clock, channel, &mut session, config.trials);
    let mut summary = RunSummary::default();

    let threshold = if config.calibration_iterations > 0 {
        let calibration = engine.calibrate(config.calibration_iterations, config.hist);
        println!("{}", calibration);
        if config.raw {
            dump_raw("calibration_hit", &calibration.hit);
            dump_raw("calibration_miss", &calibration.miss);
        }
        calibration.threshold
    } else {
        None
    };

    if config.flush_reload {
        let technique = FlushReload {
            probe_unaccessed: config.probe_unaccessed,
            threshold,
        };
        let report = engine.run(&technique)?;
        println!("{}", report);
        if config.raw {
            dump_raw("flush_reload_accessed", &report.accessed);
            if let Some(unaccessed) = &report.unaccessed {
                dump_raw("flush_reload_unaccessed", unaccessed);
            }
        }
        summary.techniques.push("Flush+Reload");
    }

    if config.evict_time {
        let report = engine.run(&EvictTime::default())?;
        println!("{}", report);
        if config.raw {
            dump_raw("evict_time_no_evict", &report.no_evict);
            dump_raw("evict_time_evict", &report.evict);
        }
        summary.techniques.push("Evict+Time");
    }

    if config.prime_probe {
        let report = engine.run(&PrimeProbe::default())?;
        println!("{}", report);
        if config.raw {
            for line in &report.lines {
                dump_raw(&format!("prime_probe_baseline_{}", line.line), &line.baseline);
                dump_raw(&format!("prime_probe_target_{}", line.line), &line.target);
            }
        }
        summary.techniques.push("Prime+Probe");
    }

    drop(engine);
    summary.invocations = session.invocations();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use tee_client::{TEEC_ERROR_ITEM_NOT_FOUND, TEEC_ORIGIN_TEE};

    fn small_config(extra: &[&str]) -> RunConfig {
        let mut argv = vec![
            "tee_cache_observer",
            "--trials",
            "3",
            "--shared-size",
            "4096",
            "--cache-size",
            "4096",
            "--line-size",
            "64",
            "--scratch-size",
            "8192",
            "--calibration-iterations",
            "4",
            "--internal-size",
            "4096",
        ];
        argv.extend_from_slice(extra);
        RunConfig::from_args(Args::try_parse_from(argv).unwrap()).unwrap()
    }

    fn simulated() -> SimulatedTeec {
        SimulatedTeec::new(SECURITY_TEST_TA_UUID, 4096, 64)
    }

    #[test]
    fn simulated_run_executes_every_technique() {
        let config = small_config(&["--prime-probe", "--raw"]);
        let mut teec = simulated();
        let summary = run_with(&config, MonotonicClock::new().unwrap(), &mut teec).unwrap();
        assert_eq!(
            summary.techniques,
            vec!["Flush+Reload", "Evict+Time", "Prime+Probe"]
        );
        // 3 + 2 * 3 + 2 * 64 lines * 3
        assert_eq!(summary.invocations, 393);
        assert!(teec.observed() > 0);
    }

    #[test]
    fn disabled_techniques_do_not_invoke() {
        let config = small_config(&["--no-flush-reload", "--no-evict-time"]);
        let summary = run_with(&config, MonotonicClock::new().unwrap(), simulated()).unwrap();
        assert!(summary.techniques.is_empty());
        assert_eq!(summary.invocations, 0);
        assert_eq!(summary.to_string(), "no technique run (0 TEE invocations)");
    }

    #[test]
    fn unknown_ta_stops_before_any_trial() {
        let config = small_config(&["--ta-uuid", "00000000-0000-0000-0000-000000000001"]);
        let mut teec = simulated();
        match run_with(&config, MonotonicClock::new().unwrap(), &mut teec) {
            Err(Error::Tee(e)) => {
                assert_eq!(e.code, TEEC_ERROR_ITEM_NOT_FOUND);
                assert_eq!(e.origin, TEEC_ORIGIN_TEE);
            }
            r => panic!("unexpected {:?}", r),
        }
        assert_eq!(teec.observed(), 0);
    }

    #[cfg(not(feature = "optee"))]
    #[test]
    fn optee_backend_needs_the_feature() {
        let config = small_config(&["--backend", "optee"]);
        assert!(matches!(run(&config), Err(Error::Config(_))));
    }
}
