use std::fmt;

use cache_utils::calibration::{HistParams, Histogram, Threshold};
use cache_utils::stats::SampleSeries;
use cache_utils::timing::{Clock, Timer};

use crate::{CacheControl, Command, Oracle, Region, SideChannelError};

/// One measurement protocol run for a fixed number of trials.
pub trait Technique {
    type Report;

    fn name(&self) -> &'static str;

    fn run<C: Clock, K: CacheControl, O: Oracle>(
        &self,
        engine: &mut TrialEngine<C, K, O>,
    ) -> Result<Self::Report, SideChannelError>;
}

/// Strictly sequential driver: every step finishes before the next starts,
/// nothing is retried and the trial count never changes mid run.
pub struct TrialEngine<C: Clock, K: CacheControl, O: Oracle> {
    timer: Timer<C>,
    cache: K,
    oracle: O,
    trials: usize,
}

impl<C: Clock, K: CacheControl, O: Oracle> TrialEngine<C, K, O> {
    pub fn new(clock: C, cache: K, oracle: O, trials: usize) -> Self {
        assert_ne!(trials, 0);
        Self {
            timer: Timer::new(clock),
            cache,
            oracle,
            trials,
        }
    }

    pub fn trials(&self) -> usize {
        self.trials
    }

    pub fn timer(&self) -> &Timer<C> {
        &self.timer
    }

    pub fn cache(&self) -> &K {
        &self.cache
    }

    pub fn line_size(&self) -> usize {
        self.cache.line_size()
    }

    pub fn flush(&mut self) {
        self.cache.flush();
    }

    pub fn fill(&mut self, region: Region) {
        self.cache.fill(region);
    }

    /// Timed single read of `region[offset]`.
    pub fn probe(&mut self, region: Region, offset: usize) -> u64 {
        debug_assert!(offset < self.cache.region_len(region));
        let cache = &mut self.cache;
        self.timer.time_read(|| cache.access(region, offset))
    }

    pub fn invoke(&mut self, command: Command) -> Result<(), SideChannelError> {
        self.oracle.invoke(command)
    }

    /// Duration of the whole invocation, fences around the call.
    pub fn timed_invoke(&mut self, command: Command) -> Result<u64, SideChannelError> {
        let oracle = &mut self.oracle;
        let (t, r) = self.timer.time(|| oracle.invoke(command));
        r.map(|()| t)
    }

    /// Offset of the last byte of `region`.
    pub fn last_offset(&self, region: Region) -> Result<usize, SideChannelError> {
        self.cache
            .region_len(region)
            .checked_sub(1)
            .ok_or(SideChannelError::EmptyRegion(region))
    }

    /// Hit and miss latencies of the first private line, and the threshold
    /// separating them if there is one.
    pub fn calibrate(&mut self, iterations: usize, params: HistParams) -> Calibration {
        let mut hit = SampleSeries::with_capacity(iterations);
        let mut miss = SampleSeries::with_capacity(iterations);
        for _ in 0..iterations {
            self.fill(Region::Private);
            hit.push(self.probe(Region::Private, 0));
            self.flush();
            miss.push(self.probe(Region::Private, 0));
        }
        let threshold = Threshold::from_histograms(
            &Histogram::from_samples(params, &hit),
            &Histogram::from_samples(params, &miss),
        );
        match threshold {
            Some(threshold) => log::info!("Calibration: {}", threshold),
            None => log::warn!("Calibration found no hit/miss threshold"),
        }
        self.report_wraparounds("calibration");
        Calibration {
            hit,
            miss,
            threshold,
        }
    }

    pub fn run<T: Technique>(&mut self, technique: &T) -> Result<T::Report, SideChannelError> {
        log::info!("{}: {} trials", technique.name(), self.trials);
        let report = technique.run(self)?;
        self.report_wraparounds(technique.name());
        log::info!("{}: done", technique.name());
        Ok(report)
    }

    fn report_wraparounds(&self, what: &str) {
        let clamped = self.timer.take_wraparounds();
        if clamped != 0 {
            log::warn!("{}: {} samples clamped to 0 (clock went backwards)", what, clamped);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Calibration {
    pub hit: SampleSeries,
    pub miss: SampleSeries,
    pub threshold: Option<Threshold>,
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration ({} iterations)", self.hit.len())?;
        if let Some(hit) = self.hit.summary() {
            writeln!(f, "  hit:  {}", hit)?;
        }
        if let Some(miss) = self.miss.summary() {
            writeln!(f, "  miss: {}", miss)?;
        }
        match self.threshold {
            Some(threshold) => write!(f, "  threshold: {}", threshold),
            None => write!(f, "  threshold: none, hit and miss latencies overlap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{model_engine, CacheModel, Effect};

    #[test]
    fn probe_times_hits_and_misses() {
        let model = CacheModel::new(64, 1024, 1024).shared();
        let mut engine = model_engine(&model, 1);
        assert_eq!(engine.probe(Region::Shared, 0), 200);
        assert_eq!(engine.probe(Region::Shared, 10), 10);
        engine.flush();
        assert_eq!(engine.probe(Region::Shared, 10), 200);
    }

    #[test]
    fn timed_invoke_measures_the_call() {
        let model = CacheModel::new(64, 1024, 1024)
            .on(
                Command::ReadSharedMemory,
                vec![Effect::Delay(1000), Effect::Touch(Region::Shared, 0)],
            )
            .shared();
        let mut engine = model_engine(&model, 1);
        assert_eq!(engine.timed_invoke(Command::ReadSharedMemory), Ok(1200));
        assert_eq!(engine.timed_invoke(Command::ReadSharedMemory), Ok(1010));
        assert_eq!(engine.timed_invoke(Command::DoNothing), Ok(0));
    }

    #[test]
    fn invocation_failure_is_reported() {
        let model = CacheModel::new(64, 1024, 1024)
            .failing(Command::AccessInternalMemory, 0xffff0000)
            .shared();
        let mut engine = model_engine(&model, 1);
        assert!(engine.invoke(Command::DoNothing).is_ok());
        match engine.timed_invoke(Command::AccessInternalMemory) {
            Err(SideChannelError::Oracle { command, code, .. }) => {
                assert_eq!(command, Command::AccessInternalMemory);
                assert_eq!(code, 0xffff0000);
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn calibration_on_model() {
        let model = CacheModel::new(64, 1024, 1024).shared();
        let mut engine = model_engine(&model, 1);
        let calibration = engine.calibrate(16, HistParams::default());
        assert_eq!(calibration.hit.median(), Some(10));
        assert_eq!(calibration.miss.median(), Some(200));
        let threshold = calibration.threshold.unwrap();
        assert!(threshold.is_hit(10));
        assert!(!threshold.is_hit(200));
    }

    #[test]
    fn empty_region_has_no_last_offset() {
        let model = CacheModel::new(64, 0, 1024).shared();
        let engine = model_engine(&model, 1);
        assert_eq!(
            engine.last_offset(Region::Shared),
            Err(SideChannelError::EmptyRegion(Region::Shared))
        );
        assert_eq!(engine.last_offset(Region::Private), Ok(1023));
    }
}
