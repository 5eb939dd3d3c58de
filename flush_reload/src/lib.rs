#![deny(unsafe_op_in_unsafe_fn)]

use cache_side_channel::{
    CacheControl, CacheStatus, Command, Oracle, Region, SideChannelError, Technique,
    TrialEngine, Verdict,
};
use cache_utils::calibration::Threshold;
use cache_utils::stats::{signed_delta, SampleSeries};
use cache_utils::timing::Clock;
use std::fmt;

/// Flush, let the TEE read the shared buffer, reload its first byte.
///
/// The last byte of the buffer is reloaded as well, as a reference for a
/// line that was flushed and (presumably) not brought back.
#[derive(Debug, Clone, Copy)]
pub struct FlushReload {
    pub probe_unaccessed: bool,
    pub threshold: Option<Threshold>,
}

impl Default for FlushReload {
    fn default() -> Self {
        FlushReload {
            probe_unaccessed: true,
            threshold: None,
        }
    }
}

impl Technique for FlushReload {
    type Report = FlushReloadReport;

    fn name(&self) -> &'static str {
        "Flush+Reload"
    }

    fn run<C: Clock, K: CacheControl, O: Oracle>(
        &self,
        engine: &mut TrialEngine<C, K, O>,
    ) -> Result<FlushReloadReport, SideChannelError> {
        let last = engine.last_offset(Region::Shared)?;
        // The reference line must differ from the reloaded one.
        let reference = self.probe_unaccessed && last / engine.line_size() != 0;
        if self.probe_unaccessed && !reference {
            log::warn!(
                "Flush+Reload: shared buffer is a single line, no unaccessed reference"
            );
        }
        let trials = engine.trials();
        let mut accessed = SampleSeries::with_capacity(trials);
        let mut unaccessed = SampleSeries::with_capacity(trials);
        for _ in 0..trials {
            engine.flush();
            engine.invoke(Command::ReadSharedMemory)?;
            accessed.push(engine.probe(Region::Shared, 0));
            if reference {
                unaccessed.push(engine.probe(Region::Shared, last));
            }
        }
        Ok(FlushReloadReport {
            accessed,
            unaccessed: if reference { Some(unaccessed) } else { None },
            threshold: self.threshold,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FlushReloadReport {
    /// Reload of the first shared byte.
    pub accessed: SampleSeries,
    /// Reload of the last shared byte.
    pub unaccessed: Option<SampleSeries>,
    pub threshold: Option<Threshold>,
}

impl FlushReloadReport {
    /// Unaccessed median minus accessed median; positive when the accessed
    /// line reloads faster.
    pub fn delta(&self) -> Option<i64> {
        let accessed = self.accessed.median()?;
        let unaccessed = self.unaccessed.as_ref()?.median()?;
        Some(signed_delta(unaccessed, accessed))
    }

    pub fn accessed_status(&self) -> Option<CacheStatus> {
        let threshold = self.threshold?;
        let median = self.accessed.median()?;
        Some(if threshold.is_hit(median) {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        })
    }

    /// Calibrated classification first, the differential otherwise.
    pub fn verdict(&self) -> Verdict {
        match (self.accessed_status(), self.delta()) {
            (Some(CacheStatus::Hit), _) => Verdict::ProbablyAccessed,
            (Some(CacheStatus::Miss), _) => Verdict::ProbablyNotAccessed,
            (None, Some(delta)) if delta > 0 => Verdict::ProbablyAccessed,
            (None, Some(_)) => Verdict::ProbablyNotAccessed,
            (None, None) => Verdict::Inconclusive,
        }
    }
}

impl fmt::Display for FlushReloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flush+Reload ({} trials)", self.accessed.len())?;
        if let Some(accessed) = self.accessed.summary() {
            writeln!(f, "  accessed   (shared start): {}", accessed)?;
        }
        if let Some(unaccessed) = self.unaccessed.as_ref().and_then(|s| s.summary()) {
            writeln!(f, "  unaccessed (shared end):   {}", unaccessed)?;
        }
        if let Some(delta) = self.delta() {
            writeln!(f, "  delta: {:+} ns", delta)?;
        }
        if let Some(status) = self.accessed_status() {
            writeln!(f, "  accessed median: {}", status)?;
        }
        write!(f, "  verdict: {}", self.verdict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::model::{model_engine, CacheModel, Effect};

    fn touching_model() -> CacheModel {
        CacheModel::new(64, 4096, 4096).on(
            Command::ReadSharedMemory,
            vec![Effect::Touch(Region::Shared, 0)],
        )
    }

    #[test]
    fn accessed_line_reloads_faster() {
        let model = touching_model().shared();
        let mut engine = model_engine(&model, 20);
        let report = engine.run(&FlushReload::default()).unwrap();
        assert_eq!(report.accessed.len(), 20);
        assert!(report.accessed.median() < report.unaccessed.as_ref().unwrap().median());
        assert_eq!(report.delta(), Some(190));
        assert_eq!(report.verdict(), Verdict::ProbablyAccessed);
        assert_eq!(model.borrow().invocations(), 20);
    }

    #[test]
    fn untouched_buffer_looks_flushed() {
        let model = CacheModel::new(64, 4096, 4096).shared();
        let mut engine = model_engine(&model, 5);
        let report = engine.run(&FlushReload::default()).unwrap();
        assert_eq!(report.accessed.median(), Some(200));
        assert_eq!(report.delta(), Some(0));
        assert_eq!(report.verdict(), Verdict::ProbablyNotAccessed);
    }

    #[test]
    fn calibrated_threshold_classifies() {
        let model = touching_model().shared();
        let mut engine = model_engine(&model, 5);
        let technique = FlushReload {
            probe_unaccessed: false,
            threshold: Some(Threshold { bound: 50 }),
        };
        let report = engine.run(&technique).unwrap();
        assert!(report.unaccessed.is_none());
        assert_eq!(report.delta(), None);
        assert_eq!(report.accessed_status(), Some(CacheStatus::Hit));
        assert_eq!(report.verdict(), Verdict::ProbablyAccessed);
    }

    #[test]
    fn same_model_same_medians() {
        let run = || {
            let model = touching_model().shared();
            let mut engine = model_engine(&model, 9);
            let report = engine.run(&FlushReload::default()).unwrap();
            (
                report.accessed.median(),
                report.unaccessed.as_ref().and_then(|s| s.median()),
            )
        };
        assert_eq!(run(), run());

        let model = touching_model().shared();
        let mut engine = model_engine(&model, 9);
        let first = engine.run(&FlushReload::default()).unwrap();
        let second = engine.run(&FlushReload::default()).unwrap();
        assert_eq!(first.accessed.median(), second.accessed.median());
    }

    #[test]
    fn single_line_buffer_has_no_reference() {
        let model = CacheModel::new(64, 64, 64)
            .on(
                Command::ReadSharedMemory,
                vec![Effect::Touch(Region::Shared, 0)],
            )
            .shared();
        let mut engine = model_engine(&model, 5);
        let report = engine.run(&FlushReload::default()).unwrap();
        assert_eq!(report.accessed.median(), Some(10));
        assert!(report.unaccessed.is_none());
        assert_eq!(report.delta(), None);
        assert_eq!(report.verdict(), Verdict::Inconclusive);

        // a threshold still classifies the reload
        let technique = FlushReload {
            threshold: Some(Threshold { bound: 50 }),
            ..FlushReload::default()
        };
        let report = engine.run(&technique).unwrap();
        assert_eq!(report.verdict(), Verdict::ProbablyAccessed);
    }

    #[test]
    fn reference_on_second_line_is_kept() {
        let model = CacheModel::new(64, 128, 128)
            .on(
                Command::ReadSharedMemory,
                vec![Effect::Touch(Region::Shared, 0)],
            )
            .shared();
        let mut engine = model_engine(&model, 5);
        let report = engine.run(&FlushReload::default()).unwrap();
        assert_eq!(report.delta(), Some(190));
        assert_eq!(report.verdict(), Verdict::ProbablyAccessed);
    }

    #[test]
    fn failed_invocation_aborts() {
        let model = touching_model()
            .failing(Command::ReadSharedMemory, 0xffff000e)
            .shared();
        let mut engine = model_engine(&model, 10);
        assert!(engine.run(&FlushReload::default()).is_err());
        assert_eq!(model.borrow().invocations(), 1);
    }
}
