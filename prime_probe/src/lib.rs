#![deny(unsafe_op_in_unsafe_fn)]

use cache_side_channel::{
    CacheControl, Command, Oracle, Region, SideChannelError, Technique, TrialEngine,
};
use cache_utils::stats::{signed_delta, SampleSeries};
use cache_utils::timing::Clock;
use std::fmt;

/// Lines between two progress messages.
const PROGRESS_INTERVAL: usize = 64;

/// Primes the private buffer, lets the TEE run, probes one private line.
///
/// Done once per line with the baseline command and once with the target
/// command; lines the target evicts show up as a positive delta.
#[derive(Debug, Clone, Copy)]
pub struct PrimeProbe {
    pub baseline: Command,
    pub target: Command,
}

impl Default for PrimeProbe {
    fn default() -> Self {
        PrimeProbe {
            baseline: Command::DoNothing,
            target: Command::AccessInternalMemory,
        }
    }
}

impl PrimeProbe {
    fn pass<C: Clock, K: CacheControl, O: Oracle>(
        &self,
        engine: &mut TrialEngine<C, K, O>,
        command: Command,
        lines: usize,
    ) -> Result<Vec<SampleSeries>, SideChannelError> {
        let line_size = engine.line_size();
        let trials = engine.trials();
        let mut per_line = Vec::with_capacity(lines);
        for line in 0..lines {
            if line % PROGRESS_INTERVAL == 0 {
                log::debug!("Prime+Probe {}: line {}/{}", command, line, lines);
            }
            let mut samples = SampleSeries::with_capacity(trials);
            for _ in 0..trials {
                engine.fill(Region::Private);
                engine.invoke(command)?;
                samples.push(engine.probe(Region::Private, line * line_size));
            }
            per_line.push(samples);
        }
        Ok(per_line)
    }
}

impl Technique for PrimeProbe {
    type Report = PrimeProbeReport;

    fn name(&self) -> &'static str {
        "Prime+Probe"
    }

    fn run<C: Clock, K: CacheControl, O: Oracle>(
        &self,
        engine: &mut TrialEngine<C, K, O>,
    ) -> Result<PrimeProbeReport, SideChannelError> {
        let lines = engine
            .cache()
            .lines(Region::Shared)
            .min(engine.cache().lines(Region::Private));
        if lines == 0 {
            return Err(SideChannelError::EmptyRegion(Region::Private));
        }
        let baseline = self.pass(engine, self.baseline, lines)?;
        let target = self.pass(engine, self.target, lines)?;
        let lines = baseline
            .into_iter()
            .zip(target)
            .enumerate()
            .map(|(line, (baseline, target))| LineDelta {
                line,
                baseline,
                target,
            })
            .collect();
        Ok(PrimeProbeReport {
            baseline_command: self.baseline,
            target_command: self.target,
            line_size: engine.line_size(),
            lines,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LineDelta {
    pub line: usize,
    pub baseline: SampleSeries,
    pub target: SampleSeries,
}

impl LineDelta {
    /// Summed target probe time minus summed baseline probe time.
    pub fn delta(&self) -> i64 {
        signed_delta(self.target.total(), self.baseline.total())
    }

    pub fn magnitude(&self) -> u64 {
        self.delta().unsigned_abs()
    }
}

#[derive(Debug, Clone)]
pub struct PrimeProbeReport {
    pub baseline_command: Command,
    pub target_command: Command,
    pub line_size: usize,
    pub lines: Vec<LineDelta>,
}

impl PrimeProbeReport {
    /// Line with the largest delta magnitude, the lowest index on ties.
    pub fn strongest(&self) -> Option<&LineDelta> {
        let mut best: Option<&LineDelta> = None;
        for l in &self.lines {
            if best.map_or(true, |b| l.magnitude() > b.magnitude()) {
                best = Some(l);
            }
        }
        best
    }
}

impl fmt::Display for PrimeProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Prime+Probe {} vs {} ({} lines of {} bytes)",
            self.target_command,
            self.baseline_command,
            self.lines.len(),
            self.line_size
        )?;
        writeln!(f, "  {:>6} {:>10} {:>10} {:>10}", "line", "baseline", "target", "delta")?;
        for l in &self.lines {
            writeln!(
                f,
                "  {:>6} {:>10} {:>10} {:>+10}",
                l.line,
                l.baseline.total(),
                l.target.total(),
                l.delta()
            )?;
        }
        match self.strongest() {
            Some(l) => write!(
                f,
                "  strongest: line {} (offset 0x{:x}), delta {:+} ns",
                l.line,
                l.line * self.line_size,
                l.delta()
            ),
            None => write!(f, "  strongest: none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::model::{model_engine, CacheModel, Effect};

    #[test]
    fn evicted_line_stands_out() {
        let model = CacheModel::new(64, 512, 512)
            .on(
                Command::AccessInternalMemory,
                vec![Effect::Evict(Region::Private, 3)],
            )
            .shared();
        let mut engine = model_engine(&model, 5);
        let report = engine.run(&PrimeProbe::default()).unwrap();
        assert_eq!(report.lines.len(), 8);
        let strongest = report.strongest().unwrap();
        assert_eq!(strongest.line, 3);
        assert_eq!(strongest.delta(), 5 * (200 - 10));
        assert!(report
            .lines
            .iter()
            .filter(|l| l.line != 3)
            .all(|l| l.delta() == 0));
        // two passes, 8 lines, 5 trials
        assert_eq!(model.borrow().invocations(), 2 * 8 * 5);
    }

    #[test]
    fn lines_past_the_progress_interval_are_measured() {
        let lines = 2 * PROGRESS_INTERVAL + 3;
        let model = CacheModel::new(64, 64 * lines, 64 * lines)
            .on(
                Command::AccessInternalMemory,
                vec![Effect::Evict(Region::Private, PROGRESS_INTERVAL + 1)],
            )
            .shared();
        let mut engine = model_engine(&model, 1);
        let report = engine.run(&PrimeProbe::default()).unwrap();
        assert_eq!(report.lines.len(), lines);
        assert_eq!(report.strongest().unwrap().line, PROGRESS_INTERVAL + 1);
        assert_eq!(model.borrow().invocations(), 2 * lines);
    }

    #[test]
    fn ties_pick_the_first_line() {
        let model = CacheModel::new(64, 256, 256).shared();
        let mut engine = model_engine(&model, 2);
        let report = engine.run(&PrimeProbe::default()).unwrap();
        assert_eq!(report.strongest().unwrap().line, 0);
        assert_eq!(report.strongest().unwrap().magnitude(), 0);
    }

    #[test]
    fn smaller_region_bounds_the_lines() {
        let model = CacheModel::new(64, 256, 1024).shared();
        let mut engine = model_engine(&model, 1);
        let report = engine.run(&PrimeProbe::default()).unwrap();
        assert_eq!(report.lines.len(), 4);
    }

    #[test]
    fn negative_delta_counts_by_magnitude() {
        // baseline evicts line 1 hard, target evicts nothing
        let model = CacheModel::new(64, 256, 256)
            .on(Command::DoNothing, vec![Effect::Evict(Region::Private, 1)])
            .shared();
        let mut engine = model_engine(&model, 3);
        let report = engine.run(&PrimeProbe::default()).unwrap();
        let strongest = report.strongest().unwrap();
        assert_eq!(strongest.line, 1);
        assert_eq!(strongest.delta(), -3 * 190);
    }

    #[test]
    fn sub_line_buffer_is_rejected() {
        let model = CacheModel::new(64, 32, 32).shared();
        let mut engine = model_engine(&model, 1);
        assert_eq!(
            engine.run(&PrimeProbe::default()).unwrap_err(),
            SideChannelError::EmptyRegion(Region::Private)
        );
    }
}
