#![deny(unsafe_op_in_unsafe_fn)]

use cache_side_channel::{
    CacheControl, Command, Oracle, SideChannelError, Technique, TrialEngine, Verdict,
};
use cache_utils::stats::{signed_delta, SampleSeries};
use cache_utils::timing::Clock;
use std::cmp::Ordering;
use std::fmt;

/// Times the same invocation twice per trial: once with a warm cache, once
/// right after evicting it. A slower evicted call means the TEE depends on
/// state the eviction removed.
#[derive(Debug, Clone, Copy)]
pub struct EvictTime {
    pub command: Command,
}

impl Default for EvictTime {
    fn default() -> Self {
        EvictTime {
            command: Command::ReadSharedMemory,
        }
    }
}

impl Technique for EvictTime {
    type Report = EvictTimeReport;

    fn name(&self) -> &'static str {
        "Evict+Time"
    }

    fn run<C: Clock, K: CacheControl, O: Oracle>(
        &self,
        engine: &mut TrialEngine<C, K, O>,
    ) -> Result<EvictTimeReport, SideChannelError> {
        let trials = engine.trials();
        let mut no_evict = SampleSeries::with_capacity(trials);
        let mut evict = SampleSeries::with_capacity(trials);
        for _ in 0..trials {
            no_evict.push(engine.timed_invoke(self.command)?);
            engine.flush();
            evict.push(engine.timed_invoke(self.command)?);
        }
        Ok(EvictTimeReport {
            command: self.command,
            no_evict,
            evict,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Slower,
    Faster,
    Unchanged,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Slower => write!(f, "slower after eviction"),
            Direction::Faster => write!(f, "faster after eviction"),
            Direction::Unchanged => write!(f, "unchanged by eviction"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvictTimeReport {
    pub command: Command,
    pub no_evict: SampleSeries,
    pub evict: SampleSeries,
}

impl EvictTimeReport {
    /// Evicted median minus warm median.
    pub fn delta(&self) -> Option<i64> {
        Some(signed_delta(self.evict.median()?, self.no_evict.median()?))
    }

    pub fn direction(&self) -> Option<Direction> {
        Some(match self.delta()?.cmp(&0) {
            Ordering::Greater => Direction::Slower,
            Ordering::Less => Direction::Faster,
            Ordering::Equal => Direction::Unchanged,
        })
    }

    pub fn verdict(&self) -> Verdict {
        match self.direction() {
            Some(Direction::Slower) => Verdict::ProbablyAccessed,
            Some(_) => Verdict::ProbablyNotAccessed,
            None => Verdict::Inconclusive,
        }
    }
}

impl fmt::Display for EvictTimeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Evict+Time on {} ({} trials)",
            self.command,
            self.evict.len()
        )?;
        if let Some(no_evict) = self.no_evict.summary() {
            writeln!(f, "  no eviction: {}", no_evict)?;
        }
        if let Some(evict) = self.evict.summary() {
            writeln!(f, "  eviction:    {}", evict)?;
        }
        if let (Some(delta), Some(direction)) = (self.delta(), self.direction()) {
            writeln!(f, "  delta: {:+} ns, {}", delta, direction)?;
        }
        write!(f, "  verdict: {}", self.verdict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::model::{model_engine, CacheModel, Effect};
    use cache_side_channel::Region;

    #[test]
    fn eviction_slows_dependent_call() {
        let model = CacheModel::new(64, 4096, 4096)
            .on(
                Command::ReadSharedMemory,
                vec![Effect::Delay(1000), Effect::Touch(Region::Shared, 0)],
            )
            .shared();
        let mut engine = model_engine(&model, 10);
        let report = engine.run(&EvictTime::default()).unwrap();
        // the first warm call starts cold
        assert_eq!(report.no_evict.samples()[0], 1200);
        assert_eq!(report.no_evict.median(), Some(1010));
        assert_eq!(report.evict.median(), Some(1200));
        assert_eq!(report.delta(), Some(190));
        assert_eq!(report.direction(), Some(Direction::Slower));
        assert_eq!(report.verdict(), Verdict::ProbablyAccessed);
        assert_eq!(model.borrow().invocations(), 20);
    }

    #[test]
    fn independent_call_is_unchanged() {
        let model = CacheModel::new(64, 4096, 4096)
            .on(Command::DoNothing, vec![Effect::Delay(500)])
            .shared();
        let mut engine = model_engine(&model, 4);
        let report = engine
            .run(&EvictTime {
                command: Command::DoNothing,
            })
            .unwrap();
        assert_eq!(report.delta(), Some(0));
        assert_eq!(report.direction(), Some(Direction::Unchanged));
        assert_eq!(report.verdict(), Verdict::ProbablyNotAccessed);
    }

    #[test]
    fn failure_stops_the_run() {
        let model = CacheModel::new(64, 4096, 4096)
            .failing(Command::ReadSharedMemory, 0xffff3024)
            .shared();
        let mut engine = model_engine(&model, 10);
        match engine.run(&EvictTime::default()) {
            Err(SideChannelError::Oracle { code, .. }) => assert_eq!(code, 0xffff3024),
            r => panic!("unexpected {:?}", r),
        }
        assert_eq!(model.borrow().invocations(), 1);
    }
}
