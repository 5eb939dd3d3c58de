//! Deterministic stand-in for the cache, the clock and the TEE.
//!
//! All three share one [`CacheModel`]: a virtual clock that only moves when
//! memory is loaded (by the hit or miss latency) or when an invocation
//! declares a fixed cost, and a set of resident lines. Eviction is exact
//! here, unlike on hardware, which makes the protocols testable.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use cache_utils::timing::Clock;

use crate::{CacheControl, Command, Oracle, Region, SideChannelError, TrialEngine};

pub const MODEL_HIT_LATENCY: u64 = 10;
pub const MODEL_MISS_LATENCY: u64 = 200;

/// Origin code reported by failing model invocations (trusted application).
pub const MODEL_ERROR_ORIGIN: u32 = 4;

/// What an invocation does to the modelled cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Loads a line; costs the hit or miss latency.
    Touch(Region, usize),
    /// Evicts a line, e.g. a TEE internal line aliasing an observer line.
    Evict(Region, usize),
    /// Fixed cost in nanoseconds.
    Delay(u64),
}

#[derive(Debug)]
pub struct CacheModel {
    time: u64,
    hit_latency: u64,
    miss_latency: u64,
    line_size: usize,
    shared_len: usize,
    private_len: usize,
    resident: HashSet<(Region, usize)>,
    effects: HashMap<Command, Vec<Effect>>,
    failing: Option<(Command, u32)>,
    invocations: usize,
}

pub type SharedModel = Rc<RefCell<CacheModel>>;

impl CacheModel {
    pub fn new(line_size: usize, shared_len: usize, private_len: usize) -> Self {
        assert_ne!(line_size, 0);
        CacheModel {
            time: 0,
            hit_latency: MODEL_HIT_LATENCY,
            miss_latency: MODEL_MISS_LATENCY,
            line_size,
            shared_len,
            private_len,
            resident: HashSet::new(),
            effects: HashMap::new(),
            failing: None,
            invocations: 0,
        }
    }

    pub fn with_latencies(mut self, hit: u64, miss: u64) -> Self {
        self.hit_latency = hit;
        self.miss_latency = miss;
        self
    }

    /// Effects applied, in order, each time `command` is invoked.
    pub fn on(mut self, command: Command, effects: Vec<Effect>) -> Self {
        self.effects.insert(command, effects);
        self
    }

    /// Makes every invocation of `command` fail with `code`.
    pub fn failing(mut self, command: Command, code: u32) -> Self {
        self.failing = Some((command, code));
        self
    }

    pub fn shared(self) -> SharedModel {
        Rc::new(RefCell::new(self))
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn is_resident(&self, region: Region, line: usize) -> bool {
        self.resident.contains(&(region, line))
    }

    fn region_len(&self, region: Region) -> usize {
        match region {
            Region::Shared => self.shared_len,
            Region::Private => self.private_len,
        }
    }

    fn load(&mut self, region: Region, line: usize) {
        let latency = if self.resident.insert((region, line)) {
            self.miss_latency
        } else {
            self.hit_latency
        };
        self.time += latency;
    }

    fn apply(&mut self, command: Command) -> Result<(), SideChannelError> {
        self.invocations += 1;
        if let Some((failing, code)) = self.failing {
            if failing == command {
                return Err(SideChannelError::Oracle {
                    command,
                    code,
                    origin: MODEL_ERROR_ORIGIN,
                });
            }
        }
        let effects = self.effects.get(&command).cloned().unwrap_or_default();
        for effect in effects {
            match effect {
                Effect::Touch(region, line) => self.load(region, line),
                Effect::Evict(region, line) => {
                    self.resident.remove(&(region, line));
                }
                Effect::Delay(d) => self.time += d,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModelClock(pub SharedModel);

impl Clock for ModelClock {
    fn timestamp(&self) -> u64 {
        self.0.borrow().time
    }
}

#[derive(Debug, Clone)]
pub struct ModelCache(pub SharedModel);

impl CacheControl for ModelCache {
    fn line_size(&self) -> usize {
        self.0.borrow().line_size
    }

    fn region_len(&self, region: Region) -> usize {
        self.0.borrow().region_len(region)
    }

    fn flush(&mut self) {
        self.0.borrow_mut().resident.clear();
    }

    fn fill(&mut self, region: Region) {
        let mut model = self.0.borrow_mut();
        let lines = (model.region_len(region) + model.line_size - 1) / model.line_size;
        for line in 0..lines {
            model.resident.insert((region, line));
        }
    }

    fn access(&mut self, region: Region, offset: usize) -> u8 {
        let mut model = self.0.borrow_mut();
        let line = offset / model.line_size;
        model.load(region, line);
        0
    }
}

#[derive(Debug, Clone)]
pub struct ModelOracle(pub SharedModel);

impl Oracle for ModelOracle {
    fn invoke(&mut self, command: Command) -> Result<(), SideChannelError> {
        self.0.borrow_mut().apply(command)
    }
}

pub fn model_engine(
    model: &SharedModel,
    trials: usize,
) -> TrialEngine<ModelClock, ModelCache, ModelOracle> {
    TrialEngine::new(
        ModelClock(model.clone()),
        ModelCache(model.clone()),
        ModelOracle(model.clone()),
        trials,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_flush() {
        let model = CacheModel::new(64, 256, 256).shared();
        let mut cache = ModelCache(model.clone());
        cache.fill(Region::Private);
        assert!(model.borrow().is_resident(Region::Private, 3));
        assert!(!model.borrow().is_resident(Region::Shared, 0));
        cache.flush();
        assert!(!model.borrow().is_resident(Region::Private, 3));
    }

    #[test]
    fn evict_effect_removes_only_its_line() {
        let model = CacheModel::new(64, 256, 256)
            .on(
                Command::AccessInternalMemory,
                vec![Effect::Evict(Region::Private, 2)],
            )
            .shared();
        ModelCache(model.clone()).fill(Region::Private);
        ModelOracle(model.clone())
            .invoke(Command::AccessInternalMemory)
            .unwrap();
        let model = model.borrow();
        assert!(!model.is_resident(Region::Private, 2));
        assert!(model.is_resident(Region::Private, 1));
        assert_eq!(model.invocations(), 1);
        assert_eq!(model.time(), 0);
    }

    #[test]
    fn custom_latencies() {
        let model = CacheModel::new(64, 256, 256).with_latencies(1, 5).shared();
        let mut cache = ModelCache(model.clone());
        cache.access(Region::Shared, 0);
        cache.access(Region::Shared, 1);
        assert_eq!(model.borrow().time(), 6);
    }
}
