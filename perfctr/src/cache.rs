use serde::Serialize;

use crate::backend::{Backend, HwControl, RegisterAccess};
use crate::generation::Generation;
use crate::status::Status;

/// Running totals of cache behaviour on one CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub register_writes: u64,
}

/// What one CPU's control registers are believed to hold.
///
/// `owner` is the generation of the session whose control values were last
/// written in full. While it matches, a resume writes nothing. `None` means
/// the owner is unknown and the next write has to compare against `shadow`.
///
/// Anything that writes control registers without going through
/// [`PerCpuCache::write_control`] must either keep `shadow` in sync itself
/// or call [`PerCpuCache::invalidate`].
pub struct PerCpuCache {
    owner: Option<Generation>,
    shadow: HwControl,
    stats: CacheStats,
}

impl PerCpuCache {
    pub fn new(backend: &dyn Backend) -> PerCpuCache {
        PerCpuCache {
            owner: None,
            shadow: backend.invalid_shadow(),
            stats: CacheStats::default(),
        }
    }

    /// Forgets everything, so the next write rewrites every field.
    pub fn invalidate(&mut self, backend: &dyn Backend) {
        self.owner = None;
        self.shadow = backend.invalid_shadow();
    }

    /// Forgets the owner but keeps the shadow, so the next write still
    /// skips fields that are known to match.
    #[inline]
    pub fn forget_owner(&mut self) {
        self.owner = None;
    }

    #[inline]
    pub fn owner(&self) -> Option<Generation> {
        self.owner
    }

    #[inline]
    pub fn is_owned_by(&self, generation: Option<Generation>) -> bool {
        generation.is_some() && self.owner == generation
    }

    pub fn shadow(&self) -> &HwControl {
        &self.shadow
    }

    pub(crate) fn shadow_mut(&mut self) -> &mut HwControl {
        &mut self.shadow
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Brings the hardware in line with `control`, returning the number of
    /// register writes it took.
    pub fn write_control(
        &mut self,
        backend: &dyn Backend,
        regs: &dyn RegisterAccess,
        control: &HwControl,
        status: Status,
        generation: Option<Generation>,
    ) -> usize {
        if self.is_owned_by(generation) {
            self.stats.hits += 1;
            trace!("PerCpuCache::write_control: hit for {:?}", generation);
            return 0;
        }

        let writes = backend.write_control(regs, &mut self.shadow, control, status);
        self.owner = generation;
        self.stats.misses += 1;
        self.stats.register_writes += writes as u64;
        trace!(
            "PerCpuCache::write_control: miss for {:?}, {} register writes",
            generation,
            writes
        );
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CounterConfig;
    use crate::testing_common::{MockBackend, SimRegisters};

    #[test]
    fn hit_after_miss() {
        let backend = MockBackend::new(4);
        let regs = SimRegisters::new();
        let config = CounterConfig::new().with_active(0, 0x11).with_active(2, 0x22);
        let derived = backend.check_control(&config).unwrap();
        let status = Status::new(false, 2, 0);
        let generation = Some(Generation::next());

        let mut cache = PerCpuCache::new(&backend);
        assert_eq!(
            cache.write_control(&backend, &regs, &derived.control, status, generation),
            2
        );
        assert_eq!(cache.owner(), generation);
        assert_eq!(
            cache.write_control(&backend, &regs, &derived.control, status, generation),
            0
        );
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                register_writes: 2
            }
        );
    }

    #[test]
    fn forget_owner_keeps_the_diff() {
        let backend = MockBackend::new(4);
        let regs = SimRegisters::new();
        let config = CounterConfig::new().with_active(1, 0x11);
        let derived = backend.check_control(&config).unwrap();
        let status = Status::new(false, 1, 0);
        let generation = Some(Generation::next());

        let mut cache = PerCpuCache::new(&backend);
        cache.write_control(&backend, &regs, &derived.control, status, generation);
        cache.forget_owner();
        assert!(!cache.is_owned_by(generation));
        assert_eq!(
            cache.write_control(&backend, &regs, &derived.control, status, generation),
            0
        );

        cache.invalidate(&backend);
        assert_eq!(
            cache.write_control(&backend, &regs, &derived.control, status, generation),
            1
        );
    }

    #[test]
    fn no_generation_never_hits() {
        let backend = MockBackend::new(2);
        let cache = PerCpuCache::new(&backend);
        assert!(!cache.is_owned_by(None));
    }
}
