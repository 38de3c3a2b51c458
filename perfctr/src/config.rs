//! What a monitoring session asks the hardware for.
//!
//! A [`CounterConfig`] is plain data: it names the physical counters to use,
//! the opaque per-architecture selector bits for each, and whether the
//! free-running clock should be sampled too. Nothing here is validated; that
//! is the job of [`Backend::check_control`](crate::backend::Backend::check_control).
//!
//! Configurations deserialize from JSON, e.g.
//!
//! ```json
//! { "clock": true,
//!   "active": [ { "slot": 0, "selector": 4391104 } ],
//!   "interrupt": [ { "slot": 1, "selector": 1245376, "reload": 4294967196 } ] }
//! ```

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One physical counter and the selector bits to program it with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterSpec {
    pub slot: u32,
    pub selector: u64,
}

/// A counter that raises an interrupt on overflow.
///
/// After every overflow the counter is reprogrammed with `reload`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterruptSpec {
    #[serde(flatten)]
    pub counter: CounterSpec,
    pub reload: u32,
}

/// Control words that belong to a whole architecture family rather than to a
/// single counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ArchExtras {
    #[default]
    None,
    /// Nehalem and Westmere off-core response matrices.
    X86 { offcore_rsp: [u32; 2] },
    /// User-controlled MMCR0 bits and MMCR2 on 32-bit PowerPC.
    Ppc { mmcr0: u32, mmcr2: u32 },
    /// POWER programs its selectors through the monitor mode control
    /// registers directly.
    Power { mmcr0: u32, mmcr1: u64, mmcra: u64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterConfig {
    #[serde(default)]
    pub clock: bool,
    #[serde(default)]
    pub active: SmallVec<[CounterSpec; 4]>,
    #[serde(default)]
    pub interrupt: SmallVec<[InterruptSpec; 4]>,
    #[serde(default)]
    pub extras: ArchExtras,
}

impl CounterConfig {
    pub fn new() -> CounterConfig {
        CounterConfig::default()
    }

    pub fn with_clock(mut self, clock: bool) -> CounterConfig {
        self.clock = clock;
        self
    }

    pub fn with_active(mut self, slot: u32, selector: u64) -> CounterConfig {
        self.active.push(CounterSpec { slot, selector });
        self
    }

    pub fn with_interrupt(mut self, slot: u32, selector: u64, reload: u32) -> CounterConfig {
        self.interrupt.push(InterruptSpec {
            counter: CounterSpec { slot, selector },
            reload,
        });
        self
    }

    pub fn with_extras(mut self, extras: ArchExtras) -> CounterConfig {
        self.extras = extras;
        self
    }

    /// Active plus interrupt counters.
    pub fn nr_counters(&self) -> usize {
        self.active.len() + self.interrupt.len()
    }

    /// All counters in the order they occupy in the session: active counters
    /// first, then interrupt counters.
    pub fn counters(&self) -> impl Iterator<Item = &CounterSpec> + '_ {
        self.active
            .iter()
            .chain(self.interrupt.iter().map(|spec| &spec.counter))
    }

    /// A configuration that counts nothing at all.
    pub fn is_empty(&self) -> bool {
        !self.clock && self.active.is_empty() && self.interrupt.is_empty()
    }
}

/// Which running sums survive a control update.
///
/// Bit `i` keeps the sum of the `i`-th counter (in [`CounterConfig::counters`]
/// order), [`Preserve::CLOCK`] keeps the clock sum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preserve(pub u32);

impl Preserve {
    pub const NONE: Preserve = Preserve(0);
    pub const CLOCK: Preserve = Preserve(1 << 31);

    pub fn counter(index: usize) -> Preserve {
        if index < 31 {
            Preserve(1 << index)
        } else {
            Preserve::NONE
        }
    }

    pub fn keeps_counter(self, index: usize) -> bool {
        index < 31 && self.0 & (1 << index) != 0
    }

    pub fn keeps_clock(self) -> bool {
        self.0 & Preserve::CLOCK.0 != 0
    }
}

impl std::ops::BitOr for Preserve {
    type Output = Preserve;

    fn bitor(self, rhs: Preserve) -> Preserve {
        Preserve(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_lists_active_before_interrupt() {
        let config = CounterConfig::new()
            .with_interrupt(3, 0x30, 0xffff_ff00)
            .with_active(1, 0x10)
            .with_active(0, 0x20);

        let slots: Vec<u32> = config.counters().map(|c| c.slot).collect();
        assert_eq!(slots, vec![1, 0, 3]);
        assert_eq!(config.nr_counters(), 3);
    }

    #[test]
    fn empty_means_nothing_counted() {
        assert!(CounterConfig::new().is_empty());
        assert!(!CounterConfig::new().with_clock(true).is_empty());
    }

    #[test]
    fn preserve_masks() {
        let keep = Preserve::counter(0) | Preserve::counter(2) | Preserve::CLOCK;
        assert!(keep.keeps_counter(0));
        assert!(!keep.keeps_counter(1));
        assert!(keep.keeps_counter(2));
        assert!(keep.keeps_clock());
        assert!(!Preserve::NONE.keeps_clock());
        assert_eq!(Preserve::counter(40), Preserve::NONE);
    }
}
