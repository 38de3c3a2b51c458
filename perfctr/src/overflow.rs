//! Working out which interrupt counters overflowed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::UnidentifiedOverflow;
use crate::error::ControlError;
use crate::session::Session;
use crate::topology::CpuGuard;

static UNIDENTIFIED_OVERFLOWS: AtomicU64 = AtomicU64::new(0);

/// The counters one overflow interrupt was raised for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OverflowSet {
    slots: SmallVec<[u32; 4]>,
    mask: u32,
}

impl OverflowSet {
    fn push(&mut self, index: usize, slot: u32) {
        self.slots.push(slot);
        if index < 32 {
            self.mask |= 1 << index;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Hardware slots, in configuration order.
    pub fn slots(&self) -> &[u32] {
        &self.slots
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.slots.contains(&slot)
    }

    /// Bit `i` is set when the `i`-th counter of the configuration
    /// overflowed, active counters included in the numbering.
    pub fn counter_mask(&self) -> u32 {
        self.mask
    }
}

impl<'a> CpuGuard<'a> {
    /// Finds the interrupt counters that overflowed and restarts their
    /// periods at the reload value.
    ///
    /// Must follow a suspend on this CPU, which left each interrupt
    /// counter's last reading in its `start`.
    pub fn identify_overflow(&mut self, session: &mut Session) -> Result<OverflowSet, ControlError> {
        let cpu = self.cpu();
        let (backend, regs, _) = self.parts();
        session.pending_interrupt = false;

        let status = session.status;
        let nr_active = status.nr_active();

        if backend.shared_overflow_interrupt() {
            for counter in session.counters.iter_mut().take(nr_active) {
                let now = backend.read_counter(regs, counter.slot);
                if backend.counter_signals_overflow(now) {
                    counter.sum += u64::from(now.wrapping_sub(counter.start));
                    counter.start = 0;
                    backend.write_counter(regs, counter.slot, 0);
                }
            }
        }

        let mut overflowed = OverflowSet::default();
        for (i, counter) in session
            .counters
            .iter_mut()
            .enumerate()
            .take(status.nr_counters())
            .skip(nr_active)
        {
            if !backend.counter_signals_overflow(counter.start) {
                continue;
            }
            if let Some(spec) = session.config.interrupt.get(i - nr_active) {
                counter.start = spec.reload;
                overflowed.push(i, counter.slot);
            }
        }

        let used = session
            .counters
            .iter()
            .take(status.nr_counters())
            .map(|counter| counter.slot)
            .collect::<SmallVec<[u32; 8]>>();
        backend.after_overflow(regs, &used);

        if !overflowed.is_empty() {
            // The hardware still holds the overflowed values.
            session.isuspend_cpu = None;
        } else {
            match backend.unidentified_overflow() {
                UnidentifiedOverflow::Report => {
                    let seen = UNIDENTIFIED_OVERFLOWS.fetch_add(1, Ordering::Relaxed) + 1;
                    if seen.is_power_of_two() {
                        error!(
                            "CpuGuard::identify_overflow: BUG! unidentifiable overflow on cpu {} ({} so far)",
                            cpu, seen
                        );
                    }
                    return Err(ControlError::NoIdentifiableOverflow);
                }
                UnidentifiedOverflow::Expected => {
                    debug!(
                        "CpuGuard::identify_overflow: spurious overflow interrupt on cpu {}",
                        cpu
                    );
                }
            }
        }

        Ok(overflowed)
    }
}
