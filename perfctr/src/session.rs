use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::HwControl;
use crate::config::CounterConfig;
use crate::generation::Generation;
use crate::status::Status;
use crate::topology::CpuId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running { cpu: CpuId },
}

/// Software state of one hardware counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterState {
    pub slot: u32,
    /// Raw counter value at the last resume or sample.
    pub start: u32,
    /// Everything counted before `start`.
    pub sum: u64,
}

/// Sums of one session at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub clock: u64,
    pub sums: SmallVec<[u64; 8]>,
}

/// One monitoring context: what it counts and what it has counted so far.
///
/// A session starts out stopped and counting nothing. Its control is set
/// with [`Session::update_control`], after which it is driven through
/// [`CpuGuard::resume`](crate::topology::CpuGuard::resume) and friends.
/// Counters are kept active first, interrupt counters after, in
/// configuration order.
#[derive(Debug)]
pub struct Session {
    pub(crate) config: CounterConfig,
    pub(crate) control: HwControl,
    pub(crate) status: Status,
    pub(crate) generation: Option<Generation>,
    pub(crate) clock_start: u32,
    pub(crate) clock_sum: u64,
    pub(crate) counters: SmallVec<[CounterState; 8]>,
    /// The CPU the interrupt counters were last stopped on.
    pub(crate) isuspend_cpu: Option<CpuId>,
    pub(crate) pending_interrupt: bool,
    pub(crate) run_state: RunState,
    pub(crate) last_cpu: Option<CpuId>,
    pub(crate) sequence: u64,
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session {
            config: CounterConfig::default(),
            control: HwControl::None,
            status: Status::NONE,
            generation: None,
            clock_start: 0,
            clock_sum: 0,
            counters: SmallVec::new(),
            isuspend_cpu: None,
            pending_interrupt: false,
            run_state: RunState::Stopped,
            last_cpu: None,
            sequence: 0,
        }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    pub fn control(&self) -> &HwControl {
        &self.control
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.run_state, RunState::Running { .. })
    }

    pub(crate) fn is_running_on(&self, cpu: CpuId) -> bool {
        self.run_state == RunState::Running { cpu }
    }

    /// The CPU the session last resumed on.
    pub fn last_cpu(&self) -> Option<CpuId> {
        self.last_cpu
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.pending_interrupt
    }

    /// Odd while the sums are being updated.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn clock_sum(&self) -> u64 {
        self.clock_sum
    }

    pub fn clock_start(&self) -> u32 {
        self.clock_start
    }

    pub fn counters(&self) -> &[CounterState] {
        &self.counters
    }

    pub fn active_counters(&self) -> &[CounterState] {
        let nr_active = self.status.nr_active().min(self.counters.len());
        &self.counters[..nr_active]
    }

    /// The interrupt counters of the current status. Empty while an
    /// overflow is waiting to be handled.
    pub fn interrupt_counters(&self) -> &[CounterState] {
        let end = self.status.nr_counters().min(self.counters.len());
        let start = self.status.nr_active().min(end);
        &self.counters[start..end]
    }

    pub(crate) fn interrupt_slots(&self) -> SmallVec<[u32; 4]> {
        self.interrupt_counters().iter().map(|c| c.slot).collect()
    }

    /// The sum of the counter in `slot`.
    pub fn sum(&self, slot: u32) -> Option<u64> {
        self.counters.iter().find(|c| c.slot == slot).map(|c| c.sum)
    }

    pub fn sums(&self) -> SmallVec<[u64; 8]> {
        self.counters.iter().map(|c| c.sum).collect()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            clock: self.clock_sum,
            sums: self.sums(),
        }
    }

    /// Stops a session whose CPU went away. Whatever it counted since the
    /// last sample is lost.
    pub(crate) fn abandon(&mut self) {
        self.begin_update();
        self.run_state = RunState::Stopped;
        self.isuspend_cpu = None;
        self.pending_interrupt = false;
        self.end_update();
    }

    #[inline]
    pub(crate) fn begin_update(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn end_update(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_counts_nothing() {
        let session = Session::new();
        assert!(!session.status().is_enabled());
        assert!(!session.is_running());
        assert_eq!(session.generation(), None);
        assert_eq!(session.snapshot(), CounterSnapshot::default());
        assert!(session.interrupt_counters().is_empty());
    }

    #[test]
    fn counter_views_follow_status() {
        let mut session = Session::new();
        session.counters = (0..3)
            .map(|slot| CounterState {
                slot,
                start: 0,
                sum: u64::from(slot) * 10,
            })
            .collect();
        session.status = Status::new(true, 2, 1);

        assert_eq!(session.active_counters().len(), 2);
        assert_eq!(session.interrupt_counters()[0].slot, 2);
        assert_eq!(session.sum(1), Some(10));
        assert_eq!(session.sum(7), None);
        assert_eq!(session.sums().as_slice(), &[0, 10, 20]);

        session.status = Status::clock_only();
        assert!(session.interrupt_counters().is_empty());
        assert!(session.active_counters().is_empty());
    }
}
