//! Resume, suspend and sample.
//!
//! These run on a [`CpuGuard`] and never fail. Each reads every counter it
//! cares about exactly once and folds the 32-bit delta since the last read
//! into the 64-bit sum, so counters may wrap as long as they are sampled
//! more often than once per full wrap.

use crate::backend::{Backend, RegisterAccess};
use crate::cache::PerCpuCache;
use crate::session::{RunState, Session};
use crate::topology::{CpuGuard, CpuId, ReloadPolicy};

#[inline]
fn delta(now: u32, start: u32) -> u64 {
    u64::from(now.wrapping_sub(start))
}

impl<'a> CpuGuard<'a> {
    /// Programs the session's control values into this CPU and takes the
    /// baseline readings.
    pub fn resume(&mut self, session: &mut Session) {
        if let RunState::Running { cpu } = session.run_state {
            warn!(
                "CpuGuard::resume: session is already running on cpu {}",
                cpu
            );
            return;
        }

        let cpu = self.cpu();
        let reload_policy = self.reload_policy();
        let (backend, regs, cache) = self.parts();
        session.begin_update();

        let status = session.status;
        if status.is_enabled() {
            if !cache.is_owned_by(session.generation) {
                let migrated = session.last_cpu.map_or(false, |last| last != cpu);
                if migrated || reload_policy == ReloadPolicy::Full {
                    cache.invalidate(backend);
                }
            }
            if status.has_interrupt_counters() {
                iresume(backend, regs, cache, session, cpu);
            }
            if status.quirks() != 0 {
                cache.forget_owner();
            }
            cache.write_control(
                backend,
                regs,
                &session.control,
                status,
                session.generation,
            );

            if status.has_clock() {
                session.clock_start = backend.read_clock(regs);
            }
            for counter in session.counters.iter_mut().take(status.nr_active()) {
                counter.start = backend.read_counter(regs, counter.slot);
            }
        }

        session.run_state = RunState::Running { cpu };
        session.last_cpu = Some(cpu);
        session.end_update();
    }

    /// Folds everything counted since the last resume or sample into the
    /// sums and stops the session.
    pub fn suspend(&mut self, session: &mut Session) {
        let cpu = self.cpu();
        match session.run_state {
            RunState::Stopped => return,
            RunState::Running { cpu: running } if running != cpu => {
                error!(
                    "CpuGuard::suspend: BUG! session running on cpu {} suspended on cpu {}",
                    running, cpu
                );
                return;
            }
            RunState::Running { .. } => {}
        }

        let (backend, regs, cache) = self.parts();
        session.begin_update();

        let status = session.status;
        if status.quirks() != 0 {
            backend.quiesce(regs, cache.shadow_mut(), &mut session.control);
        }
        if status.has_interrupt_counters() {
            isuspend(backend, regs, cache, session, cpu);
        }
        fold_active(backend, regs, session);

        session.run_state = RunState::Stopped;
        session.end_update();
    }

    /// Folds the counts so far into the sums without stopping. Does
    /// nothing unless the session is running on this CPU.
    pub fn sample(&mut self, session: &mut Session) {
        if !session.is_running_on(self.cpu()) {
            return;
        }

        let (backend, regs, _) = self.parts();
        session.begin_update();

        fold_active(backend, regs, session);
        session.end_update();
    }
}

/// Reads the clock and the active counters, adds what they counted to the
/// sums and makes the readings the new baseline.
fn fold_active(backend: &dyn Backend, regs: &dyn RegisterAccess, session: &mut Session) {
    let status = session.status;
    if status.has_clock() {
        let now = backend.read_clock(regs);
        session.clock_sum += delta(now, session.clock_start);
        session.clock_start = now;
    }
    for counter in session.counters.iter_mut().take(status.nr_active()) {
        let now = backend.read_counter(regs, counter.slot);
        counter.sum += delta(now, counter.start);
        counter.start = now;
    }
}

/// Stops the interrupt counters and folds them. The selectors are cleared
/// behind the cache owner's back, so the shadow is kept in step.
fn isuspend(
    backend: &dyn Backend,
    regs: &dyn RegisterAccess,
    cache: &mut PerCpuCache,
    session: &mut Session,
    cpu: CpuId,
) {
    session.isuspend_cpu = Some(cpu);
    backend.mask_interrupts(regs);

    let slots = session.interrupt_slots();
    backend.stop_counters(regs, cache.shadow_mut(), &session.control, &slots);

    let status = session.status;
    let mut pending = false;
    for counter in session
        .counters
        .iter_mut()
        .take(status.nr_counters())
        .skip(status.nr_active())
    {
        let now = backend.read_counter(regs, counter.slot);
        counter.sum += delta(now, counter.start);
        counter.start = now;
        if backend.counter_signals_overflow(now) {
            pending = true;
        }
    }
    session.pending_interrupt = pending;
}

/// Puts the interrupt counters back. If this CPU still holds them from the
/// last interrupt suspend only the selectors need rewriting.
fn iresume(
    backend: &dyn Backend,
    regs: &dyn RegisterAccess,
    cache: &mut PerCpuCache,
    session: &mut Session,
    cpu: CpuId,
) {
    backend.unmask_interrupts(regs);

    if cache.is_owned_by(session.generation) {
        cache.forget_owner();
        if session.isuspend_cpu == Some(cpu) {
            return;
        }
    }

    let slots = session.interrupt_slots();
    backend.disarm_counters(regs, cache.shadow_mut(), &session.control, &slots);
    for counter in session.interrupt_counters() {
        backend.write_counter(regs, counter.slot, counter.start);
    }
}

/// Re-arms overflow interrupts on an overflowed session. Its next resume
/// rewrites the interrupt counters with their `start` values.
pub fn ireload(backend: &dyn Backend, session: &mut Session) {
    session.isuspend_cpu = None;
    backend.rearm(&mut session.control);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::CounterConfig;
    use crate::testing_common::{sim_topology, MockBackend, SimRegisters, MOCK_SELECTOR0};
    use crate::topology::{CpuTopology, TopologyOptions};

    fn setup(nr_cpus: usize) -> (Arc<CpuTopology>, Vec<Arc<SimRegisters>>) {
        let options = TopologyOptions {
            nr_cpus,
            ..TopologyOptions::default()
        };
        sim_topology(Arc::new(MockBackend::new(4)), options)
    }

    #[test]
    fn resume_tick_suspend_counts_ticks() {
        let (topology, regs) = setup(1);
        let mut session = Session::new();
        session
            .update_control(
                &**topology.backend(),
                CounterConfig::new().with_clock(true).with_active(0, 1),
            )
            .unwrap();

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        assert!(session.is_running());
        regs[0].tick(250);
        cpu.sample(&mut session);
        assert_eq!(session.sum(0), Some(250));
        regs[0].tick(50);
        cpu.suspend(&mut session);

        assert!(!session.is_running());
        assert_eq!(session.sum(0), Some(300));
        assert_eq!(session.clock_sum(), 300);
        assert_eq!(session.sequence() % 2, 0);

        // Stopped sessions neither sample nor suspend.
        regs[0].tick(10);
        cpu.sample(&mut session);
        cpu.suspend(&mut session);
        assert_eq!(session.sum(0), Some(300));
    }

    #[test]
    fn double_resume_is_ignored() {
        let (topology, regs) = setup(1);
        let mut session = Session::new();
        session
            .update_control(&**topology.backend(), CounterConfig::new().with_active(1, 1))
            .unwrap();

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        regs[0].tick(7);
        cpu.resume(&mut session);
        regs[0].tick(3);
        cpu.suspend(&mut session);
        assert_eq!(session.sum(1), Some(10));
    }

    #[test]
    fn suspend_on_the_wrong_cpu_is_refused() {
        let (topology, regs) = setup(2);
        let mut session = Session::new();
        session
            .update_control(&**topology.backend(), CounterConfig::new().with_active(0, 1))
            .unwrap();

        topology.enter(0).unwrap().resume(&mut session);
        regs[0].tick(5);
        topology.enter(1).unwrap().suspend(&mut session);
        assert!(session.is_running());
        topology.enter(0).unwrap().suspend(&mut session);
        assert_eq!(session.sum(0), Some(5));
    }

    #[test]
    fn empty_session_resumes_without_touching_hardware() {
        let (topology, regs) = setup(1);
        let mut session = Session::new();
        session
            .update_control(&**topology.backend(), CounterConfig::new())
            .unwrap();
        regs[0].clear_log();

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        cpu.suspend(&mut session);
        assert_eq!(regs[0].write_count(), 0);
        assert_eq!(regs[0].read_count(), 0);
    }

    #[test]
    fn isuspend_then_iresume_on_same_cpu_skips_counter_writes() {
        let (topology, regs) = setup(1);
        let backend = Arc::clone(topology.backend());
        let mut session = Session::new();
        session
            .update_control(
                &*backend,
                CounterConfig::new().with_interrupt(2, 5, 0xFFFF_FF00),
            )
            .unwrap();

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        let counter_reg = backend.counter_registers()[2];
        assert_eq!(regs[0].get(counter_reg) as u32, 0xFFFF_FF00);

        regs[0].tick(0x10);
        cpu.suspend(&mut session);
        assert_eq!(session.sum(2), Some(0x10));
        assert_eq!(session.counters()[0].start, 0xFFFF_FF10);
        assert!(!session.has_pending_interrupt());

        regs[0].clear_log();
        cpu.resume(&mut session);
        assert_eq!(regs[0].writes_to(counter_reg), 0);
        // The stopped selector is turned back on.
        assert_eq!(regs[0].writes_to(MOCK_SELECTOR0 + 2), 1);
    }

    #[test]
    fn resume_after_identified_overflow_writes_reload_value() {
        let (topology, regs) = setup(1);
        let backend = Arc::clone(topology.backend());
        let mut session = Session::new();
        session
            .update_control(
                &*backend,
                CounterConfig::new().with_interrupt(0, 5, 0xFFFF_FF00),
            )
            .unwrap();
        let counter_reg = backend.counter_registers()[0];

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        regs[0].tick(0x200);
        cpu.suspend(&mut session);
        assert_eq!(cpu.identify_overflow(&mut session).unwrap().slots(), &[0]);
        assert_eq!(session.sum(0), Some(0x200));

        // No ireload: the same CPU must still restart the period.
        cpu.resume(&mut session);
        assert_eq!(regs[0].get(counter_reg) as u32, 0xFFFF_FF00);
        regs[0].tick(10);
        cpu.suspend(&mut session);
        assert_eq!(session.sum(0), Some(0x20a));
    }

    #[test]
    fn ireload_rewrites_reload_value() {
        let (topology, regs) = setup(1);
        let backend = Arc::clone(topology.backend());
        let mut session = Session::new();
        session
            .update_control(
                &*backend,
                CounterConfig::new().with_interrupt(0, 5, 0xFFFF_FF00),
            )
            .unwrap();

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        regs[0].tick(0x200);
        cpu.suspend(&mut session);
        assert!(session.has_pending_interrupt());

        let overflowed = cpu.identify_overflow(&mut session).unwrap();
        assert_eq!(overflowed.slots(), &[0]);
        ireload(&*backend, &mut session);
        cpu.resume(&mut session);
        assert_eq!(
            regs[0].get(backend.counter_registers()[0]) as u32,
            0xFFFF_FF00
        );
    }
}
