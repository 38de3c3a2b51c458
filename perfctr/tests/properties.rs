use std::sync::Arc;

use perfctr::testing_common::{
    sim_topology, MockBackend, SimRegisters, MOCK_COUNTER0, MOCK_SELECTOR0,
};
use perfctr::{
    ireload, Backend, ControlError, CounterConfig, CpuTopology, ReloadPolicy, Session,
    TopologyOptions,
};
use proptest::prelude::*;

fn topology(nr_cpus: usize, reload_policy: ReloadPolicy) -> (Arc<CpuTopology>, Vec<Arc<SimRegisters>>) {
    sim_topology(
        Arc::new(MockBackend::new(4)),
        TopologyOptions {
            nr_cpus,
            reload_policy,
        },
    )
}

fn session(topology: &CpuTopology, config: CounterConfig) -> Session {
    let mut session = Session::new();
    session
        .update_control(&**topology.backend(), config)
        .unwrap();
    session
}

fn selector_writes(regs: &SimRegisters) -> usize {
    (0..4).map(|slot| regs.writes_to(MOCK_SELECTOR0 + slot)).sum()
}

#[test]
fn resuming_the_owner_again_writes_nothing() {
    let (topology, regs) = topology(1, ReloadPolicy::Diff);
    let mut session = session(
        &topology,
        CounterConfig::new()
            .with_clock(true)
            .with_active(0, 0x11)
            .with_active(3, 0x33),
    );

    let mut cpu = topology.enter(0).unwrap();
    cpu.resume(&mut session);
    cpu.suspend(&mut session);
    assert_eq!(selector_writes(&regs[0]), 2);

    regs[0].clear_log();
    for _ in 0..10 {
        cpu.resume(&mut session);
        cpu.suspend(&mut session);
    }
    assert_eq!(regs[0].write_count(), 0);

    let stats = cpu.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 10);
}

#[test]
fn switching_sessions_writes_only_the_difference() {
    let (topology, regs) = topology(1, ReloadPolicy::Diff);
    let mut a = session(
        &topology,
        CounterConfig::new().with_active(0, 0x11).with_active(1, 0x22),
    );
    let mut b = session(
        &topology,
        CounterConfig::new().with_active(0, 0x11).with_active(1, 0x44),
    );

    let mut cpu = topology.enter(0).unwrap();
    cpu.resume(&mut a);
    cpu.suspend(&mut a);

    regs[0].clear_log();
    cpu.resume(&mut b);
    cpu.suspend(&mut b);
    assert_eq!(regs[0].writes(), vec![(MOCK_SELECTOR0 + 1, 0x44)]);
}

#[test]
fn full_reload_policy_rewrites_on_every_miss() {
    let (topology, regs) = topology(1, ReloadPolicy::Full);
    let mut a = session(&topology, CounterConfig::new().with_active(0, 0x11));
    let mut b = session(&topology, CounterConfig::new().with_active(0, 0x11));

    let mut cpu = topology.enter(0).unwrap();
    cpu.resume(&mut a);
    cpu.suspend(&mut a);

    regs[0].clear_log();
    cpu.resume(&mut b);
    cpu.suspend(&mut b);
    assert_eq!(selector_writes(&regs[0]), 1);

    // The owner still hits.
    regs[0].clear_log();
    cpu.resume(&mut b);
    assert_eq!(regs[0].write_count(), 0);
}

#[test]
fn migration_writes_everything_even_when_the_shadow_matches() {
    let (topology, regs) = topology(2, ReloadPolicy::Diff);
    let config = CounterConfig::new().with_active(0, 0x11).with_active(2, 0x22);
    let mut migrating = session(&topology, config.clone());
    let mut resident = session(&topology, config);

    // cpu 1 ends up holding exactly the values `migrating` needs.
    topology.enter(1).unwrap().resume(&mut resident);
    topology.enter(1).unwrap().suspend(&mut resident);

    topology.enter(0).unwrap().resume(&mut migrating);
    topology.enter(0).unwrap().suspend(&mut migrating);

    regs[1].clear_log();
    topology.enter(1).unwrap().resume(&mut migrating);
    assert_eq!(selector_writes(&regs[1]), 2);
    assert_eq!(migrating.last_cpu(), Some(1));
}

#[test]
fn staying_put_with_a_matching_shadow_writes_nothing() {
    let (topology, regs) = topology(1, ReloadPolicy::Diff);
    let config = CounterConfig::new().with_active(0, 0x11).with_active(2, 0x22);
    let mut a = session(&topology, config.clone());
    let mut b = session(&topology, config);

    let mut cpu = topology.enter(0).unwrap();
    cpu.resume(&mut a);
    cpu.suspend(&mut a);
    cpu.resume(&mut b);
    cpu.suspend(&mut b);

    regs[0].clear_log();
    cpu.resume(&mut a);
    assert_eq!(regs[0].write_count(), 0);
    assert_eq!(cpu.cache().stats().misses, 3);
}

#[test]
fn rejected_updates_leave_the_session_untouched() {
    let (topology, regs) = topology(1, ReloadPolicy::Diff);
    let mut session = session(
        &topology,
        CounterConfig::new().with_clock(true).with_active(1, 0x11),
    );
    {
        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        regs[0].tick(77);
        cpu.suspend(&mut session);
    }

    let generation = session.generation();
    let status = session.status();
    let snapshot = session.snapshot();
    let control = session.control().clone();

    let backend = Arc::clone(topology.backend());
    let rejected = [
        CounterConfig::new().with_active(9, 0x11),
        CounterConfig::new().with_active(0, 0x11).with_active(0, 0x22),
        CounterConfig::new().with_active(0, 1 << 63),
        CounterConfig::new().with_interrupt(0, 0x11, 0x10),
        CounterConfig::new()
            .with_active(0, 1)
            .with_active(1, 1)
            .with_active(2, 1)
            .with_active(3, 1)
            .with_interrupt(4, 1, 0x8000_0000),
    ];
    for config in rejected {
        assert!(session.update_control(&*backend, config).is_err());
        assert_eq!(session.generation(), generation);
        assert_eq!(session.status(), status);
        assert_eq!(session.snapshot(), snapshot);
        assert_eq!(session.control(), &control);
    }
}

#[test]
fn control_updates_need_a_suspended_session() {
    let (topology, _regs) = topology(1, ReloadPolicy::Diff);
    let mut session = session(&topology, CounterConfig::new().with_active(0, 0x11));
    topology.enter(0).unwrap().resume(&mut session);
    assert!(matches!(
        session.update_control(&**topology.backend(), CounterConfig::new()),
        Err(ControlError::Busy(_))
    ));
}

#[test]
fn overflowed_counters_restart_at_their_reload_value() {
    let (topology, regs) = topology(1, ReloadPolicy::Diff);
    let backend = Arc::clone(topology.backend());
    let reload = 0xFFFF_F000;
    let mut session = session(
        &topology,
        CounterConfig::new()
            .with_active(0, 0x11)
            .with_interrupt(1, 0x22, reload)
            .with_interrupt(2, 0x33, 0x8000_0000),
    );

    let mut cpu = topology.enter(0).unwrap();
    for round in 1..=3u64 {
        cpu.resume(&mut session);
        assert_eq!(regs[0].get(MOCK_COUNTER0 + 1) as u32, reload);
        regs[0].tick(0x1000);
        cpu.suspend(&mut session);
        assert!(session.has_pending_interrupt());

        let overflowed = cpu.identify_overflow(&mut session).unwrap();
        assert_eq!(overflowed.slots(), &[1]);
        assert_eq!(session.sum(1), Some(0x1000 * round));
        ireload(&*backend, &mut session);
    }
    assert_eq!(session.sum(0), Some(0x3000));
    assert_eq!(session.sum(2), Some(0x3000));
}

#[test]
fn a_thousand_ticks_across_two_cpus() {
    let (topology, regs) = topology(2, ReloadPolicy::Diff);
    let mut sessions = [
        session(
            &topology,
            CounterConfig::new().with_clock(true).with_active(0, 0x11),
        ),
        session(
            &topology,
            CounterConfig::new().with_active(0, 0x22).with_active(1, 0x33),
        ),
    ];
    let mut expected = [0u64; 2];

    // Both sessions share both CPUs, swapping every few ticks.
    for tick in 0..1000u64 {
        let cpu_id = (tick / 7 % 2) as usize;
        let which = (tick / 3 % 2) as usize;
        let events = 0x0123_4567 + tick * 0x10_0000;

        let mut cpu = topology.enter(cpu_id).unwrap();
        cpu.resume(&mut sessions[which]);
        regs[cpu_id].tick(events);
        if tick % 5 == 0 {
            cpu.sample(&mut sessions[which]);
        }
        cpu.suspend(&mut sessions[which]);
        expected[which] += events;
    }

    assert_eq!(sessions[0].sum(0), Some(expected[0]));
    assert_eq!(sessions[0].clock_sum(), expected[0]);
    assert_eq!(sessions[1].sum(0), Some(expected[1]));
    assert_eq!(sessions[1].sum(1), Some(expected[1]));
    for session in &sessions {
        assert_eq!(session.sequence() % 2, 0);
    }
}

proptest! {
    #[test]
    fn deltas_survive_wraparound(start in any::<u32>(), events in 0u64..=u64::from(u32::MAX)) {
        let (topology, regs) = topology(1, ReloadPolicy::Diff);
        let mut session = session(&topology, CounterConfig::new().with_active(2, 0x11));

        regs[0].set(MOCK_COUNTER0 + 2, u64::from(start));
        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        regs[0].tick(events);
        cpu.suspend(&mut session);
        prop_assert_eq!(session.sum(2), Some(events));
    }

    #[test]
    fn sampling_never_loses_or_invents_counts(
        chunks in prop::collection::vec((0u64..=u64::from(u32::MAX), any::<bool>()), 1..64)
    ) {
        let (topology, regs) = topology(1, ReloadPolicy::Diff);
        let mut session = session(
            &topology,
            CounterConfig::new().with_clock(true).with_active(0, 0x11),
        );

        let mut cpu = topology.enter(0).unwrap();
        cpu.resume(&mut session);
        let mut total = 0u64;
        for (events, suspend) in chunks {
            regs[0].tick(events);
            total += events;
            if suspend {
                cpu.suspend(&mut session);
                // Stopped counting: nothing here may show up.
                regs[0].tick(0x5555);
                cpu.resume(&mut session);
            } else {
                cpu.sample(&mut session);
            }
        }
        cpu.suspend(&mut session);
        prop_assert_eq!(session.sum(0), Some(total));
        prop_assert_eq!(session.clock_sum(), total);
    }
}

#[test]
fn mock_lists_every_counter_register() {
    let backend = MockBackend::new(4);
    let registers: Vec<u32> = backend.counter_registers().into_iter().collect();
    assert_eq!(
        registers,
        (0..4).map(|slot| MOCK_COUNTER0 + slot).collect::<Vec<_>>()
    );
}
