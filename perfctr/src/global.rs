//! System-wide counting: one session per CPU, sampled by a periodic timer.
//!
//! Global-mode counters count everything that happens on a CPU, whoever
//! runs there. They hold the counter reservation while running, so they
//! exclude per-task counting for that time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CounterConfig;
use crate::error::ControlError;
use crate::session::{CounterSnapshot, Session};
use crate::topology::{CpuId, CpuTopology, Reservation};

/// Timer intervals below this would spend too much time sampling.
pub const MIN_INTERVAL_USEC: u32 = 10_000;

pub const SERVICE: &str = "global-mode perfctrs";

struct GlobalCpu {
    session: Session,
    active: bool,
}

struct GlobalRun {
    _reservation: Reservation,
    interval_usec: u32,
}

pub struct GlobalCounters {
    topology: Arc<CpuTopology>,
    cpus: Vec<Mutex<GlobalCpu>>,
    running: Mutex<Option<GlobalRun>>,
}

impl GlobalCounters {
    pub fn new(topology: Arc<CpuTopology>) -> GlobalCounters {
        let cpus = (0..topology.nr_cpus())
            .map(|_| {
                Mutex::new(GlobalCpu {
                    session: Session::new(),
                    active: false,
                })
            })
            .collect();

        GlobalCounters {
            topology,
            cpus,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// The timer interval of the current run. Zero means no timer.
    pub fn interval_usec(&self) -> Option<u32> {
        self.running.lock().as_ref().map(|run| run.interval_usec)
    }

    /// Number of CPUs with something to count.
    pub fn nr_active(&self) -> usize {
        self.cpus.iter().filter(|cpu| cpu.lock().active).count()
    }

    /// Sets what `cpu` counts and resets its sums. A configuration that
    /// counts nothing takes the CPU out of the next run. Returns the number
    /// of active CPUs.
    pub fn control(&self, cpu: CpuId, config: CounterConfig) -> Result<usize, ControlError> {
        if self.is_running() {
            return Err(ControlError::Busy("global-mode counters are running"));
        }
        if !config.interrupt.is_empty() {
            return Err(ControlError::Unsupported(
                "global-mode counters cannot interrupt",
            ));
        }
        let slot = self.cpus.get(cpu).ok_or(ControlError::Offline { cpu })?;
        if !self.topology.is_online(cpu) {
            return Err(ControlError::Offline { cpu });
        }

        {
            let mut global_cpu = slot.lock();
            let active = !config.is_empty();
            global_cpu
                .session
                .update_control(&**self.topology.backend(), config)?;
            global_cpu.active = active;
        }

        Ok(self.nr_active())
    }

    /// Reserves the counters and starts every active CPU. The caller is
    /// expected to call [`GlobalCounters::tick`] every `interval_usec`, or
    /// never when it is 0. Returns the number of CPUs started.
    pub fn start(&self, interval_usec: u32) -> Result<usize, ControlError> {
        if interval_usec != 0 && interval_usec < MIN_INTERVAL_USEC {
            return Err(ControlError::InvalidInterval {
                usec: interval_usec,
            });
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ControlError::Busy("global-mode counters are running"));
        }
        let nr_active = self.nr_active();
        if nr_active == 0 {
            return Ok(0);
        }

        let reservation = self.topology.reserve(SERVICE)?;
        let mut started = Vec::with_capacity(nr_active);
        for (cpu, slot) in self.cpus.iter().enumerate() {
            let mut global_cpu = slot.lock();
            if !global_cpu.active {
                continue;
            }
            match self.topology.enter(cpu) {
                Ok(mut guard) => {
                    guard.resume(&mut global_cpu.session);
                    started.push(cpu);
                }
                Err(e) => {
                    drop(global_cpu);
                    warn!(
                        "GlobalCounters::start: cpu {} went away, stopping {} started cpus",
                        cpu,
                        started.len()
                    );
                    self.suspend_cpus(&started);
                    return Err(e);
                }
            }
        }

        info!(
            "GlobalCounters::start: counting on {} cpus, interval {} usec",
            nr_active, interval_usec
        );
        *running = Some(GlobalRun {
            _reservation: reservation,
            interval_usec,
        });
        Ok(nr_active)
    }

    /// The sampling timer. Folds every running CPU's counts so far, so
    /// that no counter wraps twice between observations.
    pub fn tick(&self) {
        if !self.is_running() {
            return;
        }
        for (cpu, slot) in self.cpus.iter().enumerate() {
            let mut global_cpu = slot.lock();
            if !global_cpu.session.is_running() {
                continue;
            }
            if let Ok(mut guard) = self.topology.enter(cpu) {
                guard.sample(&mut global_cpu.session);
            }
        }
    }

    /// Stops every CPU and gives the counters back. The sums stay readable.
    pub fn stop(&self) {
        let run = self.running.lock().take();
        if run.is_none() {
            return;
        }

        let cpus: Vec<CpuId> = (0..self.cpus.len()).collect();
        self.suspend_cpus(&cpus);
        // Releases the reservation.
        drop(run);
        info!("GlobalCounters::stop: stopped");
    }

    /// The current sums of `cpu`. Without a timer, reading is what keeps
    /// the sums current, so the CPU is sampled first.
    pub fn read(&self, cpu: CpuId) -> Result<CounterSnapshot, ControlError> {
        let slot = self.cpus.get(cpu).ok_or(ControlError::Offline { cpu })?;
        let sample_first = self.interval_usec() == Some(0);

        let mut global_cpu = slot.lock();
        if sample_first && global_cpu.session.is_running() {
            self.topology.enter(cpu)?.sample(&mut global_cpu.session);
        }
        Ok(global_cpu.session.snapshot())
    }

    fn suspend_cpus(&self, cpus: &[CpuId]) {
        for &cpu in cpus {
            let Some(slot) = self.cpus.get(cpu) else {
                continue;
            };
            let mut global_cpu = slot.lock();
            if !global_cpu.session.is_running() {
                continue;
            }
            match self.topology.enter(cpu) {
                Ok(mut guard) => guard.suspend(&mut global_cpu.session),
                Err(e) => {
                    warn!(
                        "GlobalCounters::suspend_cpus: cpu {}: {}, counts since the last sample are lost",
                        cpu, e
                    );
                    global_cpu.session.abandon();
                }
            }
        }
    }
}

impl Drop for GlobalCounters {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_common::{sim_topology, MockBackend};
    use crate::topology::TopologyOptions;

    fn global(nr_cpus: usize) -> (GlobalCounters, Vec<Arc<crate::testing_common::SimRegisters>>) {
        let options = TopologyOptions {
            nr_cpus,
            ..TopologyOptions::default()
        };
        let (topology, regs) = sim_topology(Arc::new(MockBackend::new(2)), options);
        (GlobalCounters::new(topology), regs)
    }

    #[test]
    fn intervals_below_the_minimum_are_rejected() {
        let (global, _) = global(1);
        global
            .control(0, CounterConfig::new().with_active(0, 1))
            .unwrap();
        assert_eq!(
            global.start(9_999),
            Err(ControlError::InvalidInterval { usec: 9_999 })
        );
        assert_eq!(global.start(MIN_INTERVAL_USEC), Ok(1));
    }

    #[test]
    fn nothing_to_count_starts_nothing() {
        let (global, _) = global(2);
        assert_eq!(global.start(0), Ok(0));
        assert!(!global.is_running());
    }

    #[test]
    fn control_while_running_is_busy() {
        let (global, _) = global(2);
        assert_eq!(
            global.control(1, CounterConfig::new().with_clock(true)),
            Ok(1)
        );
        global.start(0).unwrap();
        assert!(matches!(
            global.control(0, CounterConfig::new().with_clock(true)),
            Err(ControlError::Busy(_))
        ));
        global.stop();
        assert_eq!(global.control(1, CounterConfig::new()), Ok(0));
    }

    #[test]
    fn interrupt_counters_are_unsupported() {
        let (global, _) = global(1);
        assert!(matches!(
            global.control(0, CounterConfig::new().with_interrupt(0, 1, 0x8000_0000)),
            Err(ControlError::Unsupported(_))
        ));
        assert_eq!(
            global.control(3, CounterConfig::new()),
            Err(ControlError::Offline { cpu: 3 })
        );
    }

    #[test]
    fn counts_per_cpu_and_holds_the_reservation() {
        let (global, regs) = global(2);
        global
            .control(0, CounterConfig::new().with_clock(true).with_active(0, 1))
            .unwrap();
        global
            .control(1, CounterConfig::new().with_active(1, 1))
            .unwrap();

        assert_eq!(global.start(0), Ok(2));
        assert_eq!(global.topology.reserved_by(), Some(SERVICE));

        regs[0].tick(100);
        regs[1].tick(40);
        let cpu0 = global.read(0).unwrap();
        assert_eq!(cpu0.clock, 100);
        assert_eq!(cpu0.sums.as_slice(), &[100]);

        regs[1].tick(2);
        global.stop();
        assert_eq!(global.topology.reserved_by(), None);
        assert_eq!(global.read(1).unwrap().sums.as_slice(), &[42]);
    }

    #[test]
    fn timer_ticks_sample_running_cpus() {
        let (global, regs) = global(1);
        global
            .control(0, CounterConfig::new().with_active(0, 1))
            .unwrap();
        global.start(MIN_INTERVAL_USEC).unwrap();

        regs[0].tick(0xC000_0000);
        global.tick();
        regs[0].tick(0xC000_0000);
        global.tick();
        // With a timer, reads do not sample.
        regs[0].tick(5);
        assert_eq!(global.read(0).unwrap().sums.as_slice(), &[0x1_8000_0000]);
    }
}
