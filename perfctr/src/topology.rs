//! The set of logical CPUs and exclusive access to them.
//!
//! Every CPU has a [`CpuSlot`] behind a mutex: its register access, its
//! [`PerCpuCache`] and whether it is online. Holding a [`CpuGuard`] stands
//! for running on that CPU with preemption and migration disabled, which is
//! the only way the engine ever touches counter hardware.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, RegisterAccess};
use crate::cache::{CacheStats, PerCpuCache};
use crate::error::ControlError;

pub type CpuId = usize;

/// How much a generation mismatch costs on resume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPolicy {
    /// Write only the fields that differ from the shadow. A session that
    /// moved to another CPU still gets a full write there.
    #[default]
    Diff,
    /// Write every field whenever the generation does not match.
    Full,
}

impl FromStr for ReloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<ReloadPolicy, String> {
        match s {
            "diff" => Ok(ReloadPolicy::Diff),
            "full" => Ok(ReloadPolicy::Full),
            _ => Err(format!("unknown reload policy `{}`, expected diff or full", s)),
        }
    }
}

impl fmt::Display for ReloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadPolicy::Diff => f.write_str("diff"),
            ReloadPolicy::Full => f.write_str("full"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyOptions {
    pub nr_cpus: usize,
    #[serde(default)]
    pub reload_policy: ReloadPolicy,
}

impl Default for TopologyOptions {
    fn default() -> TopologyOptions {
        TopologyOptions {
            nr_cpus: 1,
            reload_policy: ReloadPolicy::Diff,
        }
    }
}

pub struct CpuSlot {
    cache: PerCpuCache,
    regs: Box<dyn RegisterAccess>,
    online: bool,
}

pub struct CpuTopology {
    backend: Arc<dyn Backend>,
    cpus: Vec<Mutex<CpuSlot>>,
    reload_policy: ReloadPolicy,
    reservation: Mutex<Option<&'static str>>,
}

impl CpuTopology {
    /// Builds a topology of `options.nr_cpus` online CPUs, asking
    /// `registers` for each CPU's register access.
    pub fn new(
        backend: Arc<dyn Backend>,
        options: TopologyOptions,
        registers: impl FnMut(CpuId) -> Box<dyn RegisterAccess>,
    ) -> CpuTopology {
        let registers = (0..options.nr_cpus).map(registers).collect();
        CpuTopology::from_registers(backend, options.reload_policy, registers)
    }

    pub fn from_registers(
        backend: Arc<dyn Backend>,
        reload_policy: ReloadPolicy,
        registers: Vec<Box<dyn RegisterAccess>>,
    ) -> CpuTopology {
        let cpus = registers
            .into_iter()
            .map(|regs| {
                Mutex::new(CpuSlot {
                    cache: PerCpuCache::new(&*backend),
                    regs,
                    online: true,
                })
            })
            .collect::<Vec<_>>();

        info!(
            "CpuTopology::new: {} CPUs with {} counters, {} reloads",
            cpus.len(),
            backend.name(),
            reload_policy
        );

        CpuTopology {
            backend,
            cpus,
            reload_policy,
            reservation: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        self.reload_policy
    }

    /// Pins the caller to `cpu` until the guard is dropped.
    pub fn enter(&self, cpu: CpuId) -> Result<CpuGuard<'_>, ControlError> {
        let slot = self
            .cpus
            .get(cpu)
            .ok_or(ControlError::Offline { cpu })?
            .lock();
        if !slot.online {
            return Err(ControlError::Offline { cpu });
        }

        Ok(CpuGuard {
            cpu,
            slot,
            backend: &*self.backend,
            reload_policy: self.reload_policy,
        })
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu).map_or(false, |slot| slot.lock().online)
    }

    /// Brings `cpu` online or takes it offline. Either way the counters no
    /// longer hold anything the cache knows about.
    pub fn set_online(&self, cpu: CpuId, online: bool) -> Result<(), ControlError> {
        let reserved = self.reserved_by().is_some();
        let mut slot = self
            .cpus
            .get(cpu)
            .ok_or(ControlError::Offline { cpu })?
            .lock();
        if slot.online == online {
            return Ok(());
        }

        if reserved {
            self.backend.clear_counters(&*slot.regs, online);
        }
        slot.cache.invalidate(&*self.backend);
        slot.online = online;

        info!(
            "CpuTopology::set_online: cpu {} is now {}",
            cpu,
            if online { "online" } else { "offline" }
        );
        Ok(())
    }

    /// Grants the counter hardware to `service` until the returned
    /// reservation is dropped.
    pub fn reserve(self: &Arc<Self>, service: &'static str) -> Result<Reservation, ControlError> {
        {
            let mut holder = self.reservation.lock();
            if let Some(current) = *holder {
                warn!(
                    "CpuTopology::reserve: {} wanted the counters but {} holds them",
                    service, current
                );
                return Err(ControlError::Busy(current));
            }
            *holder = Some(service);
        }

        self.for_each_online(|backend, slot| {
            backend.clear_counters(&*slot.regs, true);
            slot.cache.invalidate(backend);
        });

        info!("CpuTopology::reserve: counters reserved by {}", service);
        Ok(Reservation {
            topology: Arc::clone(self),
            service,
        })
    }

    pub fn reserved_by(&self) -> Option<&'static str> {
        *self.reservation.lock()
    }

    pub fn cache_stats(&self, cpu: CpuId) -> Option<CacheStats> {
        self.cpus.get(cpu).map(|slot| slot.lock().cache.stats())
    }

    fn release(&self, service: &'static str) {
        self.for_each_online(|backend, slot| {
            backend.clear_counters(&*slot.regs, false);
            slot.cache.invalidate(backend);
        });
        *self.reservation.lock() = None;
        info!("CpuTopology::release: counters released by {}", service);
    }

    fn for_each_online(&self, mut f: impl FnMut(&dyn Backend, &mut CpuSlot)) {
        for slot in &self.cpus {
            let mut slot = slot.lock();
            if slot.online {
                f(&*self.backend, &mut slot);
            }
        }
    }
}

/// Exclusive use of the counter hardware. Dropping it clears every counter.
pub struct Reservation {
    topology: Arc<CpuTopology>,
    service: &'static str,
}

impl Reservation {
    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn topology(&self) -> &Arc<CpuTopology> {
        &self.topology
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.topology.release(self.service);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("service", &self.service)
            .finish()
    }
}

/// Running on one CPU with migration disabled.
pub struct CpuGuard<'a> {
    cpu: CpuId,
    slot: MutexGuard<'a, CpuSlot>,
    backend: &'a dyn Backend,
    reload_policy: ReloadPolicy,
}

impl<'a> CpuGuard<'a> {
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub fn backend(&self) -> &'a dyn Backend {
        self.backend
    }

    pub fn registers(&self) -> &dyn RegisterAccess {
        &*self.slot.regs
    }

    pub fn cache(&self) -> &PerCpuCache {
        &self.slot.cache
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        self.reload_policy
    }

    /// Splits the guard into what the engine needs at the same time.
    pub(crate) fn parts(&mut self) -> (&'a dyn Backend, &dyn RegisterAccess, &mut PerCpuCache) {
        let slot = &mut *self.slot;
        (self.backend, &*slot.regs, &mut slot.cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_common::{sim_topology, MockBackend};

    fn topology(nr_cpus: usize) -> Arc<CpuTopology> {
        let options = TopologyOptions {
            nr_cpus,
            ..TopologyOptions::default()
        };
        sim_topology(Arc::new(MockBackend::new(4)), options).0
    }

    #[test]
    fn enter_checks_cpu() {
        let topology = topology(2);
        assert_eq!(topology.enter(1).map(|guard| guard.cpu()), Ok(1));
        assert_eq!(
            topology.enter(2).map(|guard| guard.cpu()),
            Err(ControlError::Offline { cpu: 2 })
        );

        topology.set_online(1, false).unwrap();
        assert!(!topology.is_online(1));
        assert_eq!(
            topology.enter(1).map(|guard| guard.cpu()),
            Err(ControlError::Offline { cpu: 1 })
        );
    }

    #[test]
    fn one_reservation_at_a_time() {
        let topology = topology(1);
        let reservation = topology.reserve("global-mode perfctrs").unwrap();
        assert_eq!(topology.reserved_by(), Some("global-mode perfctrs"));
        assert_eq!(
            topology.reserve("oprofile").map(|r| r.service()),
            Err(ControlError::Busy("global-mode perfctrs"))
        );

        drop(reservation);
        assert_eq!(topology.reserved_by(), None);
        assert!(topology.reserve("oprofile").is_ok());
    }

    #[test]
    fn reservation_clears_counters_both_ways() {
        let options = TopologyOptions {
            nr_cpus: 2,
            ..TopologyOptions::default()
        };
        let backend = Arc::new(MockBackend::new(2));
        let (topology, regs) = sim_topology(backend.clone(), options);
        let counter = backend.counter_registers()[1];

        regs[0].set(counter, 1234);
        let reservation = topology.reserve("test").unwrap();
        assert_eq!(regs[0].get(counter), 0);

        regs[1].set(counter, 99);
        drop(reservation);
        assert_eq!(regs[1].get(counter), 0);
    }

    #[test]
    fn reload_policy_parses() {
        assert_eq!("full".parse(), Ok(ReloadPolicy::Full));
        assert_eq!("diff".parse(), Ok(ReloadPolicy::Diff));
        assert!("sometimes".parse::<ReloadPolicy>().is_err());
        assert_eq!(ReloadPolicy::Full.to_string(), "full");
    }
}
