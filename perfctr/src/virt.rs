//! Per-task virtual counters.
//!
//! A [`VirtualCounters`] follows one task around: it is resumed when the
//! task is switched in, suspended when it is switched out, and sampled by
//! the scheduler tick while it runs so that no counter wraps unobserved.
//! Interrupt counters deliver an [`OverflowSignal`] to the task; counting
//! then stays disabled, apart from the clock, until the task asks for it
//! to be resumed with [`VirtualCounters::iresume`].

use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::config::{CounterConfig, Preserve};
use crate::engine::ireload;
use crate::error::ControlError;
use crate::session::{CounterSnapshot, Session};
use crate::status::Status;
use crate::topology::{CpuGuard, CpuId, CpuTopology};

/// Scheduler ticks between samples: half a second at HZ=1000.
pub const SAMPLE_PERIOD_TICKS: u32 = 500;

/// What to deliver to the task after an overflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OverflowSignal {
    pub signo: i32,
    /// Bit `i` set for the `i`-th counter of the configuration.
    pub pmc_mask: u32,
    pub slots: SmallVec<[u32; 4]>,
}

pub struct VirtualCounters {
    topology: Arc<CpuTopology>,
    session: Session,
    scheduled: Option<CpuId>,
    sample_countdown: u32,
    /// The status to go back to once an overflow has been handled.
    iresume_status: Option<Status>,
    signo: i32,
    close_on_exec: bool,
    unlinked: bool,
}

impl VirtualCounters {
    pub fn new(topology: Arc<CpuTopology>, signo: i32) -> VirtualCounters {
        VirtualCounters {
            topology,
            session: Session::new(),
            scheduled: None,
            sample_countdown: SAMPLE_PERIOD_TICKS,
            iresume_status: None,
            signo,
            close_on_exec: false,
            unlinked: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The CPU the task is running on, if it is running.
    pub fn scheduled(&self) -> Option<CpuId> {
        self.scheduled
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }

    /// Whether an overflow was delivered and counting waits for
    /// [`VirtualCounters::iresume`].
    pub fn awaiting_iresume(&self) -> bool {
        self.iresume_status.is_some()
    }

    pub fn set_close_on_exec(&mut self, close_on_exec: bool) {
        self.close_on_exec = close_on_exec;
    }

    /// The task was switched in on `cpu`. An overflow that arrived while
    /// it was being switched out is handled now.
    pub fn switch_in(&mut self, cpu: CpuId) -> Result<Option<OverflowSignal>, ControlError> {
        if self.unlinked {
            return Ok(None);
        }
        if let Some(running) = self.scheduled {
            warn!(
                "VirtualCounters::switch_in: already running on cpu {}",
                running
            );
            return Ok(None);
        }

        let topology = Arc::clone(&self.topology);
        let mut guard = topology.enter(cpu)?;
        self.scheduled = Some(cpu);
        if self.session.has_pending_interrupt() {
            return Ok(self.handle_overflow(&mut guard));
        }
        guard.resume(&mut self.session);
        self.sample_countdown = SAMPLE_PERIOD_TICKS;
        Ok(None)
    }

    pub fn switch_out(&mut self) -> Result<(), ControlError> {
        let Some(cpu) = self.scheduled else {
            return Ok(());
        };
        self.topology.enter(cpu)?.suspend(&mut self.session);
        self.scheduled = None;
        Ok(())
    }

    /// One scheduler tick on the task's CPU.
    pub fn tick(&mut self) -> Result<(), ControlError> {
        let Some(cpu) = self.scheduled else {
            return Ok(());
        };
        self.sample_countdown = self.sample_countdown.saturating_sub(1);
        if self.sample_countdown == 0 {
            self.topology.enter(cpu)?.sample(&mut self.session);
            self.sample_countdown = SAMPLE_PERIOD_TICKS;
        }
        Ok(())
    }

    /// Installs a new configuration. The sums selected by `preserve` carry
    /// over, as does the clock sum while the clock stays on.
    pub fn control(&mut self, config: CounterConfig, preserve: Preserve) -> Result<(), ControlError> {
        if self.unlinked {
            return Err(ControlError::Busy("virtual counters were unlinked"));
        }

        let mut guard = match self.scheduled {
            Some(cpu) => Some(self.topology.enter(cpu)?),
            None => None,
        };
        if let Some(guard) = guard.as_mut() {
            guard.suspend(&mut self.session);
        }

        let preserve = if config.clock {
            preserve | Preserve::CLOCK
        } else {
            preserve
        };
        let result =
            self.session
                .update_control_preserving(&**self.topology.backend(), config, preserve);
        if result.is_ok() {
            self.iresume_status = None;
        }

        if let Some(guard) = guard.as_mut() {
            guard.resume(&mut self.session);
            self.sample_countdown = SAMPLE_PERIOD_TICKS;
        }
        result
    }

    /// The overflow interrupt arrived on the task's CPU.
    pub fn overflow(&mut self) -> Result<Option<OverflowSignal>, ControlError> {
        let Some(cpu) = self.scheduled else {
            warn!("VirtualCounters::overflow: task is not running");
            return Ok(None);
        };

        let topology = Arc::clone(&self.topology);
        let mut guard = topology.enter(cpu)?;
        guard.suspend(&mut self.session);
        Ok(self.handle_overflow(&mut guard))
    }

    fn handle_overflow(&mut self, guard: &mut CpuGuard<'_>) -> Option<OverflowSignal> {
        let overflowed = match guard.identify_overflow(&mut self.session) {
            Ok(overflowed) if !overflowed.is_empty() => overflowed,
            // Either way the sample is dropped and counting goes on.
            Ok(_) | Err(_) => {
                guard.resume(&mut self.session);
                return None;
            }
        };

        let status = self.session.status;
        self.iresume_status = Some(status);
        self.session.status = if status.has_clock() {
            Status::clock_only()
        } else {
            Status::NONE
        };
        guard.resume(&mut self.session);
        self.sample_countdown = SAMPLE_PERIOD_TICKS;

        debug!(
            "VirtualCounters::handle_overflow: cpu {} counters {:?}",
            guard.cpu(),
            overflowed.slots()
        );
        Some(OverflowSignal {
            signo: self.signo,
            pmc_mask: overflowed.counter_mask(),
            slots: overflowed.slots().into(),
        })
    }

    /// Turns the interrupt counters back on after an overflow was handled.
    pub fn iresume(&mut self) -> Result<(), ControlError> {
        let status = match self.iresume_status {
            Some(status) if status.has_interrupt_counters() => status,
            _ => return Err(ControlError::Busy("no overflow to resume from")),
        };

        let mut guard = match self.scheduled {
            Some(cpu) => Some(self.topology.enter(cpu)?),
            None => None,
        };
        if let Some(guard) = guard.as_mut() {
            guard.suspend(&mut self.session);
        }

        self.session.status = status;
        self.iresume_status = None;
        ireload(&**self.topology.backend(), &mut self.session);

        if let Some(guard) = guard.as_mut() {
            guard.resume(&mut self.session);
            self.sample_countdown = SAMPLE_PERIOD_TICKS;
        }
        Ok(())
    }

    /// Stops counting for good. The sums stay readable.
    pub fn unlink(&mut self) -> Result<(), ControlError> {
        self.switch_out()?;
        self.session.status = Status::NONE;
        self.iresume_status = None;
        self.unlinked = true;
        Ok(())
    }

    /// The task called exec.
    pub fn exec(&mut self) -> Result<(), ControlError> {
        if self.close_on_exec {
            self.unlink()?;
        }
        Ok(())
    }

    pub fn read(&mut self) -> Result<CounterSnapshot, ControlError> {
        if let Some(cpu) = self.scheduled {
            self.topology.enter(cpu)?.sample(&mut self.session);
        }
        Ok(self.session.snapshot())
    }
}

impl Drop for VirtualCounters {
    fn drop(&mut self) {
        if let Err(e) = self.switch_out() {
            error!("VirtualCounters::drop: {}", e);
        }
    }
}
