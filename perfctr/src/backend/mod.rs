//! Per-architecture counter hardware.
//!
//! Everything architecture specific sits behind two traits:
//!
//! * [`RegisterAccess`] reads and writes numbered registers on one CPU. The
//!   numbering is whatever the backend uses: MSR addresses on x86, SPR
//!   numbers on PowerPC, coprocessor 14 indices on XScale. Implementations
//!   range from the native MSR device to the simulated register file in
//!   [`testing_common`](crate::testing_common).
//! * [`Backend`] knows the register layout of one counter family. It
//!   validates configurations, derives the control values to program and
//!   pushes them through a [`RegisterAccess`].
//!
//! A backend is picked once, usually with [`by_name`], and shared as an
//! `Arc<dyn Backend>` by the whole topology.
//!
//! [`HwControl`] is the tagged bundle of control values. The same type is used
//! for a session's derived control and for a CPU cache's shadow copy, so a
//! backend can compare the two field by field and only write what differs.

use std::error::Error;
use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::config::{CounterConfig, InterruptSpec};
use crate::error::ControlError;
use crate::status::Status;

pub mod ppc;
pub mod x86;
pub mod xscale;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub mod native;

pub use self::ppc::{Ppc, PpcControl, PpcModel};
pub use self::x86::{X86, X86Control, X86Model};
pub use self::xscale::{XScale, XScaleControl, XScaleModel};

/// Raw register access on one CPU.
///
/// Implementations must not block and must be callable with interrupts
/// disabled. Registers are at most 64 bits wide; narrower registers ignore
/// the upper bits on write and return zeros there on read.
pub trait RegisterAccess: Send {
    fn read(&self, reg: u32) -> u64;
    fn write(&self, reg: u32, value: u64);
}

impl<R: RegisterAccess + Sync + ?Sized> RegisterAccess for Arc<R> {
    #[inline]
    fn read(&self, reg: u32) -> u64 {
        (**self).read(reg)
    }

    #[inline]
    fn write(&self, reg: u32, value: u64) {
        (**self).write(reg, value)
    }
}

bitflags! {
    /// Capabilities of the counter hardware.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Counters can be read from user mode.
        const RDPMC = 1 << 0;
        /// A free-running clock is available.
        const RDTSC = 1 << 1;
        /// Counter overflow raises an interrupt that can be caught.
        const PCINT = 1 << 2;
    }
}

/// What an overflow interrupt with no overflowed interrupt counter means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnidentifiedOverflow {
    /// A lost race or a hardware bug. Logged and reported to the caller.
    Report,
    /// The hardware raises such interrupts as a matter of course (for
    /// example a time base bit flip), so they are quietly ignored.
    Expected,
}

/// Control values a session wants in hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwControl {
    /// Nothing to program yet.
    None,
    X86(X86Control),
    Ppc(PpcControl),
    XScale(XScaleControl),
    /// One selector register per physical counter, indexed by slot.
    Selectors(SmallVec<[u64; 8]>),
}

impl Default for HwControl {
    fn default() -> HwControl {
        HwControl::None
    }
}

/// Output of [`Backend::check_control`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Derived {
    pub control: HwControl,
    /// Architecture fixups, carried in [`Status::quirks`]. Nonzero quirks
    /// make every suspend call [`Backend::quiesce`] and every resume bypass
    /// the generation check.
    pub quirks: u32,
}

impl Derived {
    pub fn new(control: HwControl) -> Derived {
        Derived { control, quirks: 0 }
    }
}

/// One performance counter family.
///
/// Methods taking `slots` receive the hardware slots of the session's
/// interrupt counters, in configuration order.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn features(&self) -> Features;

    /// Number of physical counters, not counting the clock.
    fn nr_counters(&self) -> usize;

    /// Checks a configuration against the hardware rules and derives the
    /// control values to program. Never touches hardware.
    fn check_control(&self, config: &CounterConfig) -> Result<Derived, ControlError>;

    /// Checks that an interrupt counter's reload value leads to an
    /// overflow. Counters interrupt when they wrap past the sign bit, so the
    /// reload must be negative.
    fn check_reload(&self, spec: &InterruptSpec) -> Result<(), ControlError> {
        if (spec.reload as i32) < 0 {
            Ok(())
        } else {
            Err(ControlError::InvalidReload {
                slot: spec.counter.slot,
                reload: spec.reload,
            })
        }
    }

    /// Whether a raw counter value shows that the counter has overflowed
    /// since it was loaded with a valid reload value.
    fn counter_signals_overflow(&self, raw: u32) -> bool {
        (raw as i32) >= 0
    }

    fn unidentified_overflow(&self) -> UnidentifiedOverflow {
        UnidentifiedOverflow::Report
    }

    /// Whether active counters can raise the overflow interrupt too. Such
    /// counters are force-sampled and cleared while identifying an overflow.
    fn shared_overflow_interrupt(&self) -> bool {
        false
    }

    /// A shadow that differs from every control value the backend accepts,
    /// for a cache that knows nothing about the hardware. Fields that must
    /// never be written on parts lacking them hold the zero their control
    /// counterparts always have there.
    fn invalid_shadow(&self) -> HwControl;

    /// Writes every field of `control` that differs from `shadow`, limited
    /// to the counters `status` enables, and updates `shadow` to match.
    /// Returns the number of register writes.
    fn write_control(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        status: Status,
    ) -> usize;

    fn read_clock(&self, regs: &dyn RegisterAccess) -> u32;

    /// Reads the low 32 bits of the counter in `slot`.
    fn read_counter(&self, regs: &dyn RegisterAccess, slot: u32) -> u32;

    fn write_counter(&self, regs: &dyn RegisterAccess, slot: u32, value: u32);

    /// All physical counter registers, for clearing and for simulation.
    fn counter_registers(&self) -> SmallVec<[u32; 8]>;

    /// The clock register, if the clock lives in a register at all.
    fn clock_register(&self) -> Option<u32>;

    fn mask_interrupts(&self, _regs: &dyn RegisterAccess) {}

    fn unmask_interrupts(&self, _regs: &dyn RegisterAccess) {}

    /// Stops the interrupt counters before they are read on an interrupt
    /// suspend, keeping `shadow` in step with what is written.
    fn stop_counters(
        &self,
        _regs: &dyn RegisterAccess,
        _shadow: &mut HwControl,
        _control: &HwControl,
        _slots: &[u32],
    ) {
    }

    /// Disables whatever selectors another session left programmed before
    /// the interrupt counters are reloaded, so the reload cannot be counted
    /// or trigger a stray overflow.
    fn disarm_counters(
        &self,
        _regs: &dyn RegisterAccess,
        _shadow: &mut HwControl,
        _control: &HwControl,
        _slots: &[u32],
    ) {
    }

    /// Freezes all counters at the start of a suspend. Only called when the
    /// session's status carries quirks.
    fn quiesce(
        &self,
        _regs: &dyn RegisterAccess,
        _shadow: &mut HwControl,
        _control: &mut HwControl,
    ) {
    }

    /// Re-arms overflow interrupts in a session's control just before an
    /// interrupt reload.
    fn rearm(&self, _control: &mut HwControl) {}

    /// Tidies up after overflow identification. `used` holds the slots of
    /// every counter the session uses.
    fn after_overflow(&self, _regs: &dyn RegisterAccess, _used: &[u32]) {}

    /// Resets every control register and then every counter register.
    /// `init` is true when the hardware is being acquired, false when it is
    /// handed back.
    fn clear_counters(&self, regs: &dyn RegisterAccess, init: bool);
}

/// Every name [`by_name`] accepts.
pub const NAMES: &[&str] = &[
    "p6", "core2", "nehalem", "westmere", "k7", "fam10h", "generic", "ppc604", "ppc604e",
    "ppc750", "ppc7400", "ppc7450", "power", "xsc1", "xsc2",
];

/// Looks up a backend by the name of its counter family.
pub fn by_name(name: &str) -> Result<Arc<dyn Backend>, Box<dyn Error + Send + Sync>> {
    let backend: Arc<dyn Backend> = match name {
        "p6" => Arc::new(X86::new(X86Model::P6)),
        "core2" => Arc::new(X86::new(X86Model::Core2)),
        "nehalem" => Arc::new(X86::new(X86Model::Nehalem)),
        "westmere" => Arc::new(X86::new(X86Model::Westmere)),
        "k7" => Arc::new(X86::new(X86Model::K7)),
        "fam10h" => Arc::new(X86::new(X86Model::Fam10h)),
        "generic" => Arc::new(X86::new(X86Model::Generic)),
        "ppc604" => Arc::new(Ppc::new(PpcModel::Ppc604)),
        "ppc604e" => Arc::new(Ppc::new(PpcModel::Ppc604e)),
        "ppc750" => Arc::new(Ppc::new(PpcModel::Ppc750)),
        "ppc7400" => Arc::new(Ppc::new(PpcModel::Ppc7400)),
        "ppc7450" => Arc::new(Ppc::new(PpcModel::Ppc7450)),
        "power" => Arc::new(Ppc::new(PpcModel::Power)),
        "xsc1" => Arc::new(XScale::new(XScaleModel::Xsc1)),
        "xsc2" => Arc::new(XScale::new(XScaleModel::Xsc2)),
        _ => {
            return Err(format!(
                "unknown counter family `{}`, expected one of: {}",
                name,
                NAMES.join(", ")
            )
            .into())
        }
    };

    info!(
        "backend::by_name: selected {} ({} counters, features {:?})",
        backend.name(),
        backend.nr_counters(),
        backend.features()
    );

    Ok(backend)
}

/// Validates slot numbers the way every simple family does: each slot below
/// `nr_pmcs`, none used twice. Returns the mask of used slots.
pub(crate) fn check_slots(config: &CounterConfig, nr_pmcs: usize) -> Result<u32, ControlError> {
    let nrctrs = config.nr_counters();
    if nrctrs > nr_pmcs {
        return Err(ControlError::TooManyCounters {
            requested: nrctrs,
            available: nr_pmcs,
        });
    }

    let mut pmc_mask = 0u32;
    for spec in config.counters() {
        let slot = spec.slot;
        if slot as usize >= nr_pmcs || pmc_mask & (1 << slot) != 0 {
            return Err(ControlError::InvalidSlot { slot });
        }
        pmc_mask |= 1 << slot;
    }

    Ok(pmc_mask)
}

/// Writes `value` to `reg` if it differs from the shadowed copy.
#[inline]
pub(crate) fn write_if_changed<T>(
    regs: &dyn RegisterAccess,
    reg: u32,
    shadow: &mut T,
    value: T,
    writes: &mut usize,
) where
    T: Copy + PartialEq + Into<u64>,
{
    if *shadow != value {
        *shadow = value;
        regs.write(reg, value.into());
        *writes += 1;
    }
}
