//! Intel P6 and its descendants, and the AMD K7 family.
//!
//! All of these share the P6 event select layout: one EVNTSEL MSR per
//! general purpose counter with an ENable bit, a CPL field and an INT bit.
//! The differences that matter here:
//!
//! * P6 has a single global ENable bit in EVNTSEL0. Everything newer, and
//!   every AMD part, has one per counter.
//! * Core 2 and later add fixed-function counters, selected with slot
//!   `FIXED_FLAG | n` and programmed through one shared control MSR.
//! * Nehalem adds the off-core response matrix MSRs.
//! * AMD Family 10h widens EVNTSEL to 64 bits.
//!
//! The generic model has no counters at all, only the time stamp counter.

use smallvec::SmallVec;

use super::{write_if_changed, Backend, Derived, Features, HwControl, RegisterAccess};
use crate::config::{ArchExtras, CounterConfig};
use crate::error::ControlError;
use crate::status::Status;

pub const MSR_TSC: u32 = 0x10;
pub const MSR_P6_PERFCTR0: u32 = 0xC1;
pub const MSR_P6_EVNTSEL0: u32 = 0x186;
pub const MSR_OFFCORE_RSP0: u32 = 0x1A6;
pub const MSR_DEBUGCTL: u32 = 0x1D9;
pub const MSR_FIXED_CTR0: u32 = 0x309;
pub const MSR_FIXED_CTR_CTRL: u32 = 0x38D;
pub const MSR_GLOBAL_CTRL: u32 = 0x38F;
/// The local APIC performance counter LVT entry, in its x2APIC MSR form.
pub const MSR_APIC_LVTPC: u32 = 0x834;
pub const MSR_K7_EVNTSEL0: u32 = 0xC001_0000;
pub const MSR_K7_PERFCTR0: u32 = 0xC001_0004;

pub const EVNTSEL_ENABLE: u32 = 0x0040_0000;
pub const EVNTSEL_INT: u32 = 0x0010_0000;
pub const EVNTSEL_CPL: u32 = 0x0003_0000;
pub const EVNTSEL_RESERVED: u32 = 0x0028_0000;

/// Slot flag selecting a fixed-function counter.
pub const FIXED_FLAG: u32 = 1 << 30;
const FIXED_MASK: u32 = 0x3;
const FIXED_CTR_CTRL_PMIANY: u32 = 0x0000_0888;

const FAM10H_EVNTSEL_HIGH_RESERVED: u32 = !0x30F;
const OFFCORE_RSP_RESERVED: u32 = !0xF7FF;
const DEBUGCTL_FREEZE_PERFMON_ON_PMI: u64 = 1 << 12;

const LOCAL_PERFCTR_VECTOR: u64 = 0xEE;
const APIC_LVT_MASKED: u64 = 1 << 16;
const APIC_DM_NMI: u64 = 0x400;

/// Upper bound on general purpose counters in any model.
pub const MAX_PMCS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum X86Model {
    P6,
    Core2,
    Nehalem,
    Westmere,
    K7,
    Fam10h,
    Generic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X86Control {
    /// Slots in configuration order.
    pub map: SmallVec<[u32; 8]>,
    /// Indexed by physical counter.
    pub evntsel: [u32; MAX_PMCS],
    pub evntsel_high: [u32; MAX_PMCS],
    pub fixed_ctr_ctrl: u32,
    pub offcore_rsp: [u32; 2],
}

impl X86Control {
    fn empty() -> X86Control {
        X86Control {
            map: SmallVec::new(),
            evntsel: [0; MAX_PMCS],
            evntsel_high: [0; MAX_PMCS],
            fixed_ctr_ctrl: 0,
            offcore_rsp: [0; 2],
        }
    }

    fn invalid() -> X86Control {
        X86Control {
            map: SmallVec::new(),
            evntsel: [!0; MAX_PMCS],
            evntsel_high: [!0; MAX_PMCS],
            // Must look already written, since parts without these MSRs
            // fault when they are accessed.
            fixed_ctr_ctrl: 0,
            offcore_rsp: [0; 2],
        }
    }
}

pub struct X86 {
    model: X86Model,
    nr_pmcs: u32,
    nr_ffcs: u32,
    nr_offcore_rsps: usize,
    separate_enables: bool,
    k7: bool,
}

impl X86 {
    pub fn new(model: X86Model) -> X86 {
        let (nr_pmcs, nr_ffcs, nr_offcore_rsps, separate_enables, k7) = match model {
            X86Model::P6 => (2, 0, 0, false, false),
            X86Model::Core2 => (2, 3, 0, true, false),
            X86Model::Nehalem => (4, 3, 1, true, false),
            X86Model::Westmere => (4, 3, 2, true, false),
            X86Model::K7 | X86Model::Fam10h => (4, 0, 0, true, true),
            X86Model::Generic => (0, 0, 0, false, false),
        };

        X86 {
            model,
            nr_pmcs,
            nr_ffcs,
            nr_offcore_rsps,
            separate_enables,
            k7,
        }
    }

    pub fn model(&self) -> X86Model {
        self.model
    }

    fn evntsel0(&self) -> u32 {
        if self.k7 {
            MSR_K7_EVNTSEL0
        } else {
            MSR_P6_EVNTSEL0
        }
    }

    fn perfctr0(&self) -> u32 {
        if self.k7 {
            MSR_K7_PERFCTR0
        } else {
            MSR_P6_PERFCTR0
        }
    }

    fn max_counters(&self) -> u32 {
        if self.k7 {
            self.nr_pmcs
        } else {
            self.nr_pmcs + self.nr_ffcs
        }
    }

    #[inline]
    fn is_fixed(&self, slot: u32) -> bool {
        self.nr_ffcs != 0 && slot & FIXED_FLAG != 0
    }

    fn counter_msr(&self, slot: u32) -> u32 {
        if self.is_fixed(slot) {
            MSR_FIXED_CTR0 + (slot & FIXED_MASK)
        } else {
            self.perfctr0() + slot
        }
    }

    fn check_evntsel(
        &self,
        slot: u32,
        pmc: u32,
        evntsel: u32,
        interrupt: bool,
    ) -> Result<(), ControlError> {
        if evntsel & EVNTSEL_RESERVED != 0 {
            return Err(ControlError::ReservedBitsSet {
                slot: Some(slot),
                bits: u64::from(evntsel & EVNTSEL_RESERVED),
            });
        }

        if self.separate_enables {
            if evntsel & EVNTSEL_ENABLE == 0 {
                return Err(ControlError::Incompatible {
                    slot,
                    reason: "every counter needs its enable bit",
                });
            }
        } else if evntsel & EVNTSEL_ENABLE != 0 {
            if pmc > 0 {
                return Err(ControlError::ReservedBitsSet {
                    slot: Some(slot),
                    bits: u64::from(EVNTSEL_ENABLE),
                });
            }
        } else if pmc == 0 {
            return Err(ControlError::Incompatible {
                slot,
                reason: "counter 0 carries the global enable bit",
            });
        }

        if evntsel & EVNTSEL_CPL == 0 {
            return Err(ControlError::Incompatible {
                slot,
                reason: "the CPL field must be non-zero",
            });
        }

        match (evntsel & EVNTSEL_INT != 0, interrupt) {
            (true, false) => Err(ControlError::Incompatible {
                slot,
                reason: "active counters must not raise interrupts",
            }),
            (false, true) => Err(ControlError::Incompatible {
                slot,
                reason: "interrupt counters need the INT bit",
            }),
            _ => Ok(()),
        }
    }
}

impl Backend for X86 {
    fn name(&self) -> &'static str {
        match self.model {
            X86Model::P6 => "Intel P6",
            X86Model::Core2 => "Intel Core 2",
            X86Model::Nehalem => "Intel Nehalem",
            X86Model::Westmere => "Intel Westmere",
            X86Model::K7 => "AMD K7/K8",
            X86Model::Fam10h => "AMD Family 10h",
            X86Model::Generic => "Generic x86 with TSC",
        }
    }

    fn features(&self) -> Features {
        match self.model {
            X86Model::Generic => Features::RDTSC,
            _ => Features::RDPMC | Features::RDTSC | Features::PCINT,
        }
    }

    fn nr_counters(&self) -> usize {
        self.max_counters() as usize
    }

    fn check_control(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        let nractrs = config.active.len();
        let nrctrs = config.nr_counters();
        let max_nrctrs = self.max_counters();
        if nrctrs > max_nrctrs as usize {
            return Err(ControlError::TooManyCounters {
                requested: nrctrs,
                available: max_nrctrs as usize,
            });
        }

        let mut control = X86Control::empty();
        let mut pmc_mask = 0u32;
        for (i, spec) in config.counters().enumerate() {
            let slot = spec.slot;
            let fixed = self.is_fixed(slot);
            // Fixed counter N is checked as physical counter nr_pmcs + N.
            let pmc = if fixed {
                self.nr_pmcs + (slot & !FIXED_FLAG)
            } else {
                slot
            };
            if !fixed && !self.k7 && self.nr_ffcs != 0 && slot >= self.nr_pmcs {
                return Err(ControlError::InvalidSlot { slot });
            }
            if pmc >= max_nrctrs || pmc_mask & (1 << pmc) != 0 {
                return Err(ControlError::InvalidSlot { slot });
            }
            pmc_mask |= 1 << pmc;

            let evntsel = spec.selector as u32;
            let mut evntsel_high = (spec.selector >> 32) as u32;
            if self.model == X86Model::Fam10h {
                if evntsel_high & FAM10H_EVNTSEL_HIGH_RESERVED != 0 {
                    return Err(ControlError::ReservedBitsSet {
                        slot: Some(slot),
                        bits: u64::from(evntsel_high & FAM10H_EVNTSEL_HIGH_RESERVED) << 32,
                    });
                }
            } else {
                evntsel_high = 0;
            }

            self.check_evntsel(slot, pmc, evntsel, i >= nractrs)?;

            if fixed {
                let ctl = ((evntsel >> 17) & 1) // CPL.OS
                    | (((evntsel >> 16) & 1) << 1) // CPL.USR
                    | (((evntsel >> 20) & 1) << 3); // INT
                control.fixed_ctr_ctrl |= ctl << ((slot & FIXED_MASK) * 4);
            } else {
                control.evntsel[pmc as usize] = evntsel;
                control.evntsel_high[pmc as usize] = evntsel_high;
            }
            control.map.push(slot);
        }

        // Parts without the off-core response MSRs get zeros, which the
        // cache never writes.
        let offcore_rsp = match config.extras {
            ArchExtras::None => [0; 2],
            ArchExtras::X86 { offcore_rsp } => offcore_rsp,
            ArchExtras::Ppc { .. } | ArchExtras::Power { .. } => {
                return Err(ControlError::Unsupported(
                    "PowerPC control words on an x86 counter family",
                ))
            }
        };
        for (i, &value) in offcore_rsp.iter().enumerate().take(self.nr_offcore_rsps) {
            if value & OFFCORE_RSP_RESERVED != 0 {
                return Err(ControlError::ReservedBitsSet {
                    slot: None,
                    bits: u64::from(value & OFFCORE_RSP_RESERVED),
                });
            }
            control.offcore_rsp[i] = value;
        }

        Ok(Derived::new(HwControl::X86(control)))
    }

    fn invalid_shadow(&self) -> HwControl {
        HwControl::X86(X86Control::invalid())
    }

    fn write_control(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        status: Status,
    ) -> usize {
        let (HwControl::X86(shadow), HwControl::X86(control)) = (shadow, control) else {
            return 0;
        };

        let mut writes = 0;
        for &slot in control.map.iter().take(status.nr_counters()) {
            let pmc = slot as usize;
            if self.is_fixed(slot) || pmc >= MAX_PMCS {
                continue;
            }
            let evntsel = control.evntsel[pmc];
            let evntsel_high = control.evntsel_high[pmc];
            if evntsel != shadow.evntsel[pmc] || evntsel_high != shadow.evntsel_high[pmc] {
                shadow.evntsel[pmc] = evntsel;
                shadow.evntsel_high[pmc] = evntsel_high;
                regs.write(
                    self.evntsel0() + slot,
                    (u64::from(evntsel_high) << 32) | u64::from(evntsel),
                );
                writes += 1;
            }
        }

        if status.nr_counters() != 0
            && control.fixed_ctr_ctrl != 0
            && control.fixed_ctr_ctrl != shadow.fixed_ctr_ctrl
        {
            shadow.fixed_ctr_ctrl = control.fixed_ctr_ctrl;
            regs.write(MSR_FIXED_CTR_CTRL, u64::from(control.fixed_ctr_ctrl));
            writes += 1;
        }

        for i in 0..2 {
            write_if_changed(
                regs,
                MSR_OFFCORE_RSP0 + i as u32,
                &mut shadow.offcore_rsp[i],
                control.offcore_rsp[i],
                &mut writes,
            );
        }

        writes
    }

    fn read_clock(&self, regs: &dyn RegisterAccess) -> u32 {
        regs.read(MSR_TSC) as u32
    }

    fn read_counter(&self, regs: &dyn RegisterAccess, slot: u32) -> u32 {
        regs.read(self.counter_msr(slot)) as u32
    }

    fn write_counter(&self, regs: &dyn RegisterAccess, slot: u32, value: u32) {
        // Fixed counters are 40 bits wide and fault on anything above.
        let high: u64 = if self.is_fixed(slot) { 0xFF } else { 0xFFFF_FFFF };
        regs.write(self.counter_msr(slot), (high << 32) | u64::from(value));
    }

    fn counter_registers(&self) -> SmallVec<[u32; 8]> {
        let mut regs: SmallVec<[u32; 8]> =
            (0..self.nr_pmcs).map(|pmc| self.perfctr0() + pmc).collect();
        if !self.k7 {
            regs.extend((0..self.nr_ffcs).map(|n| MSR_FIXED_CTR0 + n));
        }
        regs
    }

    fn clock_register(&self) -> Option<u32> {
        Some(MSR_TSC)
    }

    fn mask_interrupts(&self, regs: &dyn RegisterAccess) {
        regs.write(MSR_APIC_LVTPC, LOCAL_PERFCTR_VECTOR | APIC_LVT_MASKED);
    }

    fn unmask_interrupts(&self, regs: &dyn RegisterAccess) {
        regs.write(MSR_APIC_LVTPC, LOCAL_PERFCTR_VECTOR);
    }

    fn stop_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        slots: &[u32],
    ) {
        let (HwControl::X86(shadow), HwControl::X86(control)) = (shadow, control) else {
            return;
        };

        if control.fixed_ctr_ctrl & FIXED_CTR_CTRL_PMIANY != 0 {
            shadow.fixed_ctr_ctrl = 0;
            regs.write(MSR_FIXED_CTR_CTRL, 0);
        }
        for &slot in slots {
            let pmc = slot as usize;
            if self.is_fixed(slot) || pmc >= MAX_PMCS {
                continue;
            }
            shadow.evntsel[pmc] = 0;
            shadow.evntsel_high[pmc] = 0;
            regs.write(self.evntsel0() + slot, 0);
        }
    }

    fn disarm_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        slots: &[u32],
    ) {
        let (HwControl::X86(shadow), HwControl::X86(control)) = (shadow, control) else {
            return;
        };

        if control.fixed_ctr_ctrl & FIXED_CTR_CTRL_PMIANY != 0 && shadow.fixed_ctr_ctrl != 0 {
            shadow.fixed_ctr_ctrl = 0;
            regs.write(MSR_FIXED_CTR_CTRL, 0);
        }
        for &slot in slots {
            let pmc = slot as usize;
            if self.is_fixed(slot) || pmc >= MAX_PMCS {
                continue;
            }
            if shadow.evntsel[pmc] != 0 {
                shadow.evntsel[pmc] = 0;
                shadow.evntsel_high[pmc] = 0;
                regs.write(self.evntsel0() + slot, 0);
            }
        }
    }

    fn clear_counters(&self, regs: &dyn RegisterAccess, init: bool) {
        // Event selects go first so nothing counts while the counters are
        // being zeroed.
        for pmc in 0..self.nr_pmcs {
            regs.write(self.evntsel0() + pmc, 0);
        }
        if self.nr_ffcs != 0 {
            for n in 0..self.nr_ffcs {
                regs.write(MSR_FIXED_CTR0 + n, 0);
            }
            regs.write(MSR_FIXED_CTR_CTRL, 0);
        }
        for i in 0..self.nr_offcore_rsps {
            regs.write(MSR_OFFCORE_RSP0 + i as u32, 0);
        }
        for pmc in 0..self.nr_pmcs {
            regs.write(self.perfctr0() + pmc, 0);
        }

        if self.nr_ffcs != 0 && init {
            let debugctl = regs.read(MSR_DEBUGCTL) & !DEBUGCTL_FREEZE_PERFMON_ON_PMI;
            regs.write(MSR_DEBUGCTL, debugctl);
            let enables =
                (((1u64 << self.nr_ffcs) - 1) << 32) | ((1u64 << self.nr_pmcs) - 1);
            regs.write(MSR_GLOBAL_CTRL, enables);
        }

        if self.features().contains(Features::PCINT) {
            if init {
                regs.write(MSR_APIC_LVTPC, LOCAL_PERFCTR_VECTOR);
            } else {
                regs.write(MSR_APIC_LVTPC, APIC_DM_NMI | APIC_LVT_MASKED);
            }
        }
    }
}
