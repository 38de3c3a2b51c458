//! PowerPC 604 through 7450, and 64-bit POWER.
//!
//! The 32-bit parts pack every counter's event selector into MMCR0 and
//! MMCR1, so a configuration is validated per slot and then folded into
//! those words. POWER leaves event selection to the caller, who hands over
//! complete MMCR0, MMCR1 and MMCRA values.
//!
//! Counters interrupt when bit 31 becomes set, so unlike x86 an overflowed
//! counter reads negative and reload values must be non-negative.

use smallvec::SmallVec;

use super::{
    check_slots, write_if_changed, Backend, Derived, Features, HwControl, RegisterAccess,
    UnidentifiedOverflow,
};
use crate::config::{ArchExtras, CounterConfig, InterruptSpec};
use crate::error::ControlError;
use crate::status::Status;

pub const SPRN_MMCR2: u32 = 944;
pub const SPRN_PMC5: u32 = 945;
pub const SPRN_PMC6: u32 = 946;
pub const SPRN_MMCR0: u32 = 952;
pub const SPRN_PMC1: u32 = 953;
pub const SPRN_PMC2: u32 = 954;
pub const SPRN_MMCR1: u32 = 956;
pub const SPRN_PMC3: u32 = 957;
pub const SPRN_PMC4: u32 = 958;
pub const SPRN_TBL: u32 = 268;

pub const SPRN_POWER_MMCRA: u32 = 786;
pub const SPRN_POWER_PMC1: u32 = 787;
pub const SPRN_POWER_MMCR0: u32 = 795;
pub const SPRN_POWER_MMCR1: u32 = 798;

pub const MMCR0_FC: u32 = 0x8000_0000;
pub const MMCR0_PMXE: u32 = 0x0400_0000;
pub const MMCR0_FCECE: u32 = 0x0200_0000;
pub const MMCR0_TBEE: u32 = 0x0040_0000;
pub const MMCR0_TRIGGER: u32 = 0x0000_2000;
pub const MMCR0_PMAO: u32 = 0x0000_0080;
const MMCR0_PMC1SEL: u32 = 0x0000_1FC0;
const MMCR0_PMC2SEL: u32 = 0x0000_003F;
const MMCR0_RESERVED: u32 = MMCR0_PMC1SEL | MMCR0_PMC2SEL;
/// Only the threshold multiplier is user controlled.
const MMCR2_RESERVED: u32 = 0x7FFF_FFFF;

/// The session's MMCR0 has bits that must be frozen and saved on suspend.
pub const QUIRK_MMCR0: u32 = 1 << 0;

const PMC_SPRNS: [u32; 6] = [
    SPRN_PMC1, SPRN_PMC2, SPRN_PMC3, SPRN_PMC4, SPRN_PMC5, SPRN_PMC6,
];
const PMC_MAX_EVENT: [u64; 6] = [127, 63, 31, 31, 31, 63];
const POWER_NR_PMCS: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PpcModel {
    Ppc604,
    Ppc604e,
    Ppc750,
    Ppc7400,
    Ppc7450,
    Power,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpcControl {
    pub mmcr0: u32,
    pub mmcr1: u64,
    pub mmcr2: u32,
    pub mmcra: u64,
}

pub struct Ppc {
    model: PpcModel,
}

impl Ppc {
    pub fn new(model: PpcModel) -> Ppc {
        Ppc { model }
    }

    pub fn model(&self) -> PpcModel {
        self.model
    }

    fn is_power(&self) -> bool {
        self.model == PpcModel::Power
    }

    fn nr_pmcs(&self) -> u32 {
        match self.model {
            PpcModel::Ppc604 => 2,
            PpcModel::Ppc604e | PpcModel::Ppc750 | PpcModel::Ppc7400 => 4,
            PpcModel::Ppc7450 => 6,
            PpcModel::Power => POWER_NR_PMCS,
        }
    }

    fn has_mmcr1(&self) -> bool {
        self.model != PpcModel::Ppc604
    }

    fn has_mmcr2(&self) -> bool {
        matches!(self.model, PpcModel::Ppc7400 | PpcModel::Ppc7450)
    }

    fn mmcr0_sprn(&self) -> u32 {
        if self.is_power() {
            SPRN_POWER_MMCR0
        } else {
            SPRN_MMCR0
        }
    }

    fn mmcr1_sprn(&self) -> u32 {
        if self.is_power() {
            SPRN_POWER_MMCR1
        } else {
            SPRN_MMCR1
        }
    }

    fn pmc_sprn(&self, slot: u32) -> u32 {
        if self.is_power() {
            SPRN_POWER_PMC1 + slot
        } else {
            debug_assert!(
                (slot as usize) < PMC_SPRNS.len(),
                "unchecked pmc slot {}",
                slot
            );
            PMC_SPRNS[slot as usize]
        }
    }

    fn check_ppc32(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        let nractrs = config.active.len();
        let pmc_mask = check_slots(config, self.nr_pmcs() as usize)?;

        let mut evntsel = [0u32; 6];
        let mut pmi_mask = 0u32;
        for (i, spec) in config.counters().enumerate() {
            let slot = spec.slot;
            if i >= nractrs {
                pmi_mask |= 1 << slot;
            }
            if spec.selector > PMC_MAX_EVENT[slot as usize] {
                return Err(ControlError::Incompatible {
                    slot,
                    reason: "event number out of range for this counter",
                });
            }
            evntsel[slot as usize] = spec.selector as u32;
        }

        // PMC2 and up share one interrupt enable bit.
        let shared_pmi = pmi_mask & !1;
        if shared_pmi != 0 && shared_pmi != pmc_mask & !1 {
            let slot = (pmc_mask & !1 & !pmi_mask).trailing_zeros();
            return Err(ControlError::Incompatible {
                slot,
                reason: "PMC2 and up must all interrupt or all count",
            });
        }

        let (mmcr0, mmcr2) = match config.extras {
            ArchExtras::None => (0, 0),
            ArchExtras::Ppc { mmcr0, mmcr2 } => (mmcr0, mmcr2),
            ArchExtras::X86 { .. } | ArchExtras::Power { .. } => {
                return Err(ControlError::Unsupported(
                    "foreign control words on a 32-bit PowerPC",
                ))
            }
        };

        if mmcr2 != 0 {
            let reserved = if self.has_mmcr2() {
                mmcr2 & MMCR2_RESERVED
            } else {
                mmcr2
            };
            if reserved != 0 {
                return Err(ControlError::ReservedBitsSet {
                    slot: None,
                    bits: u64::from(reserved),
                });
            }
        }

        if mmcr0 & MMCR0_PMXE != 0 && config.interrupt.is_empty() {
            return Err(ControlError::Unsupported(
                "MMCR0[PMXE] needs at least one interrupt counter",
            ));
        }
        if mmcr0 & MMCR0_RESERVED != 0 {
            return Err(ControlError::ReservedBitsSet {
                slot: None,
                bits: u64::from(mmcr0 & MMCR0_RESERVED),
            });
        }

        let control = PpcControl {
            mmcr0: mmcr0 | (evntsel[0] << 6) | evntsel[1],
            mmcr1: u64::from(
                (evntsel[2] << 27)
                    | (evntsel[3] << 22)
                    | (evntsel[4] << 17)
                    | (evntsel[5] << 11),
            ),
            mmcr2,
            mmcra: 0,
        };

        let mut derived = Derived::new(HwControl::Ppc(control));
        if mmcr0 & (MMCR0_PMXE | MMCR0_FCECE | MMCR0_TRIGGER) != 0 {
            derived.quirks = QUIRK_MMCR0;
        }
        Ok(derived)
    }

    fn check_power(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        check_slots(config, POWER_NR_PMCS as usize)?;

        for spec in config.counters() {
            if spec.selector != 0 {
                return Err(ControlError::Incompatible {
                    slot: spec.slot,
                    reason: "POWER events are selected through MMCR1",
                });
            }
        }

        let (mmcr0, mmcr1, mmcra) = match config.extras {
            ArchExtras::None => (0, 0, 0),
            ArchExtras::Power {
                mmcr0,
                mmcr1,
                mmcra,
            } => (mmcr0, mmcr1, mmcra),
            ArchExtras::X86 { .. } | ArchExtras::Ppc { .. } => {
                return Err(ControlError::Unsupported("foreign control words on POWER"))
            }
        };

        let owned = mmcr0 & (MMCR0_PMXE | MMCR0_PMAO | MMCR0_TBEE);
        if owned != 0 {
            return Err(ControlError::ReservedBitsSet {
                slot: None,
                bits: u64::from(owned),
            });
        }

        let control = PpcControl {
            mmcr0,
            mmcr1,
            mmcr2: 0,
            mmcra,
        };

        // MMCR0 is always saved and restored on POWER.
        Ok(Derived {
            control: HwControl::Ppc(control),
            quirks: QUIRK_MMCR0,
        })
    }
}

impl Backend for Ppc {
    fn name(&self) -> &'static str {
        match self.model {
            PpcModel::Ppc604 => "PowerPC 604",
            PpcModel::Ppc604e => "PowerPC 604e",
            PpcModel::Ppc750 => "PowerPC 750",
            PpcModel::Ppc7400 => "PowerPC 7400",
            PpcModel::Ppc7450 => "PowerPC 7450",
            PpcModel::Power => "POWER",
        }
    }

    fn features(&self) -> Features {
        Features::RDPMC | Features::RDTSC | Features::PCINT
    }

    fn nr_counters(&self) -> usize {
        self.nr_pmcs() as usize
    }

    fn check_control(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        if self.is_power() {
            self.check_power(config)
        } else {
            self.check_ppc32(config)
        }
    }

    fn check_reload(&self, spec: &InterruptSpec) -> Result<(), ControlError> {
        if (spec.reload as i32) < 0 {
            Err(ControlError::InvalidReload {
                slot: spec.counter.slot,
                reload: spec.reload,
            })
        } else {
            Ok(())
        }
    }

    fn counter_signals_overflow(&self, raw: u32) -> bool {
        (raw as i32) < 0
    }

    fn unidentified_overflow(&self) -> UnidentifiedOverflow {
        if self.is_power() {
            UnidentifiedOverflow::Expected
        } else {
            UnidentifiedOverflow::Report
        }
    }

    fn shared_overflow_interrupt(&self) -> bool {
        self.is_power()
    }

    fn invalid_shadow(&self) -> HwControl {
        HwControl::Ppc(PpcControl {
            mmcr0: !0,
            mmcr1: if self.has_mmcr1() { !0 } else { 0 },
            mmcr2: if self.has_mmcr2() { !0 } else { 0 },
            mmcra: if self.is_power() { !0 } else { 0 },
        })
    }

    fn write_control(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        status: Status,
    ) -> usize {
        let (HwControl::Ppc(shadow), HwControl::Ppc(control)) = (shadow, control) else {
            return 0;
        };

        let mut writes = 0;
        if self.is_power() {
            write_if_changed(
                regs,
                SPRN_POWER_MMCRA,
                &mut shadow.mmcra,
                control.mmcra,
                &mut writes,
            );
            write_if_changed(
                regs,
                SPRN_POWER_MMCR1,
                &mut shadow.mmcr1,
                control.mmcr1,
                &mut writes,
            );
            let mut mmcr0 = control.mmcr0;
            if status.has_interrupt_counters() {
                mmcr0 |= MMCR0_PMXE;
            }
            write_if_changed(
                regs,
                SPRN_POWER_MMCR0,
                &mut shadow.mmcr0,
                mmcr0,
                &mut writes,
            );
        } else {
            // MMCR0 goes last: it may unfreeze the counters.
            write_if_changed(
                regs,
                SPRN_MMCR2,
                &mut shadow.mmcr2,
                control.mmcr2,
                &mut writes,
            );
            write_if_changed(
                regs,
                SPRN_MMCR1,
                &mut shadow.mmcr1,
                control.mmcr1,
                &mut writes,
            );
            write_if_changed(
                regs,
                SPRN_MMCR0,
                &mut shadow.mmcr0,
                control.mmcr0,
                &mut writes,
            );
        }
        writes
    }

    fn read_clock(&self, regs: &dyn RegisterAccess) -> u32 {
        regs.read(SPRN_TBL) as u32
    }

    fn read_counter(&self, regs: &dyn RegisterAccess, slot: u32) -> u32 {
        regs.read(self.pmc_sprn(slot)) as u32
    }

    fn write_counter(&self, regs: &dyn RegisterAccess, slot: u32, value: u32) {
        regs.write(self.pmc_sprn(slot), u64::from(value));
    }

    fn counter_registers(&self) -> SmallVec<[u32; 8]> {
        (0..self.nr_pmcs()).map(|slot| self.pmc_sprn(slot)).collect()
    }

    fn clock_register(&self) -> Option<u32> {
        Some(SPRN_TBL)
    }

    fn disarm_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        _control: &HwControl,
        slots: &[u32],
    ) {
        let HwControl::Ppc(shadow) = shadow else {
            return;
        };

        if shadow.mmcr0 & MMCR0_FC == 0 {
            shadow.mmcr0 |= MMCR0_FC;
            regs.write(self.mmcr0_sprn(), u64::from(shadow.mmcr0));
        }
        // Counters not about to be reloaded go back to a non-overflowed state.
        for slot in (0..self.nr_pmcs()).filter(|slot| !slots.contains(slot)) {
            regs.write(self.pmc_sprn(slot), 0);
        }
    }

    fn quiesce(&self, regs: &dyn RegisterAccess, shadow: &mut HwControl, control: &mut HwControl) {
        let (HwControl::Ppc(shadow), HwControl::Ppc(control)) = (shadow, control) else {
            return;
        };

        if self.is_power() {
            regs.write(SPRN_POWER_MMCR0, u64::from(MMCR0_FC));
            shadow.mmcr0 = MMCR0_FC;
        } else {
            // Hardware may have cleared PMXE or set FC on its own; keep what
            // it says for the next resume.
            let mmcr0 = regs.read(SPRN_MMCR0) as u32;
            regs.write(SPRN_MMCR0, u64::from(mmcr0 | MMCR0_FC));
            shadow.mmcr0 = mmcr0 | MMCR0_FC;
            control.mmcr0 = mmcr0;
        }
    }

    fn rearm(&self, control: &mut HwControl) {
        if self.is_power() {
            return;
        }
        if let HwControl::Ppc(control) = control {
            control.mmcr0 |= MMCR0_PMXE;
        }
    }

    fn after_overflow(&self, regs: &dyn RegisterAccess, used: &[u32]) {
        if !self.is_power() {
            return;
        }
        for slot in (0..POWER_NR_PMCS).filter(|slot| !used.contains(slot)) {
            if (self.read_counter(regs, slot) as i32) < 0 {
                self.write_counter(regs, slot, 0);
            }
        }
    }

    fn clear_counters(&self, regs: &dyn RegisterAccess, _init: bool) {
        if self.is_power() {
            regs.write(SPRN_POWER_MMCRA, 0);
            regs.write(SPRN_POWER_MMCR1, 0);
            regs.write(SPRN_POWER_MMCR0, u64::from(MMCR0_FC));
        } else {
            if self.has_mmcr2() {
                regs.write(SPRN_MMCR2, 0);
            }
            if self.has_mmcr1() {
                regs.write(self.mmcr1_sprn(), 0);
            }
            regs.write(SPRN_MMCR0, 0);
        }
        for slot in 0..self.nr_pmcs() {
            regs.write(self.pmc_sprn(slot), 0);
        }
    }
}
