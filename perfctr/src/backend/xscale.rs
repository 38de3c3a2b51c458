//! Intel XScale performance monitoring on coprocessor 14.
//!
//! Registers are numbered `crn << 4 | crm`. XScale 1 keeps everything,
//! event selectors and interrupt enables included, in PMNC. XScale 2 splits
//! them out into EVTSEL and INTEN and has to be disabled while they change.

use smallvec::SmallVec;

use super::{check_slots, write_if_changed, Backend, Derived, Features, HwControl, RegisterAccess};
use crate::config::{ArchExtras, CounterConfig};
use crate::error::ControlError;
use crate::status::Status;

const fn cp14(crn: u32, crm: u32) -> u32 {
    (crn << 4) | crm
}

pub const XSC1_PMNC: u32 = cp14(0, 0);
pub const XSC1_CCNT: u32 = cp14(1, 0);
pub const XSC1_PMN0: u32 = cp14(2, 0);
pub const XSC1_PMN1: u32 = cp14(3, 0);

pub const XSC2_PMNC: u32 = cp14(0, 1);
pub const XSC2_CCNT: u32 = cp14(1, 1);
pub const XSC2_INTEN: u32 = cp14(4, 1);
pub const XSC2_FLAG: u32 = cp14(5, 1);
pub const XSC2_EVTSEL: u32 = cp14(8, 1);
pub const XSC2_PMN0: u32 = cp14(0, 2);

pub const PMNC_ENABLE: u32 = 1 << 0;
const XSC1_PMNC_WRITE_MASK: u32 = 0x0FFF_F77F;
const XSC2_PMNC_WRITE_MASK: u32 = 0xF;
const MAX_EVENT: u64 = 0x0D;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XScaleModel {
    Xsc1,
    Xsc2,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XScaleControl {
    pub pmnc: u32,
    pub evtsel: u32,
    pub inten: u32,
}

pub struct XScale {
    model: XScaleModel,
}

impl XScale {
    pub fn new(model: XScaleModel) -> XScale {
        XScale { model }
    }

    pub fn model(&self) -> XScaleModel {
        self.model
    }

    fn nr_pmcs(&self) -> u32 {
        match self.model {
            XScaleModel::Xsc1 => 2,
            XScaleModel::Xsc2 => 4,
        }
    }

    fn pmnc_reg(&self) -> u32 {
        match self.model {
            XScaleModel::Xsc1 => XSC1_PMNC,
            XScaleModel::Xsc2 => XSC2_PMNC,
        }
    }

    fn write_pmnc(&self, regs: &dyn RegisterAccess, pmnc: u32) {
        let mask = match self.model {
            XScaleModel::Xsc1 => XSC1_PMNC_WRITE_MASK,
            XScaleModel::Xsc2 => XSC2_PMNC_WRITE_MASK,
        };
        regs.write(self.pmnc_reg(), u64::from(pmnc & mask));
    }

    fn pmn_reg(&self, slot: u32) -> u32 {
        match self.model {
            XScaleModel::Xsc1 if slot == 0 => XSC1_PMN0,
            XScaleModel::Xsc1 => XSC1_PMN1,
            XScaleModel::Xsc2 => XSC2_PMN0 + (slot << 4),
        }
    }
}

impl Backend for XScale {
    fn name(&self) -> &'static str {
        match self.model {
            XScaleModel::Xsc1 => "XScale 1",
            XScaleModel::Xsc2 => "XScale 2",
        }
    }

    fn features(&self) -> Features {
        Features::RDTSC | Features::PCINT
    }

    fn nr_counters(&self) -> usize {
        self.nr_pmcs() as usize
    }

    fn check_control(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        if config.extras != ArchExtras::None {
            return Err(ControlError::Unsupported(
                "XScale has no family control words",
            ));
        }

        let nractrs = config.active.len();
        check_slots(config, self.nr_pmcs() as usize)?;

        let mut evntsel = [0u32; 4];
        let mut pmi_mask = 0u32;
        for (i, spec) in config.counters().enumerate() {
            let slot = spec.slot;
            if spec.selector > MAX_EVENT {
                return Err(ControlError::Incompatible {
                    slot,
                    reason: "event number out of range",
                });
            }
            evntsel[slot as usize] = spec.selector as u32;
            if i >= nractrs {
                pmi_mask |= 1 << slot;
            }
        }

        let control = match self.model {
            XScaleModel::Xsc1 => XScaleControl {
                pmnc: (evntsel[1] << 20) | (evntsel[0] << 12) | (pmi_mask << 4) | PMNC_ENABLE,
                evtsel: 0,
                inten: 0,
            },
            XScaleModel::Xsc2 => XScaleControl {
                pmnc: PMNC_ENABLE,
                evtsel: (evntsel[3] << 24) | (evntsel[2] << 16) | (evntsel[1] << 8) | evntsel[0],
                inten: pmi_mask << 1,
            },
        };

        Ok(Derived::new(HwControl::XScale(control)))
    }

    fn invalid_shadow(&self) -> HwControl {
        match self.model {
            XScaleModel::Xsc1 => HwControl::XScale(XScaleControl {
                pmnc: !0,
                evtsel: 0,
                inten: 0,
            }),
            XScaleModel::Xsc2 => HwControl::XScale(XScaleControl {
                pmnc: !0,
                evtsel: !0,
                inten: !0,
            }),
        }
    }

    fn write_control(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        _status: Status,
    ) -> usize {
        let (HwControl::XScale(shadow), HwControl::XScale(control)) = (shadow, control) else {
            return 0;
        };

        let mut writes = 0;
        match self.model {
            XScaleModel::Xsc1 => {
                if shadow.pmnc != control.pmnc {
                    shadow.pmnc = control.pmnc;
                    self.write_pmnc(regs, control.pmnc);
                    writes += 1;
                }
            }
            XScaleModel::Xsc2 => {
                if shadow.pmnc & PMNC_ENABLE != 0 {
                    shadow.pmnc &= !PMNC_ENABLE;
                    self.write_pmnc(regs, shadow.pmnc);
                    writes += 1;
                }
                write_if_changed(
                    regs,
                    XSC2_EVTSEL,
                    &mut shadow.evtsel,
                    control.evtsel,
                    &mut writes,
                );
                write_if_changed(
                    regs,
                    XSC2_INTEN,
                    &mut shadow.inten,
                    control.inten,
                    &mut writes,
                );
                shadow.pmnc = control.pmnc | PMNC_ENABLE;
                self.write_pmnc(regs, shadow.pmnc);
                writes += 1;
            }
        }
        writes
    }

    fn read_clock(&self, regs: &dyn RegisterAccess) -> u32 {
        let ccnt = match self.model {
            XScaleModel::Xsc1 => XSC1_CCNT,
            XScaleModel::Xsc2 => XSC2_CCNT,
        };
        regs.read(ccnt) as u32
    }

    fn read_counter(&self, regs: &dyn RegisterAccess, slot: u32) -> u32 {
        regs.read(self.pmn_reg(slot)) as u32
    }

    fn write_counter(&self, regs: &dyn RegisterAccess, slot: u32, value: u32) {
        regs.write(self.pmn_reg(slot), u64::from(value));
    }

    fn counter_registers(&self) -> SmallVec<[u32; 8]> {
        (0..self.nr_pmcs()).map(|slot| self.pmn_reg(slot)).collect()
    }

    fn clock_register(&self) -> Option<u32> {
        match self.model {
            XScaleModel::Xsc1 => Some(XSC1_CCNT),
            XScaleModel::Xsc2 => Some(XSC2_CCNT),
        }
    }

    fn disarm_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        _control: &HwControl,
        _slots: &[u32],
    ) {
        let HwControl::XScale(shadow) = shadow else {
            return;
        };

        if shadow.pmnc & PMNC_ENABLE != 0 {
            shadow.pmnc &= !PMNC_ENABLE;
            self.write_pmnc(regs, shadow.pmnc);
        }
    }

    fn clear_counters(&self, regs: &dyn RegisterAccess, _init: bool) {
        match self.model {
            XScaleModel::Xsc1 => {
                // Keep the reserved bits, reset the counters, clear the
                // overflow flags and select no events.
                let pmnc = regs.read(XSC1_PMNC) as u32;
                let pmnc = (pmnc & ((1 << 10) | (1 << 6) | (1 << 3) | 1))
                    | (0xFF << 20)
                    | (0xFF << 12)
                    | (0x7 << 8)
                    | (1 << 1);
                self.write_pmnc(regs, pmnc & !PMNC_ENABLE);
            }
            XScaleModel::Xsc2 => {
                let inten = regs.read(XSC2_INTEN) & 1;
                regs.write(XSC2_INTEN, inten);
                regs.write(XSC2_EVTSEL, 0xFFFF_FFFF);
                let pmnc = regs.read(XSC2_PMNC) as u32;
                self.write_pmnc(regs, (pmnc & (1 << 3)) | (1 << 1));
                regs.write(XSC2_FLAG, 0x1F);
            }
        }
    }
}
