//! A simulated register file and a minimal counter family, for tests and
//! for the `pmcsim` simulator.

use std::error::Error;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::backend::{
    check_slots, Backend, Derived, Features, HwControl, RegisterAccess, UnidentifiedOverflow,
};
use crate::config::{ArchExtras, CounterConfig};
use crate::error::ControlError;
use crate::status::Status;
use crate::topology::{CpuTopology, TopologyOptions};

#[derive(Default)]
struct SimState {
    regs: FxHashMap<u32, u64>,
    ticking: SmallVec<[u32; 16]>,
    writes: Vec<(u32, u64)>,
    reads: usize,
}

/// Registers held in memory. Unwritten registers read as zero.
///
/// Registers marked as ticking advance together on [`SimRegisters::tick`],
/// standing in for counters that count every event.
#[derive(Default)]
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl SimRegisters {
    pub fn new() -> SimRegisters {
        SimRegisters::default()
    }

    /// A register file whose clock and counter registers tick.
    pub fn for_backend(backend: &dyn Backend) -> SimRegisters {
        let mut ticking: SmallVec<[u32; 16]> = backend.counter_registers().into_iter().collect();
        ticking.extend(backend.clock_register());
        SimRegisters::with_ticking(&ticking)
    }

    pub fn with_ticking(regs: &[u32]) -> SimRegisters {
        let sim = SimRegisters::new();
        sim.state.lock().ticking.extend_from_slice(regs);
        sim
    }

    pub fn tick(&self, events: u64) {
        let mut state = self.state.lock();
        let SimState { regs, ticking, .. } = &mut *state;
        for &reg in ticking.iter() {
            let value = regs.entry(reg).or_insert(0);
            *value = value.wrapping_add(events);
        }
    }

    pub fn get(&self, reg: u32) -> u64 {
        self.state.lock().regs.get(&reg).copied().unwrap_or(0)
    }

    /// Sets a register as the hardware would, without logging a write.
    pub fn set(&self, reg: u32, value: u64) {
        self.state.lock().regs.insert(reg, value);
    }

    /// Every logged write, oldest first.
    pub fn writes(&self) -> Vec<(u32, u64)> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn writes_to(&self, reg: u32) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|&&(r, _)| r == reg)
            .count()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.reads = 0;
    }
}

impl RegisterAccess for SimRegisters {
    fn read(&self, reg: u32) -> u64 {
        let mut state = self.state.lock();
        state.reads += 1;
        state.regs.get(&reg).copied().unwrap_or(0)
    }

    fn write(&self, reg: u32, value: u64) {
        let mut state = self.state.lock();
        state.regs.insert(reg, value);
        state.writes.push((reg, value));
    }
}

/// Like [`backend::by_name`](crate::backend::by_name), but also accepts
/// `"mock"` for a four-counter [`MockBackend`].
pub fn sim_backend(name: &str) -> Result<Arc<dyn Backend>, Box<dyn Error + Send + Sync>> {
    if name == "mock" {
        return Ok(Arc::new(MockBackend::new(4)));
    }
    crate::backend::by_name(name)
}

/// A topology of simulated CPUs, and the register file of each.
pub fn sim_topology(
    backend: Arc<dyn Backend>,
    options: TopologyOptions,
) -> (Arc<CpuTopology>, Vec<Arc<SimRegisters>>) {
    let regs: Vec<Arc<SimRegisters>> = (0..options.nr_cpus)
        .map(|_| Arc::new(SimRegisters::for_backend(&*backend)))
        .collect();
    let registers = regs
        .iter()
        .map(|sim| Box::new(Arc::clone(sim)) as Box<dyn RegisterAccess>)
        .collect();
    let topology = CpuTopology::from_registers(backend, options.reload_policy, registers);
    (Arc::new(topology), regs)
}

pub const MOCK_CLOCK: u32 = 0x10;
pub const MOCK_SELECTOR0: u32 = 0x100;
pub const MOCK_COUNTER0: u32 = 0x200;
pub const MOCK_INTERRUPT_MASK: u32 = 0x300;
const MOCK_RESERVED: u64 = 1 << 63;

/// One selector register per counter, x86 overflow semantics.
///
/// Selector zero means "off", so every configured counter needs a nonzero
/// selector, and bit 63 is reserved.
pub struct MockBackend {
    nr_counters: usize,
    features: Features,
    unidentified: UnidentifiedOverflow,
    shared_interrupt: bool,
}

impl MockBackend {
    pub fn new(nr_counters: usize) -> MockBackend {
        MockBackend {
            nr_counters: nr_counters.min(8),
            features: Features::RDPMC | Features::RDTSC | Features::PCINT,
            unidentified: UnidentifiedOverflow::Report,
            shared_interrupt: false,
        }
    }

    pub fn without_interrupts(mut self) -> MockBackend {
        self.features.remove(Features::PCINT);
        self
    }

    pub fn with_expected_overflows(mut self) -> MockBackend {
        self.unidentified = UnidentifiedOverflow::Expected;
        self
    }

    pub fn with_shared_overflow_interrupt(mut self) -> MockBackend {
        self.shared_interrupt = true;
        self
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn features(&self) -> Features {
        self.features
    }

    fn nr_counters(&self) -> usize {
        self.nr_counters
    }

    fn check_control(&self, config: &CounterConfig) -> Result<Derived, ControlError> {
        if config.extras != ArchExtras::None {
            return Err(ControlError::Unsupported("mock counters have no extras"));
        }
        check_slots(config, self.nr_counters)?;

        let mut selectors: SmallVec<[u64; 8]> = SmallVec::from_elem(0, self.nr_counters);
        for spec in config.counters() {
            if spec.selector & MOCK_RESERVED != 0 {
                return Err(ControlError::ReservedBitsSet {
                    slot: Some(spec.slot),
                    bits: MOCK_RESERVED,
                });
            }
            if spec.selector == 0 {
                return Err(ControlError::Incompatible {
                    slot: spec.slot,
                    reason: "selector 0 turns the counter off",
                });
            }
            selectors[spec.slot as usize] = spec.selector;
        }
        Ok(Derived::new(HwControl::Selectors(selectors)))
    }

    fn unidentified_overflow(&self) -> UnidentifiedOverflow {
        self.unidentified
    }

    fn shared_overflow_interrupt(&self) -> bool {
        self.shared_interrupt
    }

    fn invalid_shadow(&self) -> HwControl {
        HwControl::Selectors(SmallVec::from_elem(!0, self.nr_counters))
    }

    fn write_control(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        control: &HwControl,
        status: Status,
    ) -> usize {
        let (HwControl::Selectors(shadow), HwControl::Selectors(control)) = (shadow, control) else {
            return 0;
        };
        if status.nr_counters() == 0 {
            return 0;
        }

        let mut writes = 0;
        for (slot, (current, &selector)) in shadow.iter_mut().zip(control.iter()).enumerate() {
            if selector != 0 && *current != selector {
                *current = selector;
                regs.write(MOCK_SELECTOR0 + slot as u32, selector);
                writes += 1;
            }
        }
        writes
    }

    fn read_clock(&self, regs: &dyn RegisterAccess) -> u32 {
        regs.read(MOCK_CLOCK) as u32
    }

    fn read_counter(&self, regs: &dyn RegisterAccess, slot: u32) -> u32 {
        regs.read(MOCK_COUNTER0 + slot) as u32
    }

    fn write_counter(&self, regs: &dyn RegisterAccess, slot: u32, value: u32) {
        regs.write(MOCK_COUNTER0 + slot, u64::from(value));
    }

    fn counter_registers(&self) -> SmallVec<[u32; 8]> {
        (0..self.nr_counters as u32)
            .map(|slot| MOCK_COUNTER0 + slot)
            .collect()
    }

    fn clock_register(&self) -> Option<u32> {
        Some(MOCK_CLOCK)
    }

    fn mask_interrupts(&self, regs: &dyn RegisterAccess) {
        regs.write(MOCK_INTERRUPT_MASK, 1);
    }

    fn unmask_interrupts(&self, regs: &dyn RegisterAccess) {
        regs.write(MOCK_INTERRUPT_MASK, 0);
    }

    fn stop_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        _control: &HwControl,
        slots: &[u32],
    ) {
        let HwControl::Selectors(shadow) = shadow else {
            return;
        };
        for &slot in slots {
            if let Some(selector) = shadow.get_mut(slot as usize) {
                *selector = 0;
                regs.write(MOCK_SELECTOR0 + slot, 0);
            }
        }
    }

    fn disarm_counters(
        &self,
        regs: &dyn RegisterAccess,
        shadow: &mut HwControl,
        _control: &HwControl,
        slots: &[u32],
    ) {
        let HwControl::Selectors(shadow) = shadow else {
            return;
        };
        for &slot in slots {
            if let Some(selector) = shadow.get_mut(slot as usize) {
                if *selector != 0 {
                    *selector = 0;
                    regs.write(MOCK_SELECTOR0 + slot, 0);
                }
            }
        }
    }

    fn clear_counters(&self, regs: &dyn RegisterAccess, _init: bool) {
        for slot in 0..self.nr_counters as u32 {
            regs.write(MOCK_SELECTOR0 + slot, 0);
        }
        for slot in 0..self.nr_counters as u32 {
            regs.write(MOCK_COUNTER0 + slot, 0);
        }
    }
}
