//! Control of per-CPU performance-monitoring counters.
//!
//! A [`Session`] holds one monitoring configuration and its running 64-bit
//! sums. Sessions are resumed onto and suspended off a CPU through a
//! [`CpuGuard`] obtained from a [`CpuTopology`]. Each CPU remembers which
//! configuration its control registers currently hold, so resuming the
//! session that last ran there costs no register writes at all, and
//! resuming a different one writes only the fields that differ.
//!
//! The counter hardware of each family is described by a [`Backend`]:
//! [`X86`], [`Ppc`] and [`XScale`] are provided, and [`backend::by_name`]
//! looks one up by family name. Register access itself goes through the
//! [`RegisterAccess`] trait, so the same engine drives real MSRs and the
//! simulated register files in [`testing_common`].
//!
//! On top of the engine sit the two ways counters are used:
//! [`GlobalCounters`] count everything on every CPU, [`VirtualCounters`]
//! follow a single task around and deliver overflow signals to it.

#[macro_use]
extern crate log;

pub mod backend;
mod cache;
mod config;
mod control;
mod engine;
mod error;
mod generation;
mod global;
mod overflow;
mod session;
mod status;
mod topology;
mod virt;

pub mod testing_common;

pub use crate::backend::{
    Backend, Features, HwControl, Ppc, RegisterAccess, UnidentifiedOverflow, X86, XScale,
};
pub use crate::cache::{CacheStats, PerCpuCache};
pub use crate::config::{ArchExtras, CounterConfig, CounterSpec, InterruptSpec, Preserve};
pub use crate::engine::ireload;
pub use crate::error::ControlError;
pub use crate::generation::Generation;
pub use crate::global::{GlobalCounters, MIN_INTERVAL_USEC};
pub use crate::overflow::OverflowSet;
pub use crate::session::{CounterSnapshot, CounterState, RunState, Session};
pub use crate::status::Status;
pub use crate::topology::{
    CpuGuard, CpuId, CpuTopology, ReloadPolicy, Reservation, TopologyOptions,
};
pub use crate::virt::{OverflowSignal, VirtualCounters, SAMPLE_PERIOD_TICKS};
