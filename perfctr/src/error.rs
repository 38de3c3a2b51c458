use std::error::Error;
use std::fmt;

use crate::topology::CpuId;

/// Reasons a control request, or one of the operations around it, can be
/// turned down.
///
/// Every rejection from [`Session::update_control`] leaves the session
/// exactly as it was before the call.
///
/// [`Session::update_control`]: crate::Session::update_control
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// A counter names a physical slot that does not exist, or names the same
    /// slot as an earlier counter in the configuration.
    InvalidSlot { slot: u32 },

    /// More counters were requested than the hardware has.
    TooManyCounters { requested: usize, available: usize },

    /// A selector sets bits the hardware reserves. `slot` is `None` when the
    /// offending bits live in a control word that is not tied to one counter.
    ReservedBitsSet { slot: Option<u32>, bits: u64 },

    /// The selector cannot be programmed into the requested slot.
    Incompatible { slot: u32, reason: &'static str },

    /// The reload value of an interrupt counter would not produce an overflow
    /// interrupt on this architecture.
    InvalidReload { slot: u32, reload: u32 },

    /// The platform cannot do what was asked, typically deliver overflow
    /// interrupts.
    Unsupported(&'static str),

    /// An overflow interrupt arrived but no interrupt counter shows the
    /// overflow pattern.
    NoIdentifiableOverflow,

    /// The counters, or the session, are in use.
    Busy(&'static str),

    /// The sampling interval is shorter than the global timer allows.
    InvalidInterval { usec: u32 },

    /// The CPU does not exist or is offline.
    Offline { cpu: CpuId },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ControlError::InvalidSlot { slot } => write!(f, "invalid counter slot {:#x}", slot),
            ControlError::TooManyCounters {
                requested,
                available,
            } => write!(
                f,
                "{} counters requested but only {} available",
                requested, available
            ),
            ControlError::ReservedBitsSet {
                slot: Some(slot),
                bits,
            } => write!(f, "reserved bits {:#x} set for slot {:#x}", bits, slot),
            ControlError::ReservedBitsSet { slot: None, bits } => {
                write!(f, "reserved bits {:#x} set in control word", bits)
            }
            ControlError::Incompatible { slot, reason } => {
                write!(f, "selector incompatible with slot {:#x}: {}", slot, reason)
            }
            ControlError::InvalidReload { slot, reload } => {
                write!(f, "reload value {:#x} is invalid for slot {:#x}", reload, slot)
            }
            ControlError::Unsupported(what) => write!(f, "unsupported: {}", what),
            ControlError::NoIdentifiableOverflow => {
                write!(f, "overflow interrupt with no identifiable source")
            }
            ControlError::Busy(what) => write!(f, "busy: {}", what),
            ControlError::InvalidInterval { usec } => {
                write!(f, "sampling interval of {}us is too short", usec)
            }
            ControlError::Offline { cpu } => write!(f, "cpu {} is not online", cpu),
        }
    }
}

impl Error for ControlError {}
