use std::fmt;

const CLOCK_BIT: u32 = 1 << 31;
const COUNT_MASK: u32 = 0x7F;
const TOTAL_SHIFT: u32 = 8;
const INTERRUPT_SHIFT: u32 = 16;

/// Packed summary of what a session counts.
///
/// The word layout is `clock << 31 | nr_interrupt << 16 | nr_counters << 8 |
/// nr_active`, so the hot paths can answer "is anything enabled", "is the
/// clock on" and "how many counters do I touch" with a single mask or a
/// sign test. The `quirks` word is owned by the backend and is never
/// interpreted here beyond "is it nonzero".
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status {
    word: u32,
    quirks: u32,
}

impl Status {
    pub const NONE: Status = Status { word: 0, quirks: 0 };

    pub fn new(clock: bool, nr_active: usize, nr_interrupt: usize) -> Status {
        debug_assert!(nr_active + nr_interrupt <= COUNT_MASK as usize);
        let nr_active = nr_active as u32 & COUNT_MASK;
        let nr_interrupt = nr_interrupt as u32 & COUNT_MASK;
        let nr_counters = (nr_active + nr_interrupt) & COUNT_MASK;
        let clock = if clock { CLOCK_BIT } else { 0 };
        Status {
            word: clock
                | (nr_interrupt << INTERRUPT_SHIFT)
                | (nr_counters << TOTAL_SHIFT)
                | nr_active,
            quirks: 0,
        }
    }

    /// Only the clock, as used while an overflow is waiting to be handled.
    pub fn clock_only() -> Status {
        Status::new(true, 0, 0)
    }

    pub fn with_quirks(self, quirks: u32) -> Status {
        Status { quirks, ..self }
    }

    #[inline]
    pub fn is_enabled(self) -> bool {
        self.word != 0
    }

    #[inline]
    pub fn has_clock(self) -> bool {
        (self.word as i32) < 0
    }

    #[inline]
    pub fn nr_active(self) -> usize {
        (self.word & COUNT_MASK) as usize
    }

    #[inline]
    pub fn nr_counters(self) -> usize {
        ((self.word >> TOTAL_SHIFT) & COUNT_MASK) as usize
    }

    #[inline]
    pub fn nr_interrupt(self) -> usize {
        ((self.word >> INTERRUPT_SHIFT) & COUNT_MASK) as usize
    }

    #[inline]
    pub fn has_interrupt_counters(self) -> bool {
        self.word & (COUNT_MASK << INTERRUPT_SHIFT) != 0
    }

    #[inline]
    pub fn quirks(self) -> u32 {
        self.quirks
    }

    pub fn bits(self) -> u32 {
        self.word
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("word", &format_args!("{:#010x}", self.word))
            .field("quirks", &format_args!("{:#x}", self.quirks))
            .finish()
    }
}
