use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Identifies one validated set of control values.
///
/// A fresh `Generation` is handed out every time a session's control is
/// successfully updated. Per-CPU caches remember the generation whose values
/// they hold, which is what lets a resume skip all register writes.
/// Generations are process-wide, increase monotonically and are never zero,
/// so `Option<Generation>` is as small as a `u64`. At one update per
/// nanosecond the counter takes centuries to wrap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(NonZeroU64);

impl Generation {
    pub fn next() -> Generation {
        loop {
            let id = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = NonZeroU64::new(id) {
                return Generation(id);
            }
        }
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_increase() {
        let a = Generation::next();
        let b = Generation::next();
        let c = Generation::next();
        assert!(a < b && b < c);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn niche_keeps_option_small() {
        assert_eq!(
            std::mem::size_of::<Option<Generation>>(),
            std::mem::size_of::<u64>()
        );
    }
}
