use std::sync::atomic::{AtomicBool, Ordering};

/// Single-slot mailbox between the timer context and the control loop.
///
/// Raising an already raised flag is a no-op, so ticks that land between two
/// polls coalesce into one.
#[derive(Debug, Default)]
pub struct TickFlag(AtomicBool);

impl TickFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Called from the timer callback. Never blocks.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check-and-clear, called once per control loop iteration.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
