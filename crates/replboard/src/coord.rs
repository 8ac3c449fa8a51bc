use crate::types::SequenceNumber;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cluster-wide source of strictly increasing sequence numbers.
///
/// Only the designated sequencer replica hosts one; everybody else reaches it
/// through `GETSEQUENCENUMBER`. The first number handed out is 1.
#[derive(Debug, Default)]
pub struct Sequencer {
    counter: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SequenceNumber {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last number handed out (0 before the first call)
    pub fn current(&self) -> SequenceNumber {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Single-holder lock that never blocks.
///
/// `acquire` either takes the lock or reports that it is held; callers that
/// need to wait poll it themselves.
#[derive(Debug, Default)]
pub struct TryMutex {
    held: AtomicBool,
}

impl TryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the lock was free and is now held
    pub fn acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Returns true if the lock was held and is now free; releasing a free
    /// lock is a no-op
    pub fn release(&self) -> bool {
        self.held
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}
