use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide single-flight flag shared by backups and restores.
#[derive(Debug, Clone, Default)]
pub struct EngineLock {
    held: Arc<AtomicBool>,
}

impl EngineLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set: at most one caller gets a guard until it is dropped.
    pub fn try_acquire(&self) -> Option<LockGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the lock when dropped, including during unwinding.
#[derive(Debug)]
pub struct LockGuard {
    held: Arc<AtomicBool>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
