//! Counting semaphore bounding concurrent execution units.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

pub struct Semaphore {
    available: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(capacity),
            freed: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is free.
    pub fn acquire(self: &Arc<Self>) -> Permit {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .freed
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        Permit {
            semaphore: Arc::clone(self),
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit {
            semaphore: Arc::clone(self),
        })
    }
}

/// Returned to the semaphore on drop.
pub struct Permit {
    semaphore: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = self
            .semaphore
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.semaphore.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn never_exceeds_capacity() {
        let semaphore = Semaphore::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (semaphore, running, peak) = (semaphore.clone(), running.clone(), peak.clone());
                std::thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    fn try_acquire_reports_exhaustion() {
        let semaphore = Semaphore::new(1);
        let held = semaphore.try_acquire();
        assert!(held.is_some());
        assert!(semaphore.try_acquire().is_none());
        drop(held);
        assert!(semaphore.try_acquire().is_some());
    }
}
