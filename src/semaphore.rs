use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Blocking counting semaphore. Permits are returned when the guard drops.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<SemaphoreState>,
}

struct SemaphoreState {
    count: Mutex<usize>,
    condition: Condvar,
}

pub struct SemaphoreGuard {
    state: Arc<SemaphoreState>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(SemaphoreState {
                count: Mutex::new(permits),
                condition: Condvar::new(),
            }),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard {
        let mut count = self.state.count.lock();
        self.state.condition.wait_while(&mut count, |&mut c| c == 0);
        *count -= 1;
        self.guard()
    }

    /// Waits for a permit until `deadline`; `None` if none became free in time.
    pub fn acquire_until(&self, deadline: Instant) -> Option<SemaphoreGuard> {
        let mut count = self.state.count.lock();
        let timed_out = self
            .state
            .condition
            .wait_while_until(&mut count, |&mut c| c == 0, deadline)
            .timed_out();
        if timed_out && *count == 0 {
            return None;
        }
        *count -= 1;
        Some(self.guard())
    }

    pub fn available_permits(&self) -> usize {
        *self.state.count.lock()
    }

    fn guard(&self) -> SemaphoreGuard {
        SemaphoreGuard {
            state: Arc::clone(&self.state),
        }
    }
}

impl SemaphoreGuard {
    fn release(&self) {
        let mut count = self.state.count.lock();
        *count += 1;
        self.state.condition.notify_one();
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_permits_are_returned_on_drop() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.acquire();
        let _second = semaphore.acquire();
        assert_eq!(semaphore.available_permits(), 0);

        drop(first);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_acquire_until_times_out() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.acquire();

        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(semaphore.acquire_until(deadline).is_none());
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    fn test_waiter_wakes_when_permit_is_released() {
        let semaphore = Semaphore::new(1);
        let held = semaphore.acquire();

        let waiter = {
            let semaphore = semaphore.clone();
            thread::spawn(move || {
                semaphore
                    .acquire_until(Instant::now() + Duration::from_secs(5))
                    .is_some()
            })
        };

        thread::sleep(Duration::from_millis(10));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
