// SPDX-License-Identifier: Apache-2.0

//! Small synchronization helpers shared by the device threads.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore.
///
/// Raised by every S-SIQ arrival and every N-SIQ issued, consumed by the
/// scheduler loop while the secure world reports itself idle.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    /// Block until a unit is available.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Block up to `timeout`; `false` on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let (next, result) = self.cv.wait_timeout(count, timeout).unwrap();
            count = next;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}
