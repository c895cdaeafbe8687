// Monotonic time source for the state machines
//
// Controllers compare elapsed time against fixed thresholds, so a late tick
// simply sees a larger elapsed value. Tests swap in MockClock to step time.

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;
use std::time::Instant;

pub trait Clock {
    /// Milliseconds since the clock's origin
    fn now_ms(&self) -> u64;

    /// Microseconds since the clock's origin
    fn now_us(&self) -> u64;

    /// Milliseconds elapsed since `reference_ms` (saturating)
    fn millis_since(&self, reference_ms: u64) -> u64 {
        self.now_ms().saturating_sub(reference_ms)
    }
}

/// Wall clock; clones share the same origin
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock; clones observe the same time
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now_us: Rc<Cell<u64>>,
}

#[cfg(test)]
impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_us.set(ms * 1_000);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_us.set(self.now_us.get() + ms * 1_000);
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_us.get() / 1_000
    }

    fn now_us(&self) -> u64 {
        self.now_us.get()
    }
}
