//! Interrupt core.
//!
//! The top half runs in hard-IRQ context: it reads the status word, acks the
//! same bits, ORs them into an accumulator and wakes the bottom half. All
//! dispatch happens on the bottom-half thread owned by the device, which
//! drains the accumulator once per wakeup (coalescing back-to-back hard
//! IRQs).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::regs::Registers;

pub struct IrqCore {
    pending: Mutex<u32>,
    cv: Condvar,
    stopped: AtomicBool,
    hard_irqs: AtomicU64,
    dispatches: AtomicU64,
}

impl IrqCore {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cv: Condvar::new(),
            stopped: AtomicBool::new(false),
            hard_irqs: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    }

    /// Hard-IRQ entry. Returns `false` for "not mine". Non-blocking apart
    /// from the accumulator lock, which is only ever held for the OR.
    pub fn hard_irq(&self, regs: &Registers) -> bool {
        let status = regs.irq_status();
        if status == 0 {
            return false;
        }
        regs.irq_ack(status);
        self.hard_irqs.fetch_add(1, Ordering::Relaxed);
        trace!(status = format_args!("{status:#x}"), "hard irq");

        let mut pending = self.pending.lock().unwrap();
        *pending |= status;
        self.cv.notify_all();
        true
    }

    /// Software raise; used by recovery paths and tests to run a deferred
    /// handler without the hardware's involvement.
    pub fn raise(&self, bits: u32) {
        let mut pending = self.pending.lock().unwrap();
        *pending |= bits;
        self.cv.notify_all();
    }

    /// Bottom-half entry: blocks until bits accumulate or the core stops,
    /// then takes and clears the whole mask. Returns `None` once stopped and
    /// drained.
    pub fn wait_pending(&self, park: Duration) -> Option<u32> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if *pending != 0 {
                let bits = *pending;
                *pending = 0;
                self.dispatches.fetch_add(1, Ordering::Relaxed);
                return Some(bits);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _timed_out) = self.cv.wait_timeout(pending, park).unwrap();
            pending = guard;
        }
    }

    /// Stops the bottom half after it drains whatever is pending.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn hard_irq_count(&self) -> u64 {
        self.hard_irqs.load(Ordering::Relaxed)
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl Default for IrqCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_bits_coalesce_into_one_dispatch() {
        let core = IrqCore::new();
        core.raise(0x1);
        core.raise(0x4);
        assert_eq!(core.wait_pending(Duration::from_millis(10)), Some(0x5));
        core.stop();
        assert_eq!(core.wait_pending(Duration::from_millis(10)), None);
    }

    #[test]
    fn stop_drains_pending_bits_first() {
        let core = IrqCore::new();
        core.raise(0x2);
        core.stop();
        assert_eq!(core.wait_pending(Duration::from_millis(10)), Some(0x2));
        assert_eq!(core.wait_pending(Duration::from_millis(10)), None);
    }
}
