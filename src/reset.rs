//! System-level policy for fatal faults: log, then reset exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::error::Fault;
use crate::task_loop::Shutdown;
use crate::watchdog::HardwareWatchdog;

/// Decides what happens when any task reports a fault.
pub struct ResetController {
    hw: Arc<dyn HardwareWatchdog>,
    shutdown: Shutdown,
    requested: AtomicBool,
    reason: Mutex<Option<Fault>>,
    reports: AtomicUsize,
}

impl ResetController {
    pub fn new(hw: Arc<dyn HardwareWatchdog>, shutdown: Shutdown) -> Self {
        Self {
            hw,
            shutdown,
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
            reports: AtomicUsize::new(0),
        }
    }

    /// Log `fault` and reset the system unless a reset is already under way.
    /// Returns whether this call triggered the reset.
    pub fn escalate(&self, fault: Fault) -> bool {
        self.reports.fetch_add(1, Ordering::SeqCst);
        error!("fatal {:?} fault: {fault}", fault.kind());
        if self.requested.swap(true, Ordering::SeqCst) {
            debug!("reset already requested; not re-triggering");
            return false;
        }
        *self.reason.lock().unwrap_or_else(|p| p.into_inner()) = Some(fault);
        error!("resetting system");
        self.hw.kick();
        self.shutdown.trigger();
        true
    }

    /// Feed the hardware watchdog while no reset is pending.
    pub fn pet(&self) {
        if !self.reset_requested() {
            self.hw.pet();
        }
    }

    pub fn reset_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The fault that triggered the reset.
    pub fn reason(&self) -> Option<Fault> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Faults reported so far, including ones after the reset.
    pub fn fault_count(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}
