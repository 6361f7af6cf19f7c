//! Process-wide interrupt flag raised by signal handlers

use std::sync::atomic::AtomicBool;

/// Flag the monitor polls; handed to `signal_hook::flag::register`.
pub fn interrupt_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}
