//! Shutdown coordination.
//!
//! One flag per server, written by any worker that executes `SHUTDOWN` and
//! read by the event loop once per poll iteration. Operator interrupts set a
//! process-wide flag from the signal handler, which every `Shutdown` also
//! observes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from the SIGINT/SIGTERM handler. Only atomic stores happen there.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handlers and ignore SIGPIPE so that a peer
/// resetting mid-write surfaces as an I/O error instead of killing us.
pub fn install_interrupt_handler() -> io::Result<()> {
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    unsafe {
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::signal(signal, handler) == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Cloneable handle on the server's shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    /// Process-wide interrupt flag this handle observes.
    interrupt: &'static AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::observing(&INTERRUPTED)
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn observing(interrupt: &'static AtomicBool) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            interrupt,
        }
    }

    /// Ask the server to stop. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Whether an operator interrupt has been received.
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// True once a stop was requested on this server or the process was interrupted.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire) || self.interrupted()
    }
}
