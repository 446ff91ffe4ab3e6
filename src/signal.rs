//! SIGINT/SIGTERM handling: the only mutable state shared outside the
//! forwarder's own ownership, since a signal handler cannot reach into the
//! event loop's locals. The handler only ever sets a flag; the loop is the
//! only reader.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Installs the stop handler for SIGINT and SIGTERM. Must be called once,
/// before the event loop starts polling.
pub fn install() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_stop_signal as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}
