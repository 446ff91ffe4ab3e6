//! Daemonizing: fork once, let the parent exit, and detach the child from
//! its controlling terminal. Called after the tunnel is already up and
//! running (client: once connected; server: once listening) so any setup
//! failure is reported on the original terminal rather than silently.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),
    #[error("setsid failed: {0}")]
    Setsid(#[source] io::Error),
}

/// Forks and detaches the child into its own session. Returns in the child
/// process only; the parent exits the process directly.
pub fn daemonize() -> Result<(), DaemonError> {
    let pid = unsafe { libc::fork() };

    if pid < 0 {
        return Err(DaemonError::Fork(io::Error::last_os_error()));
    }

    if pid > 0 {
        std::process::exit(0);
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(DaemonError::Setsid(io::Error::last_os_error()));
    }

    Ok(())
}
