//! The event loop: a single `poll(2)` over the icmp socket and the tun
//! device, with a timeout that shrinks towards the next one-second tick
//! instead of a fixed sleep, so a tick never arrives late just because
//! traffic kept the loop busy.

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::icmp_endpoint::{IcmpEndpoint, RecvOutcome};
use crate::signal;
use crate::tun::TunDevice;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The role-specific reaction to the three events the loop delivers. Both
/// `client::Client` and `server::Server` implement this.
pub trait RoleHandler {
    type Error: std::error::Error + 'static;

    /// A frame was read from the tun device into
    /// `endpoint.tx_payload_mut()[..payload_len]`; send it on.
    fn handle_tunnel_frame(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        tun: &mut TunDevice,
        payload_len: usize,
    ) -> Result<(), Self::Error>;

    /// An accepted tunnel message arrived; `endpoint.rx_payload()` holds its
    /// payload (possibly empty, for control messages).
    #[allow(clippy::too_many_arguments)]
    fn handle_icmp_message(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        tun: &mut TunDevice,
        source: std::net::Ipv4Addr,
        id: u16,
        seq: u16,
        header: crate::protocol::TunnelHeader,
        payload_len: usize,
    ) -> Result<(), Self::Error>;

    /// The one-second tick: retry ladders, keepalives, punch-thru bursts.
    fn handle_tick(&mut self, endpoint: &mut IcmpEndpoint, tun: &mut TunDevice) -> Result<(), Self::Error>;

    /// Whether the handler has decided the loop should end (e.g. the
    /// client was told the server is full).
    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum ForwarderError<E: std::error::Error + 'static> {
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("tun device io failed: {0}")]
    Tun(#[source] io::Error),
    #[error(transparent)]
    Handler(#[from] E),
}

pub fn run<H: RoleHandler>(
    endpoint: &mut IcmpEndpoint,
    tun: &mut TunDevice,
    handler: &mut H,
) -> Result<(), ForwarderError<H::Error>> {
    let mut next_tick = Instant::now() + TICK_INTERVAL;

    loop {
        if signal::stop_requested() || handler.should_stop() {
            return Ok(());
        }

        let now = Instant::now();
        let timeout_ms: i32 = if now >= next_tick {
            0
        } else {
            (next_tick - now).as_millis().min(i32::MAX as u128) as i32
        };

        let mut fds = [
            libc::pollfd {
                fd: endpoint.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: tun.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ForwarderError::Poll(err));
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match endpoint.recv() {
                Ok(RecvOutcome::Accepted {
                    source,
                    id,
                    seq,
                    header,
                    payload_len,
                }) => {
                    handler
                        .handle_icmp_message(endpoint, tun, source, id, seq, header, payload_len)
                        .map_err(ForwarderError::Handler)?;
                }
                Ok(RecvOutcome::Rejected) => {}
                // A steady-state transport failure is not fatal: log it once
                // and let the next wakeup try again.
                Err(err) => eprintln!("icmp recv failed: {err}"),
            }
        }

        if fds[1].revents & libc::POLLIN != 0 {
            let payload_len = tun
                .read(endpoint.tx_payload_mut())
                .map_err(ForwarderError::Tun)?;
            handler
                .handle_tunnel_frame(endpoint, tun, payload_len)
                .map_err(ForwarderError::Handler)?;
        }

        if Instant::now() >= next_tick {
            handler
                .handle_tick(endpoint, tun)
                .map_err(ForwarderError::Handler)?;
            next_tick = Instant::now() + TICK_INTERVAL;
        }
    }
}
