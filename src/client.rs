//! Client role: connects to a server, re-sends the connection request
//! until accepted, and once connected keeps a steady trickle of
//! punch-thru messages flowing so the server always has a recent sequence
//! number to answer unsolicited data on.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::cli::{Options, Retries};
use crate::daemon::{self, DaemonError};
use crate::emulation;
use crate::forwarder::RoleHandler;
use crate::icmp_endpoint::IcmpEndpoint;
use crate::peer::{Peer, PUNCHTHRU_WINDOW};
use crate::protocol::{PacketType, TunnelHeader, FLAG_EMULATION, MAGIC_CLIENT, MAGIC_SERVER};
use crate::tun::TunDevice;

/// How many punch-thru messages to fire immediately after the server
/// accepts, so the server's reservoir isn't empty the instant it has
/// data to send. Matches the server's punch-thru ring size so the first
/// burst fills it completely.
const INITIAL_PUNCHTHRU_BURST: usize = PUNCHTHRU_WINDOW;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("tun device io failed: {0}")]
    Tun(#[source] io::Error),
    #[error("failed to daemonize: {0}")]
    Daemon(#[from] DaemonError),
    #[error("could not reach the server")]
    ServerUnreachable,
    #[error("server stopped responding")]
    PeerTimedOut,
}

pub struct Client {
    peer: Peer,
    emulation_wanted: bool,
    emulation_active: bool,
    daemon_requested: bool,
    daemonized: bool,
    retries: Retries,
    keepalive_secs: u32,
    stop: bool,
}

impl Client {
    pub fn new(server_ip: Ipv4Addr, id: u16, initial_seq: u16, opts: &Options) -> Client {
        Client {
            peer: Peer::new_client(server_ip, id, initial_seq),
            emulation_wanted: opts.emulation,
            emulation_active: false,
            daemon_requested: opts.daemon,
            daemonized: false,
            retries: opts.retries,
            keepalive_secs: opts.keepalive,
            stop: false,
        }
    }

    /// Only `CONNECTION_REQUEST` carries the emulation bit; every other
    /// message type transmits reserved flag bits as zero.
    fn flags_for(&self, packet_type: PacketType) -> u8 {
        if packet_type == PacketType::ConnectionRequest && self.emulation_wanted {
            FLAG_EMULATION
        } else {
            0
        }
    }

    fn connected(&self) -> bool {
        self.peer
            .client_state()
            .expect("client peer always holds ClientState")
            .connected
    }

    fn retries_exceeded(&self) -> bool {
        match self.retries.limit() {
            Some(limit) => self.peer.timeouts >= limit,
            None => false,
        }
    }

    fn take_seq(&mut self) -> u16 {
        let active = self.emulation_active;
        let state = self
            .peer
            .client_state_mut()
            .expect("client peer always holds ClientState");
        emulation::next_seq(&mut state.next_seq, active)
    }

    fn send_control(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        packet_type: PacketType,
    ) -> Result<(), ClientError> {
        let seq = self.take_seq();
        let header = TunnelHeader::new(MAGIC_CLIENT, self.flags_for(packet_type), packet_type);
        if let Err(err) = endpoint.send(self.peer.link_ip, self.peer.id, seq, &header, 0) {
            eprintln!("transport error sending {packet_type:?}: {err}");
        }
        Ok(())
    }

    fn send_connection_request(&mut self, endpoint: &mut IcmpEndpoint) -> Result<(), ClientError> {
        self.send_control(endpoint, PacketType::ConnectionRequest)
    }

    fn send_punchthru(&mut self, endpoint: &mut IcmpEndpoint) -> Result<(), ClientError> {
        self.send_control(endpoint, PacketType::Punchthru)
    }

    fn send_keepalive(&mut self, endpoint: &mut IcmpEndpoint) -> Result<(), ClientError> {
        self.send_control(endpoint, PacketType::KeepAlive)
    }

    /// Sends the very first connection request. Must be called once before
    /// handing the client to the forwarder loop.
    pub fn start(&mut self, endpoint: &mut IcmpEndpoint) -> Result<(), ClientError> {
        self.send_connection_request(endpoint)
    }

    /// Drops back to the disconnected state and restarts the handshake,
    /// used when the default retry budget (but not an operator-specified
    /// one) is exhausted in steady state.
    fn reconnect(&mut self, endpoint: &mut IcmpEndpoint) -> Result<(), ClientError> {
        self.peer
            .client_state_mut()
            .expect("client peer always holds ClientState")
            .connected = false;
        self.peer.reset_timeout();
        self.emulation_active = false;
        self.send_connection_request(endpoint)
    }

    fn handle_connection_accept(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        header: TunnelHeader,
    ) -> Result<(), ClientError> {
        let already_connected = self.connected();
        if already_connected {
            return Ok(());
        }

        self.peer
            .client_state_mut()
            .expect("client peer always holds ClientState")
            .connected = true;

        // The server has the final say: whatever it set on the accept is
        // what this session runs with, even if the operator asked for
        // emulation and the server declined it.
        self.emulation_active = header.emulation_requested();

        eprintln!("connection established");
        if self.emulation_active {
            eprintln!("sequence emulation active");
        }

        if self.daemon_requested && !self.daemonized {
            daemon::daemonize()?;
            self.daemonized = true;
        }

        if !self.emulation_active {
            for _ in 0..INITIAL_PUNCHTHRU_BURST {
                self.send_punchthru(endpoint)?;
            }
        }

        Ok(())
    }
}

impl RoleHandler for Client {
    type Error = ClientError;

    fn handle_tunnel_frame(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        _tun: &mut TunDevice,
        payload_len: usize,
    ) -> Result<(), ClientError> {
        if !self.connected() {
            return Ok(());
        }

        let seq = self.take_seq();
        let header = TunnelHeader::new(MAGIC_CLIENT, self.flags_for(PacketType::Data), PacketType::Data);
        if let Err(err) = endpoint.send(self.peer.link_ip, self.peer.id, seq, &header, payload_len) {
            eprintln!("transport error sending data: {err}");
        }
        Ok(())
    }

    fn handle_icmp_message(
        &mut self,
        endpoint: &mut IcmpEndpoint,
        tun: &mut TunDevice,
        source: Ipv4Addr,
        id: u16,
        _seq: u16,
        header: TunnelHeader,
        payload_len: usize,
    ) -> Result<(), ClientError> {
        if source != self.peer.link_ip || header.magic != MAGIC_SERVER || id != self.peer.id {
            return Ok(());
        }

        self.peer.reset_timeout();

        match header.packet_type {
            PacketType::ConnectionAccept => self.handle_connection_accept(endpoint, header)?,
            PacketType::ServerFull => self.stop = true,
            PacketType::Data => {
                let payload = &endpoint.rx_payload()[..payload_len];
                tun.write(payload).map_err(ClientError::Tun)?;
            }
            PacketType::KeepAlive | PacketType::ConnectionRequest | PacketType::Punchthru => {}
        }

        Ok(())
    }

    fn handle_tick(&mut self, endpoint: &mut IcmpEndpoint, _tun: &mut TunDevice) -> Result<(), ClientError> {
        if !self.connected() {
            if self.peer.tick(1) {
                self.send_connection_request(endpoint)?;
                if self.retries_exceeded() {
                    return Err(ClientError::ServerUnreachable);
                }
            }
            return Ok(());
        }

        // The sequence is static under emulation, so a punch-thru would
        // just hand the server back the number it already has.
        if !self.emulation_active {
            self.send_punchthru(endpoint)?;
        }

        if self.peer.tick(self.keepalive_secs) {
            self.send_keepalive(endpoint)?;
            if self.retries_exceeded() {
                if self.retries.reconnects_on_timeout() {
                    eprintln!("peer timed out, reconnecting");
                    self.reconnect(endpoint)?;
                } else {
                    return Err(ClientError::PeerTimedOut);
                }
            }
        }

        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Retries;

    fn test_options() -> Options {
        Options {
            user: None,
            keepalive: 10,
            retries: Retries::Finite(3),
            mtu: 1472,
            emulation: false,
            daemon: false,
            ttl_hops: None,
            id: None,
            server: false,
            host: Some("192.0.2.1".to_string()),
        }
    }

    #[test]
    fn starts_disconnected_and_requires_accept() {
        let client = Client::new(Ipv4Addr::new(192, 0, 2, 1), 42, 0, &test_options());
        assert!(!client.connected());
    }

    #[test]
    fn retries_exceeded_respects_infinite() {
        let mut opts = test_options();
        opts.retries = Retries::Infinite;
        let mut client = Client::new(Ipv4Addr::new(192, 0, 2, 1), 42, 0, &opts);
        client.peer.timeouts = 1_000_000;
        assert!(!client.retries_exceeded());
    }

    #[test]
    fn retries_exceeded_at_exact_limit() {
        let mut client = Client::new(Ipv4Addr::new(192, 0, 2, 1), 42, 0, &test_options());
        client.peer.timeouts = 2;
        assert!(!client.retries_exceeded());
        client.peer.timeouts = 3;
        assert!(client.retries_exceeded());
    }

    #[test]
    fn emulation_flag_requested_only_on_connection_request() {
        let mut opts = test_options();
        opts.emulation = true;
        let client = Client::new(Ipv4Addr::new(192, 0, 2, 1), 42, 0, &opts);
        assert_eq!(
            client.flags_for(PacketType::ConnectionRequest),
            FLAG_EMULATION
        );
        assert_eq!(client.flags_for(PacketType::Data), 0);
        assert_eq!(client.flags_for(PacketType::Punchthru), 0);
    }

    #[test]
    fn default_retries_reconnect_instead_of_exiting() {
        let opts = test_options();
        assert!(!opts.retries.reconnects_on_timeout());

        let mut default_opts = test_options();
        default_opts.retries = Retries::Default(3);
        assert!(default_opts.retries.reconnects_on_timeout());
    }
}
