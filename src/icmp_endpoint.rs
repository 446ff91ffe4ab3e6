//! The ICMP endpoint: one raw socket, one packed MTU+header buffer, shared
//! by transmit and receive. Enforces TTL security and the role's ICMP type
//! filter before anything above it sees a packet.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::ip::IpV4Header;
use crate::protocol::{self, TunnelHeader};

pub const ICMP_HEADER_SIZE: usize = 8;
pub const HEADER_TOTAL: usize = ICMP_HEADER_SIZE + protocol::HEADER_SIZE;

/// Largest IPv4 header the kernel can hand back to us (options included).
const MAX_IP_HEADER: usize = 60;

const SOL_RAW: libc::c_int = 255;
const ICMP_FILTER: libc::c_int = 1;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unable to open icmp socket: {0}")]
    Open(#[source] io::Error),
    #[error("unable to set socket ttl: {0}")]
    SetTtl(#[source] io::Error),
    #[error("icmp send failed: {0}")]
    Send(#[source] io::Error),
    #[error("short send: wrote {wrote} of {expected} bytes")]
    ShortSend { wrote: usize, expected: usize },
    #[error("icmp recv failed: {0}")]
    Recv(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The ICMP type this role is allowed to send.
    fn send_type(&self) -> u8 {
        match self {
            Role::Client => 8, // Echo Request
            Role::Server => 0, // Echo Reply
        }
    }

    /// The ICMP type this role expects to receive.
    fn recv_type(&self) -> u8 {
        match self {
            Role::Client => 0, // Echo Reply
            Role::Server => 8, // Echo Request
        }
    }
}

pub enum RecvOutcome {
    Accepted {
        source: Ipv4Addr,
        id: u16,
        seq: u16,
        header: TunnelHeader,
        payload_len: usize,
    },
    /// Failed a framing or policy check; not an error, just a drop.
    Rejected,
}

pub struct IcmpEndpoint {
    socket: Socket,
    buffer: Vec<u8>,
    role: Role,
    mtu: usize,
    ttl_threshold: Option<u8>,
    user_space_filter: bool,
    last_payload: Option<(usize, usize)>,
}

impl IcmpEndpoint {
    pub fn open(role: Role, mtu: usize, ttl_hops: Option<u8>) -> Result<IcmpEndpoint, EndpointError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(EndpointError::Open)?;

        let ttl_threshold = ttl_hops.map(|hops| {
            255u8.saturating_sub(hops)
        });

        if ttl_hops.is_some() {
            socket.set_ttl(255).map_err(EndpointError::SetTtl)?;
        }

        let user_space_filter = !install_kernel_filter(socket.as_raw_fd(), role.recv_type());

        let buffer = vec![0u8; MAX_IP_HEADER + HEADER_TOTAL + mtu];

        Ok(IcmpEndpoint {
            socket,
            buffer,
            role,
            mtu,
            ttl_threshold,
            user_space_filter,
            last_payload: None,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether the kernel-level ICMP type filter could not be installed and
    /// receives are being filtered in user space instead.
    pub fn using_user_space_filter(&self) -> bool {
        self.user_space_filter
    }

    /// The mutable slice of the shared buffer a caller should fill with an
    /// outbound tunnel payload before calling `send`.
    pub fn tx_payload_mut(&mut self) -> &mut [u8] {
        let start = HEADER_TOTAL;
        &mut self.buffer[start..start + self.mtu]
    }

    /// The payload of the most recently accepted receive.
    pub fn rx_payload(&self) -> &[u8] {
        match self.last_payload {
            Some((offset, len)) => &self.buffer[offset..offset + len],
            None => &[],
        }
    }

    pub fn send(
        &mut self,
        target: Ipv4Addr,
        id: u16,
        seq: u16,
        header: &TunnelHeader,
        payload_len: usize,
    ) -> Result<(), EndpointError> {
        let total = HEADER_TOTAL + payload_len;

        self.buffer[0] = self.role.send_type();
        self.buffer[1] = 0; // code
        self.buffer[2] = 0; // checksum, filled below
        self.buffer[3] = 0;
        self.buffer[4..6].copy_from_slice(&id.to_be_bytes());
        self.buffer[6..8].copy_from_slice(&seq.to_be_bytes());
        header.encode(&mut self.buffer[ICMP_HEADER_SIZE..HEADER_TOTAL]);

        let sum = crate::checksum::checksum(&self.buffer[..total]);
        self.buffer[2..4].copy_from_slice(&sum.to_be_bytes());

        let dest: SocketAddr = SocketAddr::new(IpAddr::V4(target), 0);
        let wrote = self
            .socket
            .send_to(&self.buffer[..total], &dest.into())
            .map_err(EndpointError::Send)?;

        if wrote != total {
            return Err(EndpointError::ShortSend {
                wrote,
                expected: total,
            });
        }

        Ok(())
    }

    pub fn recv(&mut self) -> Result<RecvOutcome, EndpointError> {
        let (n, ip_source) = recv_from_raw(self.socket.as_raw_fd(), &mut self.buffer)
            .map_err(EndpointError::Recv)?;

        let data_len = n;

        let ip_header = match IpV4Header::decode(&self.buffer[..data_len]) {
            Ok(header) => header,
            Err(_) => return Ok(RecvOutcome::Rejected),
        };

        if ip_header.source != ip_source {
            return Ok(RecvOutcome::Rejected);
        }

        if let Some(threshold) = self.ttl_threshold {
            if ip_header.ttl < threshold {
                return Ok(RecvOutcome::Rejected);
            }
        }

        let icmp_start = ip_header.header_len;
        if data_len < icmp_start + HEADER_TOTAL {
            return Ok(RecvOutcome::Rejected);
        }

        let icmp_type = self.buffer[icmp_start];
        let icmp_code = self.buffer[icmp_start + 1];

        if icmp_code != 0 {
            return Ok(RecvOutcome::Rejected);
        }

        if self.user_space_filter && icmp_type != self.role.recv_type() {
            return Ok(RecvOutcome::Rejected);
        }

        let id = u16::from_be_bytes([self.buffer[icmp_start + 4], self.buffer[icmp_start + 5]]);
        let seq = u16::from_be_bytes([self.buffer[icmp_start + 6], self.buffer[icmp_start + 7]]);

        let tunnel_header = {
            let tunnel_start = icmp_start + ICMP_HEADER_SIZE;
            match TunnelHeader::decode(&self.buffer[tunnel_start..data_len]) {
                Ok(header) => header,
                Err(_) => return Ok(RecvOutcome::Rejected),
            }
        };

        let payload_offset = icmp_start + HEADER_TOTAL;
        let payload_len = data_len - payload_offset;
        self.last_payload = Some((payload_offset, payload_len));

        Ok(RecvOutcome::Accepted {
            source: ip_source,
            id,
            seq,
            header: tunnel_header,
            payload_len,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Installs the Linux `ICMP_FILTER` socket option so the kernel delivers
/// only `want_type`. Returns `false` (caller falls back to a user-space
/// check) if the option is rejected, e.g. on a non-Linux target.
fn install_kernel_filter(fd: RawFd, want_type: u8) -> bool {
    let mask: u32 = !(1u32 << want_type);
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_RAW,
            ICMP_FILTER,
            &mask as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    ret == 0
}

fn recv_from_raw(fd: RawFd, buffer: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
    let mut from: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut fromlen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let n = unsafe {
        libc::recvfrom(
            fd,
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            0,
            &mut from as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut fromlen,
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let source = Ipv4Addr::from(u32::from_be(from.sin_addr.s_addr));
    Ok((n as usize, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_send_and_recv_types_are_complementary() {
        assert_eq!(Role::Client.send_type(), 8);
        assert_eq!(Role::Client.recv_type(), 0);
        assert_eq!(Role::Server.send_type(), 0);
        assert_eq!(Role::Server.recv_type(), 8);
    }
}
