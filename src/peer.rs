//! The single remote peer each side of the tunnel tracks: link address,
//! randomized session id, the timeout ladder, and (server-side) the
//! punch-thru reservoir that lets outbound data ride an echo reply whose
//! sequence number a NAT has already seen.

use std::net::Ipv4Addr;

/// Number of punch-thru sequence numbers the server remembers at once.
pub const PUNCHTHRU_WINDOW: usize = 64;

/// A ring of sequence numbers the client has punched through with, waiting
/// to be spent on outbound data. Oldest entry is overwritten once full,
/// since a stale punch-thru is no more useful to drain than a fresh one.
#[derive(Debug, Clone)]
pub struct PunchthruRing {
    slots: [u16; PUNCHTHRU_WINDOW],
    read_idx: usize,
    write_idx: usize,
    len: usize,
}

impl PunchthruRing {
    pub fn new() -> PunchthruRing {
        PunchthruRing {
            slots: [0; PUNCHTHRU_WINDOW],
            read_idx: 0,
            write_idx: 0,
            len: 0,
        }
    }

    /// Records a sequence number the client has just punched through with.
    pub fn push(&mut self, seq: u16) {
        self.slots[self.write_idx] = seq;
        self.write_idx = (self.write_idx + 1) % PUNCHTHRU_WINDOW;

        if self.len == PUNCHTHRU_WINDOW {
            self.read_idx = (self.read_idx + 1) % PUNCHTHRU_WINDOW;
        } else {
            self.len += 1;
        }
    }

    /// Spends the oldest recorded sequence number, or `None` if the
    /// reservoir is empty and the caller has nothing to send with yet.
    pub fn pop(&mut self) -> Option<u16> {
        if self.len == 0 {
            return None;
        }

        let seq = self.slots[self.read_idx];
        self.read_idx = (self.read_idx + 1) % PUNCHTHRU_WINDOW;
        self.len -= 1;
        Some(seq)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.len = 0;
    }
}

impl Default for PunchthruRing {
    fn default() -> PunchthruRing {
        PunchthruRing::new()
    }
}

#[derive(Debug, Clone)]
pub struct ClientState {
    pub connected: bool,
    pub next_seq: u16,
}

impl ClientState {
    pub fn new(initial_seq: u16) -> ClientState {
        ClientState {
            connected: false,
            next_seq: initial_seq,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerState {
    bound_id: Option<u16>,
    pub punchthru: PunchthruRing,
}

impl ServerState {
    pub fn new() -> ServerState {
        ServerState::default()
    }

    pub fn bound_id(&self) -> Option<u16> {
        self.bound_id
    }

    pub fn is_bound(&self) -> bool {
        self.bound_id.is_some()
    }

    /// Binds (or re-binds) the server to a client id. The punch-thru ring
    /// is always reset, even when re-accepting the client already bound,
    /// since any reservoir entries recorded under the old binding cannot
    /// be trusted to still match the client's NAT state.
    pub fn bind(&mut self, id: u16) {
        self.bound_id = Some(id);
        self.punchthru.reset();
    }

    /// Releases the binding after the peer has gone silent past its retry
    /// budget. The server keeps running and will accept a new client.
    pub fn unbind(&mut self) {
        self.bound_id = None;
        self.punchthru.reset();
    }
}

#[derive(Debug, Clone)]
pub enum PeerRole {
    Client(ClientState),
    Server(ServerState),
}

/// The remote endpoint of the tunnel: its link address and id, the
/// role-specific state above, and the shared timeout bookkeeping the
/// forwarder's one-second tick advances.
#[derive(Debug, Clone)]
pub struct Peer {
    pub link_ip: Ipv4Addr,
    pub id: u16,
    pub seconds: u32,
    pub timeouts: u32,
    pub role: PeerRole,
}

impl Peer {
    pub fn new_client(link_ip: Ipv4Addr, id: u16, initial_seq: u16) -> Peer {
        Peer {
            link_ip,
            id,
            seconds: 0,
            timeouts: 0,
            role: PeerRole::Client(ClientState::new(initial_seq)),
        }
    }

    pub fn new_server() -> Peer {
        Peer {
            link_ip: Ipv4Addr::UNSPECIFIED,
            id: 0,
            seconds: 0,
            timeouts: 0,
            role: PeerRole::Server(ServerState::new()),
        }
    }

    /// Clears the timeout ladder; called whenever a message from the peer
    /// is accepted. Clears the whole ladder, not just the idle clock: a
    /// single accepted message means the peer is alive, however many
    /// timeouts were racked up getting here.
    pub fn reset_timeout(&mut self) {
        self.seconds = 0;
        self.timeouts = 0;
    }

    /// Advances the one-second tick. Returns true once the tick crosses a
    /// retry boundary, i.e. the caller should act (send a keepalive/retry
    /// or give up).
    pub fn tick(&mut self, retry_interval: u32) -> bool {
        self.seconds += 1;
        if self.seconds >= retry_interval {
            self.seconds = 0;
            self.timeouts += 1;
            true
        } else {
            false
        }
    }

    pub fn client_state(&self) -> Option<&ClientState> {
        match &self.role {
            PeerRole::Client(state) => Some(state),
            PeerRole::Server(_) => None,
        }
    }

    pub fn client_state_mut(&mut self) -> Option<&mut ClientState> {
        match &mut self.role {
            PeerRole::Client(state) => Some(state),
            PeerRole::Server(_) => None,
        }
    }

    pub fn server_state(&self) -> Option<&ServerState> {
        match &self.role {
            PeerRole::Server(state) => Some(state),
            PeerRole::Client(_) => None,
        }
    }

    pub fn server_state_mut(&mut self) -> Option<&mut ServerState> {
        match &mut self.role {
            PeerRole::Server(state) => Some(state),
            PeerRole::Client(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drains_in_fifo_order() {
        let mut ring = PunchthruRing::new();
        ring.push(10);
        ring.push(11);
        ring.push(12);

        assert_eq!(ring.pop(), Some(10));
        assert_eq!(ring.pop(), Some(11));
        assert_eq!(ring.pop(), Some(12));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_reports_empty_without_panicking() {
        let mut ring = PunchthruRing::new();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_overwrites_oldest_entry_once_full() {
        let mut ring = PunchthruRing::new();
        for seq in 0..(PUNCHTHRU_WINDOW as u16 + 3) {
            ring.push(seq);
        }

        assert_eq!(ring.len(), PUNCHTHRU_WINDOW);
        // The first three pushes (0, 1, 2) were evicted by the overflow.
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn binding_resets_the_ring_even_when_rebinding_same_client() {
        let mut state = ServerState::new();
        state.bind(42);
        state.punchthru.push(7);
        assert_eq!(state.punchthru.len(), 1);

        state.bind(42);
        assert_eq!(state.punchthru.len(), 0);
        assert_eq!(state.bound_id(), Some(42));
    }

    #[test]
    fn client_seq_wraps_on_overflow() {
        let mut state = ClientState::new(u16::MAX);
        assert_eq!(crate::emulation::next_seq(&mut state.next_seq, false), u16::MAX);
        assert_eq!(crate::emulation::next_seq(&mut state.next_seq, false), 0);
    }
}
