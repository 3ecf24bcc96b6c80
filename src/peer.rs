//! Per-peer session state machine: invite, accept, sync, teardown (§4.3).
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long to wait for `OK` before re-sending `IN` (§4.3, §5).
pub const INVITE_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotConnected,
    SentRequest,
    /// CONNECTED. Clock sync runs as an informational substate ([`PeerState::Sync`])
    /// but the peer is already usable for MIDI while it runs.
    Connected,
    Sync,
    Closed,
}

/// Who opened the session: we sent the first `IN`, or they did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One remote endpoint's session state (§3 "Peer session").
#[derive(Debug, Clone)]
pub struct Peer {
    pub initiator_token: u32,
    pub remote_ssrc: Option<u32>,
    pub control_addr: SocketAddr,
    pub name: String,
    pub role: Role,
    pub state: PeerState,
    started_at: Instant,
    /// `offset = (t1 + t3) / 2 - t2`, in 100 µs units (§4.3 clock sync).
    pub latency_offset: i64,
    /// One-way latency estimate, in ms.
    pub latency_ms: u64,
    send_sequence: u16,
    pub last_heard: Instant,
    /// Id of this peer's pending invite-retry timer, if one is scheduled.
    pub retry_timer_id: Option<u64>,
}

impl Peer {
    pub fn new(control_addr: SocketAddr, initiator_token: u32, name: String, role: Role) -> Self {
        let now = Instant::now();
        Peer {
            initiator_token,
            remote_ssrc: None,
            control_addr,
            name,
            role,
            state: PeerState::NotConnected,
            started_at: now,
            latency_offset: 0,
            latency_ms: 0,
            send_sequence: 0,
            last_heard: now,
            retry_timer_id: None,
        }
    }

    /// Data channel is always control channel port + 1 (§3, §4.6).
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.control_addr.ip(), self.control_addr.port() + 1)
    }

    /// Next outbound RTP sequence number, wrapping at 2^16 (§4.6).
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        seq
    }

    /// Milliseconds since this session's own clock started, used as the RTP
    /// timestamp (§4.3: "relative to that peer's session start, not wall clock").
    pub fn session_ms(&self) -> u32 {
        self.started_at.elapsed().as_millis() as u32
    }

    /// `CLOSED` peers must not emit further packets (§4.3).
    pub fn is_usable(&self) -> bool {
        !matches!(self.state, PeerState::Closed)
    }

    pub fn mark_heard(&mut self) {
        self.last_heard = Instant::now();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer {{ name: {}, addr: {}, ssrc: {:?} }}", self.name, self.control_addr, self.remote_ssrc)
    }
}

/// The result of a completed three-way clock sync exchange, in 100 µs ticks (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncResult {
    pub offset: i64,
    pub latency_ms: u64,
}

/// `offset = (t1 + t3) / 2 - t2`; `latency = (t3 - t1) / 20` ms (§4.3, §8 property 5).
pub fn compute_clock_sync(t1: u64, t2: u64, t3: u64) -> ClockSyncResult {
    let offset = (t1 as i64 + t3 as i64) / 2 - t2 as i64;
    let latency_ms = (t3 - t1) / 20;
    ClockSyncResult { offset, latency_ms }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_sync_math_matches_spec_example() {
        let result = compute_clock_sync(100, 200, 300);
        assert_eq!(result, ClockSyncResult { offset: 0, latency_ms: 10 });
    }

    #[test]
    fn sequence_numbers_increase_and_wrap() {
        let mut peer = Peer::new("127.0.0.1:5004".parse().unwrap(), 1, "Test".to_string(), Role::Client);
        peer.send_sequence = u16::MAX;
        assert_eq!(peer.next_sequence(), u16::MAX);
        assert_eq!(peer.next_sequence(), 0);
        assert_eq!(peer.next_sequence(), 1);
    }

    #[test]
    fn data_addr_is_control_port_plus_one() {
        let peer = Peer::new("192.0.2.5:5004".parse().unwrap(), 1, "Test".to_string(), Role::Server);
        assert_eq!(peer.data_addr(), "192.0.2.5:5005".parse().unwrap());
    }

    #[test]
    fn closed_peer_is_not_usable() {
        let mut peer = Peer::new("127.0.0.1:5004".parse().unwrap(), 1, "Test".to_string(), Role::Client);
        assert!(peer.is_usable());
        peer.state = PeerState::Closed;
        assert!(!peer.is_usable());
    }
}
