//! Owns the two UDP sockets, demultiplexes datagrams, and fans MIDI out to every
//! connected peer (§4.6 "Endpoint (RTPMidi)").
use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use mio::net::UdpSocket;
use mio::{Interest, Token};

use crate::codec::{self, ControlCommand, Datagram};
use crate::dispatcher::{EventHandler, TimerId, Timers};
use crate::peer::{self, Peer, PeerState, Role, INVITE_RETRY};
use crate::registry::SessionRegistry;
use crate::sequencer::Sequencer;
use crate::translator;

const MAX_UDP_PACKET_SIZE: usize = 1500;

const CONTROL_TOKEN: Token = Token(0);
const DATA_TOKEN: Token = Token(1);
const SEQUENCER_TOKEN: Token = Token(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Control,
    Data,
}

/// What a scheduled timer is for, since `EventHandler::on_timer` only carries an
/// opaque id (§9 "Timers": "an ordered list of pending timers (deadline, id,
/// callback, args)" — `args` lives here).
enum TimerPurpose {
    InviteRetry { initiator_token: u32, addr: SocketAddr, channel: Channel },
}

pub struct Endpoint<S: Sequencer> {
    ssrc: u32,
    name: String,
    control_socket: UdpSocket,
    data_socket: UdpSocket,
    sequencer: S,
    registry: SessionRegistry,
    timer_purposes: HashMap<TimerId, TimerPurpose>,
    recv_buf: [u8; MAX_UDP_PACKET_SIZE],
}

impl<S: Sequencer> Endpoint<S> {
    /// Binds both UDP sockets; `control_port` and `control_port + 1` (§6).
    pub fn bind(control_port: u16, name: String, ssrc: u32, sequencer: S) -> std::io::Result<Self> {
        let unspecified = |port: u16| SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
        let control_socket = UdpSocket::bind(unspecified(control_port))?;
        let data_socket = UdpSocket::bind(unspecified(control_port + 1))?;
        Ok(Endpoint {
            ssrc,
            name,
            control_socket,
            data_socket,
            sequencer,
            registry: SessionRegistry::new(),
            timer_purposes: HashMap::new(),
            recv_buf: [0u8; MAX_UDP_PACKET_SIZE],
        })
    }

    /// Registers the control socket, data socket, and local sequencer with the
    /// dispatcher's poll registry. Call once, right after constructing the
    /// [`crate::dispatcher::Dispatcher`] around this endpoint.
    pub fn register_sources(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        registry.register(&mut self.control_socket, CONTROL_TOKEN, Interest::READABLE)?;
        registry.register(&mut self.data_socket, DATA_TOKEN, Interest::READABLE)?;
        registry.register(&mut self.sequencer, SEQUENCER_TOKEN, Interest::READABLE)?;
        Ok(())
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Direct access to the local sequencer handle, for driving/observing it from
    /// outside the poll loop (demos, tests).
    pub fn sequencer_mut(&mut self) -> &mut S {
        &mut self.sequencer
    }

    /// Starts an outbound session: sends `IN` on the control socket and arms the
    /// 30 s retry timer (§4.3 transition 1).
    pub fn invite_participant(&mut self, addr: SocketAddr, timers: &mut Timers) -> std::io::Result<()> {
        let initiator_token = rand::random::<u32>();
        let peer = Peer::new(addr, initiator_token, String::new(), Role::Client);
        self.registry.insert_initiator(peer);
        self.send_invite_on(Channel::Control, addr, initiator_token)?;
        self.arm_retry(initiator_token, addr, Channel::Control, timers);
        Ok(())
    }

    /// Sends `IN` from the socket belonging to `channel`, so the reply lands back
    /// on that same socket (§4.3 transition 2: the data-leg invite must originate
    /// from the data socket, not the control socket).
    fn send_invite_on(&mut self, channel: Channel, addr: SocketAddr, initiator_token: u32) -> std::io::Result<()> {
        let command = ControlCommand::Invite { initiator_token, sender_ssrc: self.ssrc, name: self.name.clone() };
        self.socket(channel).send_to(&command.to_bytes(), addr)?;
        info!("{}: sent IN to {addr} on {channel:?} (initiator {initiator_token:#x})", self.name);
        Ok(())
    }

    fn arm_retry(&mut self, initiator_token: u32, addr: SocketAddr, channel: Channel, timers: &mut Timers) {
        let id = timers.call_later(INVITE_RETRY);
        self.timer_purposes.insert(id, TimerPurpose::InviteRetry { initiator_token, addr, channel });
        if let Some(peer) = self.registry.lookup_by_initiator_mut(initiator_token) {
            peer.retry_timer_id = Some(id);
        }
    }

    /// Fans a local-sequencer event out to every usable, bound peer (§4.6 "Outbound
    /// MIDI").
    fn broadcast_midi(&mut self, event: &translator::SequencerEvent) {
        let command = translator::to_midi(event);
        let ssrc = self.ssrc;
        for peer in self.registry.iter_mut() {
            if !peer.is_usable() || peer.remote_ssrc.is_none() {
                continue;
            }
            let Some(packet) = codec::rtp::build(peer.next_sequence(), peer.session_ms(), ssrc, std::slice::from_ref(&command)) else {
                warn!("endpoint: refusing to send oversize MIDI event to {}", peer.control_addr);
                continue;
            };
            if let Err(e) = self.data_socket.send_to(&packet, peer.data_addr()) {
                warn!("endpoint: send to {} failed: {e}", peer.data_addr());
            }
        }
    }

    fn handle_sequencer_readable(&mut self) {
        loop {
            match self.sequencer.next_event() {
                Ok(Some(event)) => self.broadcast_midi(&event),
                Ok(None) => break,
                Err(e) => {
                    warn!("endpoint: sequencer read error: {e}");
                    break;
                }
            }
        }
    }

    fn socket(&mut self, channel: Channel) -> &mut UdpSocket {
        match channel {
            Channel::Control => &mut self.control_socket,
            Channel::Data => &mut self.data_socket,
        }
    }

    fn handle_channel_readable(&mut self, channel: Channel, timers: &mut Timers) {
        loop {
            let recv_result = match channel {
                Channel::Control => self.control_socket.recv_from(&mut self.recv_buf),
                Channel::Data => self.data_socket.recv_from(&mut self.recv_buf),
            };
            let (len, src) = match recv_result {
                Ok(result) => result,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("endpoint: recv on {channel:?} failed: {e}");
                    return;
                }
            };
            let datagram = match codec::parse_datagram(&self.recv_buf[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("endpoint: dropping malformed datagram from {src} on {channel:?}: {e}");
                    continue;
                }
            };
            match datagram {
                Datagram::Control(command) => self.handle_control_command(channel, src, command, timers),
                Datagram::Midi(packet) => self.handle_midi_packet(packet),
            }
        }
    }

    fn handle_control_command(&mut self, channel: Channel, src: SocketAddr, command: ControlCommand, timers: &mut Timers) {
        match command {
            ControlCommand::Invite { initiator_token, sender_ssrc, name } => self.handle_invite(channel, src, initiator_token, sender_ssrc, name),
            ControlCommand::Accept { initiator_token, sender_ssrc, name } => self.handle_accept(channel, src, initiator_token, sender_ssrc, name, timers),
            ControlCommand::Reject { initiator_token, .. } => {
                warn!("{}: received NO for initiator {initiator_token:#x} from {src}", self.name);
                self.cancel_and_remove(initiator_token, timers);
            }
            ControlCommand::End { initiator_token, .. } => {
                info!("{}: received BY for initiator {initiator_token:#x} from {src}", self.name);
                self.cancel_and_remove(initiator_token, timers);
            }
            ControlCommand::ClockSync { sender_ssrc, count, timestamps } => self.handle_clock_sync(sender_ssrc, count, timestamps),
            ControlCommand::ReceiverFeedback { ssrc, sequence } => {
                // §4.3 "RS handling": accepted and logged, no journal replay, peer retained.
                debug!("{}: RS from ssrc {ssrc:#x}, sequence {sequence}", self.name);
            }
        }
    }

    fn handle_invite(&mut self, channel: Channel, src: SocketAddr, initiator_token: u32, sender_ssrc: u32, name: String) {
        if self.registry.lookup_by_initiator(initiator_token).is_none() {
            let mut peer = Peer::new(src, initiator_token, name, Role::Server);
            peer.state = PeerState::Connected;
            self.registry.insert_initiator(peer);
            if let Err(e) = self.registry.bind_ssrc(initiator_token, sender_ssrc) {
                error!("{}: {e}", self.name);
            }
            info!("{}: accepted invite from {src} (initiator {initiator_token:#x})", self.name);
            self.start_clock_sync(sender_ssrc);
        }
        let reply = ControlCommand::Accept { initiator_token, sender_ssrc: self.ssrc, name: self.name.clone() };
        if let Err(e) = self.socket(channel).send_to(&reply.to_bytes(), src) {
            warn!("{}: failed to send OK to {src}: {e}", self.name);
        }
    }

    fn handle_accept(&mut self, channel: Channel, src: SocketAddr, initiator_token: u32, sender_ssrc: u32, name: String, timers: &mut Timers) {
        let data_addr = {
            let Some(peer) = self.registry.lookup_by_initiator_mut(initiator_token) else {
                warn!("{}: OK from {src} for unknown initiator {initiator_token:#x}", self.name);
                return;
            };
            if peer.name.is_empty() {
                peer.name = name;
            }
            if let Some(id) = peer.retry_timer_id.take() {
                timers.cancel(id);
            }
            peer.data_addr()
        };

        if channel == Channel::Control {
            // Open the data leg of the two-port handshake (§4.3 transition 2).
            if let Err(e) = self.send_invite_on(Channel::Data, data_addr, initiator_token) {
                warn!("{}: failed to send data-port IN to {data_addr}: {e}", self.name);
            }
            self.arm_retry(initiator_token, data_addr, Channel::Data, timers);
            return;
        }

        if let Err(e) = self.registry.bind_ssrc(initiator_token, sender_ssrc) {
            error!("{}: {e}", self.name);
            return;
        }
        if let Some(peer) = self.registry.lookup_by_initiator_mut(initiator_token) {
            peer.state = PeerState::Connected;
        }
        info!("{}: peer {initiator_token:#x} fully connected, starting clock sync", self.name);
        self.start_clock_sync(sender_ssrc);
    }

    fn cancel_and_remove(&mut self, initiator_token: u32, timers: &mut Timers) {
        if let Some(peer) = self.registry.lookup_by_initiator_mut(initiator_token) {
            if let Some(id) = peer.retry_timer_id.take() {
                timers.cancel(id);
            }
        }
        self.registry.remove(initiator_token);
    }

    /// Explicit teardown: sends `BY` on both sockets and evicts the peer (§4.3
    /// "sending close() transmits BY on both sockets and marks CLOSED").
    pub fn close_peer(&mut self, initiator_token: u32, timers: &mut Timers) {
        if let Some(peer) = self.registry.lookup_by_initiator_mut(initiator_token) {
            if peer.is_usable() {
                let control_addr = peer.control_addr;
                let data_addr = peer.data_addr();
                let bytes = ControlCommand::End { initiator_token, sender_ssrc: self.ssrc }.to_bytes();
                if let Err(e) = self.control_socket.send_to(&bytes, control_addr) {
                    warn!("{}: failed to send BY to {control_addr}: {e}", self.name);
                }
                if let Err(e) = self.data_socket.send_to(&bytes, data_addr) {
                    warn!("{}: failed to send BY to {data_addr}: {e}", self.name);
                }
                peer.state = PeerState::Closed;
                info!("{}: closed session with {control_addr} (initiator {initiator_token:#x})", self.name);
            }
        }
        self.cancel_and_remove(initiator_token, timers);
    }

    /// Tears down every peer, for process shutdown (§5 "on process shutdown all
    /// peers receive a BY on both sockets if reachable").
    pub fn shutdown(&mut self, timers: &mut Timers) {
        let tokens: Vec<u32> = self.registry.iter().map(|peer| peer.initiator_token).collect();
        for initiator_token in tokens {
            self.close_peer(initiator_token, timers);
        }
    }

    fn start_clock_sync(&mut self, remote_ssrc: u32) {
        let Some(peer) = self.registry.lookup_by_ssrc_mut(remote_ssrc) else { return };
        peer.state = PeerState::Sync;
        let t1 = now_100us(peer);
        let command = ControlCommand::ClockSync { sender_ssrc: self.ssrc, count: 0, timestamps: [t1, 0, 0] };
        let addr = peer.data_addr();
        if let Err(e) = self.data_socket.send_to(&command.to_bytes(), addr) {
            warn!("{}: failed to send CK count=0 to {addr}: {e}", self.name);
        }
    }

    fn handle_clock_sync(&mut self, sender_ssrc: u32, count: u8, timestamps: [u64; 3]) {
        let [t1, t2, _t3] = timestamps;
        let Some(peer) = self.registry.lookup_by_ssrc_mut(sender_ssrc) else {
            warn!("{}: CK from unknown ssrc {sender_ssrc:#x}", self.name);
            return;
        };
        let addr = peer.data_addr();

        match count {
            0 => {
                let t2 = now_100us(peer);
                let reply = ControlCommand::ClockSync { sender_ssrc: self.ssrc, count: 1, timestamps: [t1, t2, 0] };
                if let Err(e) = self.data_socket.send_to(&reply.to_bytes(), addr) {
                    warn!("{}: failed to send CK count=1 to {addr}: {e}", self.name);
                }
            }
            1 => {
                let t3 = now_100us(peer);
                let result = peer::compute_clock_sync(t1, t2, t3);
                peer.latency_offset = result.offset;
                peer.latency_ms = result.latency_ms;
                peer.state = PeerState::Connected;
                let reply = ControlCommand::ClockSync { sender_ssrc: self.ssrc, count: 2, timestamps: [t1, t2, t3] };
                if let Err(e) = self.data_socket.send_to(&reply.to_bytes(), addr) {
                    warn!("{}: failed to send CK count=2 to {addr}: {e}", self.name);
                }
                info!("{}: clock sync with {addr} complete: offset={} latency={}ms", self.name, peer.latency_offset, peer.latency_ms);
            }
            2 => {
                let result = peer::compute_clock_sync(t1, t2, timestamps[2]);
                peer.latency_offset = result.offset;
                peer.latency_ms = result.latency_ms;
                peer.state = PeerState::Connected;
                info!("{}: clock sync with {addr} complete: offset={} latency={}ms", self.name, peer.latency_offset, peer.latency_ms);
            }
            other => warn!("{}: CK with unexpected count {other} from {addr}", self.name),
        }
    }

    fn handle_midi_packet(&mut self, packet: codec::rtp::RtpMidiPacket) {
        let ssrc = packet.ssrc;
        if self.registry.lookup_by_ssrc(ssrc).is_none() {
            warn!("{}: MIDI packet from unregistered ssrc {ssrc:#x}, dropping", self.name);
            return;
        }
        if let Some(peer) = self.registry.lookup_by_ssrc_mut(ssrc) {
            peer.mark_heard();
        }
        for command in &packet.commands {
            if let Some(event) = translator::from_midi(command) {
                if let Err(e) = self.sequencer.send_event(&event) {
                    warn!("{}: failed to deliver event to local sequencer: {e}", self.name);
                }
            }
        }
    }
}

/// This peer's session clock, in 100 µs ticks, per §4.3: "relative to that peer's
/// session start, not wall clock".
fn now_100us(peer: &Peer) -> u64 {
    peer.session_ms() as u64 * 10
}

impl<S: Sequencer> EventHandler for Endpoint<S> {
    fn on_ready(&mut self, token: Token, timers: &mut Timers) {
        match token {
            CONTROL_TOKEN => self.handle_channel_readable(Channel::Control, timers),
            DATA_TOKEN => self.handle_channel_readable(Channel::Data, timers),
            SEQUENCER_TOKEN => self.handle_sequencer_readable(),
            other => warn!("{}: readiness for unknown token {other:?}", self.name),
        }
    }

    fn on_timer(&mut self, id: TimerId, timers: &mut Timers) {
        let Some(purpose) = self.timer_purposes.remove(&id) else { return };
        match purpose {
            TimerPurpose::InviteRetry { initiator_token, addr, channel } => {
                let still_pending = self
                    .registry
                    .lookup_by_initiator(initiator_token)
                    .map(|peer| peer.remote_ssrc.is_none())
                    .unwrap_or(false);
                if !still_pending {
                    return;
                }
                info!("{}: no OK from {addr} within retry window, resending IN on {channel:?}", self.name);
                if let Err(e) = self.send_invite_on(channel, addr, initiator_token) {
                    warn!("{}: retry send to {addr} failed: {e}", self.name);
                    return;
                }
                self.arm_retry(initiator_token, addr, channel, timers);
            }
        }
    }
}
