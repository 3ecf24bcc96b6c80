mod common;

use std::io::Write;
use std::net::SocketAddr;

use common::find_consecutive_ports;
use rtpmidid::dispatcher::Dispatcher;
use rtpmidid::discovery::{SkipSelf, on_service_advertised};
use rtpmidid::endpoint::Endpoint;
use rtpmidid::sequencer::{LoopbackSequencer, Sequencer};
use rtpmidid::translator::SequencerEvent;

type TestDispatcher = Dispatcher<Endpoint<LoopbackSequencer>>;

fn start(name: &str, ssrc: u32) -> (TestDispatcher, SocketAddr) {
    let (control_port, _data_port) = find_consecutive_ports();
    let sequencer = LoopbackSequencer::new().unwrap();
    let endpoint = Endpoint::bind(control_port, name.to_string(), ssrc, sequencer).unwrap();
    let mut dispatcher = Dispatcher::new(endpoint).unwrap();
    let poll_registry = dispatcher.registry_handle().unwrap();
    dispatcher.handler_mut().register_sources(&poll_registry).unwrap();
    let addr = SocketAddr::new("127.0.0.1".parse().unwrap(), control_port);
    (dispatcher, addr)
}

/// Drives the handshake to completion after `initiator` has already sent the
/// first `IN`. The exchange is seven hops (§4.3 transitions 1-4: `IN` ctrl,
/// `OK` ctrl, `IN` data, `OK` data, `CK` 0/1/2), each answered by exactly one
/// `run_once` on whichever side the packet just landed on, starting with
/// `responder` since it is always the next side with something to react to.
fn settle_handshake(initiator: &mut TestDispatcher, responder: &mut TestDispatcher) {
    for hop in 0..7 {
        if hop % 2 == 0 {
            responder.run_once().unwrap();
        } else {
            initiator.run_once().unwrap();
        }
    }
}

#[test]
fn invite_accept_and_clock_sync_leaves_both_sides_connected() {
    let (mut session1, addr1) = start("Session1", 0x1111_1111);
    let (mut session2, addr2) = start("Session2", 0x2222_2222);

    session1.with_handler(|endpoint, timers| endpoint.invite_participant(addr2, timers).unwrap());
    settle_handshake(&mut session1, &mut session2);

    assert_eq!(session1.handler().registry().iter().count(), 1);
    assert_eq!(session2.handler().registry().iter().count(), 1);

    let peer1 = session1.handler().registry().iter().next().unwrap();
    let peer2 = session2.handler().registry().iter().next().unwrap();
    assert_eq!(peer1.control_addr, addr2);
    assert_eq!(peer2.control_addr, addr1);
    assert!(peer1.is_usable());
    assert!(peer2.is_usable());
}

#[test]
fn midi_forwards_from_one_session_to_the_other_after_connecting() {
    let (mut session1, _addr1) = start("Session1", 0x3333_3333);
    let (mut session2, addr2) = start("Session2", 0x4444_4444);

    session1.with_handler(|endpoint, timers| endpoint.invite_participant(addr2, timers).unwrap());
    settle_handshake(&mut session1, &mut session2);

    let note_on = SequencerEvent::NoteOn { channel: 0, note: 64, velocity: 100 };
    session1.handler_mut().sequencer_mut().writer().write_all(&encode_for_test(&note_on)).unwrap();

    session1.run_once().unwrap(); // picks up the sequencer event, broadcasts the RTP-MIDI packet
    session2.run_once().unwrap(); // receives it on the data socket, delivers to its own sequencer

    let received = poll_for_event(session2.handler_mut().sequencer_mut());
    assert_eq!(received, Some(note_on));
}

#[test]
fn close_peer_sends_by_and_the_remote_side_evicts_its_peer() {
    let (mut session1, _addr1) = start("Session1", 0x5555_5555);
    let (mut session2, addr2) = start("Session2", 0x6666_6666);

    session1.with_handler(|endpoint, timers| endpoint.invite_participant(addr2, timers).unwrap());
    settle_handshake(&mut session1, &mut session2);
    assert_eq!(session2.handler().registry().iter().count(), 1);

    let initiator_token = session1.handler().registry().iter().next().unwrap().initiator_token;
    session1.with_handler(|endpoint, timers| endpoint.close_peer(initiator_token, timers));
    assert_eq!(session1.handler().registry().iter().count(), 0);

    session2.run_once().unwrap(); // receives BY on the control channel, evicts its side too
    assert_eq!(session2.handler().registry().iter().count(), 0);
}

#[test]
fn shutdown_tears_down_every_connected_peer() {
    let (mut session1, _addr1) = start("Session1", 0x7777_7777);
    let (mut session2, addr2) = start("Session2", 0x8888_8888);
    let (mut session3, addr3) = start("Session3", 0x9999_9999);

    session1.with_handler(|endpoint, timers| endpoint.invite_participant(addr2, timers).unwrap());
    settle_handshake(&mut session1, &mut session2);
    session1.with_handler(|endpoint, timers| endpoint.invite_participant(addr3, timers).unwrap());
    settle_handshake(&mut session1, &mut session3);
    assert_eq!(session1.handler().registry().iter().count(), 2);

    session1.with_handler(|endpoint, timers| endpoint.shutdown(timers));
    assert_eq!(session1.handler().registry().iter().count(), 0);

    session2.run_once().unwrap();
    session3.run_once().unwrap();
    assert_eq!(session2.handler().registry().iter().count(), 0);
    assert_eq!(session3.handler().registry().iter().count(), 0);
}

#[test]
fn a_discovered_service_triggers_an_invite_that_completes_the_handshake() {
    let (mut session1, _addr1) = start("Session1", 0xAAAA_AAAA);
    let (mut session2, addr2) = start("Session2", 0xBBBB_BBBB);

    let sender = session1.task_sender();
    let policy = SkipSelf { own_name: "Session1".to_string() };
    on_service_advertised(&sender, &policy, addr2.ip(), addr2.port(), "Session2".to_string());

    session1.run_once().unwrap(); // drains the discovery task, which sends IN
    settle_handshake(&mut session1, &mut session2);

    assert_eq!(session1.handler().registry().iter().count(), 1);
    assert_eq!(session2.handler().registry().iter().count(), 1);
}

/// Mirrors the wire tag the sequencer module uses internally; duplicated here
/// since the encoding is a private implementation detail of [`LoopbackSequencer`].
fn encode_for_test(event: &SequencerEvent) -> [u8; 4] {
    match *event {
        SequencerEvent::NoteOn { channel, note, velocity } => [1, channel, note, velocity],
        _ => unreachable!("test only exercises NoteOn"),
    }
}

fn poll_for_event(sequencer: &mut LoopbackSequencer) -> Option<SequencerEvent> {
    for _ in 0..1000 {
        if let Some(event) = sequencer.next_event().unwrap() {
            return Some(event);
        }
    }
    None
}
