//! Local MIDI sequencer bridge (§4.6, §6 "Local MIDI sequencer handle").
//!
//! The core treats the local sequencer as an opaque readable/writable handle:
//! on readiness it asks for the next event and fans it out to every connected
//! peer, and it pushes inbound wire events back the other way. The real ALSA-like
//! subsystem behind that handle is out of scope for this core; [`LoopbackSequencer`]
//! stands in for it in tests via a local pipe.
use std::io;

use crate::translator::SequencerEvent;

/// A local-sequencer handle the dispatcher can register for readiness and poll
/// for events. Implementors must be a valid `mio` event source so the dispatcher
/// can multiplex it alongside the endpoint's sockets.
pub trait Sequencer: mio::event::Source {
    /// Returns the next available event, or `None` if none is ready right now.
    fn next_event(&mut self) -> io::Result<Option<SequencerEvent>>;

    /// Delivers an event received from a remote peer to the local sequencer.
    fn send_event(&mut self, event: &SequencerEvent) -> io::Result<()>;
}

const TAG_NOTE_OFF: u8 = 0;
const TAG_NOTE_ON: u8 = 1;
const TAG_POLY_KEY_PRESSURE: u8 = 2;
const TAG_CONTROL_CHANGE: u8 = 3;
const TAG_PITCH_BEND: u8 = 4;
const WIRE_SIZE: usize = 4;

fn encode(event: &SequencerEvent) -> [u8; WIRE_SIZE] {
    match *event {
        SequencerEvent::NoteOff { channel, note, velocity } => [TAG_NOTE_OFF, channel, note, velocity],
        SequencerEvent::NoteOn { channel, note, velocity } => [TAG_NOTE_ON, channel, note, velocity],
        SequencerEvent::PolyKeyPressure { channel, note, pressure } => [TAG_POLY_KEY_PRESSURE, channel, note, pressure],
        SequencerEvent::ControlChange { channel, controller, value } => [TAG_CONTROL_CHANGE, channel, controller, value],
        SequencerEvent::PitchBend { channel, value } => [TAG_PITCH_BEND, channel, (value & 0xFF) as u8, (value >> 8) as u8],
    }
}

fn decode(bytes: [u8; WIRE_SIZE]) -> io::Result<SequencerEvent> {
    let [tag, a, b, c] = bytes;
    Ok(match tag {
        TAG_NOTE_OFF => SequencerEvent::NoteOff { channel: a, note: b, velocity: c },
        TAG_NOTE_ON => SequencerEvent::NoteOn { channel: a, note: b, velocity: c },
        TAG_POLY_KEY_PRESSURE => SequencerEvent::PolyKeyPressure { channel: a, note: b, pressure: c },
        TAG_CONTROL_CHANGE => SequencerEvent::ControlChange { channel: a, controller: b, value: c },
        TAG_PITCH_BEND => SequencerEvent::PitchBend { channel: a, value: (b as u16) | ((c as u16) << 8) },
        other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad sequencer event tag {other}"))),
    })
}

/// An in-process stand-in for the local sequencer, backed by a `mio` pipe. One
/// end is driven by test code (or a `demos/` binary) via [`LoopbackSequencer::writer`],
/// the other is what the dispatcher registers and polls.
pub struct LoopbackSequencer {
    receiver: mio::unix::pipe::Receiver,
    sender: mio::unix::pipe::Sender,
}

impl LoopbackSequencer {
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = mio::unix::pipe::new()?;
        Ok(LoopbackSequencer { receiver, sender })
    }

    /// A writable handle for pushing test events in as if they came from the
    /// local sequencer, independent of the registered readiness source.
    pub fn writer(&mut self) -> &mut mio::unix::pipe::Sender {
        &mut self.sender
    }
}

impl mio::event::Source for LoopbackSequencer {
    fn register(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.receiver.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.receiver.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.receiver.deregister(registry)
    }
}

impl Sequencer for LoopbackSequencer {
    fn next_event(&mut self) -> io::Result<Option<SequencerEvent>> {
        use std::io::Read;
        let mut bytes = [0u8; WIRE_SIZE];
        match self.receiver.read_exact(&mut bytes) {
            Ok(()) => Ok(Some(decode(bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_event(&mut self, event: &SequencerEvent) -> io::Result<()> {
        use std::io::Write;
        self.sender.write_all(&encode(event))
    }
}
