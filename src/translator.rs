//! MIDI byte stream ↔ sequencer event record mapping (§4.2).
//!
//! Only channel-voice messages with a fixed 3-byte form are carried between the
//! wire and the local sequencer; everything else (program change, channel
//! pressure, SysEx) is logged and dropped rather than failing the connection.
use log::debug;

use crate::codec::MidiCommand;

/// A MIDI channel-voice message in the local sequencer's own record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerEvent {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyKeyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// 14-bit bend value, `(msb << 7) | lsb`.
    PitchBend { channel: u8, value: u16 },
}

/// Converts a wire command into a sequencer event. Returns `None` for command
/// kinds the sequencer bridge does not carry.
pub fn from_midi(command: &MidiCommand) -> Option<SequencerEvent> {
    match *command {
        MidiCommand::NoteOff { channel, key, velocity } => Some(SequencerEvent::NoteOff { channel, note: key, velocity }),
        MidiCommand::NoteOn { channel, key, velocity } => Some(SequencerEvent::NoteOn { channel, note: key, velocity }),
        MidiCommand::PolyphonicKeyPressure { channel, key, pressure } => {
            Some(SequencerEvent::PolyKeyPressure { channel, note: key, pressure })
        }
        MidiCommand::ControlChange { channel, controller, value } => Some(SequencerEvent::ControlChange { channel, controller, value }),
        MidiCommand::PitchBend { channel, lsb, msb } => {
            let value = ((msb as u16) << 7) | (lsb as u16 & 0x7F);
            Some(SequencerEvent::PitchBend { channel, value })
        }
        MidiCommand::ProgramChange { .. } | MidiCommand::ChannelPressure { .. } | MidiCommand::SysEx { .. } => {
            debug!("translator: dropping unsupported command {command:?}");
            None
        }
    }
}

/// Converts a sequencer event into its wire command.
pub fn to_midi(event: &SequencerEvent) -> MidiCommand {
    match *event {
        SequencerEvent::NoteOff { channel, note, velocity } => MidiCommand::NoteOff { channel, key: note, velocity },
        SequencerEvent::NoteOn { channel, note, velocity } => MidiCommand::NoteOn { channel, key: note, velocity },
        SequencerEvent::PolyKeyPressure { channel, note, pressure } => MidiCommand::PolyphonicKeyPressure { channel, key: note, pressure },
        SequencerEvent::ControlChange { channel, controller, value } => MidiCommand::ControlChange { channel, controller, value },
        SequencerEvent::PitchBend { channel, value } => {
            let lsb = (value & 0x7F) as u8;
            let msb = ((value >> 7) & 0x7F) as u8;
            MidiCommand::PitchBend { channel, lsb, msb }
        }
    }
}
