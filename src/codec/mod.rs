//! Wire codec for AppleMIDI session commands and RTP-MIDI data packets.
pub mod control;
pub mod midi_command;
pub mod rtp;

use crate::error::CodecError;
pub use control::ControlCommand;
pub use midi_command::MidiCommand;
pub use rtp::RtpMidiPacket;

/// Either kind of datagram an endpoint's sockets can receive: a control-channel
/// session command, or a data-channel RTP-MIDI packet (§4.1 demux).
#[derive(Debug, PartialEq)]
pub enum Datagram {
    Control(ControlCommand),
    Midi(RtpMidiPacket),
}

/// Dispatches on the `0xFFFF` marker to pick the right parser.
pub fn parse_datagram(bytes: &[u8]) -> Result<Datagram, CodecError> {
    if control::is_control_command(bytes) {
        Ok(Datagram::Control(control::parse(bytes)?))
    } else {
        Ok(Datagram::Midi(rtp::parse(bytes)?))
    }
}
