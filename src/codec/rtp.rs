//! RTP header, short RTP-MIDI header, and command-list framing (§4.1, §4.6).
use std::io::Cursor;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, network_endian::U16, network_endian::U32};

use super::midi_command::MidiCommand;
use crate::error::CodecError;

/// Marks an outbound RTP-MIDI packet: `flags=0x80`, dynamic payload type 0x61.
pub const RTP_FLAGS: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x61;

/// The fixed 12-byte RTP header (RFC 3550), zero-copy parsed.
#[derive(Debug, KnownLayout, Immutable, IntoBytes, FromBytes)]
#[repr(C)]
pub struct RtpHeader {
    pub flags: u8,
    pub payload_type: u8,
    pub sequence_number: U16,
    pub timestamp: U32,
    pub ssrc: U32,
}

impl RtpHeader {
    pub const SIZE: usize = 12;
}

/// A parsed RTP-MIDI data packet: header fields plus the decoded command list.
#[derive(Debug, PartialEq)]
pub struct RtpMidiPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub commands: Vec<MidiCommand>,
}

/// Parses an RTP-MIDI data packet: 12-byte RTP header, 1-byte short RTP-MIDI header
/// (low nibble = command-section length, no journal/delta support), then the commands.
pub fn parse(bytes: &[u8]) -> Result<RtpMidiPacket, CodecError> {
    let (header, rest) = RtpHeader::ref_from_prefix(bytes).map_err(|_| CodecError::NotEnoughData)?;
    let header_byte = *rest.first().ok_or(CodecError::NotEnoughData)?;
    if header_byte & 0x80 != 0 {
        return Err(CodecError::InvalidData { reason: "long RTP-MIDI header form not supported" });
    }
    let body_len = (header_byte & 0x0F) as usize;
    let body = rest.get(1..1 + body_len).ok_or(CodecError::NotEnoughData)?;

    let commands = parse_command_section(body)?;
    Ok(RtpMidiPacket {
        sequence_number: header.sequence_number.get(),
        timestamp: header.timestamp.get(),
        ssrc: header.ssrc.get(),
        commands,
    })
}

/// Decodes a MIDI command-list body, applying running status across messages.
pub fn parse_command_section(body: &[u8]) -> Result<Vec<MidiCommand>, CodecError> {
    let mut cursor = Cursor::new(body);
    let mut commands = Vec::new();
    let mut running_status = None;
    while (cursor.position() as usize) < body.len() {
        let (command, next_rs) = MidiCommand::read(&mut cursor, running_status)?;
        running_status = next_rs;
        commands.push(command);
    }
    Ok(commands)
}

/// Builds a short-header RTP-MIDI packet. The low nibble of the RTP-MIDI header
/// carries the command-section length, so the combined section must not exceed 15
/// bytes (§4.6 oversize rule); returns `None` if it does.
pub fn build(sequence_number: u16, timestamp: u32, ssrc: u32, commands: &[MidiCommand]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut running_status = None;
    for command in commands {
        command.write(&mut body, running_status).ok()?;
        running_status = Some(command.status());
    }
    if body.len() > 0x0F {
        return None;
    }

    let header = RtpHeader {
        flags: RTP_FLAGS,
        payload_type: RTP_PAYLOAD_TYPE,
        sequence_number: sequence_number.into(),
        timestamp: timestamp.into(),
        ssrc: ssrc.into(),
    };
    let mut packet = Vec::with_capacity(RtpHeader::SIZE + 1 + body.len());
    packet.extend_from_slice(header.as_bytes());
    packet.push(body.len() as u8);
    packet.extend_from_slice(&body);
    Some(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_note_on() {
        let commands = vec![MidiCommand::NoteOn { channel: 0, key: 0x40, velocity: 0x7F }];
        let packet = build(5, 10, 0x0B, &commands).unwrap();
        let parsed = parse(&packet).unwrap();
        assert_eq!(parsed.sequence_number, 5);
        assert_eq!(parsed.timestamp, 10);
        assert_eq!(parsed.ssrc, 0x0B);
        assert_eq!(parsed.commands, commands);
    }

    #[test]
    fn parses_reference_midi_forward_packet() {
        // from spec §8 "MIDI forward" scenario
        let bytes = [
            0x80, 0x61, 0x00, 0x05, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x0B, 0x02, 0x90, 0x40, 0x7F,
        ];
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.ssrc, 0x0B);
        assert_eq!(parsed.commands, vec![MidiCommand::NoteOn { channel: 0, key: 64, velocity: 127 }]);
    }

    #[test]
    fn oversize_command_section_refused() {
        let commands: Vec<MidiCommand> = (0..6).map(|i| MidiCommand::NoteOn { channel: 0, key: i, velocity: 1 }).collect();
        // 6 note-on messages with distinct statuses per call -> well over 15 bytes combined.
        assert!(build(0, 0, 1, &commands).is_none());
    }

    #[test]
    fn long_header_form_rejected() {
        let bytes = [0x80, 0x61, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x80];
        let result = parse(&bytes);
        assert!(matches!(result, Err(CodecError::InvalidData { .. })));
    }
}
