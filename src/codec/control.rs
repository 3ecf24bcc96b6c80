//! AppleMIDI session-layer commands: `IN`/`OK`/`NO`/`BY`/`CK`/`RS` (§4.1).
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::CodecError;

const MARKER: [u8; 2] = [0xFF, 0xFF];
const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, KnownLayout, Immutable, IntoBytes, FromBytes)]
#[repr(C)]
struct CommandHeader {
    marker: [u8; 2],
    command: [u8; 2],
}

/// A parsed AppleMIDI command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Invite { initiator_token: u32, sender_ssrc: u32, name: String },
    Accept { initiator_token: u32, sender_ssrc: u32, name: String },
    Reject { initiator_token: u32, sender_ssrc: u32 },
    End { initiator_token: u32, sender_ssrc: u32 },
    ClockSync { sender_ssrc: u32, count: u8, timestamps: [u64; 3] },
    ReceiverFeedback { ssrc: u32, sequence: u32 },
}

/// `true` if the first two bytes are the `0xFFFF` AppleMIDI command marker (§4.1);
/// otherwise the datagram is an RTP-MIDI data packet.
pub fn is_control_command(bytes: &[u8]) -> bool {
    bytes.starts_with(&MARKER)
}

pub fn parse(bytes: &[u8]) -> Result<ControlCommand, CodecError> {
    let (header, rest) = CommandHeader::ref_from_prefix(bytes).map_err(|_| CodecError::NotEnoughData)?;
    let mut cursor = Cursor::new(rest);

    match &header.command {
        b"IN" | b"OK" => {
            let (initiator_token, sender_ssrc, name) = read_session_body(&mut cursor)?;
            if &header.command == b"IN" {
                Ok(ControlCommand::Invite { initiator_token, sender_ssrc, name })
            } else {
                Ok(ControlCommand::Accept { initiator_token, sender_ssrc, name })
            }
        }
        b"NO" | b"BY" => {
            let (initiator_token, sender_ssrc) = read_session_header(&mut cursor)?;
            if &header.command == b"NO" {
                Ok(ControlCommand::Reject { initiator_token, sender_ssrc })
            } else {
                Ok(ControlCommand::End { initiator_token, sender_ssrc })
            }
        }
        b"CK" => {
            let sender_ssrc = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            let count = cursor.read_u8().map_err(|_| CodecError::NotEnoughData)?;
            cursor.read_u8().map_err(|_| CodecError::NotEnoughData)?; // pad:u8
            cursor.read_u16::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?; // pad:u16
            let t1 = cursor.read_u64::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            let t2 = cursor.read_u64::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            let t3 = cursor.read_u64::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            Ok(ControlCommand::ClockSync { sender_ssrc, count, timestamps: [t1, t2, t3] })
        }
        b"RS" => {
            let ssrc = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            let sequence = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
            Ok(ControlCommand::ReceiverFeedback { ssrc, sequence })
        }
        other => Err(CodecError::UnknownCommand(*other)),
    }
}

fn read_session_header(cursor: &mut Cursor<&[u8]>) -> Result<(u32, u32), CodecError> {
    let protocol_version = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
    let _ = protocol_version;
    let initiator_token = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
    let sender_ssrc = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::NotEnoughData)?;
    Ok((initiator_token, sender_ssrc))
}

fn read_session_body(cursor: &mut Cursor<&[u8]>) -> Result<(u32, u32, String), CodecError> {
    let (initiator_token, sender_ssrc) = read_session_header(cursor)?;
    let remaining = &cursor.get_ref()[cursor.position() as usize..];
    let nul_pos = remaining.iter().position(|&b| b == 0).ok_or(CodecError::NameNotNulTerminated)?;
    let name = String::from_utf8(remaining[..nul_pos].to_vec()).map_err(|_| CodecError::Utf8)?;
    Ok((initiator_token, sender_ssrc, name))
}

fn write_header<W: Write>(writer: &mut W, command: &[u8; 2]) -> std::io::Result<()> {
    let header = CommandHeader { marker: MARKER, command: *command };
    writer.write_all(header.as_bytes())
}

fn write_session_body<W: Write>(writer: &mut W, command: &[u8; 2], initiator_token: u32, sender_ssrc: u32, name: Option<&str>) -> std::io::Result<()> {
    write_header(writer, command)?;
    writer.write_u32::<BigEndian>(PROTOCOL_VERSION)?;
    writer.write_u32::<BigEndian>(initiator_token)?;
    writer.write_u32::<BigEndian>(sender_ssrc)?;
    if let Some(name) = name {
        writer.write_all(name.as_bytes())?;
        writer.write_u8(0)?;
    }
    Ok(())
}

impl ControlCommand {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            ControlCommand::Invite { initiator_token, sender_ssrc, name } => {
                write_session_body(&mut buffer, b"IN", *initiator_token, *sender_ssrc, Some(name)).expect("write to Vec never fails");
            }
            ControlCommand::Accept { initiator_token, sender_ssrc, name } => {
                write_session_body(&mut buffer, b"OK", *initiator_token, *sender_ssrc, Some(name)).expect("write to Vec never fails");
            }
            ControlCommand::Reject { initiator_token, sender_ssrc } => {
                write_session_body(&mut buffer, b"NO", *initiator_token, *sender_ssrc, None).expect("write to Vec never fails");
            }
            ControlCommand::End { initiator_token, sender_ssrc } => {
                write_session_body(&mut buffer, b"BY", *initiator_token, *sender_ssrc, None).expect("write to Vec never fails");
            }
            ControlCommand::ClockSync { sender_ssrc, count, timestamps } => {
                write_header(&mut buffer, b"CK").expect("write to Vec never fails");
                buffer.write_u32::<BigEndian>(*sender_ssrc).unwrap();
                buffer.write_u8(*count).unwrap();
                buffer.write_all(&[0u8; 3]).unwrap(); // pad:u8, pad:u16
                for t in timestamps {
                    buffer.write_u64::<BigEndian>(*t).unwrap();
                }
            }
            ControlCommand::ReceiverFeedback { ssrc, sequence } => {
                write_header(&mut buffer, b"RS").expect("write to Vec never fails");
                buffer.write_u32::<BigEndian>(*ssrc).unwrap();
                buffer.write_u32::<BigEndian>(*sequence).unwrap();
            }
        }
        buffer
    }
}
