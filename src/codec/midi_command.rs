//! MIDI command-section parsing with running status (§4.1).
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::CodecError;

/// A single MIDI channel-voice or SysEx message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiCommand {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyphonicKeyPressure { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, lsb: u8, msb: u8 },
    SysEx { data: Vec<u8> },
}

impl MidiCommand {
    pub fn status(&self) -> u8 {
        match self {
            MidiCommand::SysEx { .. } => 0xF0,
            MidiCommand::NoteOff { channel, .. } => 0x80 | (channel & 0x0F),
            MidiCommand::NoteOn { channel, .. } => 0x90 | (channel & 0x0F),
            MidiCommand::PolyphonicKeyPressure { channel, .. } => 0xA0 | (channel & 0x0F),
            MidiCommand::ControlChange { channel, .. } => 0xB0 | (channel & 0x0F),
            MidiCommand::ProgramChange { channel, .. } => 0xC0 | (channel & 0x0F),
            MidiCommand::ChannelPressure { channel, .. } => 0xD0 | (channel & 0x0F),
            MidiCommand::PitchBend { channel, .. } => 0xE0 | (channel & 0x0F),
        }
    }

    /// Total bytes following the status byte, per the §4.1 length table. `0` for SysEx,
    /// which is instead terminated by 0xF7.
    fn data_len_from_status(status: u8) -> usize {
        match status & 0xF0 {
            0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
            0xC0 | 0xD0 => 1,
            _ => 0,
        }
    }

    fn from_status_and_data(status: u8, data: &[u8]) -> Result<Self, CodecError> {
        let channel = status & 0x0F;
        Ok(match status & 0xF0 {
            0x80 => MidiCommand::NoteOff { channel, key: data[0], velocity: data[1] },
            0x90 => MidiCommand::NoteOn { channel, key: data[0], velocity: data[1] },
            0xA0 => MidiCommand::PolyphonicKeyPressure { channel, key: data[0], pressure: data[1] },
            0xB0 => MidiCommand::ControlChange { channel, controller: data[0], value: data[1] },
            0xC0 => MidiCommand::ProgramChange { channel, program: data[0] },
            0xD0 => MidiCommand::ChannelPressure { channel, pressure: data[0] },
            0xE0 => MidiCommand::PitchBend { channel, lsb: data[0], msb: data[1] },
            _ => return Err(CodecError::InvalidData { reason: "unsupported status nibble" }),
        })
    }

    /// Reads one command, given the running status in effect before this byte (if any).
    /// Returns the command and the (possibly unchanged) running status to carry forward.
    pub fn read<R: Read>(reader: &mut R, running_status: Option<u8>) -> Result<(Self, Option<u8>), CodecError> {
        let first_byte = reader.read_u8().map_err(|_| CodecError::NotEnoughData)?;

        if first_byte == 0xF0 {
            let mut data = Vec::new();
            loop {
                let byte = reader.read_u8().map_err(|_| CodecError::NotEnoughData)?;
                if byte == 0xF7 {
                    break;
                }
                data.push(byte);
            }
            return Ok((MidiCommand::SysEx { data }, running_status));
        }

        let (status, next_running_status) = if first_byte & 0x80 != 0 {
            (first_byte, Some(first_byte))
        } else {
            match running_status {
                Some(rs) => (rs, Some(rs)),
                None => return Err(CodecError::InvalidData { reason: "data byte with no running status" }),
            }
        };

        let len = Self::data_len_from_status(status);
        let mut data = [0u8; 2];
        if first_byte & 0x80 == 0 {
            data[0] = first_byte;
            for slot in data[1..len].iter_mut() {
                *slot = reader.read_u8().map_err(|_| CodecError::NotEnoughData)?;
            }
        } else {
            for slot in data[..len].iter_mut() {
                *slot = reader.read_u8().map_err(|_| CodecError::NotEnoughData)?;
            }
        }

        let command = Self::from_status_and_data(status, &data)?;
        Ok((command, next_running_status))
    }

    /// Writes this command, omitting the status byte if it matches `running_status`.
    pub fn write<W: Write>(&self, writer: &mut W, running_status: Option<u8>) -> std::io::Result<usize> {
        let mut written = 0;
        if running_status != Some(self.status()) {
            writer.write_u8(self.status())?;
            written += 1;
        }
        match self {
            MidiCommand::SysEx { data } => {
                writer.write_u8(0xF0)?;
                writer.write_all(data)?;
                writer.write_u8(0xF7)?;
                written += data.len() + 2;
            }
            MidiCommand::NoteOff { key, velocity, .. } | MidiCommand::NoteOn { key, velocity, .. } => {
                writer.write_u8(*key)?;
                writer.write_u8(*velocity)?;
                written += 2;
            }
            MidiCommand::PolyphonicKeyPressure { key, pressure, .. } => {
                writer.write_u8(*key)?;
                writer.write_u8(*pressure)?;
                written += 2;
            }
            MidiCommand::ControlChange { controller, value, .. } => {
                writer.write_u8(*controller)?;
                writer.write_u8(*value)?;
                written += 2;
            }
            MidiCommand::ProgramChange { program, .. } => {
                writer.write_u8(*program)?;
                written += 1;
            }
            MidiCommand::ChannelPressure { pressure, .. } => {
                writer.write_u8(*pressure)?;
                written += 1;
            }
            MidiCommand::PitchBend { lsb, msb, .. } => {
                writer.write_u8(*lsb)?;
                writer.write_u8(*msb)?;
                written += 2;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_note_on() {
        let command = MidiCommand::NoteOn { channel: 4, key: 0x40, velocity: 0x7F };
        let mut bytes = Vec::new();
        command.write(&mut bytes, None).unwrap();
        assert_eq!(bytes, vec![0x94, 0x40, 0x7F]);

        let mut reader = Cursor::new(&bytes);
        let (decoded, _) = MidiCommand::read(&mut reader, None).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn running_status_three_note_ons() {
        let bytes = [0x90u8, 0x40, 0x7F, 0x41, 0x7F, 0x42, 0x7F];
        let mut reader = Cursor::new(&bytes[..]);
        let mut running_status = None;
        let mut notes = Vec::new();
        for _ in 0..3 {
            let (command, rs) = MidiCommand::read(&mut reader, running_status).unwrap();
            running_status = rs;
            notes.push(command);
        }
        assert_eq!(
            notes,
            vec![
                MidiCommand::NoteOn { channel: 0, key: 0x40, velocity: 0x7F },
                MidiCommand::NoteOn { channel: 0, key: 0x41, velocity: 0x7F },
                MidiCommand::NoteOn { channel: 0, key: 0x42, velocity: 0x7F },
            ]
        );
    }

    #[test]
    fn data_byte_without_running_status_is_an_error() {
        let bytes = [0x40u8, 0x7F];
        let mut reader = Cursor::new(&bytes[..]);
        let result = MidiCommand::read(&mut reader, None);
        assert!(matches!(result, Err(CodecError::InvalidData { .. })));
    }

    #[test]
    fn sysex_terminated_by_f7() {
        let bytes = [0xF0u8, 0x01, 0x02, 0x03, 0xF7];
        let mut reader = Cursor::new(&bytes[..]);
        let (command, _) = MidiCommand::read(&mut reader, None).unwrap();
        assert_eq!(command, MidiCommand::SysEx { data: vec![0x01, 0x02, 0x03] });
    }

    #[test]
    fn control_change_round_trip() {
        let command = MidiCommand::ControlChange { channel: 2, controller: 7, value: 100 };
        let mut bytes = Vec::new();
        command.write(&mut bytes, None).unwrap();
        let mut reader = Cursor::new(&bytes);
        let (decoded, _) = MidiCommand::read(&mut reader, None).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn pitch_bend_round_trip() {
        let command = MidiCommand::PitchBend { channel: 0, lsb: 0x7F, msb: 0x41 };
        let mut bytes = Vec::new();
        command.write(&mut bytes, None).unwrap();
        let mut reader = Cursor::new(&bytes);
        let (decoded, _) = MidiCommand::read(&mut reader, None).unwrap();
        assert_eq!(decoded, command);
    }
}
