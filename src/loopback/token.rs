//! NTLM message framing: the `NTLMSSP\0` signature and a little-endian message type, followed by
//! the message fields. Variable fields carry a `u32` length prefix.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

const SIGNATURE: [u8; 8] = *b"NTLMSSP\0";
const HEADER_LEN: u64 = 12;

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub(super) enum MessageType {
    Negotiate = 1,
    Challenge = 2,
    Authenticate = 3,
}

impl MessageType {
    /// Type of an NTLM message, `None` when `data` is not one.
    pub(super) fn of(data: &[u8]) -> Option<MessageType> {
        let mut header = data.strip_prefix(&SIGNATURE[..])?;

        MessageType::from_u32(header.read_u32::<LittleEndian>().ok()?)
    }
}

pub(super) struct MessageWriter(Vec<u8>);

impl MessageWriter {
    pub(super) fn new(message_type: MessageType) -> Self {
        let mut data = SIGNATURE.to_vec();
        data.extend_from_slice(&message_type.to_u32().unwrap_or_default().to_le_bytes());

        Self(data)
    }

    pub(super) fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.0.write_u32::<LittleEndian>(value)
    }

    pub(super) fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;

        self.0.write_u32::<LittleEndian>(len)?;
        self.0.write_all(data)
    }

    pub(super) fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.write_bytes(value.as_bytes())
    }

    pub(super) fn finish(self) -> Vec<u8> {
        self.0
    }
}

pub(super) struct MessageReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> MessageReader<'a> {
    pub(super) fn new(data: &'a [u8], expected: MessageType) -> io::Result<Self> {
        match MessageType::of(data) {
            Some(message_type) if message_type == expected => {
                let mut cursor = Cursor::new(data);
                cursor.set_position(HEADER_LEN);

                Ok(Self { cursor })
            }
            found => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected an NTLM {:?} message, got {:?}", expected, found),
            )),
        }
    }

    fn remaining(&self) -> usize {
        let data = self.cursor.get_ref();

        data.len().saturating_sub(self.cursor.position() as usize)
    }

    pub(super) fn read_u32(&mut self) -> io::Result<u32> {
        self.cursor.read_u32::<LittleEndian>()
    }

    pub(super) fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.cursor.read_u32::<LittleEndian>()? as usize;

        if len > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("field length {} exceeds the {} remaining bytes", len, self.remaining()),
            ));
        }

        let mut data = vec![0; len];
        self.cursor.read_exact(&mut data)?;

        Ok(data)
    }

    pub(super) fn read_string(&mut self) -> io::Result<String> {
        String::from_utf8(self.read_bytes()?).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Fails when bytes are left over.
    pub(super) fn finish(self) -> io::Result<()> {
        match self.remaining() {
            0 => Ok(()),
            left => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes", left),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_header() {
        let mut writer = MessageWriter::new(MessageType::Challenge);
        writer.write_u32(0x30).unwrap();
        let message = writer.finish();

        assert_eq!(message[..12], *b"NTLMSSP\0\x02\0\0\0");
        assert_eq!(MessageType::of(&message), Some(MessageType::Challenge));

        let mut reader = MessageReader::new(&message, MessageType::Challenge).unwrap();
        assert_eq!(reader.read_u32().unwrap(), 0x30);
        reader.finish().unwrap();
    }

    #[test]
    fn rejects_wrong_type_and_overlong_fields() {
        let message = MessageWriter::new(MessageType::Negotiate).finish();
        assert!(MessageReader::new(&message, MessageType::Authenticate).is_err());
        assert_eq!(MessageType::of(b"NTLMSSP\0\x09\0\0\0"), None);
        assert_eq!(MessageType::of(b"NTLM"), None);

        let mut message = MessageWriter::new(MessageType::Authenticate).finish();
        message.extend_from_slice(&[9, 0, 0, 0, 1, 2]);
        let mut reader = MessageReader::new(&message, MessageType::Authenticate).unwrap();
        assert!(reader.read_bytes().is_err());
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut writer = MessageWriter::new(MessageType::Negotiate);
        writer.write_string("alice").unwrap();
        let mut message = writer.finish();
        message.push(7);

        let mut reader = MessageReader::new(&message, MessageType::Negotiate).unwrap();
        assert_eq!(reader.read_string().unwrap(), "alice");
        assert!(reader.finish().is_err());
    }
}
