//! Conversion between provider buffer descriptors and the byte sequences the rest of the
//! stack passes around.
//!
//! A [`ProtectedMessage`] is a descriptor array serialized as consecutive
//! `type (u32 LE) | length (u32 LE) | bytes` records. Decoding is strict: unknown types,
//! truncated records and trailing bytes are all rejected.

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::ops::Deref;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::provider::RawHandle;
use crate::registry::{kind, HandleRegistry};
use crate::status::{CallSite, StatusTranslator};
use crate::{Error, ErrorKind, Result};

const DESCRIPTOR_HEADER_LEN: usize = 8;

/// Buffer types, numbered as `SECBUFFER_*` values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum BufferType {
    Empty = 0,
    Data = 1,
    Token = 2,
    StreamTrailer = 6,
    StreamHeader = 7,
    Padding = 9,
    Stream = 10,
    ChannelBindings = 14,
}

/// One entry of a descriptor array.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityBuffer {
    pub buffer: Vec<u8>,
    pub buffer_type: BufferType,
}

impl SecurityBuffer {
    pub fn new(buffer: Vec<u8>, buffer_type: BufferType) -> Self {
        Self { buffer, buffer_type }
    }

    pub fn find_buffer(buffers: &[SecurityBuffer], buffer_type: BufferType) -> Result<&SecurityBuffer> {
        buffers.iter().find(|b| b.buffer_type == buffer_type).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidToken,
                format!("no buffer was provided with type {:?}", buffer_type),
            )
        })
    }

    pub fn find_buffer_mut(buffers: &mut [SecurityBuffer], buffer_type: BufferType) -> Result<&mut SecurityBuffer> {
        buffers.iter_mut().find(|b| b.buffer_type == buffer_type).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidToken,
                format!("no buffer was provided with type {:?}", buffer_type),
            )
        })
    }
}

impl fmt::Debug for SecurityBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityBuffer")
            .field("buffer_type", &self.buffer_type)
            .field("len", &self.buffer.len())
            .finish()
    }
}

/// A negotiation token produced by one side and consumed by the other.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Token {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Token {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({} bytes)", self.0.len())
    }
}

/// Application data protected under an established context.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtectedMessage(Vec<u8>);

impl ProtectedMessage {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub(crate) fn from_wrap_output(buffers: &[SecurityBuffer]) -> Result<Self> {
        let token = SecurityBuffer::find_buffer(buffers, BufferType::Token)?;
        let data = SecurityBuffer::find_buffer(buffers, BufferType::Data)?;

        Ok(Self(encode_descriptors(&[token.clone(), data.clone()])?))
    }

    /// Splits the message back into its `Token` and `Data` descriptors.
    pub(crate) fn to_unwrap_input(&self) -> Result<Vec<SecurityBuffer>> {
        let buffers = decode_descriptors(&self.0)?;

        match buffers.as_slice() {
            [token, data] if token.buffer_type == BufferType::Token && data.buffer_type == BufferType::Data => {
                Ok(buffers)
            }
            _ => Err(Error::new(
                ErrorKind::InvalidToken,
                "protected message must hold exactly one token and one data buffer",
            )),
        }
    }
}

impl AsRef<[u8]> for ProtectedMessage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ProtectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedMessage({} bytes)", self.0.len())
    }
}

/// Serializes a descriptor array.
pub fn encode_descriptors(buffers: &[SecurityBuffer]) -> Result<Vec<u8>> {
    let total = buffers
        .iter()
        .map(|buffer| DESCRIPTOR_HEADER_LEN + buffer.buffer.len())
        .sum();
    let mut encoded = Vec::with_capacity(total);

    for buffer in buffers {
        let buffer_type = buffer
            .buffer_type
            .to_u32()
            .ok_or_else(|| Error::new(ErrorKind::InternalError, "unrepresentable buffer type"))?;
        let len = u32::try_from(buffer.buffer.len())
            .map_err(|_| Error::new(ErrorKind::InvalidParameter, "buffer is too large"))?;

        encoded.write_u32::<LittleEndian>(buffer_type)?;
        encoded.write_u32::<LittleEndian>(len)?;
        encoded.write_all(&buffer.buffer)?;
    }

    Ok(encoded)
}

/// Parses a descriptor array, rejecting anything that does not decode exactly.
pub fn decode_descriptors(data: &[u8]) -> Result<Vec<SecurityBuffer>> {
    let mut reader = Cursor::new(data);
    let mut buffers = Vec::new();

    while (reader.position() as usize) < data.len() {
        let remaining = data.len() - reader.position() as usize;
        if remaining < DESCRIPTOR_HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidToken, "truncated buffer descriptor"));
        }

        let raw_type = reader.read_u32::<LittleEndian>()?;
        let buffer_type = BufferType::from_u32(raw_type)
            .ok_or_else(|| Error::new(ErrorKind::InvalidToken, format!("unknown buffer type: {}", raw_type)))?;
        let len = reader.read_u32::<LittleEndian>()? as usize;

        if len > remaining - DESCRIPTOR_HEADER_LEN {
            return Err(Error::new(
                ErrorKind::InvalidToken,
                format!(
                    "buffer length {} exceeds the {} remaining bytes",
                    len,
                    remaining - DESCRIPTOR_HEADER_LEN
                ),
            ));
        }

        let mut buffer = vec![0; len];
        reader.read_exact(&mut buffer)?;

        buffers.push(SecurityBuffer { buffer, buffer_type });
    }

    Ok(buffers)
}

/// The descriptors handed to the provider's `wrap`.
pub(crate) fn wrap_input(plaintext: &[u8]) -> Vec<SecurityBuffer> {
    vec![
        SecurityBuffer::new(Vec::new(), BufferType::Token),
        SecurityBuffer::new(plaintext.to_vec(), BufferType::Data),
    ]
}

/// Takes a provider output buffer into the registry, copies its contents and releases it
/// before returning, whatever the outcome of the copy.
pub(crate) fn take_output_buffer(registry: &Arc<HandleRegistry>, raw: Option<RawHandle>) -> Result<Option<Token>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let owned = registry.adopt::<kind::Buffer>(raw);
    let outcome = registry.provider().buffer_contents(owned.raw()?);

    let copied = StatusTranslator::new(registry.provider())
        .translate(CallSite::Query, outcome.status.major, outcome.status.minor, None)
        .map(|_| Token(outcome.value));
    let released = owned.release();

    let token = copied?;
    released?;

    trace!(len = token.len(), "copied provider output buffer");

    Ok(Some(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackProvider, LoopbackRealm};

    #[test]
    fn descriptor_layout() {
        let encoded = encode_descriptors(&[
            SecurityBuffer::new(vec![0xaa, 0xbb], BufferType::Token),
            SecurityBuffer::new(vec![0xcc], BufferType::Data),
        ])
        .unwrap();

        assert_eq!(
            encoded,
            [2, 0, 0, 0, 2, 0, 0, 0, 0xaa, 0xbb, 1, 0, 0, 0, 1, 0, 0, 0, 0xcc]
        );
        assert_eq!(decode_descriptors(&encoded).unwrap().len(), 2);
    }

    #[test]
    fn empty_buffers_are_kept() {
        let encoded = encode_descriptors(&wrap_input(b"")).unwrap();
        let decoded = decode_descriptors(&encoded).unwrap();

        assert_eq!(decoded, wrap_input(b""));
    }

    #[test]
    fn rejects_malformed_descriptors() {
        // unknown type
        assert!(decode_descriptors(&[3, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // length past the end
        assert!(decode_descriptors(&[1, 0, 0, 0, 5, 0, 0, 0, 1, 2]).is_err());
        // truncated header
        assert!(decode_descriptors(&[1, 0, 0]).is_err());
    }

    #[test]
    fn protected_message_requires_token_then_data() {
        let data_only = encode_descriptors(&[SecurityBuffer::new(vec![1], BufferType::Data)]).unwrap();

        let err = ProtectedMessage::from_bytes(data_only).to_unwrap_input().unwrap_err();

        assert_eq!(err.error_type, ErrorKind::InvalidToken);
    }

    #[test]
    fn output_buffer_is_released_after_copy() {
        let provider = Arc::new(LoopbackProvider::new(LoopbackRealm::new("EXAMPLE.COM")));
        let registry = HandleRegistry::new(provider.clone());
        let raw = provider.allocate_buffer(vec![1, 2, 3]);

        let token = take_output_buffer(&registry, Some(raw)).unwrap().unwrap();

        assert_eq!(token.as_bytes(), [1, 2, 3]);
        assert_eq!(registry.stats().total_live(), 0);
        assert_eq!(provider.stats().live, 0);
        assert_eq!(take_output_buffer(&registry, None).unwrap(), None);
    }
}
