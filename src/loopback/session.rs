//! Established loopback contexts and their per-message tokens.
//!
//! Wrap and MIC tokens follow the RFC 4121 layout:
//!
//! ```text
//! wrap: 05 04 | flags | ff | ec (u16) | rrc (u16) | seq (u64)
//! mic:  04 04 | flags | ff ff ff ff ff | seq (u64)
//! ```
//!
//! A sealed message is `encrypt(plaintext | header)` in the `Data` buffer with the bare header in
//! the `Token` buffer. A signed message keeps the plaintext in `Data` and carries
//! `header | checksum(plaintext | header)` in `Token`.

use std::collections::BTreeSet;

use bitflags::bitflags;
use picky_krb::constants::key_usages::{ACCEPTOR_SEAL, ACCEPTOR_SIGN, INITIATOR_SEAL, INITIATOR_SIGN};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use super::crypto;
use super::{minor, Rejected, Rejection};
use crate::buffer::{BufferType, SecurityBuffer};
use crate::mechanism::MechanismId;
use crate::status::{RoutineError, SupplementaryInfo};
use crate::{ContextFlags, Secret};

const WRAP_TOKEN_ID: [u8; 2] = [0x05, 0x04];
const MIC_TOKEN_ID: [u8; 2] = [0x04, 0x04];
const HEADER_LEN: usize = 16;
const FILLER: u8 = 0xff;
const REPLAY_WINDOW: u64 = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TokenFlags: u8 {
        const SENT_BY_ACCEPTOR = 0x01;
        const SEALED = 0x02;
    }
}

/// Keys and counters of an established context.
#[derive(Debug)]
pub(super) struct Session {
    pub(super) key: Secret<Vec<u8>>,
    pub(super) mechanism: MechanismId,
    pub(super) flags: ContextFlags,
    pub(super) initiator: bool,
    pub(super) client: String,
    pub(super) target: String,
    pub(super) expires: OffsetDateTime,
    pub(super) send_seq: u64,
    pub(super) window: SequenceWindow,
}

impl Session {
    pub(super) fn lifetime(&self) -> u32 {
        (self.expires - OffsetDateTime::now_utc())
            .whole_seconds()
            .clamp(0, i64::from(u32::MAX)) as u32
    }

    pub(super) fn is_expired(&self) -> bool {
        self.expires <= OffsetDateTime::now_utc()
    }

    fn sender_flags(&self) -> TokenFlags {
        if self.initiator {
            TokenFlags::empty()
        } else {
            TokenFlags::SENT_BY_ACCEPTOR
        }
    }

    fn seal_usage(&self, outbound: bool) -> i32 {
        if self.initiator == outbound {
            INITIATOR_SEAL
        } else {
            ACCEPTOR_SEAL
        }
    }

    fn sign_usage(&self, outbound: bool) -> i32 {
        if self.initiator == outbound {
            INITIATOR_SIGN
        } else {
            ACCEPTOR_SIGN
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);

        seq
    }

    pub(super) fn wrap(&mut self, confidentiality: bool, message: &mut [SecurityBuffer]) -> Rejected<bool> {
        let sealed = confidentiality && self.flags.contains(ContextFlags::CONFIDENTIALITY);

        let mut token_flags = self.sender_flags();
        if sealed {
            token_flags |= TokenFlags::SEALED;
        }

        let seq = self.next_seq();
        let header = wrap_header(token_flags, seq);

        let data = SecurityBuffer::find_buffer_mut(message, BufferType::Data).map_err(|_| Rejection::defective())?;

        let token = if sealed {
            let mut payload = std::mem::take(&mut data.buffer);
            payload.extend_from_slice(&header);
            data.buffer = crypto::encrypt(&self.key, self.seal_usage(true), &payload)?;

            header.to_vec()
        } else {
            let mut signed = data.buffer.clone();
            signed.extend_from_slice(&header);
            let checksum = crypto::checksum(&self.key, self.sign_usage(true), &signed)?;

            [header.as_slice(), &checksum].concat()
        };

        SecurityBuffer::find_buffer_mut(message, BufferType::Token)
            .map_err(|_| Rejection::defective())?
            .buffer = token;

        Ok(sealed)
    }

    pub(super) fn unwrap(&mut self, message: &mut [SecurityBuffer]) -> Rejected<(bool, SupplementaryInfo)> {
        let token = SecurityBuffer::find_buffer(message, BufferType::Token)
            .map_err(|_| Rejection::defective())?
            .buffer
            .clone();
        if token.len() < HEADER_LEN {
            return Err(Rejection::defective());
        }

        let (header, trailer) = token.split_at(HEADER_LEN);
        let (token_flags, seq) = self.parse_wrap_header(header)?;
        let sealed = token_flags.contains(TokenFlags::SEALED);

        let data = SecurityBuffer::find_buffer_mut(message, BufferType::Data).map_err(|_| Rejection::defective())?;

        let plaintext = if sealed {
            if !trailer.is_empty() {
                return Err(Rejection::defective());
            }

            let decrypted = crypto::decrypt(&self.key, self.seal_usage(false), &data.buffer)
                .map_err(|_| Rejection::bad_signature())?;
            if decrypted.len() < HEADER_LEN {
                return Err(Rejection::bad_signature());
            }

            let (plaintext, inner_header) = decrypted.split_at(decrypted.len() - HEADER_LEN);
            if inner_header != header {
                return Err(Rejection::bad_signature());
            }

            plaintext.to_vec()
        } else {
            let mut signed = data.buffer.clone();
            signed.extend_from_slice(header);
            let expected = crypto::checksum(&self.key, self.sign_usage(false), &signed)?;

            if !bool::from(expected.ct_eq(trailer)) {
                return Err(Rejection::bad_signature());
            }

            data.buffer.clone()
        };

        let supplementary = self.window.check(seq, self.flags);
        data.buffer = plaintext;

        Ok((sealed, supplementary))
    }

    pub(super) fn get_mic(&mut self, message: &[u8]) -> Rejected<Vec<u8>> {
        let seq = self.next_seq();
        let header = mic_header(self.sender_flags(), seq);

        let mut signed = message.to_vec();
        signed.extend_from_slice(&header);
        let checksum = crypto::checksum(&self.key, self.sign_usage(true), &signed)?;

        Ok([header.as_slice(), &checksum].concat())
    }

    pub(super) fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> Rejected<SupplementaryInfo> {
        if mic.len() < HEADER_LEN {
            return Err(Rejection::defective());
        }

        let (header, checksum) = mic.split_at(HEADER_LEN);
        if header[..2] != MIC_TOKEN_ID || header[3..8].iter().any(|&b| b != FILLER) {
            return Err(Rejection::defective());
        }
        self.check_sender(header[2])?;

        let mut signed = message.to_vec();
        signed.extend_from_slice(header);
        let expected = crypto::checksum(&self.key, self.sign_usage(false), &signed)?;

        if !bool::from(expected.ct_eq(checksum)) {
            return Err(Rejection::bad_signature());
        }

        let seq = u64::from_be_bytes(seq_bytes(header));

        Ok(self.window.check(seq, self.flags))
    }

    fn parse_wrap_header(&self, header: &[u8]) -> Rejected<(TokenFlags, u64)> {
        if header[..2] != WRAP_TOKEN_ID || header[3] != FILLER || header[4..8] != [0, 0, 0, 0] {
            return Err(Rejection::defective());
        }

        let token_flags = self.check_sender(header[2])?;

        Ok((token_flags, u64::from_be_bytes(seq_bytes(header))))
    }

    /// Rejects tokens with unknown flags or sent by our own side.
    fn check_sender(&self, raw_flags: u8) -> Rejected<TokenFlags> {
        let token_flags = TokenFlags::from_bits(raw_flags).ok_or_else(Rejection::defective)?;

        // the peer of an initiator is the acceptor
        if token_flags.contains(TokenFlags::SENT_BY_ACCEPTOR) != self.initiator {
            return Err(Rejection::new(RoutineError::DefectiveToken, minor::WRONG_DIRECTION));
        }

        Ok(token_flags)
    }
}

fn wrap_header(token_flags: TokenFlags, seq: u64) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[..2].copy_from_slice(&WRAP_TOKEN_ID);
    header[2] = token_flags.bits();
    header[3] = FILLER;
    // ec and rrc stay zero
    header[8..].copy_from_slice(&seq.to_be_bytes());

    header
}

fn mic_header(token_flags: TokenFlags, seq: u64) -> [u8; HEADER_LEN] {
    let mut header = [FILLER; HEADER_LEN];
    header[..2].copy_from_slice(&MIC_TOKEN_ID);
    header[2] = token_flags.bits();
    header[8..].copy_from_slice(&seq.to_be_bytes());

    header
}

fn seq_bytes(header: &[u8]) -> [u8; 8] {
    let mut seq = [0; 8];
    seq.copy_from_slice(&header[8..HEADER_LEN]);

    seq
}

/// Receive-side sequence tracking for replay and ordering detection.
#[derive(Debug)]
pub(super) struct SequenceWindow {
    next: u64,
    seen: BTreeSet<u64>,
}

impl SequenceWindow {
    pub(super) fn new(first: u64) -> Self {
        Self {
            next: first,
            seen: BTreeSet::new(),
        }
    }

    pub(super) fn check(&mut self, seq: u64, flags: ContextFlags) -> SupplementaryInfo {
        let replay = flags.contains(ContextFlags::REPLAY_DETECT);
        let sequence = flags.contains(ContextFlags::SEQUENCE_DETECT);

        if !replay && !sequence {
            return SupplementaryInfo::empty();
        }

        let mut info = SupplementaryInfo::empty();

        if seq == self.next {
            self.next = seq.wrapping_add(1);
        } else if seq > self.next {
            if sequence {
                info |= SupplementaryInfo::GAP_TOKEN;
            }
            self.next = seq.wrapping_add(1);
        } else if self.seen.contains(&seq) {
            if replay {
                info |= SupplementaryInfo::DUPLICATE_TOKEN;
            }
        } else if self.next - seq > REPLAY_WINDOW {
            info |= SupplementaryInfo::OLD_TOKEN;
        } else if sequence {
            info |= SupplementaryInfo::UNSEQ_TOKEN;
        }

        self.seen.insert(seq);
        while self.seen.len() as u64 > REPLAY_WINDOW {
            self.seen.pop_first();
        }

        info
    }
}
