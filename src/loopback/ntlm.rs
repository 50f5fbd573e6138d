//! NTLM-compatible three-leg exchange: NEGOTIATE, CHALLENGE, AUTHENTICATE.
//!
//! The client proves knowledge of its key by sealing both challenges, its name and the channel
//! bindings under that key, then hands over a random session key encrypted the same way. The
//! acceptor trusts the proof once it decrypts with the stored key and carries the expected
//! content. There is no acceptor proof, so mutual authentication is never achieved.

use time::OffsetDateTime;

use super::session::{SequenceWindow, Session};
use super::token::{MessageReader, MessageType, MessageWriter};
use super::{bindings_bytes, check_bindings, crypto, minor, InitiatorRequest, LoopbackRealm, Rejected, Rejection, Step};
use crate::channel_bindings::ChannelBindings;
use crate::mechanism::MechanismId;
use crate::status::RoutineError;
use crate::{ContextFlags, Secret};

// outside the range used by Kerberos
const PROOF_KEY_USAGE: i32 = 1040;
const KEY_EXCHANGE_KEY_USAGE: i32 = 1041;

const CHALLENGE_LEN: usize = 8;

fn supported_flags() -> ContextFlags {
    ContextFlags::REPLAY_DETECT | ContextFlags::SEQUENCE_DETECT | ContextFlags::CONFIDENTIALITY | ContextFlags::INTEGRITY
}

fn proof_input(server_challenge: &[u8], client_challenge: &[u8], client: &str, bindings: &[u8]) -> Vec<u8> {
    [server_challenge, client_challenge, client.as_bytes(), bindings].concat()
}

#[derive(Debug)]
pub(super) struct Initiator {
    client: String,
    target: String,
    flags: ContextFlags,
    bindings: Vec<u8>,
    expires: OffsetDateTime,
}

impl Initiator {
    pub(super) fn start(realm: &LoopbackRealm, request: &InitiatorRequest) -> Rejected<(Self, Step)> {
        if realm.ntlm_key(&request.client).is_none() {
            return Err(Rejection::new(RoutineError::NoCred, minor::UNKNOWN_PRINCIPAL));
        }

        let flags = request.flags & supported_flags();

        let mut token = MessageWriter::new(MessageType::Negotiate);
        token.write_u32(flags.bits())?;

        Ok((
            Self {
                client: request.client.clone(),
                target: request.target.clone(),
                flags,
                bindings: bindings_bytes(request.bindings.as_ref())?,
                expires: request.expires,
            },
            Step::Continue(token.finish()),
        ))
    }

    /// Answers the CHALLENGE. The initiator is done once AUTHENTICATE is produced.
    pub(super) fn step(&mut self, realm: &LoopbackRealm, input: &[u8]) -> Rejected<Step> {
        let mut reader = MessageReader::new(input, MessageType::Challenge)?;
        let server_challenge = reader.read_bytes()?;
        let flags = ContextFlags::from_bits_truncate(reader.read_u32()?) & self.flags;
        reader.finish()?;

        if server_challenge.len() != CHALLENGE_LEN {
            return Err(Rejection::defective());
        }

        let key = realm
            .ntlm_key(&self.client)
            .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::UNKNOWN_PRINCIPAL))?;

        let client_challenge = crypto::random_bytes::<CHALLENGE_LEN>();
        let proof = crypto::encrypt(
            &key,
            PROOF_KEY_USAGE,
            &proof_input(&server_challenge, &client_challenge, &self.client, &self.bindings),
        )?;
        let session_key = crypto::random_key();
        let encrypted_session_key = crypto::encrypt(&key, KEY_EXCHANGE_KEY_USAGE, session_key.as_ref())?;

        let mut token = MessageWriter::new(MessageType::Authenticate);
        token.write_string(&self.client)?;
        token.write_bytes(&client_challenge)?;
        token.write_bytes(&proof)?;
        token.write_bytes(&encrypted_session_key)?;
        token.write_bytes(&self.bindings)?;
        token.write_u32(flags.bits())?;

        Ok(Step::Complete {
            output: Some(token.finish()),
            session: Session {
                key: session_key,
                mechanism: MechanismId::Ntlm,
                flags,
                initiator: true,
                client: self.client.clone(),
                target: self.target.clone(),
                expires: self.expires,
                send_seq: 0,
                window: SequenceWindow::new(0),
            },
        })
    }
}

#[derive(Debug)]
pub(super) struct Acceptor {
    challenge: [u8; CHALLENGE_LEN],
    /// Flags offered in the CHALLENGE.
    flags: ContextFlags,
    service: String,
}

impl Acceptor {
    /// Answers NEGOTIATE with a fresh challenge.
    pub(super) fn start(realm: &LoopbackRealm, service: Option<&str>, input: &[u8]) -> Rejected<(Self, Vec<u8>)> {
        let mut reader = MessageReader::new(input, MessageType::Negotiate)?;
        let flags = ContextFlags::from_bits_truncate(reader.read_u32()?) & supported_flags();
        reader.finish()?;

        let challenge = crypto::random_bytes::<CHALLENGE_LEN>();

        let mut token = MessageWriter::new(MessageType::Challenge);
        token.write_bytes(&challenge)?;
        token.write_u32(flags.bits())?;

        Ok((
            Self {
                challenge,
                flags,
                service: service.map_or_else(|| realm.name().to_owned(), str::to_owned),
            },
            token.finish(),
        ))
    }

    /// Verifies AUTHENTICATE. No token is sent back.
    pub(super) fn step(
        &mut self,
        realm: &LoopbackRealm,
        input: &[u8],
        bindings: Option<&ChannelBindings>,
    ) -> Rejected<Session> {
        let mut reader = MessageReader::new(input, MessageType::Authenticate)?;
        let client = reader.read_string()?;
        let client_challenge = reader.read_bytes()?;
        let proof = reader.read_bytes()?;
        let encrypted_session_key = reader.read_bytes()?;
        let initiator_bindings = reader.read_bytes()?;
        // the initiator may only narrow what the CHALLENGE offered
        let flags = ContextFlags::from_bits_truncate(reader.read_u32()?) & self.flags;
        reader.finish()?;

        let key = realm
            .ntlm_key(&client)
            .ok_or_else(|| Rejection::new(RoutineError::Failure, minor::LOGON_FAILURE))?;

        let proven = crypto::decrypt(&key, PROOF_KEY_USAGE, &proof)
            .map_err(|_| Rejection::new(RoutineError::Failure, minor::LOGON_FAILURE))?;
        if proven != proof_input(&self.challenge, &client_challenge, &client, &initiator_bindings) {
            return Err(Rejection::new(RoutineError::Failure, minor::LOGON_FAILURE));
        }
        check_bindings(bindings, &initiator_bindings)?;

        let session_key = crypto::decrypt(&key, KEY_EXCHANGE_KEY_USAGE, &encrypted_session_key)
            .map_err(|_| Rejection::new(RoutineError::DefectiveToken, minor::INTEGRITY_CHECK_FAILED))?;

        Ok(Session {
            key: Secret::new(session_key),
            mechanism: MechanismId::Ntlm,
            flags,
            initiator: false,
            client,
            target: self.service.clone(),
            expires: OffsetDateTime::now_utc() + super::TICKET_LIFETIME,
            send_seq: 0,
            window: SequenceWindow::new(0),
        })
    }
}
