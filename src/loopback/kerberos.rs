//! AP-REQ / AP-REP exchange against the realm keystore.
//!
//! The realm acts as the KDC: the initiator gets the service ticket directly from the service
//! key. Messages are the RFC 4120 ones framed as RFC 4121 initial context tokens. The requested
//! context flags and the channel binding hash travel in the `0x8003` authenticator checksum.

use std::fmt::Debug;

use md5::{Digest, Md5};
use picky_asn1::bit_string::BitString;
use picky_asn1::date::GeneralizedTime;
use picky_asn1::restricted_string::IA5String;
use picky_asn1::wrapper::{
    Asn1SequenceOf, ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ExplicitContextTag3,
    ExplicitContextTag4, ExplicitContextTag5, ExplicitContextTag7, IntegerAsn1, ObjectIdentifierAsn1,
    OctetStringAsn1, Optional,
};
use picky_asn1_x509::oids;
use picky_krb::constants::gss_api::{AP_REP_TOKEN_ID, AP_REQ_TOKEN_ID, AUTHENTICATOR_CHECKSUM_TYPE};
use picky_krb::constants::key_usages::{AP_REP_ENC, AP_REQ_AUTHENTICATOR, TICKET_REP};
use picky_krb::constants::types::{AP_REP_MSG_TYPE, AP_REQ_MSG_TYPE, NT_PRINCIPAL, NT_SRV_INST};
use picky_krb::data_types::{
    ApOptions, Authenticator, AuthenticatorInner, Checksum, EncApRepPart, EncApRepPartInner, EncTicketPart,
    EncTicketPartInner, EncryptedData, EncryptionKey, KerberosFlags, KerberosStringAsn1, KerberosTime,
    PrincipalName, Realm, Ticket, TicketInner, TransitedEncoding,
};
use picky_krb::gss_api::{ApplicationTag0, KrbMessage};
use picky_krb::messages::{ApRep, ApRepInner, ApReq, ApReqInner};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;

use super::session::{SequenceWindow, Session};
use super::{bindings_bytes, crypto, minor, InitiatorRequest, LoopbackRealm, Rejected, Rejection, Step};
use crate::channel_bindings::ChannelBindings;
use crate::mechanism::MechanismId;
use crate::status::RoutineError;
use crate::{ContextFlags, Secret};

const KERBEROS_VERSION: u8 = 0x05;

const MUTUAL_REQUIRED: u32 = 0x2000_0000;

const MAX_MICROSECONDS: u32 = 999_999;

/// Lgth (4) + Bnd (16) + Flags (4).
const CHECKSUM_LEN: usize = 24;

fn supported_flags() -> ContextFlags {
    ContextFlags::MUTUAL
        | ContextFlags::REPLAY_DETECT
        | ContextFlags::SEQUENCE_DETECT
        | ContextFlags::CONFIDENTIALITY
        | ContextFlags::INTEGRITY
}

fn random_seq() -> u32 {
    u32::from_be_bytes(crypto::random_bytes::<4>())
}

fn unsigned_integer(value: u32) -> IntegerAsn1 {
    IntegerAsn1::from_bytes_be_unsigned(value.to_be_bytes().to_vec())
}

fn read_unsigned_integer(value: &IntegerAsn1) -> Rejected<u32> {
    let bytes = value.as_unsigned_bytes_be();
    let start = bytes.iter().position(|byte| *byte != 0).unwrap_or(bytes.len());
    let bytes = &bytes[start..];
    if bytes.len() > 4 {
        return Err(Rejection::defective());
    }

    let mut be = [0; 4];
    be[4 - bytes.len()..].copy_from_slice(bytes);

    Ok(u32::from_be_bytes(be))
}

fn kerberos_string(value: &str) -> Rejected<KerberosStringAsn1> {
    IA5String::from_string(value.to_owned())
        .map(KerberosStringAsn1::from)
        .map_err(|_| Rejection::new(RoutineError::BadName, minor::INVALID_NAME))
}

/// Splits `name/instance@REALM` into the principal name and its realm.
fn principal_name(principal: &str, name_type: u8) -> Rejected<(PrincipalName, Realm)> {
    let (name, realm) = principal
        .rsplit_once('@')
        .ok_or_else(|| Rejection::new(RoutineError::BadName, minor::INVALID_NAME))?;
    let components = name.split('/').map(kerberos_string).collect::<Rejected<Vec<_>>>()?;

    Ok((
        PrincipalName {
            name_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![name_type])),
            name_string: ExplicitContextTag1::from(Asn1SequenceOf::from(components)),
        },
        kerberos_string(realm)?,
    ))
}

fn principal_string(name: &PrincipalName, realm: &Realm) -> String {
    let components = name.name_string.0 .0.iter().map(|component| component.0.to_string()).collect::<Vec<_>>();

    format!("{}@{}", components.join("/"), realm.0)
}

fn bindings_hash(bindings: Option<&ChannelBindings>) -> Rejected<[u8; 16]> {
    match bindings {
        Some(bindings) => Ok(Md5::digest(bindings_bytes(Some(bindings))?).into()),
        None => Ok([0; 16]),
    }
}

fn authenticator_checksum(flags: ContextFlags, bindings: Option<&ChannelBindings>) -> Rejected<Vec<u8>> {
    let mut checksum = Vec::with_capacity(CHECKSUM_LEN);
    checksum.extend_from_slice(&16u32.to_le_bytes());
    checksum.extend_from_slice(&bindings_hash(bindings)?);
    checksum.extend_from_slice(&flags.bits().to_le_bytes());

    Ok(checksum)
}

fn seal(key: &Secret<Vec<u8>>, usage: i32, data: &[u8]) -> Rejected<EncryptedData> {
    Ok(EncryptedData {
        etype: ExplicitContextTag0::from(IntegerAsn1::from(vec![crypto::etype()])),
        kvno: Optional::from(None),
        cipher: ExplicitContextTag2::from(OctetStringAsn1::from(crypto::encrypt(key, usage, data)?)),
    })
}

fn open<T: DeserializeOwned>(key: &Secret<Vec<u8>>, usage: i32, data: &EncryptedData) -> Rejected<T> {
    if data.etype.0 .0 != [crypto::etype()] {
        return Err(Rejection::defective());
    }
    let plain = crypto::decrypt(key, usage, &data.cipher.0 .0)
        .map_err(|_| Rejection::new(RoutineError::DefectiveToken, minor::INTEGRITY_CHECK_FAILED))?;

    Ok(picky_asn1_der::from_bytes(&plain)?)
}

fn frame<T: Serialize + Debug + PartialEq>(token_id: [u8; 2], message: T) -> Rejected<Vec<u8>> {
    Ok(picky_asn1_der::to_vec(&ApplicationTag0(KrbMessage {
        krb5_oid: ObjectIdentifierAsn1::from(oids::krb5()),
        krb5_token_id: token_id,
        krb_msg: message,
    }))?)
}

fn unframe<T: DeserializeOwned>(data: &[u8], token_id: [u8; 2]) -> Rejected<T> {
    let message = KrbMessage::<T>::decode_application_krb_message(data)
        .map_err(|_| Rejection::defective())?
        .0;
    let mechanism = &message.krb5_oid.0;
    if (*mechanism != oids::krb5() && *mechanism != oids::ms_krb5()) || message.krb5_token_id != token_id {
        return Err(Rejection::defective());
    }

    Ok(message.krb_msg)
}

/// Whether `data` is a framed AP-REQ.
pub(super) fn is_ap_req(data: &[u8]) -> bool {
    unframe::<ApReq>(data, AP_REQ_TOKEN_ID).is_ok()
}

/// Initiator waiting for the AP-REP of a mutual exchange.
#[derive(Debug)]
pub(super) struct Initiator {
    pending: Option<Session>,
    ctime: i64,
    cusec: u32,
}

impl Initiator {
    pub(super) fn start(realm: &LoopbackRealm, request: &InitiatorRequest) -> Rejected<(Self, Step)> {
        if realm.kerberos_key(&request.client).is_none() {
            return Err(Rejection::new(RoutineError::NoCred, minor::NO_KERBEROS_KEY));
        }
        let service_key = realm
            .kerberos_key(&request.target)
            .ok_or_else(|| Rejection::new(RoutineError::Failure, minor::UNKNOWN_SERVER))?;

        let (cname, crealm) = principal_name(&request.client, NT_PRINCIPAL)?;
        let (sname, srealm) = principal_name(&request.target, NT_SRV_INST)?;

        let session_key = crypto::random_key();
        let flags = request.flags & supported_flags();
        let now = OffsetDateTime::now_utc();
        let cusec = now.microsecond().min(MAX_MICROSECONDS);
        let seq = random_seq();

        let enc_ticket_part = EncTicketPart::from(EncTicketPartInner {
            flags: ExplicitContextTag0::from(KerberosFlags::from(BitString::with_bytes(vec![0, 0, 0, 0]))),
            key: ExplicitContextTag1::from(EncryptionKey {
                key_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![crypto::etype()])),
                key_value: ExplicitContextTag1::from(OctetStringAsn1::from(session_key.as_ref().to_vec())),
            }),
            crealm: ExplicitContextTag2::from(crealm.clone()),
            cname: ExplicitContextTag3::from(cname.clone()),
            transited: ExplicitContextTag4::from(TransitedEncoding {
                tr_type: ExplicitContextTag0::from(IntegerAsn1::from(vec![0])),
                contents: ExplicitContextTag1::from(OctetStringAsn1::from(Vec::new())),
            }),
            auth_time: ExplicitContextTag5::from(KerberosTime::from(GeneralizedTime::from(now))),
            starttime: Optional::from(None),
            endtime: ExplicitContextTag7::from(KerberosTime::from(GeneralizedTime::from(request.expires))),
            renew_till: Optional::from(None),
            caddr: Optional::from(None),
            authorization_data: Optional::from(None),
        });
        let ticket = Ticket::from(TicketInner {
            tkt_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            realm: ExplicitContextTag1::from(srealm),
            sname: ExplicitContextTag2::from(sname),
            enc_part: ExplicitContextTag3::from(seal(
                &service_key,
                TICKET_REP,
                &picky_asn1_der::to_vec(&enc_ticket_part)?,
            )?),
        });

        let authenticator = Authenticator::from(AuthenticatorInner {
            authenticator_vno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            crealm: ExplicitContextTag1::from(crealm),
            cname: ExplicitContextTag2::from(cname),
            cksum: Optional::from(Some(ExplicitContextTag3::from(Checksum {
                cksumtype: ExplicitContextTag0::from(IntegerAsn1::from(AUTHENTICATOR_CHECKSUM_TYPE.to_vec())),
                checksum: ExplicitContextTag1::from(OctetStringAsn1::from(authenticator_checksum(
                    flags,
                    request.bindings.as_ref(),
                )?)),
            }))),
            cusec: ExplicitContextTag4::from(unsigned_integer(cusec)),
            ctime: ExplicitContextTag5::from(KerberosTime::from(GeneralizedTime::from(now))),
            subkey: Optional::from(None),
            seq_number: Optional::from(Some(ExplicitContextTag7::from(unsigned_integer(seq)))),
            authorization_data: Optional::from(None),
        });

        let ap_options = if flags.contains(ContextFlags::MUTUAL) {
            MUTUAL_REQUIRED
        } else {
            0
        };
        let ap_req = ApReq::from(ApReqInner {
            pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
            msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REQ_MSG_TYPE])),
            ap_options: ExplicitContextTag2::from(ApOptions::from(BitString::with_bytes(
                ap_options.to_be_bytes().to_vec(),
            ))),
            ticket: ExplicitContextTag3::from(ticket),
            authenticator: ExplicitContextTag4::from(seal(
                &session_key,
                AP_REQ_AUTHENTICATOR,
                &picky_asn1_der::to_vec(&authenticator)?,
            )?),
        });
        let token = frame(AP_REQ_TOKEN_ID, ap_req)?;

        let session = Session {
            key: session_key,
            mechanism: MechanismId::Kerberos,
            flags,
            initiator: true,
            client: request.client.clone(),
            target: request.target.clone(),
            expires: request.expires,
            send_seq: u64::from(seq),
            window: SequenceWindow::new(u64::from(seq)),
        };
        let ctime = now.unix_timestamp();

        if flags.contains(ContextFlags::MUTUAL) {
            Ok((
                Self {
                    pending: Some(session),
                    ctime,
                    cusec,
                },
                Step::Continue(token),
            ))
        } else {
            Ok((
                Self {
                    pending: None,
                    ctime,
                    cusec,
                },
                Step::Complete {
                    output: Some(token),
                    session,
                },
            ))
        }
    }

    /// Verifies the AP-REP: it must echo our authenticator time under the session key.
    pub(super) fn step(&mut self, input: &[u8]) -> Rejected<Step> {
        let mut session = self
            .pending
            .take()
            .ok_or_else(|| Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE))?;

        let ap_rep: ApRep = unframe(input, AP_REP_TOKEN_ID)?;
        let enc_part: EncApRepPart = open(&session.key, AP_REP_ENC, &ap_rep.0.enc_part.0)?;

        let ctime = OffsetDateTime::try_from(enc_part.0.ctime.0 .0.clone())
            .map_err(|_| Rejection::defective())?
            .unix_timestamp();
        let cusec = read_unsigned_integer(&enc_part.0.cusec.0)?;
        if ctime != self.ctime || cusec != self.cusec {
            return Err(Rejection::new(RoutineError::DefectiveToken, minor::MUTUAL_FAILED));
        }

        let acceptor_seq = enc_part
            .0
            .seq_number
            .0
            .as_ref()
            .map(|seq| read_unsigned_integer(&seq.0))
            .transpose()?
            .ok_or_else(Rejection::defective)?;
        session.window = SequenceWindow::new(u64::from(acceptor_seq));

        Ok(Step::Complete { output: None, session })
    }
}

/// Verifies an AP-REQ and returns the AP-REP when mutual authentication was requested.
/// `service` restricts the ticket to one principal; without it any key of the realm may accept.
pub(super) fn accept(
    realm: &LoopbackRealm,
    service: Option<&str>,
    input: &[u8],
    bindings: Option<&ChannelBindings>,
) -> Rejected<(Option<Vec<u8>>, Session)> {
    let ap_req: ApReq = unframe(input, AP_REQ_TOKEN_ID)?;
    let ApReqInner {
        ticket, authenticator, ..
    } = ap_req.0;
    let ticket = ticket.0 .0;

    let target = principal_string(&ticket.sname.0, &ticket.realm.0);
    if service.is_some_and(|service| service != target) {
        return Err(Rejection::new(RoutineError::Failure, minor::WRONG_PRINCIPAL));
    }

    let service_key = realm
        .kerberos_key(&target)
        .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::NO_KERBEROS_KEY))?;

    let enc_ticket_part: EncTicketPart = open(&service_key, TICKET_REP, &ticket.enc_part.0)?;
    let enc_ticket_part = enc_ticket_part.0;

    let expires = OffsetDateTime::try_from(enc_ticket_part.endtime.0 .0.clone()).map_err(|_| Rejection::defective())?;
    if expires <= OffsetDateTime::now_utc() {
        return Err(Rejection::new(RoutineError::CredentialsExpired, minor::TICKET_EXPIRED));
    }
    let client = principal_string(&enc_ticket_part.cname.0, &enc_ticket_part.crealm.0);
    let session_key = Secret::new(enc_ticket_part.key.0.key_value.0 .0.clone());

    let authenticator: Authenticator = open(&session_key, AP_REQ_AUTHENTICATOR, &authenticator.0)?;
    let authenticator = authenticator.0;

    if authenticator.crealm.0 != enc_ticket_part.crealm.0 || authenticator.cname.0 != enc_ticket_part.cname.0 {
        return Err(Rejection::new(RoutineError::DefectiveToken, minor::WRONG_PRINCIPAL));
    }

    let checksum = authenticator
        .cksum
        .0
        .as_ref()
        .map(|checksum| &checksum.0)
        .filter(|checksum| checksum.cksumtype.0 .0 == AUTHENTICATOR_CHECKSUM_TYPE)
        .map(|checksum| checksum.checksum.0 .0.as_slice())
        .filter(|checksum| checksum.len() >= CHECKSUM_LEN)
        .ok_or_else(Rejection::defective)?;

    // an acceptor without bindings accepts any
    if bindings.is_some() && checksum[4..20] != bindings_hash(bindings)? {
        return Err(Rejection::new(RoutineError::BadBindings, minor::CHANNEL_BINDINGS_MISMATCH));
    }
    let flags = <[u8; 4]>::try_from(&checksum[20..24])
        .map(u32::from_le_bytes)
        .map_err(|_| Rejection::defective())?;
    let flags = ContextFlags::from_bits_truncate(flags) & supported_flags();

    let initiator_seq = authenticator
        .seq_number
        .0
        .as_ref()
        .map(|seq| read_unsigned_integer(&seq.0))
        .transpose()?
        .unwrap_or_default();

    let mut session = Session {
        key: session_key,
        mechanism: MechanismId::Kerberos,
        flags,
        initiator: false,
        client,
        target,
        expires,
        send_seq: u64::from(initiator_seq),
        window: SequenceWindow::new(u64::from(initiator_seq)),
    };

    if !flags.contains(ContextFlags::MUTUAL) {
        return Ok((None, session));
    }

    let acceptor_seq = random_seq();
    let enc_part = EncApRepPart::from(EncApRepPartInner {
        ctime: ExplicitContextTag0::from(authenticator.ctime.0),
        cusec: ExplicitContextTag1::from(authenticator.cusec.0),
        subkey: Optional::from(None),
        seq_number: Optional::from(Some(ExplicitContextTag3::from(unsigned_integer(acceptor_seq)))),
    });
    let ap_rep = ApRep::from(ApRepInner {
        pvno: ExplicitContextTag0::from(IntegerAsn1::from(vec![KERBEROS_VERSION])),
        msg_type: ExplicitContextTag1::from(IntegerAsn1::from(vec![AP_REP_MSG_TYPE])),
        enc_part: ExplicitContextTag2::from(seal(&session.key, AP_REP_ENC, &picky_asn1_der::to_vec(&enc_part)?)?),
    });
    session.send_seq = u64::from(acceptor_seq);

    Ok((Some(frame(AP_REP_TOKEN_ID, ap_rep)?), session))
}
