//! In-process GSS-API provider over a shared realm keystore.
//!
//! Both peers of an exchange use providers built on the same [`LoopbackRealm`], which plays the
//! role of the KDC and of every keytab. Mechanisms:
//!
//! * Kerberos: AP-REQ with a service ticket sealed under the service key, optional AP-REP for
//!   mutual authentication.
//! * NTLM: a three-leg challenge/response with session key exchange.
//! * SPNEGO: selects one of the above, falling back to NTLM when Kerberos cannot be used.
//!
//! The provider counts every handle it hands out and every release, and records releases of
//! handles it already freed instead of touching them.
//!
//! ```
//! use std::sync::Arc;
//!
//! use gss_negotiate::loopback::{LoopbackProvider, LoopbackRealm};
//! use gss_negotiate::{Gss, GssConfig};
//!
//! let realm = LoopbackRealm::new("EXAMPLE.COM");
//! realm.add_principal("alice", "password").unwrap();
//!
//! let provider = Arc::new(LoopbackProvider::new(realm));
//! let gss = Gss::new(provider.clone(), GssConfig::default()).unwrap();
//!
//! assert_eq!(provider.stats().live, 0);
//! # drop(gss);
//! ```

mod crypto;
mod kerberos;
mod ntlm;
mod session;
mod spnego;
mod token;

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use picky_asn1::date::GeneralizedTime;
use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, IntegerAsn1, Optional};
use picky_asn1_der::Asn1DerError;
use picky_krb::constants::types::PA_ENC_TIMESTAMP_KEY_USAGE;
use picky_krb::crypto::KerberosCryptoError;
use picky_krb::data_types::{KerberosTime, PaEncTsEnc};
use time::{Duration, OffsetDateTime};

use self::session::Session;
use self::token::MessageType;
use crate::buffer::SecurityBuffer;
use crate::channel_bindings::ChannelBindings;
use crate::credentials::CredentialUsage;
use crate::mechanism::{MechanismId, ProviderFamily};
use crate::name::NameType;
use crate::provider::{
    AcceptSecContextCall, AcquireCredRequest, AcquiredCredential, CallStatus, ContextInfo, GssProvider,
    InitSecContextCall, Outcome, RawHandle, SecContextOutput, StatusType,
};
use crate::status::{self, RoutineError};
use crate::{ContextFlags, Error, ErrorKind, Result, Secret};

/// Maximum lifetime of tickets, credentials and contexts.
pub(super) const TICKET_LIFETIME: Duration = Duration::hours(10);

/// Minor status codes reported by the loopback mechanisms.
pub mod minor {
    pub const MALFORMED_TOKEN: u32 = 1;
    pub const INTEGRITY_CHECK_FAILED: u32 = 2;
    pub const UNKNOWN_PRINCIPAL: u32 = 3;
    pub const UNKNOWN_SERVER: u32 = 4;
    pub const PREAUTH_FAILED: u32 = 5;
    pub const WRONG_PRINCIPAL: u32 = 6;
    pub const TICKET_EXPIRED: u32 = 7;
    pub const CHANNEL_BINDINGS_MISMATCH: u32 = 8;
    pub const NO_COMMON_MECHANISM: u32 = 9;
    pub const LOGON_FAILURE: u32 = 10;
    pub const CONTEXT_STATE: u32 = 11;
    pub const NO_KERBEROS_KEY: u32 = 12;
    pub const STALE_HANDLE: u32 = 13;
    pub const MUTUAL_FAILED: u32 = 14;
    pub const WRONG_DIRECTION: u32 = 15;
    pub const CRYPTO_FAILURE: u32 = 16;
    pub const NO_DEFAULT_IDENTITY: u32 = 17;
    pub const CONTEXT_EXPIRED: u32 = 18;
    pub const CREDENTIALS_EXPIRED: u32 = 19;
    pub const INVALID_NAME: u32 = 20;

    pub(super) fn describe(code: u32) -> Option<&'static str> {
        let text = match code {
            MALFORMED_TOKEN => "malformed token",
            INTEGRITY_CHECK_FAILED => "decrypt integrity check failed",
            UNKNOWN_PRINCIPAL => "client not found in the realm",
            UNKNOWN_SERVER => "server not found in the realm",
            PREAUTH_FAILED => "preauthentication failed",
            WRONG_PRINCIPAL => "wrong principal in request",
            TICKET_EXPIRED => "ticket expired",
            CHANNEL_BINDINGS_MISMATCH => "channel binding mismatch",
            NO_COMMON_MECHANISM => "no mechanism in common with the peer",
            LOGON_FAILURE => "logon failure",
            CONTEXT_STATE => "token received in the wrong context state",
            NO_KERBEROS_KEY => "principal has no Kerberos key",
            STALE_HANDLE => "unknown or released handle",
            MUTUAL_FAILED => "mutual authentication failed",
            WRONG_DIRECTION => "token sent by the wrong side of the context",
            CRYPTO_FAILURE => "cryptographic operation failed",
            NO_DEFAULT_IDENTITY => "no default identity in the realm",
            CONTEXT_EXPIRED => "context expired",
            CREDENTIALS_EXPIRED => "credentials expired",
            INVALID_NAME => "invalid name",
            _ => return None,
        };

        Some(text)
    }
}

/// Why a mechanism refused a call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Rejection {
    error: RoutineError,
    minor: u32,
}

impl Rejection {
    pub(super) fn new(error: RoutineError, minor: u32) -> Self {
        Self { error, minor }
    }

    pub(super) fn defective() -> Self {
        Self::new(RoutineError::DefectiveToken, minor::MALFORMED_TOKEN)
    }

    pub(super) fn bad_signature() -> Self {
        Self::new(RoutineError::BadSig, minor::INTEGRITY_CHECK_FAILED)
    }

    fn status(self) -> CallStatus {
        CallStatus::routine(self.error, self.minor)
    }
}

impl From<io::Error> for Rejection {
    fn from(_: io::Error) -> Self {
        Self::defective()
    }
}

impl From<Asn1DerError> for Rejection {
    fn from(_: Asn1DerError) -> Self {
        Self::defective()
    }
}

impl From<KerberosCryptoError> for Rejection {
    fn from(_: KerberosCryptoError) -> Self {
        Self::new(RoutineError::Failure, minor::CRYPTO_FAILURE)
    }
}

pub(super) type Rejected<T> = std::result::Result<T, Rejection>;

/// Outcome of one leg of an exchange.
#[derive(Debug)]
pub(super) enum Step {
    /// Send the token (if not empty) and wait for the peer.
    Continue(Vec<u8>),
    Complete { output: Option<Vec<u8>>, session: Session },
}

#[derive(Debug, Clone)]
pub(super) struct InitiatorRequest {
    client: String,
    target: String,
    target_is_ip: bool,
    flags: ContextFlags,
    bindings: Option<ChannelBindings>,
    expires: OffsetDateTime,
}

fn bindings_bytes(bindings: Option<&ChannelBindings>) -> Rejected<Vec<u8>> {
    Ok(bindings
        .map(ChannelBindings::to_bytes)
        .transpose()
        .map_err(|_| Rejection::new(RoutineError::BadBindings, minor::CHANNEL_BINDINGS_MISMATCH))?
        .unwrap_or_default())
}

/// An acceptor without bindings accepts any.
fn check_bindings(ours: Option<&ChannelBindings>, theirs: &[u8]) -> Rejected<()> {
    match ours {
        Some(ours) if bindings_bytes(Some(ours))? != theirs => Err(Rejection::new(
            RoutineError::BadBindings,
            minor::CHANNEL_BINDINGS_MISMATCH,
        )),
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct PrincipalKeys {
    kerberos: Option<Secret<Vec<u8>>>,
    ntlm: Secret<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Keystore {
    principals: HashMap<String, PrincipalKeys>,
    // insertion order, the first principal is the default identity
    order: Vec<String>,
    default_principal: Option<String>,
}

/// Principals and their long-term keys.
#[derive(Debug)]
pub struct LoopbackRealm {
    name: String,
    keystore: Mutex<Keystore>,
}

impl LoopbackRealm {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            keystore: Mutex::new(Keystore::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends the realm to names that do not carry one.
    pub fn qualify(&self, principal: &str) -> String {
        if principal.contains('@') {
            principal.to_owned()
        } else {
            format!("{}@{}", principal, self.name)
        }
    }

    fn keystore(&self) -> MutexGuard<'_, Keystore> {
        self.keystore.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a principal usable with every mechanism.
    pub fn add_principal(&self, principal: &str, password: &str) -> Result<()> {
        let principal = self.qualify(principal);
        let keys = PrincipalKeys {
            kerberos: Some(self.kerberos_string_to_key(&principal, password)?),
            ntlm: ntlm_string_to_key(&principal, password)?,
        };

        self.insert(principal, keys);

        Ok(())
    }

    /// Adds a principal without a Kerberos key, as if it only existed in a local account
    /// database.
    pub fn add_ntlm_principal(&self, principal: &str, password: &str) -> Result<()> {
        let principal = self.qualify(principal);
        let keys = PrincipalKeys {
            kerberos: None,
            ntlm: ntlm_string_to_key(&principal, password)?,
        };

        self.insert(principal, keys);

        Ok(())
    }

    /// Chooses the identity used when credentials are acquired without a name.
    pub fn set_default_principal(&self, principal: &str) -> Result<()> {
        let principal = self.qualify(principal);
        let mut keystore = self.keystore();

        if !keystore.principals.contains_key(&principal) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("{} is not a principal of the realm", principal),
            ));
        }

        keystore.default_principal = Some(principal);

        Ok(())
    }

    fn insert(&self, principal: String, keys: PrincipalKeys) {
        debug!(%principal, kerberos = keys.kerberos.is_some(), "added loopback principal");

        let mut keystore = self.keystore();
        if keystore.principals.insert(principal.clone(), keys).is_none() {
            keystore.order.push(principal);
        }
    }

    fn kerberos_string_to_key(&self, principal: &str, password: &str) -> Result<Secret<Vec<u8>>> {
        // REALM followed by the name components
        let components = principal.split('@').next().unwrap_or(principal).replace('/', "");

        Ok(crypto::string_to_key(password, &format!("{}{}", self.name, components))?)
    }

    fn contains(&self, principal: &str) -> bool {
        self.keystore().principals.contains_key(principal)
    }

    fn default_principal(&self) -> Option<String> {
        let keystore = self.keystore();

        keystore
            .default_principal
            .clone()
            .or_else(|| keystore.order.first().cloned())
    }

    pub(super) fn kerberos_key(&self, principal: &str) -> Option<Secret<Vec<u8>>> {
        self.keystore()
            .principals
            .get(principal)
            .and_then(|keys| keys.kerberos.clone())
    }

    pub(super) fn ntlm_key(&self, principal: &str) -> Option<Secret<Vec<u8>>> {
        self.keystore().principals.get(principal).map(|keys| keys.ntlm.clone())
    }

    /// Checks `password` the way PA-ENC-TIMESTAMP pre-authentication does: a timestamp sealed
    /// with the key derived from it has to open with the stored key.
    fn verify_password(&self, principal: &str, password: &str) -> Rejected<()> {
        let (stored, derived) = match self.kerberos_key(principal) {
            Some(key) => (
                key,
                self.kerberos_string_to_key(principal, password)
                    .map_err(|_| Rejection::new(RoutineError::Failure, minor::CRYPTO_FAILURE))?,
            ),
            None => {
                let key = self
                    .ntlm_key(principal)
                    .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::UNKNOWN_PRINCIPAL))?;

                (key, ntlm_string_to_key(principal, password)?)
            }
        };

        let now = OffsetDateTime::now_utc();
        let timestamp = picky_asn1_der::to_vec(&PaEncTsEnc {
            patimestamp: ExplicitContextTag0::from(KerberosTime::from(GeneralizedTime::from(now))),
            pausec: Optional::from(Some(ExplicitContextTag1::from(IntegerAsn1::from(
                now.microsecond().to_be_bytes().to_vec(),
            )))),
        })?;
        let sealed = crypto::encrypt(&derived, PA_ENC_TIMESTAMP_KEY_USAGE, &timestamp)?;

        crypto::decrypt(&stored, PA_ENC_TIMESTAMP_KEY_USAGE, &sealed)
            .map(|_| ())
            .map_err(|_| Rejection::new(RoutineError::Failure, minor::PREAUTH_FAILED))
    }
}

fn ntlm_string_to_key(principal: &str, password: &str) -> std::result::Result<Secret<Vec<u8>>, KerberosCryptoError> {
    crypto::string_to_key(password, &format!("NTLM:{}", principal.to_lowercase()))
}

/// An imported name: how it is displayed and which realm principals it may denote.
#[derive(Debug, Clone)]
struct LoopbackName {
    display: String,
    candidates: Vec<String>,
    host: Option<String>,
}

impl LoopbackName {
    fn import(realm: &LoopbackRealm, text: &str, name_type: NameType) -> Option<Self> {
        if text.is_empty() {
            return None;
        }

        match name_type {
            NameType::UserPrincipal => Some(Self::principal(realm.qualify(text))),
            NameType::HostBasedService => {
                let (service, host) = match text.split_once('@') {
                    Some((service, host)) => (service, Some(host)),
                    None => (text, None),
                };

                let candidates = match host {
                    Some(host) => vec![text.to_owned(), format!("{}/{}@{}", service, host, realm.name())],
                    None => vec![realm.qualify(service)],
                };

                Some(Self {
                    display: candidates[0].clone(),
                    candidates,
                    host: host.map(str::to_owned),
                })
            }
            NameType::KerberosPrincipal => {
                let qualified = realm.qualify(text);
                let host = qualified
                    .split('@')
                    .next()
                    .and_then(|principal| principal.split_once('/'))
                    .map(|(_, instance)| instance.to_owned());

                Some(Self {
                    display: qualified.clone(),
                    candidates: vec![qualified],
                    host,
                })
            }
        }
    }

    fn principal(principal: String) -> Self {
        Self {
            display: principal.clone(),
            candidates: vec![principal],
            host: None,
        }
    }

    /// The realm principal the name denotes, if any.
    fn resolve(&self, realm: &LoopbackRealm) -> Option<String> {
        self.candidates.iter().find(|candidate| realm.contains(candidate)).cloned()
    }

    fn is_ip_address(&self) -> bool {
        self.host
            .as_deref()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct LoopbackCredential {
    principal: Option<String>,
    usage: CredentialUsage,
    mechanism: MechanismId,
    negotiable: Vec<MechanismId>,
    expires: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct AcceptorSetup {
    service: Option<String>,
    mechanism: MechanismId,
    supported: Vec<MechanismId>,
}

#[derive(Debug)]
enum Exchange {
    KerberosInitiator(kerberos::Initiator),
    NtlmInitiator(ntlm::Initiator),
    SpnegoInitiator(spnego::Initiator),
    /// The acceptor has not seen a token yet.
    AwaitInitiator(AcceptorSetup),
    NtlmAcceptor(ntlm::Acceptor),
    SpnegoAcceptor(spnego::Acceptor),
    /// Between a completed step and the session being installed.
    Closed,
    Open(Session),
}

impl Exchange {
    fn mechanism(&self) -> Option<MechanismId> {
        match self {
            Exchange::KerberosInitiator(_) => Some(MechanismId::Kerberos),
            Exchange::NtlmInitiator(_) | Exchange::NtlmAcceptor(_) => Some(MechanismId::Ntlm),
            Exchange::Open(session) => Some(session.mechanism.clone()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LoopbackContext {
    initiator: bool,
    exchange: Exchange,
}

impl LoopbackContext {
    fn step_initiator(&mut self, realm: &LoopbackRealm, input: &[u8]) -> Rejected<Step> {
        match &mut self.exchange {
            Exchange::KerberosInitiator(initiator) => initiator.step(input),
            Exchange::NtlmInitiator(initiator) => initiator.step(realm, input),
            Exchange::SpnegoInitiator(initiator) => initiator.step(realm, input),
            _ => Err(Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE)),
        }
    }

    fn step_acceptor(
        &mut self,
        realm: &LoopbackRealm,
        input: &[u8],
        bindings: Option<&ChannelBindings>,
    ) -> Rejected<Step> {
        match &mut self.exchange {
            Exchange::AwaitInitiator(setup) => {
                let (exchange, step) = start_acceptor(realm, setup.clone(), input, bindings)?;
                self.exchange = exchange;

                Ok(step)
            }
            Exchange::NtlmAcceptor(acceptor) => acceptor
                .step(realm, input, bindings)
                .map(|session| Step::Complete { output: None, session }),
            Exchange::SpnegoAcceptor(acceptor) => acceptor.step(realm, input, bindings),
            _ => Err(Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE)),
        }
    }

    fn session(&mut self) -> Rejected<&mut Session> {
        match &mut self.exchange {
            Exchange::Open(session) if session.is_expired() => {
                Err(Rejection::new(RoutineError::ContextExpired, minor::CONTEXT_EXPIRED))
            }
            Exchange::Open(session) => Ok(session),
            _ => Err(Rejection::new(RoutineError::NoContext, minor::CONTEXT_STATE)),
        }
    }
}

fn start_acceptor(
    realm: &LoopbackRealm,
    setup: AcceptorSetup,
    input: &[u8],
    bindings: Option<&ChannelBindings>,
) -> Rejected<(Exchange, Step)> {
    let spnego = |setup: AcceptorSetup| -> Rejected<(Exchange, Step)> {
        let mut acceptor = spnego::Acceptor::new(setup.service, setup.supported);
        let step = acceptor.step(realm, input, bindings)?;

        Ok((Exchange::SpnegoAcceptor(acceptor), step))
    };

    if input.is_empty() {
        return if setup.mechanism.is_negotiating() {
            spnego(setup)
        } else {
            Ok((Exchange::AwaitInitiator(setup), Step::Continue(Vec::new())))
        };
    }

    let offered = if spnego::is_neg_token_init(input) {
        MechanismId::Spnego
    } else if kerberos::is_ap_req(input) {
        MechanismId::Kerberos
    } else if MessageType::of(input) == Some(MessageType::Negotiate) {
        MechanismId::Ntlm
    } else {
        return Err(Rejection::defective());
    };

    match offered {
        MechanismId::Spnego if setup.mechanism.is_negotiating() => spnego(setup),
        MechanismId::Kerberos if setup.supported.contains(&MechanismId::Kerberos) => {
            let (output, session) = kerberos::accept(realm, setup.service.as_deref(), input, bindings)?;

            Ok((Exchange::Closed, Step::Complete { output, session }))
        }
        MechanismId::Ntlm if setup.supported.contains(&MechanismId::Ntlm) => {
            let (acceptor, challenge) = ntlm::Acceptor::start(realm, setup.service.as_deref(), input)?;

            Ok((Exchange::NtlmAcceptor(acceptor), Step::Continue(challenge)))
        }
        _ => Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM)),
    }
}

#[derive(Debug)]
enum Object {
    Name(LoopbackName),
    Credential(LoopbackCredential),
    Context(Box<LoopbackContext>),
    Buffer(Vec<u8>),
}

/// Handle accounting of a [`LoopbackProvider`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub allocated: u64,
    pub released: u64,
    /// Releases of handles that were already released.
    pub double_releases: u64,
    pub live: usize,
}

#[derive(Debug, Default)]
struct HandleTable {
    next: u64,
    objects: HashMap<u64, Object>,
    released: HashSet<u64>,
    stats: ProviderStats,
}

impl HandleTable {
    fn insert(&mut self, object: Object) -> RawHandle {
        // handles are never reused
        self.next += 1;
        self.objects.insert(self.next, object);
        self.stats.allocated += 1;

        RawHandle::from_raw(self.next)
    }

    fn release(&mut self, handle: RawHandle, matches: fn(&Object) -> bool, error: RoutineError) -> CallStatus {
        let raw = handle.as_raw();

        match self.objects.get(&raw) {
            Some(object) if matches(object) => {
                self.objects.remove(&raw);
                self.released.insert(raw);
                self.stats.released += 1;

                CallStatus::COMPLETE
            }
            Some(_) => CallStatus::routine(error, minor::STALE_HANDLE),
            None => {
                if self.released.contains(&raw) {
                    self.stats.double_releases += 1;
                    error!(handle = raw, "loopback handle released twice");
                }

                CallStatus::routine(error, minor::STALE_HANDLE)
            }
        }
    }

    fn name(&self, handle: RawHandle) -> Rejected<&LoopbackName> {
        match self.objects.get(&handle.as_raw()) {
            Some(Object::Name(name)) => Ok(name),
            _ => Err(Rejection::new(RoutineError::BadName, minor::STALE_HANDLE)),
        }
    }

    fn credential(&self, handle: RawHandle) -> Rejected<&LoopbackCredential> {
        match self.objects.get(&handle.as_raw()) {
            Some(Object::Credential(credential)) => Ok(credential),
            _ => Err(Rejection::new(RoutineError::NoCred, minor::STALE_HANDLE)),
        }
    }

    fn context(&mut self, handle: RawHandle) -> Rejected<&mut LoopbackContext> {
        match self.objects.get_mut(&handle.as_raw()) {
            Some(Object::Context(context)) => Ok(&mut **context),
            _ => Err(Rejection::new(RoutineError::NoContext, minor::STALE_HANDLE)),
        }
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            live: self.objects.len(),
            ..self.stats
        }
    }
}

/// [`GssProvider`] running every mechanism in process against a [`LoopbackRealm`].
#[derive(Debug)]
pub struct LoopbackProvider {
    realm: Arc<LoopbackRealm>,
    mechanisms: Vec<MechanismId>,
    table: Mutex<HandleTable>,
}

impl LoopbackProvider {
    /// Offers Kerberos, SPNEGO and NTLM.
    pub fn new(realm: Arc<LoopbackRealm>) -> Self {
        Self::with_mechanisms(
            realm,
            vec![MechanismId::Kerberos, MechanismId::Spnego, MechanismId::Ntlm],
        )
    }

    pub fn with_mechanisms(realm: Arc<LoopbackRealm>, mechanisms: Vec<MechanismId>) -> Self {
        Self {
            realm,
            mechanisms,
            table: Mutex::new(HandleTable::default()),
        }
    }

    pub fn realm(&self) -> &Arc<LoopbackRealm> {
        &self.realm
    }

    pub fn stats(&self) -> ProviderStats {
        self.table().stats()
    }

    /// Hands out a buffer the way `init_sec_context` hands out output tokens.
    pub fn allocate_buffer(&self, data: Vec<u8>) -> RawHandle {
        self.table().insert(Object::Buffer(data))
    }

    fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn concrete_mechanisms(&self) -> Vec<MechanismId> {
        self.mechanisms
            .iter()
            .filter(|mechanism| !mechanism.is_negotiating())
            .cloned()
            .collect()
    }

    fn new_credential(
        &self,
        table: &HandleTable,
        request: &AcquireCredRequest<'_>,
    ) -> Rejected<(LoopbackCredential, u32)> {
        if !self.mechanisms.contains(request.mechanism) {
            return Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM));
        }

        let principal = match request.name {
            Some(name) => Some(
                table
                    .name(name)?
                    .resolve(&self.realm)
                    .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::UNKNOWN_PRINCIPAL))?,
            ),
            None if request.usage.can_initiate() => Some(
                self.realm
                    .default_principal()
                    .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::NO_DEFAULT_IDENTITY))?,
            ),
            None => None,
        };

        if let Some(principal) = &principal {
            if *request.mechanism == MechanismId::Kerberos && self.realm.kerberos_key(principal).is_none() {
                return Err(Rejection::new(RoutineError::NoCred, minor::NO_KERBEROS_KEY));
            }
        }

        let max = TICKET_LIFETIME.whole_seconds() as u32;
        let lifetime = request.lifetime.map_or(max, |requested| requested.min(max));

        let negotiable = request
            .negotiable
            .iter()
            .filter(|mechanism| self.mechanisms.contains(mechanism))
            .cloned()
            .collect();

        Ok((
            LoopbackCredential {
                principal,
                usage: request.usage,
                mechanism: request.mechanism.clone(),
                negotiable,
                expires: OffsetDateTime::now_utc() + Duration::seconds(i64::from(lifetime)),
            },
            lifetime,
        ))
    }

    fn start_initiator(&self, table: &HandleTable, call: &InitSecContextCall<'_>) -> Rejected<(LoopbackContext, Step)> {
        let credential = match call.credential {
            Some(handle) => table.credential(handle)?.clone(),
            None => LoopbackCredential {
                principal: Some(
                    self.realm
                        .default_principal()
                        .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::NO_DEFAULT_IDENTITY))?,
                ),
                usage: CredentialUsage::Initiate,
                mechanism: call.mechanism.clone(),
                negotiable: self.concrete_mechanisms(),
                expires: OffsetDateTime::now_utc() + TICKET_LIFETIME,
            },
        };

        if !credential.usage.can_initiate() {
            return Err(Rejection::new(RoutineError::NoCred, minor::CONTEXT_STATE));
        }
        if credential.expires <= OffsetDateTime::now_utc() {
            return Err(Rejection::new(RoutineError::CredentialsExpired, minor::CREDENTIALS_EXPIRED));
        }
        if !self.mechanisms.contains(call.mechanism) {
            return Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM));
        }

        let client = credential
            .principal
            .clone()
            .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::NO_DEFAULT_IDENTITY))?;
        let target = table.name(call.target)?;

        let now = OffsetDateTime::now_utc();
        let mut expires = credential.expires.min(now + TICKET_LIFETIME);
        if let Some(lifetime) = call.lifetime {
            expires = expires.min(now + Duration::seconds(i64::from(lifetime)));
        }

        let request = InitiatorRequest {
            client,
            target: target.resolve(&self.realm).unwrap_or_else(|| target.display.clone()),
            target_is_ip: target.is_ip_address(),
            flags: call.flags,
            bindings: call.channel_bindings.cloned(),
            expires,
        };

        let (exchange, step) = match call.mechanism {
            MechanismId::Kerberos => {
                let (initiator, step) = kerberos::Initiator::start(&self.realm, &request)?;
                (Exchange::KerberosInitiator(initiator), step)
            }
            MechanismId::Ntlm => {
                let (initiator, step) = ntlm::Initiator::start(&self.realm, &request)?;
                (Exchange::NtlmInitiator(initiator), step)
            }
            MechanismId::Spnego => {
                let (initiator, step) =
                    spnego::Initiator::start(&self.realm, request, &credential.negotiable, call.input)?;
                (Exchange::SpnegoInitiator(initiator), step)
            }
            MechanismId::Other(_) => return Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM)),
        };

        Ok((
            LoopbackContext {
                initiator: true,
                exchange,
            },
            step,
        ))
    }

    fn start_acceptor_context(
        &self,
        table: &HandleTable,
        call: &AcceptSecContextCall<'_>,
    ) -> Rejected<(LoopbackContext, Step)> {
        let setup = match call.credential {
            Some(handle) => {
                let credential = table.credential(handle)?;

                if !credential.usage.can_accept() {
                    return Err(Rejection::new(RoutineError::NoCred, minor::CONTEXT_STATE));
                }
                if credential.expires <= OffsetDateTime::now_utc() {
                    return Err(Rejection::new(RoutineError::CredentialsExpired, minor::CREDENTIALS_EXPIRED));
                }

                let supported = if credential.mechanism.is_negotiating() {
                    credential.negotiable.clone()
                } else {
                    vec![credential.mechanism.clone()]
                };

                AcceptorSetup {
                    service: credential.principal.clone(),
                    mechanism: credential.mechanism.clone(),
                    supported,
                }
            }
            None => AcceptorSetup {
                service: None,
                mechanism: MechanismId::Spnego,
                supported: self.concrete_mechanisms(),
            },
        };

        let (exchange, step) = start_acceptor(&self.realm, setup, call.input, call.channel_bindings)?;

        Ok((
            LoopbackContext {
                initiator: false,
                exchange,
            },
            step,
        ))
    }

    /// A failed round leaves an existing context in place for the caller to delete.
    fn failed_step(table: &mut HandleTable, context: Option<RawHandle>, rejection: Rejection) -> Outcome<SecContextOutput> {
        let context = context.filter(|handle| table.context(*handle).is_ok());

        Outcome::new(
            rejection.status(),
            SecContextOutput {
                context,
                ..Default::default()
            },
        )
    }

    /// Publishes the products of a step: output buffer, session, peer name.
    fn finish_step(&self, table: &mut HandleTable, handle: RawHandle, step: Step) -> Outcome<SecContextOutput> {
        match step {
            Step::Continue(token) => {
                trace!(len = token.len(), "loopback continue");

                let mechanism = table.context(handle).ok().and_then(|context| context.exchange.mechanism());
                let output = (!token.is_empty()).then(|| table.insert(Object::Buffer(token)));

                Outcome::new(
                    CallStatus::continue_needed(),
                    SecContextOutput {
                        context: Some(handle),
                        output,
                        mechanism,
                        ..Default::default()
                    },
                )
            }
            Step::Complete { output, session } => {
                let source_name =
                    (!session.initiator).then(|| table.insert(Object::Name(LoopbackName::principal(session.client.clone()))));
                let output = output.map(|token| table.insert(Object::Buffer(token)));
                let value = SecContextOutput {
                    context: Some(handle),
                    output,
                    mechanism: Some(session.mechanism.clone()),
                    flags: session.flags,
                    lifetime: Some(session.lifetime()),
                    source_name,
                };

                if let Ok(context) = table.context(handle) {
                    context.exchange = Exchange::Open(session);
                }

                Outcome::complete(value)
            }
        }
    }
}

impl GssProvider for LoopbackProvider {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Loopback
    }

    fn supports_password_credentials(&self) -> bool {
        true
    }

    fn indicate_mechs(&self) -> Outcome<Vec<MechanismId>> {
        Outcome::complete(self.mechanisms.clone())
    }

    fn import_name(&self, name: &str, name_type: NameType) -> Outcome<Option<RawHandle>> {
        match LoopbackName::import(&self.realm, name, name_type) {
            Some(name) => Outcome::complete(Some(self.table().insert(Object::Name(name)))),
            None => Outcome::failed(CallStatus::routine(RoutineError::BadName, minor::INVALID_NAME)),
        }
    }

    fn display_name(&self, name: RawHandle) -> Outcome<Option<String>> {
        match self.table().name(name) {
            Ok(name) => Outcome::complete(Some(name.display.clone())),
            Err(rejection) => Outcome::failed(rejection.status()),
        }
    }

    fn release_name(&self, name: RawHandle) -> CallStatus {
        self.table()
            .release(name, |object| matches!(object, Object::Name(_)), RoutineError::BadName)
    }

    fn acquire_cred(&self, request: &AcquireCredRequest<'_>) -> Outcome<Option<AcquiredCredential>> {
        let mut table = self.table();

        match self.new_credential(&table, request) {
            Ok((credential, lifetime)) => {
                debug!(principal = ?credential.principal, usage = ?credential.usage, "acquired loopback credential");

                let handle = table.insert(Object::Credential(credential));

                Outcome::complete(Some(AcquiredCredential {
                    handle,
                    lifetime: Some(lifetime),
                }))
            }
            Err(rejection) => Outcome::failed(rejection.status()),
        }
    }

    fn acquire_cred_with_password(
        &self,
        name: RawHandle,
        password: &Secret<String>,
        request: &AcquireCredRequest<'_>,
    ) -> Outcome<Option<AcquiredCredential>> {
        let principal = {
            let table = self.table();

            table
                .name(name)
                .and_then(|name| {
                    name.resolve(&self.realm)
                        .ok_or_else(|| Rejection::new(RoutineError::NoCred, minor::UNKNOWN_PRINCIPAL))
                })
        };

        let verified = principal.and_then(|principal| self.realm.verify_password(&principal, password.as_ref()));
        if let Err(rejection) = verified {
            return Outcome::failed(rejection.status());
        }

        let request = AcquireCredRequest {
            name: Some(name),
            ..request.clone()
        };

        self.acquire_cred(&request)
    }

    fn release_cred(&self, credential: RawHandle) -> CallStatus {
        self.table().release(
            credential,
            |object| matches!(object, Object::Credential(_)),
            RoutineError::NoCred,
        )
    }

    fn init_sec_context(&self, call: InitSecContextCall<'_>) -> Outcome<SecContextOutput> {
        let mut table = self.table();

        let result = match call.context {
            None => self
                .start_initiator(&table, &call)
                .map(|(context, step)| (table.insert(Object::Context(Box::new(context))), step)),
            Some(handle) => table
                .context(handle)
                .and_then(|context| context.step_initiator(&self.realm, call.input.unwrap_or_default()))
                .map(|step| (handle, step)),
        };

        match result {
            Ok((handle, step)) => self.finish_step(&mut table, handle, step),
            Err(rejection) => {
                debug!(?rejection, "loopback init_sec_context rejected");

                Self::failed_step(&mut table, call.context, rejection)
            }
        }
    }

    fn accept_sec_context(&self, call: AcceptSecContextCall<'_>) -> Outcome<SecContextOutput> {
        let mut table = self.table();

        let result = match call.context {
            None => self
                .start_acceptor_context(&table, &call)
                .map(|(context, step)| (table.insert(Object::Context(Box::new(context))), step)),
            Some(handle) => table
                .context(handle)
                .and_then(|context| context.step_acceptor(&self.realm, call.input, call.channel_bindings))
                .map(|step| (handle, step)),
        };

        match result {
            Ok((handle, step)) => self.finish_step(&mut table, handle, step),
            Err(rejection) => {
                debug!(?rejection, "loopback accept_sec_context rejected");

                Self::failed_step(&mut table, call.context, rejection)
            }
        }
    }

    fn delete_sec_context(&self, context: RawHandle) -> CallStatus {
        self.table().release(
            context,
            |object| matches!(object, Object::Context(_)),
            RoutineError::NoContext,
        )
    }

    fn inquire_context(&self, context: RawHandle) -> Outcome<Option<ContextInfo>> {
        let mut table = self.table();

        let context = match table.context(context) {
            Ok(context) => context,
            Err(rejection) => return Outcome::failed(rejection.status()),
        };

        let info = match &context.exchange {
            Exchange::Open(session) => ContextInfo {
                source: Some(session.client.clone()),
                target: Some(session.target.clone()),
                mechanism: Some(session.mechanism.clone()),
                flags: session.flags,
                lifetime: Some(session.lifetime()),
                locally_initiated: session.initiator,
                open: true,
            },
            exchange => ContextInfo {
                mechanism: exchange.mechanism(),
                locally_initiated: context.initiator,
                ..Default::default()
            },
        };

        Outcome::complete(Some(info))
    }

    fn wrap(&self, context: RawHandle, confidentiality: bool, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        let mut table = self.table();

        match table
            .context(context)
            .and_then(LoopbackContext::session)
            .and_then(|session| session.wrap(confidentiality, message))
        {
            Ok(sealed) => Outcome::complete(sealed),
            Err(rejection) => Outcome::failed(rejection.status()),
        }
    }

    fn unwrap(&self, context: RawHandle, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        let mut table = self.table();

        match table
            .context(context)
            .and_then(LoopbackContext::session)
            .and_then(|session| session.unwrap(message))
        {
            Ok((sealed, supplementary)) => Outcome::new(CallStatus::supplementary(supplementary), sealed),
            Err(rejection) => Outcome::failed(rejection.status()),
        }
    }

    fn get_mic(&self, context: RawHandle, message: &[u8]) -> Outcome<Option<RawHandle>> {
        let mut table = self.table();

        let mic = table
            .context(context)
            .and_then(LoopbackContext::session)
            .and_then(|session| session.get_mic(message));

        match mic {
            Ok(mic) => Outcome::complete(Some(table.insert(Object::Buffer(mic)))),
            Err(rejection) => Outcome::failed(rejection.status()),
        }
    }

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> CallStatus {
        let mut table = self.table();

        match table
            .context(context)
            .and_then(LoopbackContext::session)
            .and_then(|session| session.verify_mic(message, mic))
        {
            Ok(supplementary) => CallStatus::supplementary(supplementary),
            Err(rejection) => rejection.status(),
        }
    }

    fn buffer_contents(&self, buffer: RawHandle) -> Outcome<Vec<u8>> {
        match self.table().objects.get(&buffer.as_raw()) {
            Some(Object::Buffer(data)) => Outcome::complete(data.clone()),
            _ => Outcome::failed(CallStatus::routine(RoutineError::Failure, minor::STALE_HANDLE)),
        }
    }

    fn release_buffer(&self, buffer: RawHandle) -> CallStatus {
        self.table().release(
            buffer,
            |object| matches!(object, Object::Buffer(_)),
            RoutineError::Failure,
        )
    }

    fn display_status(&self, code: u32, status_type: StatusType, _mechanism: Option<&MechanismId>) -> String {
        match status_type {
            StatusType::Gss => status::describe_major(code),
            StatusType::Mechanism => minor::describe(code)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("unknown loopback minor status {}", code)),
        }
    }
}
