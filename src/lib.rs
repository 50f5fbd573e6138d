//! `gss-negotiate` drives GSS-API security context negotiation (Kerberos, SPNEGO and the
//! NTLM fallback offered through SPNEGO) on top of an existing GSS-API provider.
//!
//! The crate never talks to the network. The caller owns the transport: every negotiation
//! round takes the peer's token as an opaque byte buffer and hands back the token to send.
//! Once a [`SecurityContext`] is established it protects application data with
//! [`SecurityContext::wrap`] and [`SecurityContext::unwrap`].
//!
//! Opaque provider resources (names, credentials, contexts and output buffers) are owned by a
//! [`HandleRegistry`](registry::HandleRegistry) which releases each of them exactly once.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use gss_negotiate::loopback::{LoopbackProvider, LoopbackRealm};
//! use gss_negotiate::{ContextFlags, CredentialUsage, Gss, GssConfig, MechanismId, NameType, SecurityStatus};
//!
//! let realm = LoopbackRealm::new("EXAMPLE.COM");
//! realm.add_principal("alice@EXAMPLE.COM", "alice-password").unwrap();
//! realm.add_principal("service@EXAMPLE.COM", "service-password").unwrap();
//!
//! let gss = Gss::new(Arc::new(LoopbackProvider::new(realm)), GssConfig::default()).unwrap();
//!
//! let alice = gss.resolve_name("alice@EXAMPLE.COM", NameType::UserPrincipal).unwrap();
//! let client_credential = gss
//!     .acquire_credential()
//!     .with_credential_use(CredentialUsage::Initiate)
//!     .with_principal(alice)
//!     .with_mechanism(MechanismId::Kerberos)
//!     .execute()
//!     .unwrap()
//!     .credential_handle;
//!
//! let service = gss.resolve_name("service@EXAMPLE.COM", NameType::HostBasedService).unwrap();
//! let server_credential = gss
//!     .acquire_credential()
//!     .with_credential_use(CredentialUsage::Accept)
//!     .with_principal(service)
//!     .with_mechanism(MechanismId::Kerberos)
//!     .execute()
//!     .unwrap()
//!     .credential_handle;
//!
//! let target = gss.resolve_name("service@EXAMPLE.COM", NameType::HostBasedService).unwrap();
//! let mut client = gss
//!     .initialize_security_context()
//!     .with_credential(&client_credential)
//!     .with_target_name(target)
//!     .with_context_requirements(ContextFlags::MUTUAL | ContextFlags::CONFIDENTIALITY | ContextFlags::INTEGRITY)
//!     .build()
//!     .unwrap();
//! let mut server = gss.accept_security_context().with_credential(&server_credential).build().unwrap();
//!
//! let first = client.initiate(None).unwrap();
//! assert_eq!(first.status, SecurityStatus::ContinueNeeded);
//!
//! let reply = server.accept(first.output.as_deref().unwrap_or_default()).unwrap();
//! assert_eq!(reply.status, SecurityStatus::Ok);
//!
//! let last = client.initiate(reply.output.as_deref()).unwrap();
//! assert_eq!(last.status, SecurityStatus::Ok);
//!
//! let message = client.wrap(b"hello", true).unwrap();
//! let unwrapped = server.unwrap(&message).unwrap();
//! assert_eq!(unwrapped.plaintext, b"hello");
//! ```

#[macro_use]
extern crate tracing;

pub mod buffer;
pub mod builders;
pub mod channel_bindings;
pub mod config;
pub mod context;
pub mod credentials;
mod gss;
pub mod loopback;
pub mod mechanism;
pub mod name;
#[cfg(all(unix, feature = "native"))]
pub mod native;
mod protection;
pub mod provider;
pub mod registry;
mod secret;
pub mod status;

use std::{error, fmt, io, result};

use bitflags::bitflags;

pub use self::buffer::{BufferType, ProtectedMessage, SecurityBuffer, Token};
pub use self::builders::{
    AcceptSecurityContext, AcquireCredentialResult, EmptyAcquireCredential, EmptyInitializeSecurityContext,
    FilledAcquireCredential, FilledInitializeSecurityContext,
};
pub use self::channel_bindings::ChannelBindings;
pub use self::config::{EmptyContinuePolicies, EmptyContinuePolicy, GssConfig, MechanismKind};
pub use self::context::{ContextRole, NegotiationState, NegotiationStep, SecurityContext};
pub use self::credentials::{CredentialHandle, CredentialUsage};
pub use self::gss::Gss;
pub use self::mechanism::{Capabilities, MechanismId, ProviderFamily};
pub use self::name::{NameType, PrincipalName};
pub use self::protection::UnwrappedMessage;
pub use self::provider::GssProvider;
pub use self::registry::RegistryStats;
pub use self::secret::Secret;
pub use self::status::{GssStatus, MajorStatus, MinorStatus};

/// Representation of a GSS-related result.
pub type Result<T> = result::Result<T, Error>;

/// Outcome of a successful provider call: either the operation is complete, or the peer
/// has to answer with another token first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityStatus {
    Ok = 0,
    ContinueNeeded = 1,
}

bitflags! {
    /// Context attributes, used both to request features when a context is created and to
    /// report the features achieved once it is established.
    ///
    /// The bit values follow the GSS-API `GSS_C_*_FLAG` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        const DELEGATION = 1;
        const MUTUAL = 2;
        const REPLAY_DETECT = 4;
        const SEQUENCE_DETECT = 8;
        const CONFIDENTIALITY = 16;
        const INTEGRITY = 32;
        const ANONYMOUS = 64;
        const PROTECTION_READY = 128;
        const TRANSFERABLE = 256;
    }
}

impl ContextFlags {
    /// What an acceptor asks for unless told otherwise.
    pub fn acceptor_default() -> Self {
        ContextFlags::MUTUAL
            | ContextFlags::CONFIDENTIALITY
            | ContextFlags::INTEGRITY
            | ContextFlags::REPLAY_DETECT
            | ContextFlags::SEQUENCE_DETECT
    }
}

/// The kind of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The text cannot be parsed or imported as a principal name.
    NameResolution,
    /// No usable identity (credential) is available for the request.
    CredentialUnavailable,
    /// The mechanism (or the requested operation for it) is not available on this platform.
    MechanismUnsupported,
    /// The peer's token was rejected or the exchange could not be completed.
    NegotiationFailed,
    /// The credential lifetime ran out.
    CredentialsExpired,
    /// The context, or the credential backing it, is past its lifetime.
    ContextExpired,
    /// The operation needs an established context.
    ContextNotEstablished,
    /// Confidentiality was requested but the context does not provide it.
    ConfidentialityUnavailable,
    /// The protected message or MIC was tampered with or is malformed.
    IntegrityViolation,
    /// The protected message is a replay or arrived out of order.
    SequenceViolation,
    /// A handle was released twice or does not resolve any more.
    InvalidHandle,
    InvalidParameter,
    /// The operation is not allowed in the current context state.
    OutOfSequence,
    InvalidToken,
    InternalError,
}

impl ErrorKind {
    /// Whether retrying the operation with a freshly acquired credential may succeed.
    pub fn is_credential_refresh_candidate(self) -> bool {
        matches!(
            self,
            ErrorKind::CredentialsExpired | ErrorKind::ContextExpired | ErrorKind::CredentialUnavailable
        )
    }
}

/// Holds the [`ErrorKind`], a description and, when the failure was reported by the
/// provider, the raw GSS status it was translated from.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub error_type: ErrorKind,
    pub description: String,
    pub status: Option<GssStatus>,
    /// Error token the provider produced with a failed negotiation round. It is meant for the
    /// peer.
    pub output_token: Option<Vec<u8>>,
}

impl Error {
    /// Allows to fill a new error easily, supplying it with a coherent description.
    pub fn new(error_type: ErrorKind, description: impl ToString) -> Self {
        Self {
            error_type,
            description: description.to_string(),
            status: None,
            output_token: None,
        }
    }

    pub fn with_status(error_type: ErrorKind, description: impl ToString, status: GssStatus) -> Self {
        Self {
            error_type,
            description: description.to_string(),
            status: Some(status),
            output_token: None,
        }
    }

    pub fn with_output_token(mut self, token: Vec<u8>) -> Self {
        self.output_token = Some(token);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error_type
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.description)?;

        if let Some(status) = &self.status {
            write!(f, " ({})", status)?;
        }

        Ok(())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::InvalidToken, format!("IO error: {:?}", err))
    }
}

impl From<picky_krb::crypto::KerberosCryptoError> for Error {
    fn from(err: picky_krb::crypto::KerberosCryptoError) -> Self {
        Self::new(ErrorKind::InternalError, format!("crypto error: {:?}", err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::other(err.to_string())
    }
}
