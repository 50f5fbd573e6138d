//! The GSS-API entry points the layer consumes.
//!
//! A provider speaks raw major/minor codes and opaque [`RawHandle`]s. Everything above this
//! trait goes through [`StatusTranslator`](crate::status::StatusTranslator) and the
//! [`HandleRegistry`](crate::registry::HandleRegistry); nothing else ever sees a raw handle.

use std::fmt;

use crate::buffer::SecurityBuffer;
use crate::channel_bindings::ChannelBindings;
use crate::credentials::CredentialUsage;
use crate::mechanism::{MechanismId, ProviderFamily};
use crate::name::NameType;
use crate::status::{RoutineError, SupplementaryInfo, GSS_S_COMPLETE};
use crate::{ContextFlags, Secret};

/// An opaque provider handle (a pointer for native providers, a table key for the loopback one).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawHandle(u64);

impl RawHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Which code `display_status` should describe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusType {
    /// A major status (`GSS_C_GSS_CODE`).
    Gss,
    /// A mechanism minor status (`GSS_C_MECH_CODE`).
    Mechanism,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub major: u32,
    pub minor: u32,
}

impl CallStatus {
    pub const COMPLETE: CallStatus = CallStatus {
        major: GSS_S_COMPLETE,
        minor: 0,
    };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn routine(error: RoutineError, minor: u32) -> Self {
        Self {
            major: error.major(),
            minor,
        }
    }

    pub fn supplementary(info: SupplementaryInfo) -> Self {
        Self {
            major: info.bits(),
            minor: 0,
        }
    }

    pub fn continue_needed() -> Self {
        Self::supplementary(SupplementaryInfo::CONTINUE_NEEDED)
    }
}

/// The status of a call together with the values it produced.
///
/// Providers may hand out resources even when the call fails (a context handle allocated by a
/// failed first `init_sec_context`, an error token); callers take ownership of them regardless
/// of the status.
#[derive(Debug)]
pub struct Outcome<T> {
    pub status: CallStatus,
    pub value: T,
}

impl<T> Outcome<T> {
    pub fn new(status: CallStatus, value: T) -> Self {
        Self { status, value }
    }

    pub fn complete(value: T) -> Self {
        Self {
            status: CallStatus::COMPLETE,
            value,
        }
    }
}

impl<T: Default> Outcome<T> {
    pub fn failed(status: CallStatus) -> Self {
        Self {
            status,
            value: T::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquireCredRequest<'a> {
    /// `None` for the default identity.
    pub name: Option<RawHandle>,
    pub mechanism: &'a MechanismId,
    /// Mechanisms SPNEGO may negotiate with this credential. Ignored for other mechanisms.
    pub negotiable: &'a [MechanismId],
    pub usage: CredentialUsage,
    /// Requested lifetime in seconds, `None` for the maximum.
    pub lifetime: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquiredCredential {
    pub handle: RawHandle,
    /// Remaining lifetime in seconds, `None` when indefinite or unknown.
    pub lifetime: Option<u32>,
}

#[derive(Debug)]
pub struct InitSecContextCall<'a> {
    pub credential: Option<RawHandle>,
    pub context: Option<RawHandle>,
    pub target: RawHandle,
    pub mechanism: &'a MechanismId,
    pub flags: ContextFlags,
    pub lifetime: Option<u32>,
    pub channel_bindings: Option<&'a ChannelBindings>,
    pub input: Option<&'a [u8]>,
}

#[derive(Debug)]
pub struct AcceptSecContextCall<'a> {
    pub credential: Option<RawHandle>,
    pub context: Option<RawHandle>,
    pub channel_bindings: Option<&'a ChannelBindings>,
    pub input: &'a [u8],
}

/// Values produced by `init_sec_context` and `accept_sec_context`.
#[derive(Debug, Default)]
pub struct SecContextOutput {
    pub context: Option<RawHandle>,
    /// Output token buffer, released through [`GssProvider::release_buffer`].
    pub output: Option<RawHandle>,
    pub mechanism: Option<MechanismId>,
    pub flags: ContextFlags,
    /// Remaining context lifetime in seconds.
    pub lifetime: Option<u32>,
    /// Name of the authenticated initiator (acceptor side only).
    pub source_name: Option<RawHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextInfo {
    pub source: Option<String>,
    pub target: Option<String>,
    pub mechanism: Option<MechanismId>,
    pub flags: ContextFlags,
    pub lifetime: Option<u32>,
    pub locally_initiated: bool,
    pub open: bool,
}

/// Standard GSS-API entry points.
///
/// `wrap` receives a `Token` buffer and a `Data` buffer holding the plaintext. It fills the
/// `Token` buffer with the per-message header and leaves the protected payload in `Data`.
/// `unwrap` receives the same pair and leaves the plaintext in `Data`. Both report whether
/// confidentiality was applied.
pub trait GssProvider: fmt::Debug + Send + Sync {
    fn family(&self) -> ProviderFamily;

    fn supports_password_credentials(&self) -> bool;

    fn indicate_mechs(&self) -> Outcome<Vec<MechanismId>>;

    fn import_name(&self, name: &str, name_type: NameType) -> Outcome<Option<RawHandle>>;

    fn display_name(&self, name: RawHandle) -> Outcome<Option<String>>;

    fn release_name(&self, name: RawHandle) -> CallStatus;

    fn acquire_cred(&self, request: &AcquireCredRequest<'_>) -> Outcome<Option<AcquiredCredential>>;

    fn acquire_cred_with_password(
        &self,
        name: RawHandle,
        password: &Secret<String>,
        request: &AcquireCredRequest<'_>,
    ) -> Outcome<Option<AcquiredCredential>>;

    fn release_cred(&self, credential: RawHandle) -> CallStatus;

    fn init_sec_context(&self, call: InitSecContextCall<'_>) -> Outcome<SecContextOutput>;

    fn accept_sec_context(&self, call: AcceptSecContextCall<'_>) -> Outcome<SecContextOutput>;

    fn delete_sec_context(&self, context: RawHandle) -> CallStatus;

    fn inquire_context(&self, context: RawHandle) -> Outcome<Option<ContextInfo>>;

    fn wrap(&self, context: RawHandle, confidentiality: bool, message: &mut [SecurityBuffer]) -> Outcome<bool>;

    fn unwrap(&self, context: RawHandle, message: &mut [SecurityBuffer]) -> Outcome<bool>;

    fn get_mic(&self, context: RawHandle, message: &[u8]) -> Outcome<Option<RawHandle>>;

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> CallStatus;

    fn buffer_contents(&self, buffer: RawHandle) -> Outcome<Vec<u8>>;

    fn release_buffer(&self, buffer: RawHandle) -> CallStatus;

    fn display_status(&self, code: u32, status_type: StatusType, mechanism: Option<&MechanismId>) -> String;
}
