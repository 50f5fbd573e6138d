//! Translation of the provider's two-level (major/minor) status codes into [`SecurityStatus`]
//! or a typed [`Error`].
//!
//! The major status drives control flow. The minor status is mechanism specific and only ends
//! up in the error description and in [`GssStatus`].

use std::fmt;

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::mechanism::MechanismId;
use crate::provider::{GssProvider, StatusType};
use crate::{Error, ErrorKind, Result, SecurityStatus};

const CALLING_ERROR_OFFSET: u32 = 24;
const ROUTINE_ERROR_OFFSET: u32 = 16;
const CALLING_ERROR_MASK: u32 = 0xff << CALLING_ERROR_OFFSET;
const ROUTINE_ERROR_MASK: u32 = 0xff << ROUTINE_ERROR_OFFSET;
const SUPPLEMENTARY_INFO_MASK: u32 = 0xffff;

/// `GSS_S_COMPLETE`
pub const GSS_S_COMPLETE: u32 = 0;

/// GSS-API routine errors (RFC 2744, section 3.9.1), stored unshifted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RoutineError {
    BadMech = 1,
    BadName = 2,
    BadNameType = 3,
    BadBindings = 4,
    BadStatus = 5,
    BadSig = 6,
    NoCred = 7,
    NoContext = 8,
    DefectiveToken = 9,
    DefectiveCredential = 10,
    CredentialsExpired = 11,
    ContextExpired = 12,
    Failure = 13,
    BadQop = 14,
    Unauthorized = 15,
    Unavailable = 16,
    DuplicateElement = 17,
    NameNotMn = 18,
    BadMechAttr = 19,
}

impl RoutineError {
    /// The error placed in the routine-error field of a major status.
    pub fn major(self) -> u32 {
        self.to_u32().unwrap_or(RoutineError::Failure as u32) << ROUTINE_ERROR_OFFSET
    }

    fn description(self) -> &'static str {
        match self {
            RoutineError::BadMech => "an unsupported mechanism was requested",
            RoutineError::BadName => "an invalid name was supplied",
            RoutineError::BadNameType => "a supplied name was of an unsupported type",
            RoutineError::BadBindings => "incorrect channel bindings were supplied",
            RoutineError::BadStatus => "an invalid status code was supplied",
            RoutineError::BadSig => "a token had an invalid MIC",
            RoutineError::NoCred => "no credentials were supplied, or the credentials were unavailable or inaccessible",
            RoutineError::NoContext => "no context has been established",
            RoutineError::DefectiveToken => "a token was invalid",
            RoutineError::DefectiveCredential => "a credential was invalid",
            RoutineError::CredentialsExpired => "the referenced credentials have expired",
            RoutineError::ContextExpired => "the context has expired",
            RoutineError::Failure => "unspecified GSS failure",
            RoutineError::BadQop => "the quality-of-protection requested could not be provided",
            RoutineError::Unauthorized => "the operation is forbidden by local security policy",
            RoutineError::Unavailable => "the operation or option is unavailable",
            RoutineError::DuplicateElement => "the requested credential element already exists",
            RoutineError::NameNotMn => "the provided name was not a mechanism name",
            RoutineError::BadMechAttr => "an unsupported mechanism attribute was requested",
        }
    }
}

/// GSS-API calling errors: the provider could not read or write the call arguments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CallingError {
    InaccessibleRead = 1,
    InaccessibleWrite = 2,
    BadStructure = 3,
}

bitflags! {
    /// Supplementary information bits of a major status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SupplementaryInfo: u32 {
        const CONTINUE_NEEDED = 1;
        const DUPLICATE_TOKEN = 2;
        const OLD_TOKEN = 4;
        const UNSEQ_TOKEN = 8;
        const GAP_TOKEN = 16;
    }
}

impl SupplementaryInfo {
    /// Bits that report a replayed or out-of-order token.
    pub fn sequence_problems() -> Self {
        Self::DUPLICATE_TOKEN | Self::OLD_TOKEN | Self::UNSEQ_TOKEN | Self::GAP_TOKEN
    }
}

/// Raw GSS-API major status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MajorStatus(u32);

impl MajorStatus {
    pub const COMPLETE: MajorStatus = MajorStatus(GSS_S_COMPLETE);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn calling_error(self) -> Option<CallingError> {
        let code = (self.0 & CALLING_ERROR_MASK) >> CALLING_ERROR_OFFSET;

        if code == 0 {
            None
        } else {
            // unknown calling errors are still calling errors
            Some(CallingError::from_u32(code).unwrap_or(CallingError::BadStructure))
        }
    }

    pub fn routine_error(self) -> Option<RoutineError> {
        let code = (self.0 & ROUTINE_ERROR_MASK) >> ROUTINE_ERROR_OFFSET;

        if code == 0 {
            None
        } else {
            Some(RoutineError::from_u32(code).unwrap_or(RoutineError::Failure))
        }
    }

    pub fn supplementary(self) -> SupplementaryInfo {
        SupplementaryInfo::from_bits_truncate(self.0 & SUPPLEMENTARY_INFO_MASK)
    }

    /// `GSS_ERROR()`: a calling or routine error is present.
    pub fn is_error(self) -> bool {
        self.0 & (CALLING_ERROR_MASK | ROUTINE_ERROR_MASK) != 0
    }

    pub fn is_continue_needed(self) -> bool {
        !self.is_error() && self.supplementary().contains(SupplementaryInfo::CONTINUE_NEEDED)
    }
}

impl From<RoutineError> for MajorStatus {
    fn from(error: RoutineError) -> Self {
        Self(error.major())
    }
}

impl From<SupplementaryInfo> for MajorStatus {
    fn from(info: SupplementaryInfo) -> Self {
        Self(info.bits())
    }
}

impl fmt::Display for MajorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Raw, mechanism-specific minor status. Diagnostic only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MinorStatus(pub u32);

impl fmt::Display for MinorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The raw status behind a translated [`Error`].
#[derive(Debug, Clone, PartialEq)]
pub struct GssStatus {
    pub major: MajorStatus,
    pub minor: MinorStatus,
    pub mechanism: Option<MechanismId>,
}

impl fmt::Display for GssStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "major {}, minor {}", self.major, self.minor)?;

        if let Some(mechanism) = &self.mechanism {
            write!(f, ", mechanism {}", mechanism)?;
        }

        Ok(())
    }
}

/// What kind of provider call produced the status. Some routine errors mean different
/// things depending on the phase: a defective token while negotiating is a failed exchange,
/// while during the data phase it means the message was tampered with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallSite {
    Name,
    Credential,
    Negotiation,
    Protection,
    Release,
    Query,
}

/// Describes the routine part of a major status without asking the provider.
pub fn describe_major(major: u32) -> String {
    let status = MajorStatus::new(major);

    if let Some(calling) = status.calling_error() {
        return format!("calling error: {:?}", calling);
    }

    let mut parts = Vec::new();

    if let Some(routine) = status.routine_error() {
        parts.push(routine.description().to_owned());
    }

    let supplementary = status.supplementary();
    for (name, _) in supplementary.iter_names() {
        parts.push(name.to_lowercase().replace('_', " "));
    }

    if parts.is_empty() {
        "the operation completed successfully".to_owned()
    } else {
        parts.join(", ")
    }
}

/// Maps provider statuses to the crate's error taxonomy.
pub struct StatusTranslator<'a> {
    provider: &'a dyn GssProvider,
}

impl<'a> StatusTranslator<'a> {
    pub fn new(provider: &'a dyn GssProvider) -> Self {
        Self { provider }
    }

    /// Translates the status of one provider call.
    ///
    /// `CONTINUE_NEEDED` without a calling or routine error is never an error.
    pub fn translate(
        &self,
        site: CallSite,
        major: u32,
        minor: u32,
        mechanism: Option<&MechanismId>,
    ) -> Result<SecurityStatus> {
        let status = MajorStatus::new(major);

        if let Some(kind) = error_kind(site, status) {
            let description = self.describe(status, minor, mechanism);
            debug!(?site, major = %status, minor, ?kind, "provider call failed: {}", description);

            return Err(Error::with_status(
                kind,
                description,
                GssStatus {
                    major: status,
                    minor: MinorStatus(minor),
                    mechanism: mechanism.cloned(),
                },
            ));
        }

        if status.is_continue_needed() {
            Ok(SecurityStatus::ContinueNeeded)
        } else {
            Ok(SecurityStatus::Ok)
        }
    }

    /// Human-readable text for both codes, as reported by the provider.
    pub fn describe(&self, major: MajorStatus, minor: u32, mechanism: Option<&MechanismId>) -> String {
        let major_text = self.provider.display_status(major.raw(), StatusType::Gss, None);

        if minor == 0 {
            major_text
        } else {
            let minor_text = self.provider.display_status(minor, StatusType::Mechanism, mechanism);

            format!("{}: {}", major_text, minor_text)
        }
    }
}

fn error_kind(site: CallSite, status: MajorStatus) -> Option<ErrorKind> {
    if status.calling_error().is_some() {
        return Some(ErrorKind::InternalError);
    }

    if let Some(routine) = status.routine_error() {
        return Some(match routine {
            RoutineError::BadMech | RoutineError::BadMechAttr | RoutineError::Unavailable => {
                ErrorKind::MechanismUnsupported
            }
            RoutineError::BadName | RoutineError::BadNameType | RoutineError::NameNotMn => ErrorKind::NameResolution,
            RoutineError::NoCred | RoutineError::DefectiveCredential => ErrorKind::CredentialUnavailable,
            RoutineError::CredentialsExpired => ErrorKind::CredentialsExpired,
            RoutineError::ContextExpired => ErrorKind::ContextExpired,
            RoutineError::NoContext => ErrorKind::ContextNotEstablished,
            RoutineError::BadSig | RoutineError::DefectiveToken => match site {
                CallSite::Protection => ErrorKind::IntegrityViolation,
                _ => ErrorKind::NegotiationFailed,
            },
            RoutineError::BadBindings => ErrorKind::NegotiationFailed,
            RoutineError::BadQop | RoutineError::BadStatus => ErrorKind::InvalidParameter,
            RoutineError::Failure | RoutineError::Unauthorized | RoutineError::DuplicateElement => match site {
                CallSite::Name => ErrorKind::NameResolution,
                CallSite::Credential => ErrorKind::CredentialUnavailable,
                CallSite::Negotiation => ErrorKind::NegotiationFailed,
                CallSite::Protection | CallSite::Release | CallSite::Query => ErrorKind::InternalError,
            },
        });
    }

    let supplementary = status.supplementary();
    if supplementary.intersects(SupplementaryInfo::sequence_problems()) {
        match site {
            CallSite::Protection => return Some(ErrorKind::SequenceViolation),
            // a replayed initial token is an attack on the exchange itself
            CallSite::Negotiation if supplementary.contains(SupplementaryInfo::DUPLICATE_TOKEN) => {
                return Some(ErrorKind::NegotiationFailed)
            }
            _ => {}
        }
    }

    None
}
