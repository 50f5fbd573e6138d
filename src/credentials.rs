use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::builders::{AcquireCredentialResult, FilledAcquireCredential};
use crate::gss::GssShared;
use crate::mechanism::MechanismId;
use crate::name::PrincipalName;
use crate::provider::{AcquireCredRequest, AcquiredCredential, Outcome, RawHandle};
use crate::registry::{kind, HandleKind, Owned};
use crate::status::{CallSite, StatusTranslator};
use crate::{Error, ErrorKind, Result};

/// What a credential is used for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CredentialUsage {
    /// Client side: the credential initiates contexts.
    Initiate,
    /// Server side: the credential accepts contexts.
    Accept,
    Both,
}

impl CredentialUsage {
    pub fn can_initiate(self) -> bool {
        matches!(self, CredentialUsage::Initiate | CredentialUsage::Both)
    }

    pub fn can_accept(self) -> bool {
        matches!(self, CredentialUsage::Accept | CredentialUsage::Both)
    }
}

struct CredentialInner {
    handle: Mutex<Option<Owned<kind::Credential>>>,
    // released together with the credential
    principal: Mutex<Option<PrincipalName>>,
    principal_text: Option<String>,
    mechanism: MechanismId,
    usage: CredentialUsage,
    expiry: Option<OffsetDateTime>,
    shared: Arc<GssShared>,
}

/// "My identity to initiate" or "my identity to accept", scoped to a mechanism.
///
/// Clones share the same provider credential. It is released once, either explicitly with
/// [`CredentialHandle::release`] or when the last clone is dropped.
#[derive(Clone)]
pub struct CredentialHandle {
    inner: Arc<CredentialInner>,
}

impl CredentialHandle {
    pub fn mechanism(&self) -> &MechanismId {
        &self.inner.mechanism
    }

    pub fn usage(&self) -> CredentialUsage {
        self.inner.usage
    }

    /// The principal the credential was acquired for, `None` for the default identity.
    pub fn principal(&self) -> Option<&str> {
        self.inner.principal_text.as_deref()
    }

    pub fn expiry(&self) -> Option<OffsetDateTime> {
        self.inner.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.inner
            .expiry
            .map(|expiry| expiry <= OffsetDateTime::now_utc())
            .unwrap_or(false)
    }

    pub fn is_released(&self) -> bool {
        self.handle_guard().is_none()
    }

    /// Releases the provider credential for every clone. Releasing twice is an error.
    #[instrument(level = "debug", skip_all, fields(mechanism = %self.inner.mechanism))]
    pub fn release(&self) -> Result<()> {
        let handle = self.handle_guard().take();

        match handle {
            Some(handle) => {
                let name = self.name_guard().take();

                let released = handle.release();
                if let Some(name) = name {
                    name.release()?;
                }

                released
            }
            None => Err(self.inner.shared.registry.report_double_release(HandleKind::Credential)),
        }
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        match self.handle_guard().as_ref() {
            Some(handle) => handle.raw(),
            None => Err(Error::new(ErrorKind::InvalidHandle, "the credential handle was released")),
        }
    }

    fn handle_guard(&self) -> MutexGuard<'_, Option<Owned<kind::Credential>>> {
        self.inner.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_guard(&self) -> MutexGuard<'_, Option<PrincipalName>> {
        self.inner.principal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("principal", &self.inner.principal_text)
            .field("mechanism", &self.inner.mechanism)
            .field("usage", &self.inner.usage)
            .field("expiry", &self.inner.expiry)
            .finish()
    }
}

#[instrument(level = "debug", skip_all, fields(
    mechanism = %builder.mechanism,
    usage = ?builder.credential_use,
    principal = builder.principal.as_ref().map(|p| p.text()),
))]
pub(crate) fn acquire(shared: &Arc<GssShared>, builder: FilledAcquireCredential) -> Result<AcquireCredentialResult> {
    let FilledAcquireCredential {
        credential_use: usage,
        principal,
        mechanism,
        expiry_hint,
        password,
        ..
    } = builder;

    shared.capabilities.ensure_supported(&mechanism)?;

    let now = OffsetDateTime::now_utc();
    let lifetime = match expiry_hint {
        Some(hint) if hint > now => {
            let seconds = (hint - now).whole_seconds().clamp(1, i64::from(u32::MAX)) as u32;
            Some(shared.config.credential_lifetime.map_or(seconds, |configured| configured.min(seconds)))
        }
        _ => shared.config.credential_lifetime,
    };

    if matches!(expiry_hint, Some(hint) if hint <= now) {
        warn!("credential expiry hint is already in the past");
    }

    let negotiable = shared.config.negotiable_mechanisms(shared.capabilities.mechanisms());
    let name = principal.as_ref().map(PrincipalName::raw).transpose()?;
    let request = AcquireCredRequest {
        name,
        mechanism: &mechanism,
        negotiable: &negotiable,
        usage,
        lifetime,
    };

    let outcome = match &password {
        Some(password) => {
            let name = name.ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidParameter,
                    "password credentials need an explicit principal name",
                )
            })?;
            if !usage.can_initiate() || usage.can_accept() {
                return Err(Error::new(
                    ErrorKind::InvalidParameter,
                    "password credentials can only be used to initiate",
                ));
            }
            if !shared.capabilities.supports_password_credentials() {
                return Err(Error::new(
                    ErrorKind::MechanismUnsupported,
                    "the GSS provider cannot acquire credentials from a password",
                ));
            }

            shared.provider.acquire_cred_with_password(name, password, &request)
        }
        None => shared.provider.acquire_cred(&request),
    };
    // the password is wiped as soon as the provider has seen it
    drop(password);

    let Outcome { status, value } = outcome;
    let owned = value.map(|AcquiredCredential { handle, lifetime }| (shared.registry.adopt::<kind::Credential>(handle), lifetime));

    StatusTranslator::new(shared.provider.as_ref()).translate(
        CallSite::Credential,
        status.major,
        status.minor,
        Some(&mechanism),
    )?;

    let (handle, provider_lifetime) = owned.ok_or_else(|| {
        Error::new(
            ErrorKind::InternalError,
            "the GSS provider reported success without a credential handle",
        )
    })?;

    let provider_expiry = provider_lifetime.map(|seconds| now + Duration::seconds(i64::from(seconds)));
    let expiry = match (expiry_hint, provider_expiry) {
        (Some(hint), Some(provider)) => Some(hint.min(provider)),
        (hint, provider) => hint.or(provider),
    };

    debug!(?expiry, "acquired credential");

    let principal_text = principal.as_ref().map(|p| p.text().to_owned());
    let credential_handle = CredentialHandle {
        inner: Arc::new(CredentialInner {
            handle: Mutex::new(Some(handle)),
            principal: Mutex::new(principal),
            principal_text,
            mechanism,
            usage,
            expiry,
            shared: Arc::clone(shared),
        }),
    };

    Ok(AcquireCredentialResult {
        credential_handle,
        expiry,
    })
}
