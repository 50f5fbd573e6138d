use std::marker::PhantomData;
use std::sync::Arc;

use time::OffsetDateTime;

use super::{Assigned, NotAssigned, ToAssign};
use crate::credentials::{self, CredentialHandle, CredentialUsage};
use crate::gss::GssShared;
use crate::mechanism::MechanismId;
use crate::name::PrincipalName;
use crate::{Result, Secret};

pub type EmptyAcquireCredential = AcquireCredential<WithoutCredentialUse>;
pub type FilledAcquireCredential = AcquireCredential<WithCredentialUse>;

/// Contains data returned by calling the `execute` method of the [`AcquireCredential`] builder.
#[derive(Debug, Clone)]
pub struct AcquireCredentialResult {
    pub credential_handle: CredentialHandle,
    pub expiry: Option<OffsetDateTime>,
}

/// Acquires a credential handle. Returned by [`Gss::acquire_credential`](crate::Gss::acquire_credential).
///
/// # Requirements for execution
///
/// These methods are required to be called before calling the `execute` method
/// * [`with_credential_use`](struct.AcquireCredential.html#method.with_credential_use)
#[derive(Debug)]
pub struct AcquireCredential<CredentialUseSet>
where
    CredentialUseSet: ToAssign,
{
    pub(crate) shared: Arc<GssShared>,
    phantom_cred_use_set: PhantomData<CredentialUseSet>,

    pub credential_use: CredentialUsage,
    pub principal: Option<PrincipalName>,
    pub mechanism: MechanismId,
    pub expiry_hint: Option<OffsetDateTime>,
    pub password: Option<Secret<String>>,
}

impl<CredentialUseSet: ToAssign> AcquireCredential<CredentialUseSet> {
    pub(crate) fn new(shared: Arc<GssShared>) -> Self {
        let mechanism = shared.config.default_mechanism.into();

        Self {
            shared,
            phantom_cred_use_set: PhantomData,

            credential_use: CredentialUsage::Initiate,
            principal: None,
            mechanism,
            expiry_hint: None,
            password: None,
        }
    }

    /// Specifies whether the credential initiates contexts, accepts them, or both.
    pub fn with_credential_use(self, credential_use: CredentialUsage) -> AcquireCredential<WithCredentialUse> {
        AcquireCredential {
            shared: self.shared,
            phantom_cred_use_set: PhantomData,

            credential_use,
            principal: self.principal,
            mechanism: self.mechanism,
            expiry_hint: self.expiry_hint,
            password: self.password,
        }
    }

    /// The identity to acquire. Without it the provider's default identity is used.
    ///
    /// The name is consumed: it is released together with the credential.
    pub fn with_principal(self, principal: PrincipalName) -> Self {
        Self {
            principal: Some(principal),
            ..self
        }
    }

    /// Scopes the credential to a mechanism. Defaults to the configured default mechanism.
    pub fn with_mechanism(self, mechanism: MechanismId) -> Self {
        Self { mechanism, ..self }
    }

    /// Advisory expiry. A hint in the past still yields a credential, but contexts created
    /// from it fail with `ContextExpired`.
    pub fn with_expiry_hint(self, expiry_hint: OffsetDateTime) -> Self {
        Self {
            expiry_hint: Some(expiry_hint),
            ..self
        }
    }

    /// Acquires the credential from an explicit password instead of the credential cache.
    /// Only valid for initiate credentials with an explicit principal.
    pub fn with_password(self, password: Secret<String>) -> Self {
        Self {
            password: Some(password),
            ..self
        }
    }
}

impl FilledAcquireCredential {
    /// Executes the credential acquisition.
    pub fn execute(self) -> Result<AcquireCredentialResult> {
        let shared = Arc::clone(&self.shared);

        credentials::acquire(&shared, self)
    }
}

/// Simulates the presence of the `credential_use` value of the [`AcquireCredential`] builder.
#[derive(Debug)]
pub struct WithCredentialUse;
impl ToAssign for WithCredentialUse {}
impl Assigned for WithCredentialUse {}

/// Simulates the absence of the `credential_use` value of the [`AcquireCredential`] builder.
#[derive(Debug)]
pub struct WithoutCredentialUse;
impl ToAssign for WithoutCredentialUse {}
impl NotAssigned for WithoutCredentialUse {}
