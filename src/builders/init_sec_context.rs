use std::marker::PhantomData;
use std::sync::Arc;

use super::{Assigned, NotAssigned, ToAssign};
use crate::channel_bindings::ChannelBindings;
use crate::context::SecurityContext;
use crate::credentials::CredentialHandle;
use crate::gss::GssShared;
use crate::mechanism::MechanismId;
use crate::name::PrincipalName;
use crate::{ContextFlags, Result};

pub type EmptyInitializeSecurityContext<'a> = InitializeSecurityContext<'a, WithoutTargetName>;
pub type FilledInitializeSecurityContext<'a> = InitializeSecurityContext<'a, WithTargetName>;

/// Creates an initiator [`SecurityContext`]. Returned by
/// [`Gss::initialize_security_context`](crate::Gss::initialize_security_context).
///
/// # Requirements for execution
///
/// These methods are required to be called before calling the `build` method
/// * [`with_target_name`](struct.InitializeSecurityContext.html#method.with_target_name)
#[derive(Debug)]
pub struct InitializeSecurityContext<'a, TargetNameSet>
where
    TargetNameSet: ToAssign,
{
    pub(crate) shared: Arc<GssShared>,
    phantom_target_name_set: PhantomData<TargetNameSet>,

    pub credential: Option<&'a CredentialHandle>,
    pub target_name: Option<PrincipalName>,
    pub context_requirements: ContextFlags,
    pub mechanism: Option<MechanismId>,
    pub channel_bindings: Option<ChannelBindings>,
    /// Requested context lifetime in seconds.
    pub lifetime: Option<u32>,
}

impl<'a, TargetNameSet: ToAssign> InitializeSecurityContext<'a, TargetNameSet> {
    pub(crate) fn new(shared: Arc<GssShared>) -> Self {
        Self {
            shared,
            phantom_target_name_set: PhantomData,

            credential: None,
            target_name: None,
            context_requirements: ContextFlags::MUTUAL | ContextFlags::INTEGRITY | ContextFlags::CONFIDENTIALITY,
            mechanism: None,
            channel_bindings: None,
            lifetime: None,
        }
    }

    /// The principal to authenticate to. The name is consumed by the context.
    pub fn with_target_name(self, target_name: PrincipalName) -> InitializeSecurityContext<'a, WithTargetName> {
        InitializeSecurityContext {
            shared: self.shared,
            phantom_target_name_set: PhantomData,

            credential: self.credential,
            target_name: Some(target_name),
            context_requirements: self.context_requirements,
            mechanism: self.mechanism,
            channel_bindings: self.channel_bindings,
            lifetime: self.lifetime,
        }
    }

    /// Initiate credential. Without it the provider's default identity is used.
    pub fn with_credential(self, credential: &'a CredentialHandle) -> Self {
        Self {
            credential: Some(credential),
            ..self
        }
    }

    /// The features to request. Achieved flags are reported once the context is established.
    pub fn with_context_requirements(self, context_requirements: ContextFlags) -> Self {
        Self {
            context_requirements,
            ..self
        }
    }

    /// Overrides the mechanism. Defaults to the credential's mechanism.
    pub fn with_mechanism(self, mechanism: MechanismId) -> Self {
        Self {
            mechanism: Some(mechanism),
            ..self
        }
    }

    pub fn with_channel_bindings(self, channel_bindings: ChannelBindings) -> Self {
        Self {
            channel_bindings: Some(channel_bindings),
            ..self
        }
    }

    pub fn with_lifetime(self, lifetime: u32) -> Self {
        Self {
            lifetime: Some(lifetime),
            ..self
        }
    }
}

impl<'a> FilledInitializeSecurityContext<'a> {
    /// Creates the context in the `Idle` state. No provider call happens until the first
    /// [`SecurityContext::initiate`].
    pub fn build(self) -> Result<SecurityContext> {
        SecurityContext::new_initiator(self)
    }
}

/// Simulates the presence of the `target_name` value of the [`InitializeSecurityContext`] builder.
#[derive(Debug)]
pub struct WithTargetName;
impl ToAssign for WithTargetName {}
impl Assigned for WithTargetName {}

/// Simulates the absence of the `target_name` value of the [`InitializeSecurityContext`] builder.
#[derive(Debug)]
pub struct WithoutTargetName;
impl ToAssign for WithoutTargetName {}
impl NotAssigned for WithoutTargetName {}
