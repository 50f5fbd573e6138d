use std::sync::Arc;

use crate::channel_bindings::ChannelBindings;
use crate::context::SecurityContext;
use crate::credentials::CredentialHandle;
use crate::gss::GssShared;
use crate::{ContextFlags, Result};

/// Creates an acceptor [`SecurityContext`]. Returned by
/// [`Gss::accept_security_context`](crate::Gss::accept_security_context).
#[derive(Debug)]
pub struct AcceptSecurityContext<'a> {
    pub(crate) shared: Arc<GssShared>,

    pub credential: Option<&'a CredentialHandle>,
    /// Features the acceptor is willing to provide. The achieved set never exceeds it.
    pub context_requirements: ContextFlags,
    pub channel_bindings: Option<ChannelBindings>,
}

impl<'a> AcceptSecurityContext<'a> {
    pub(crate) fn new(shared: Arc<GssShared>) -> Self {
        Self {
            shared,
            credential: None,
            context_requirements: ContextFlags::acceptor_default(),
            channel_bindings: None,
        }
    }

    /// Accept credential. Without it any key the provider holds may accept.
    pub fn with_credential(self, credential: &'a CredentialHandle) -> Self {
        Self {
            credential: Some(credential),
            ..self
        }
    }

    pub fn with_context_requirements(self, context_requirements: ContextFlags) -> Self {
        Self {
            context_requirements,
            ..self
        }
    }

    pub fn with_channel_bindings(self, channel_bindings: ChannelBindings) -> Self {
        Self {
            channel_bindings: Some(channel_bindings),
            ..self
        }
    }

    pub fn build(self) -> Result<SecurityContext> {
        SecurityContext::new_acceptor(self)
    }
}
