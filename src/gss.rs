use std::sync::Arc;

use crate::builders::{AcceptSecurityContext, EmptyAcquireCredential, EmptyInitializeSecurityContext};
use crate::config::GssConfig;
use crate::mechanism::Capabilities;
use crate::name::{self, NameType, PrincipalName};
use crate::provider::GssProvider;
use crate::registry::{kind, HandleRegistry, RegistryStats};
use crate::status::{CallSite, StatusTranslator};
use crate::{Error, ErrorKind, Result};

#[derive(Debug)]
pub(crate) struct GssShared {
    pub(crate) provider: Arc<dyn GssProvider>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) capabilities: Capabilities,
    pub(crate) config: GssConfig,
}

impl GssShared {
    pub(crate) fn translator(&self) -> StatusTranslator<'_> {
        StatusTranslator::new(self.provider.as_ref())
    }
}

/// Entry point of the layer: a provider, the registry owning its handles, and the
/// capabilities discovered when it was created.
///
/// Cheap to clone; clones share everything.
#[derive(Debug, Clone)]
pub struct Gss {
    shared: Arc<GssShared>,
}

impl Gss {
    /// Probes the provider once. Fails with `MechanismUnsupported` when it offers no usable
    /// mechanism after the configured package list is applied.
    #[instrument(level = "debug", skip_all, fields(family = ?provider.family()))]
    pub fn new(provider: Arc<dyn GssProvider>, config: GssConfig) -> Result<Self> {
        let capabilities = Capabilities::discover(provider.as_ref(), &config)?;
        let registry = HandleRegistry::new(Arc::clone(&provider));

        debug!(mechanisms = ?capabilities.mechanisms(), "GSS provider initialized");

        Ok(Self {
            shared: Arc::new(GssShared {
                provider,
                registry,
                capabilities,
                config,
            }),
        })
    }

    /// Binds the system GSS-API library.
    #[cfg(all(unix, feature = "native"))]
    pub fn native(config: GssConfig) -> Result<Self> {
        Self::new(Arc::new(crate::native::NativeProvider::new()), config)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.capabilities
    }

    pub fn config(&self) -> &GssConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.shared.registry
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }

    pub fn status_translator(&self) -> StatusTranslator<'_> {
        self.shared.translator()
    }

    /// Imports a textual principal name into the provider.
    #[instrument(level = "debug", skip(self))]
    pub fn resolve_name(&self, text: &str, name_type: NameType) -> Result<PrincipalName> {
        let (canonical, name_type) = name::canonicalize(text, name_type)?;

        let outcome = self.shared.provider.import_name(&canonical, name_type);
        let handle = outcome.value.map(|raw| self.shared.registry.adopt::<kind::Name>(raw));

        self.shared
            .translator()
            .translate(CallSite::Name, outcome.status.major, outcome.status.minor, None)?;

        let handle = handle.ok_or_else(|| {
            Error::new(
                ErrorKind::InternalError,
                "the GSS provider reported success without a name handle",
            )
        })?;

        Ok(PrincipalName::new(canonical, name_type, handle))
    }

    /// Asks the provider how it displays a name, usually the fully qualified principal.
    pub fn display_name(&self, name: &PrincipalName) -> Result<String> {
        let outcome = self.shared.provider.display_name(name.raw()?);

        self.shared
            .translator()
            .translate(CallSite::Name, outcome.status.major, outcome.status.minor, None)?;

        outcome
            .value
            .ok_or_else(|| Error::new(ErrorKind::InternalError, "the GSS provider returned no display name"))
    }

    pub fn acquire_credential(&self) -> EmptyAcquireCredential {
        EmptyAcquireCredential::new(Arc::clone(&self.shared))
    }

    pub fn initialize_security_context(&self) -> EmptyInitializeSecurityContext<'_> {
        EmptyInitializeSecurityContext::new(Arc::clone(&self.shared))
    }

    pub fn accept_security_context(&self) -> AcceptSecurityContext<'_> {
        AcceptSecurityContext::new(Arc::clone(&self.shared))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::loopback::{LoopbackProvider, LoopbackRealm};
    use crate::registry::HandleKind;
    use crate::{ErrorKind, Gss, GssConfig, NameType};

    fn gss() -> Gss {
        let realm = LoopbackRealm::new("EXAMPLE.COM");
        Gss::new(Arc::new(LoopbackProvider::new(realm)), GssConfig::default()).unwrap()
    }

    #[test]
    fn resolved_name_is_released_once() {
        let gss = gss();

        let name = gss.resolve_name("HTTP/www.example.com", NameType::HostBasedService).unwrap();
        assert_eq!(name.text(), "HTTP@www.example.com");
        assert_eq!(gss.registry_stats().live(HandleKind::Name), 1);

        name.release().unwrap();
        assert_eq!(gss.registry_stats().live(HandleKind::Name), 0);
    }

    #[test]
    fn invalid_name_never_reaches_the_provider() {
        let gss = gss();

        let err = gss.resolve_name("HTTP/", NameType::HostBasedService).unwrap_err();

        assert_eq!(err.error_type, ErrorKind::NameResolution);
        assert_eq!(gss.registry_stats().allocated, 0);
    }

    #[test]
    fn display_name_qualifies_with_the_default_realm() {
        let gss = gss();
        let name = gss.resolve_name("alice", NameType::UserPrincipal).unwrap();

        assert_eq!(gss.display_name(&name).unwrap(), "alice@EXAMPLE.COM");
    }
}
