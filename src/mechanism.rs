use std::fmt;

use cfg_if::cfg_if;
use oid::ObjectIdentifier;
use picky_asn1_x509::oids;

use crate::config::GssConfig;
use crate::provider::GssProvider;
use crate::status::{CallSite, StatusTranslator};
use crate::{Error, ErrorKind, Result};

/// Identifies a GSS-API mechanism.
///
/// Once a SPNEGO exchange completes, the negotiated mechanism is always the concrete one
/// ([`MechanismId::Kerberos`] or [`MechanismId::Ntlm`]).
#[derive(Debug, Clone, PartialEq)]
pub enum MechanismId {
    /// Kerberos V5, `1.2.840.113554.1.2.2` (the legacy Microsoft OID `1.2.840.48018.1.2.2` maps here too).
    Kerberos,
    /// SPNEGO / Negotiate, `1.3.6.1.5.5.2`.
    Spnego,
    /// NTLM, `1.3.6.1.4.1.311.2.2.10`.
    Ntlm,
    /// Any other mechanism reported by the provider.
    Other(ObjectIdentifier),
}

impl MechanismId {
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            MechanismId::Kerberos => oids::krb5(),
            MechanismId::Spnego => oids::spnego(),
            MechanismId::Ntlm => oids::ntlm_ssp(),
            MechanismId::Other(oid) => oid.clone(),
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Self {
        if *oid == oids::krb5() || *oid == oids::ms_krb5() {
            MechanismId::Kerberos
        } else if *oid == oids::spnego() {
            MechanismId::Spnego
        } else if *oid == oids::ntlm_ssp() {
            MechanismId::Ntlm
        } else {
            MechanismId::Other(oid.clone())
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MechanismId::Kerberos => "Kerberos",
            MechanismId::Spnego => "Negotiate",
            MechanismId::Ntlm => "NTLM",
            MechanismId::Other(_) => "Other",
        }
    }

    /// Whether this is a pseudo-mechanism that selects another one.
    pub fn is_negotiating(&self) -> bool {
        matches!(self, MechanismId::Spnego)
    }

    pub fn dotted(&self) -> String {
        (&self.oid()).into()
    }

    /// Parses a dotted OID. Arcs that have no encoding (`1.45`, `3.1`) are rejected.
    pub fn from_dotted(dotted: &str) -> Result<Self> {
        let oid = ObjectIdentifier::try_from(dotted)
            .map_err(|e| Error::new(ErrorKind::InvalidParameter, format!("invalid OID {}: {:?}", dotted, e)))?;

        Ok(Self::from_oid(&oid))
    }

    /// The DER contents octets of the OID (no tag, no length), the form `gss_OID_desc` uses.
    pub fn to_der_content(&self) -> Result<Vec<u8>> {
        Ok((&self.oid()).into())
    }

    /// Decodes DER contents octets. Only canonical encodings are accepted.
    pub fn from_der_content(content: &[u8]) -> Result<Self> {
        let oid = ObjectIdentifier::try_from(content)
            .map_err(|e| Error::new(ErrorKind::InvalidParameter, format!("invalid OID encoding: {:?}", e)))?;

        if Into::<Vec<u8>>::into(&oid) != content {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("non-canonical or truncated OID encoding: {:02x?}", content),
            ));
        }

        Ok(Self::from_oid(&oid))
    }
}

impl fmt::Display for MechanismId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.dotted())
    }
}

/// The GSS-API implementation behind the provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProviderFamily {
    MitKerberos,
    Heimdal,
    /// The macOS GSS framework.
    GssFramework,
    /// The in-process provider from [`crate::loopback`].
    Loopback,
}

impl ProviderFamily {
    /// The family of the system GSS-API library on this platform.
    pub fn native() -> Self {
        cfg_if! {
            if #[cfg(any(target_os = "macos", target_os = "ios"))] {
                ProviderFamily::GssFramework
            } else if #[cfg(any(target_os = "freebsd", target_os = "netbsd", target_os = "dragonfly"))] {
                ProviderFamily::Heimdal
            } else {
                ProviderFamily::MitKerberos
            }
        }
    }
}

/// What the provider can do, resolved once when the layer is initialized.
#[derive(Debug, Clone)]
pub struct Capabilities {
    family: ProviderFamily,
    mechanisms: Vec<MechanismId>,
    password_credentials: bool,
}

impl Capabilities {
    /// Queries the provider's mechanisms and removes the ones disabled by the configuration.
    #[instrument(level = "debug", ret, skip_all)]
    pub fn discover(provider: &dyn GssProvider, config: &GssConfig) -> Result<Self> {
        let outcome = provider.indicate_mechs();
        StatusTranslator::new(provider).translate(CallSite::Query, outcome.status.major, outcome.status.minor, None)?;

        let packages = config.package_list_config();

        let mut mechanisms: Vec<MechanismId> = outcome
            .value
            .into_iter()
            .filter(|mechanism| match mechanism {
                MechanismId::Kerberos => packages.kerberos,
                MechanismId::Ntlm => packages.ntlm,
                _ => true,
            })
            .collect();

        // SPNEGO on its own has nothing to negotiate
        let has_concrete = mechanisms
            .iter()
            .any(|mechanism| matches!(mechanism, MechanismId::Kerberos | MechanismId::Ntlm));
        if !has_concrete {
            mechanisms.retain(|mechanism| !mechanism.is_negotiating());
        }

        if !mechanisms
            .iter()
            .any(|mechanism| matches!(mechanism, MechanismId::Kerberos | MechanismId::Spnego | MechanismId::Ntlm))
        {
            return Err(Error::new(
                ErrorKind::MechanismUnsupported,
                "the GSS provider offers no usable mechanism",
            ));
        }

        let family = provider.family();

        Ok(Self {
            family,
            mechanisms,
            password_credentials: provider.supports_password_credentials(),
        })
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }

    pub fn mechanisms(&self) -> &[MechanismId] {
        &self.mechanisms
    }

    pub fn supports(&self, mechanism: &MechanismId) -> bool {
        self.mechanisms.contains(mechanism)
    }

    pub fn is_ntlm_available(&self) -> bool {
        self.supports(&MechanismId::Ntlm)
    }

    pub fn supports_password_credentials(&self) -> bool {
        self.password_credentials
    }

    pub fn ensure_supported(&self, mechanism: &MechanismId) -> Result<()> {
        if self.supports(mechanism) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::MechanismUnsupported,
                format!("{} is not available on this platform", mechanism),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackProvider, LoopbackRealm};

    #[test]
    fn well_known_oids() {
        assert_eq!(MechanismId::Kerberos.dotted(), "1.2.840.113554.1.2.2");
        assert_eq!(MechanismId::Spnego.dotted(), "1.3.6.1.5.5.2");
        assert_eq!(MechanismId::Ntlm.dotted(), "1.3.6.1.4.1.311.2.2.10");

        assert_eq!(MechanismId::from_oid(&oids::ms_krb5()), MechanismId::Kerberos);
    }

    #[test]
    fn der_content_of_kerberos_oid() {
        let expected = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02];

        assert_eq!(MechanismId::Kerberos.to_der_content().unwrap(), expected);
        assert_eq!(MechanismId::from_der_content(&expected).unwrap(), MechanismId::Kerberos);
    }

    #[test]
    fn der_content_of_unknown_oid() {
        let oid = ObjectIdentifier::try_from("1.3.6.1.5.2.5").unwrap();
        let mechanism = MechanismId::Other(oid);

        let content = mechanism.to_der_content().unwrap();

        assert_eq!(MechanismId::from_der_content(&content).unwrap(), mechanism);
    }

    #[test]
    fn unencodable_oid_is_rejected() {
        assert!(MechanismId::from_dotted("1.45").is_err());
        assert!(MechanismId::from_dotted("3.1.2").is_err());

        // the first octet 85 is arc 2.5, it never decodes as 1.45
        assert_eq!(MechanismId::from_der_content(&[85]).unwrap().dotted(), "2.5");
        assert_eq!(MechanismId::from_dotted("1.2.840.113554.1.2.2").unwrap(), MechanismId::Kerberos);
    }

    #[test]
    fn truncated_der_content() {
        assert!(MechanismId::from_der_content(&[0x2a, 0x86]).is_err());
        assert!(MechanismId::from_der_content(&[]).is_err());
    }

    #[test]
    fn discovery_applies_package_list() {
        let provider = LoopbackProvider::new(LoopbackRealm::new("EXAMPLE.COM"));
        let config = GssConfig {
            package_list: Some("!ntlm".to_owned()),
            ..Default::default()
        };

        let capabilities = Capabilities::discover(&provider, &config).unwrap();

        assert!(capabilities.supports(&MechanismId::Kerberos));
        assert!(capabilities.supports(&MechanismId::Spnego));
        assert!(!capabilities.is_ntlm_available());
        assert_eq!(capabilities.family(), ProviderFamily::Loopback);
    }

    #[test]
    fn discovery_fails_without_mechanisms() {
        let provider = LoopbackProvider::new(LoopbackRealm::new("EXAMPLE.COM"));
        let config = GssConfig {
            package_list: Some("!ntlm,!kerberos".to_owned()),
            ..Default::default()
        };

        let err = Capabilities::discover(&provider, &config).unwrap_err();

        assert_eq!(err.error_type, ErrorKind::MechanismUnsupported);
    }
}
