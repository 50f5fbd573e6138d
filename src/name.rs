use std::fmt;

use crate::provider::RawHandle;
use crate::registry::{kind, Owned};
use crate::{Error, ErrorKind, Result};

/// How the text of a [`PrincipalName`] is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NameType {
    /// `user` or `user@REALM` (`GSS_C_NT_USER_NAME`).
    UserPrincipal,
    /// `service@host` (`GSS_C_NT_HOSTBASED_SERVICE`). `service/host` is accepted as well.
    HostBasedService,
    /// `primary/instance@REALM` (`GSS_KRB5_NT_PRINCIPAL_NAME`).
    KerberosPrincipal,
}

/// A principal name imported into the provider.
///
/// Owned exclusively until it is handed to credential acquisition or context creation,
/// which take it by value.
#[derive(Debug)]
pub struct PrincipalName {
    text: String,
    name_type: NameType,
    handle: Owned<kind::Name>,
}

impl PrincipalName {
    pub(crate) fn new(text: String, name_type: NameType, handle: Owned<kind::Name>) -> Self {
        Self {
            text,
            name_type,
            handle,
        }
    }

    /// The text the name was imported from, after canonicalization.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn name_type(&self) -> NameType {
        self.name_type
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.raw()
    }

    /// Whether the host part is an IP address rather than a DNS name.
    pub fn is_ip_address(&self) -> bool {
        host_part(&self.text)
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').parse::<std::net::IpAddr>().is_ok())
            .unwrap_or(false)
    }

    pub fn release(self) -> Result<()> {
        self.handle.release()
    }
}

impl fmt::Display for PrincipalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn host_part(text: &str) -> Option<&str> {
    match text.split_once('/') {
        // service/host@REALM
        Some((_, rest)) => Some(rest.split('@').next().unwrap_or(rest)),
        // service@host
        None => text.split_once('@').map(|(_, host)| host),
    }
}

/// Validates `text` under `name_type` and returns the form handed to the provider, along
/// with the type it should be imported as.
pub(crate) fn canonicalize(text: &str, name_type: NameType) -> Result<(String, NameType)> {
    if text.is_empty() {
        return Err(name_error(text, "the name is empty"));
    }
    if text.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(name_error(text, "the name contains whitespace or control characters"));
    }
    if text.matches('@').count() > 1 {
        return Err(name_error(text, "the name contains more than one realm separator"));
    }

    match name_type {
        NameType::UserPrincipal => {
            if let Some((user, realm)) = text.split_once('@') {
                if user.is_empty() {
                    return Err(name_error(text, "the user part is empty"));
                }
                if realm.is_empty() {
                    return Err(name_error(text, "the realm part is empty"));
                }
            }

            Ok((text.to_owned(), NameType::UserPrincipal))
        }
        NameType::HostBasedService => {
            if let Some((spn, realm)) = text.split_once('@').filter(|(spn, _)| spn.contains('/')) {
                // HTTP/host@REALM is a Kerberos principal
                if realm.is_empty() {
                    return Err(name_error(text, "the realm part is empty"));
                }
                check_spn(text, spn)?;

                return Ok((text.to_owned(), NameType::KerberosPrincipal));
            }

            let (service, host) = match text.split_once('/') {
                Some((service, host)) => (service, host),
                None => text.split_once('@').unwrap_or((text, "")),
            };

            if service.is_empty() {
                return Err(name_error(text, "the service part is empty"));
            }
            if host.is_empty() && (text.contains('@') || text.contains('/')) {
                return Err(name_error(text, "the host part is empty"));
            }
            if host.contains('/') {
                return Err(name_error(text, "the host part contains a '/'"));
            }

            if host.is_empty() {
                Ok((service.to_owned(), NameType::HostBasedService))
            } else {
                Ok((format!("{}@{}", service, host), NameType::HostBasedService))
            }
        }
        NameType::KerberosPrincipal => {
            let principal = match text.split_once('@') {
                Some((principal, realm)) => {
                    if realm.is_empty() {
                        return Err(name_error(text, "the realm part is empty"));
                    }
                    principal
                }
                None => text,
            };

            if principal.split('/').any(str::is_empty) {
                return Err(name_error(text, "the principal has an empty component"));
            }

            Ok((text.to_owned(), NameType::KerberosPrincipal))
        }
    }
}

fn check_spn(text: &str, spn: &str) -> Result<()> {
    match spn.split_once('/') {
        Some((service, host)) if !service.is_empty() && !host.is_empty() => Ok(()),
        _ => Err(name_error(text, "the service principal name has an empty service or host part")),
    }
}

fn name_error(text: &str, reason: &str) -> Error {
    Error::new(ErrorKind::NameResolution, format!("invalid name {:?}: {}", text, reason))
}
