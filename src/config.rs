use std::env;

use serde::{Deserialize, Serialize};

use crate::mechanism::MechanismId;

/// Comma-separated list of packages to enable or disable (`"kerberos,!ntlm"`).
pub const PACKAGE_LIST_ENV: &str = "GSS_NEGOTIATE_PACKAGE_LIST";
/// `true`/`false` (or `1`/`0`): whether SPNEGO may fall back to NTLM.
pub const NTLM_FALLBACK_ENV: &str = "GSS_NEGOTIATE_NTLM_FALLBACK";

/// Mechanism selection as it appears in configuration files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MechanismKind {
    Kerberos,
    #[default]
    Negotiate,
    Ntlm,
}

impl From<MechanismKind> for MechanismId {
    fn from(kind: MechanismKind) -> Self {
        match kind {
            MechanismKind::Kerberos => MechanismId::Kerberos,
            MechanismKind::Negotiate => MechanismId::Spnego,
            MechanismKind::Ntlm => MechanismId::Ntlm,
        }
    }
}

/// What to do when the provider asks for another round but produced no token to send.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyContinuePolicy {
    /// Report `ContinueNeeded` without an output token and wait for the peer.
    AwaitPeer,
    /// Treat it as a broken exchange and fail the context.
    Reject,
}

/// [`EmptyContinuePolicy`] per mechanism.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyContinuePolicies {
    pub kerberos: EmptyContinuePolicy,
    pub negotiate: EmptyContinuePolicy,
    pub ntlm: EmptyContinuePolicy,
    pub other: EmptyContinuePolicy,
}

impl Default for EmptyContinuePolicies {
    fn default() -> Self {
        Self {
            // a Kerberos initiator always has an AP-REQ or nothing left to say
            kerberos: EmptyContinuePolicy::Reject,
            negotiate: EmptyContinuePolicy::AwaitPeer,
            ntlm: EmptyContinuePolicy::AwaitPeer,
            other: EmptyContinuePolicy::AwaitPeer,
        }
    }
}

impl EmptyContinuePolicies {
    pub fn for_mechanism(&self, mechanism: &MechanismId) -> EmptyContinuePolicy {
        match mechanism {
            MechanismId::Kerberos => self.kerberos,
            MechanismId::Spnego => self.negotiate,
            MechanismId::Ntlm => self.ntlm,
            MechanismId::Other(_) => self.other,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PackageListConfig {
    pub ntlm: bool,
    pub kerberos: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GssConfig {
    pub package_list: Option<String>,
    pub default_mechanism: MechanismKind,
    /// Credential lifetime in seconds requested from the provider. `None` asks for the maximum.
    pub credential_lifetime: Option<u32>,
    /// Allow SPNEGO to fall back to NTLM when Kerberos is not usable for the target.
    pub ntlm_fallback: bool,
    pub empty_continue: EmptyContinuePolicies,
}

impl Default for GssConfig {
    fn default() -> Self {
        Self {
            package_list: None,
            default_mechanism: MechanismKind::Negotiate,
            credential_lifetime: None,
            ntlm_fallback: true,
            empty_continue: EmptyContinuePolicies::default(),
        }
    }
}

impl GssConfig {
    /// Defaults overlaid with the `GSS_NEGOTIATE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(package_list) = env::var(PACKAGE_LIST_ENV) {
            config.package_list = Some(package_list);
        }

        if let Ok(value) = env::var(NTLM_FALLBACK_ENV) {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => config.ntlm_fallback = true,
                "0" | "false" | "no" => config.ntlm_fallback = false,
                _ => warn!("unexpected {} value: {}", NTLM_FALLBACK_ENV, value),
            }
        }

        config
    }

    pub fn package_list_config(&self) -> PackageListConfig {
        parse_package_list(&self.package_list)
    }

    /// Mechanisms SPNEGO may offer, in preference order.
    pub(crate) fn negotiable_mechanisms(&self, available: &[MechanismId]) -> Vec<MechanismId> {
        let mut mechanisms = Vec::new();

        if available.contains(&MechanismId::Kerberos) {
            mechanisms.push(MechanismId::Kerberos);
        }
        if self.ntlm_fallback && available.contains(&MechanismId::Ntlm) {
            mechanisms.push(MechanismId::Ntlm);
        }

        mechanisms
    }
}

fn parse_package_list(package_list: &Option<String>) -> PackageListConfig {
    let mut ntlm = true;
    let mut kerberos = true;

    if let Some(package_list) = package_list {
        for package in package_list.split(',').map(str::trim).filter(|package| !package.is_empty()) {
            let (package_name, enabled) = match package.strip_prefix('!') {
                Some(package_name) => (package_name.to_lowercase(), false),
                None => (package.to_lowercase(), true),
            };

            match package_name.as_str() {
                "ntlm" => ntlm = enabled,
                "kerberos" => kerberos = enabled,
                _ => warn!("unexpected package name: {}", &package_name),
            }
        }
    }

    PackageListConfig { ntlm, kerberos }
}
