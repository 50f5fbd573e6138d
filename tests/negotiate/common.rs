use std::sync::{Arc, OnceLock};

use gss_negotiate::loopback::{LoopbackProvider, LoopbackRealm};
use gss_negotiate::{
    ContextFlags, CredentialHandle, CredentialUsage, Gss, GssConfig, MechanismId, NameType, SecurityContext, Token,
};
use tracing_subscriber::EnvFilter;

pub const REALM: &str = "EXAMPLE.COM";
pub const CLIENT: &str = "alice@EXAMPLE.COM";
/// Exists only in the NTLM account database.
pub const NTLM_ONLY_CLIENT: &str = "carol@EXAMPLE.COM";
pub const SERVICE: &str = "service@EXAMPLE.COM";
pub const OTHER_SERVICE: &str = "other@EXAMPLE.COM";

const MAX_ROUNDS: usize = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("GSS_NEGOTIATE_LOG"))
        .with_test_writer()
        .try_init();
}

/// Key derivation is slow, every test shares one keystore.
pub fn realm() -> Arc<LoopbackRealm> {
    static REALM_INSTANCE: OnceLock<Arc<LoopbackRealm>> = OnceLock::new();

    REALM_INSTANCE
        .get_or_init(|| {
            let realm = LoopbackRealm::new(REALM);
            realm.add_principal(CLIENT, "alice-password").unwrap();
            realm.add_ntlm_principal(NTLM_ONLY_CLIENT, "carol-password").unwrap();
            realm.add_principal(SERVICE, "service-password").unwrap();
            realm.add_principal(OTHER_SERVICE, "other-password").unwrap();
            realm
        })
        .clone()
}

pub fn setup(config: GssConfig) -> (Arc<LoopbackProvider>, Gss) {
    init_tracing();

    let provider = Arc::new(LoopbackProvider::new(realm()));
    let gss = Gss::new(provider.clone(), config).unwrap();

    (provider, gss)
}

pub fn credential(gss: &Gss, principal: &str, usage: CredentialUsage, mechanism: MechanismId) -> CredentialHandle {
    let name_type = if usage.can_initiate() {
        NameType::UserPrincipal
    } else {
        NameType::HostBasedService
    };

    gss.acquire_credential()
        .with_credential_use(usage)
        .with_principal(gss.resolve_name(principal, name_type).unwrap())
        .with_mechanism(mechanism)
        .execute()
        .unwrap()
        .credential_handle
}

pub fn client(
    gss: &Gss,
    credential: &CredentialHandle,
    target: &str,
    flags: ContextFlags,
) -> SecurityContext {
    gss.initialize_security_context()
        .with_credential(credential)
        .with_target_name(gss.resolve_name(target, NameType::HostBasedService).unwrap())
        .with_context_requirements(flags)
        .build()
        .unwrap()
}

pub fn server(gss: &Gss, credential: &CredentialHandle) -> SecurityContext {
    gss.accept_security_context().with_credential(credential).build().unwrap()
}

pub fn protection_flags() -> ContextFlags {
    ContextFlags::MUTUAL
        | ContextFlags::CONFIDENTIALITY
        | ContextFlags::INTEGRITY
        | ContextFlags::REPLAY_DETECT
        | ContextFlags::SEQUENCE_DETECT
}

/// Runs rounds until both sides are established or one of them fails.
pub fn negotiate(client: &mut SecurityContext, server: &mut SecurityContext) -> gss_negotiate::Result<()> {
    negotiate_from(client, server, None)
}

/// Like [`negotiate`], starting from a token the acceptor sent first.
pub fn negotiate_from(
    client: &mut SecurityContext,
    server: &mut SecurityContext,
    mut from_server: Option<Token>,
) -> gss_negotiate::Result<()> {
    for _ in 0..MAX_ROUNDS {
        if !client.is_established() {
            let step = client.initiate(from_server.take().as_deref())?;

            if let Some(token) = step.output {
                if !server.is_established() {
                    from_server = server.accept(&token)?.output;
                }
            }
        }

        if client.is_established() && server.is_established() {
            return Ok(());
        }
    }

    panic!("negotiation did not finish in {} rounds", MAX_ROUNDS);
}

/// A mutually authenticated Kerberos pair with every protection feature.
pub fn established_kerberos_pair(gss: &Gss) -> (SecurityContext, SecurityContext) {
    let client_credential = credential(gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = credential(gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = client(gss, &client_credential, SERVICE, protection_flags());
    let mut server = server(gss, &server_credential);

    negotiate(&mut client, &mut server).unwrap();

    (client, server)
}
