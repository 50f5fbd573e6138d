use gss_negotiate::loopback::LoopbackProvider;
use gss_negotiate::registry::HandleKind;
use gss_negotiate::{
    ContextFlags, CredentialHandle, CredentialUsage, ErrorKind, Gss, GssConfig, MechanismId, NameType,
    NegotiationState, Secret, SecurityContext,
};
use static_assertions::assert_impl_all;

use crate::common::{self, CLIENT, SERVICE};

assert_impl_all!(Gss: Send, Sync);
assert_impl_all!(CredentialHandle: Send, Sync);
assert_impl_all!(SecurityContext: Send);
assert_impl_all!(LoopbackProvider: Send, Sync);

#[test]
fn destroying_twice_is_reported() {
    let (provider, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    client.destroy().unwrap();
    server.destroy().unwrap();

    let err = client.destroy().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert_eq!(gss.registry_stats().double_releases, 1);

    let err = client.wrap(b"after destroy", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert!(!client.is_established());

    // the provider never saw the second release
    assert_eq!(provider.stats().double_releases, 0);
}

#[test]
fn releasing_a_credential_twice_is_reported() {
    let (provider, gss) = common::setup(GssConfig::default());
    let credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let clone = credential.clone();

    credential.release().unwrap();
    assert!(clone.is_released());

    let err = clone.release().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert_eq!(gss.registry_stats().double_releases, 1);
    assert_eq!(provider.stats().double_releases, 0);

    let err = gss
        .initialize_security_context()
        .with_credential(&clone)
        .with_target_name(gss.resolve_name(SERVICE, NameType::HostBasedService).unwrap())
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
}

#[test]
fn nothing_leaks_after_a_full_session() {
    let (provider, gss) = common::setup(GssConfig::default());

    {
        let (mut client, mut server) = common::established_kerberos_pair(&gss);

        let message = client.wrap(b"ping", true).unwrap();
        server.unwrap(&message).unwrap();
        let mic = server.get_mic(b"pong").unwrap();
        client.verify_mic(b"pong", &mic).unwrap();

        assert_eq!(gss.registry_stats().live(HandleKind::Context), 2);
        assert_eq!(gss.registry_stats().live(HandleKind::Buffer), 0);
    }

    let stats = gss.registry_stats();
    assert_eq!(stats.total_live(), 0);
    assert_eq!(stats.allocated, stats.released);
    assert_eq!(stats.double_releases, 0);
    assert_eq!(stats.release_failures, 0);

    let provider_stats = provider.stats();
    assert_eq!(provider_stats.live, 0);
    assert_eq!(provider_stats.double_releases, 0);
    assert_eq!(provider_stats.allocated, provider_stats.released);
}

#[test]
fn failed_negotiation_releases_the_context() {
    let (provider, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    client.initiate(None).unwrap();
    assert_eq!(gss.registry_stats().live(HandleKind::Context), 1);

    let err = client.initiate(Some(b"not an AP-REP")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(client.state(), NegotiationState::Failed);
    assert_eq!(gss.registry_stats().live(HandleKind::Context), 0);

    // destroying a failed context only drops what is left
    client.destroy().unwrap();
    drop(client);
    drop(client_credential);

    assert_eq!(gss.registry_stats().total_live(), 0);
    assert_eq!(provider.stats().live, 0);
}

#[test]
fn established_context_cannot_negotiate_again() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let err = client.initiate(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSequence);
    assert_eq!(client.state(), NegotiationState::Established);

    let err = client.accept(b"anything").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = server.accept(b"anything").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSequence);
    assert!(server.is_established());
}

#[test]
fn password_credentials() {
    let (_, gss) = common::setup(GssConfig::default());
    assert!(gss.capabilities().supports_password_credentials());

    let acquire = |password: &str| {
        gss.acquire_credential()
            .with_credential_use(CredentialUsage::Initiate)
            .with_principal(gss.resolve_name(CLIENT, NameType::UserPrincipal).unwrap())
            .with_mechanism(MechanismId::Kerberos)
            .with_password(Secret::new(password.to_owned()))
            .execute()
    };

    let credential = acquire("alice-password").unwrap().credential_handle;
    assert_eq!(credential.principal(), Some(CLIENT));

    let err = acquire("mallory-password").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CredentialUnavailable);
}

#[test]
fn unknown_principal_has_no_credential() {
    let (_, gss) = common::setup(GssConfig::default());

    let err = gss
        .acquire_credential()
        .with_credential_use(CredentialUsage::Initiate)
        .with_principal(gss.resolve_name("mallory", NameType::UserPrincipal).unwrap())
        .with_mechanism(MechanismId::Kerberos)
        .execute()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CredentialUnavailable);
}

#[test]
fn names_are_canonical() {
    let (_, gss) = common::setup(GssConfig::default());

    let name = gss.resolve_name("alice", NameType::UserPrincipal).unwrap();
    assert_eq!(gss.display_name(&name).unwrap(), CLIENT);

    let err = gss.resolve_name("", NameType::UserPrincipal).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameResolution);
}
