use std::env;

use gss_negotiate::config::{NTLM_FALLBACK_ENV, PACKAGE_LIST_ENV};
use gss_negotiate::{
    ContextFlags, CredentialUsage, EmptyContinuePolicy, ErrorKind, GssConfig, MechanismId, MechanismKind, NameType,
};

use crate::common::{self, CLIENT, NTLM_ONLY_CLIENT, SERVICE};

#[test]
fn environment_overrides() {
    env::set_var(PACKAGE_LIST_ENV, "kerberos,!ntlm");
    env::set_var(NTLM_FALLBACK_ENV, "false");

    let config = GssConfig::from_env();

    env::remove_var(PACKAGE_LIST_ENV);
    env::remove_var(NTLM_FALLBACK_ENV);

    assert_eq!(config.package_list.as_deref(), Some("kerberos,!ntlm"));
    assert!(!config.ntlm_fallback);
    assert!(!config.package_list_config().ntlm);
    assert_eq!(config.default_mechanism, MechanismKind::Negotiate);
}

#[test]
fn disabled_package_is_not_offered() {
    let (_, gss) = common::setup(GssConfig {
        package_list: Some("!ntlm".to_owned()),
        ..Default::default()
    });

    assert!(!gss.capabilities().is_ntlm_available());
    assert!(gss.capabilities().supports(&MechanismId::Kerberos));

    let err = gss
        .acquire_credential()
        .with_credential_use(CredentialUsage::Initiate)
        .with_principal(gss.resolve_name(NTLM_ONLY_CLIENT, NameType::UserPrincipal).unwrap())
        .with_mechanism(MechanismId::Ntlm)
        .execute()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MechanismUnsupported);

    let client_credential = common::credential(&gss, NTLM_ONLY_CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);

    let err = client.initiate(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MechanismUnsupported);
}

#[test]
fn default_mechanism_applies_without_credential() {
    let (_, gss) = common::setup(GssConfig {
        default_mechanism: MechanismKind::Kerberos,
        ..Default::default()
    });

    let mut client = gss
        .initialize_security_context()
        .with_target_name(gss.resolve_name(SERVICE, NameType::HostBasedService).unwrap())
        .with_context_requirements(ContextFlags::MUTUAL)
        .build()
        .unwrap();
    assert_eq!(client.mechanism(), &MechanismId::Kerberos);

    let mut server = gss.accept_security_context().build().unwrap();
    common::negotiate(&mut client, &mut server).unwrap();

    // the realm's first principal is the default identity
    assert_eq!(server.peer_name(), Some(CLIENT));
}

#[test]
fn empty_continue_can_be_tolerated() {
    let mut config = GssConfig::default();
    config.empty_continue.kerberos = EmptyContinuePolicy::AwaitPeer;
    let (_, gss) = common::setup(config);

    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);
    let mut server = common::server(&gss, &server_credential);

    let step = server.accept(&[]).unwrap();
    assert!(!step.is_complete());
    assert!(step.output.is_none());

    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    common::negotiate(&mut client, &mut server).unwrap();
}

#[test]
fn credential_lifetime_is_capped() {
    let (_, gss) = common::setup(GssConfig {
        credential_lifetime: Some(60),
        ..Default::default()
    });

    let credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let expiry = credential.expiry().unwrap();

    assert!(expiry <= time::OffsetDateTime::now_utc() + time::Duration::seconds(60));
}
