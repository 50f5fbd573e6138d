use gss_negotiate::{ContextFlags, CredentialUsage, ErrorKind, GssConfig, MechanismId, NegotiationState, SecurityStatus};

use crate::common::{self, CLIENT, NTLM_ONLY_CLIENT, SERVICE};

#[test]
fn kerberos_is_preferred() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, SERVICE, common::protection_flags());
    let mut server = common::server(&gss, &server_credential);

    common::negotiate(&mut client, &mut server).unwrap();

    assert_eq!(client.negotiated_mechanism(), Some(&MechanismId::Kerberos));
    assert_eq!(server.negotiated_mechanism(), Some(&MechanismId::Kerberos));
    assert_eq!(client.mechanism(), &MechanismId::Kerberos);
    assert_eq!(client.rounds(), 2);
    assert_eq!(server.rounds(), 1);
    assert!(client.achieved_flags().contains(ContextFlags::MUTUAL));
    assert_eq!(server.peer_name(), Some(CLIENT));
}

#[test]
fn falls_back_to_ntlm_without_kerberos_keys() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, NTLM_ONLY_CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, SERVICE, common::protection_flags());
    let mut server = common::server(&gss, &server_credential);

    common::negotiate(&mut client, &mut server).unwrap();

    assert_eq!(client.negotiated_mechanism(), Some(&MechanismId::Ntlm));
    assert_eq!(server.negotiated_mechanism(), Some(&MechanismId::Ntlm));
    assert_eq!(client.rounds(), 3);
    assert_eq!(server.rounds(), 2);
    // NTLM has no acceptor proof
    assert!(!client.achieved_flags().contains(ContextFlags::MUTUAL));
    assert!(client.achieved_flags().contains(ContextFlags::CONFIDENTIALITY));
    assert_eq!(server.peer_name(), Some(NTLM_ONLY_CLIENT));

    let message = client.wrap(b"over ntlm", true).unwrap();
    assert_eq!(server.unwrap(&message).unwrap().plaintext, b"over ntlm");
}

#[test]
fn ip_address_target_uses_ntlm() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, "HTTP@10.0.0.5", common::protection_flags());
    assert_eq!(client.mechanism(), &MechanismId::Ntlm);

    let mut server = common::server(&gss, &server_credential);

    common::negotiate(&mut client, &mut server).unwrap();

    assert_eq!(client.negotiated_mechanism(), Some(&MechanismId::Ntlm));
    assert_eq!(server.negotiated_mechanism(), Some(&MechanismId::Ntlm));
    assert_eq!(client.rounds(), 2);
    assert_eq!(server.rounds(), 2);
}

#[test]
fn ip_address_target_keeps_negotiate_without_fallback() {
    let (_, gss) = common::setup(GssConfig {
        ntlm_fallback: false,
        ..Default::default()
    });
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);

    let client = common::client(&gss, &client_credential, "HTTP@10.0.0.5", common::protection_flags());

    assert_eq!(client.mechanism(), &MechanismId::Spnego);
}

#[test]
fn no_common_mechanism_without_fallback() {
    let (_, gss) = common::setup(GssConfig {
        ntlm_fallback: false,
        ..Default::default()
    });
    let client_credential = common::credential(&gss, NTLM_ONLY_CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, SERVICE, common::protection_flags());
    let err = client.initiate(None).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MechanismUnsupported);
    assert_eq!(client.state(), NegotiationState::Failed);

    let err = client.initiate(None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSequence);
}

#[test]
fn acceptor_speaks_first() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, SERVICE, common::protection_flags());
    let mut server = common::server(&gss, &server_credential);

    let hint = server.accept(&[]).unwrap();
    assert_eq!(hint.status, SecurityStatus::ContinueNeeded);
    assert!(hint.output.as_ref().is_some_and(|token| !token.is_empty()));
    assert_eq!(server.state(), NegotiationState::Negotiating);

    common::negotiate_from(&mut client, &mut server, hint.output).unwrap();

    assert_eq!(client.negotiated_mechanism(), Some(&MechanismId::Kerberos));
    assert_eq!(server.rounds(), 2);
}

#[test]
fn kerberos_acceptor_waits_for_the_initiator() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    let mut server = common::server(&gss, &server_credential);

    // the raw mechanism has nothing to say first
    let err = server.accept(&[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(server.state(), NegotiationState::Failed);

    let mut server = common::server(&gss, &server_credential);
    common::negotiate(&mut client, &mut server).unwrap();
}

#[test]
fn tokens_are_spnego_messages() {
    const SPNEGO_OID: [u8; 8] = [0x06, 0x06, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];

    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Spnego);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Spnego);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    let mut server = common::server(&gss, &server_credential);

    let init = client.initiate(None).unwrap().output.unwrap();
    assert_eq!(init[0], 0x60);
    assert!(init.windows(SPNEGO_OID.len()).any(|window| window == SPNEGO_OID));

    // negTokenResp is context tag 1
    let response = server.accept(&init).unwrap().output.unwrap();
    assert_eq!(response[0], 0xa1);

    client.initiate(Some(&response[..])).unwrap();
    assert!(client.is_established());
}
