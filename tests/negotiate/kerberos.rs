use gss_negotiate::{
    ChannelBindings, ContextFlags, CredentialUsage, ErrorKind, GssConfig, MechanismId, NegotiationState, SecurityStatus,
};
use time::{Duration, OffsetDateTime};

use crate::common::{self, CLIENT, OTHER_SERVICE, SERVICE};

#[test]
fn mutual_authentication_takes_two_client_rounds() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let requested = ContextFlags::MUTUAL | ContextFlags::CONFIDENTIALITY | ContextFlags::INTEGRITY;
    let mut client = common::client(&gss, &client_credential, SERVICE, requested);
    let mut server = common::server(&gss, &server_credential);

    let ap_req = client.initiate(None).unwrap();
    assert_eq!(ap_req.status, SecurityStatus::ContinueNeeded);
    assert_eq!(client.state(), NegotiationState::Negotiating);

    let ap_rep = server.accept(ap_req.output.as_deref().unwrap()).unwrap();
    assert_eq!(ap_rep.status, SecurityStatus::Ok);
    assert!(ap_rep.output.is_some());
    assert!(server.is_established());

    let last = client.initiate(ap_rep.output.as_deref()).unwrap();
    assert_eq!(last.status, SecurityStatus::Ok);
    assert!(last.output.is_none());
    assert!(client.is_established());

    assert_eq!(client.rounds(), 2);
    assert_eq!(server.rounds(), 1);

    assert_eq!(client.negotiated_mechanism(), Some(&MechanismId::Kerberos));
    assert_eq!(server.negotiated_mechanism(), Some(&MechanismId::Kerberos));
    assert!(client.achieved_flags().contains(requested));
    assert!(requested.contains(client.achieved_flags()));
    assert!(ContextFlags::acceptor_default().contains(server.achieved_flags()));

    assert_eq!(client.peer_name(), Some(SERVICE));
    assert_eq!(server.peer_name(), Some(CLIENT));
    assert!(client.expiry().is_some_and(|expiry| expiry > OffsetDateTime::now_utc()));
}

#[test]
fn achieved_flags_never_exceed_the_request() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let requested = ContextFlags::INTEGRITY | ContextFlags::DELEGATION;
    let mut client = common::client(&gss, &client_credential, SERVICE, requested);
    let mut server = gss
        .accept_security_context()
        .with_credential(&server_credential)
        .with_context_requirements(ContextFlags::INTEGRITY)
        .build()
        .unwrap();

    common::negotiate(&mut client, &mut server).unwrap();

    // delegation is not supported by the mechanism
    assert_eq!(client.achieved_flags(), ContextFlags::INTEGRITY);
    assert_eq!(server.achieved_flags(), ContextFlags::INTEGRITY);
    assert_eq!(client.rounds(), 1);
}

#[test]
fn expired_credential_fails_the_first_round() {
    let (provider, gss) = common::setup(GssConfig::default());

    let credential = gss
        .acquire_credential()
        .with_credential_use(CredentialUsage::Initiate)
        .with_principal(gss.resolve_name(CLIENT, gss_negotiate::NameType::UserPrincipal).unwrap())
        .with_mechanism(MechanismId::Kerberos)
        .with_expiry_hint(OffsetDateTime::now_utc() - Duration::minutes(5))
        .execute()
        .unwrap()
        .credential_handle;
    assert!(credential.is_expired());

    let mut client = common::client(&gss, &credential, SERVICE, ContextFlags::MUTUAL);
    let err = client.initiate(None).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ContextExpired);
    assert!(err.kind().is_credential_refresh_candidate());
    assert_eq!(client.state(), NegotiationState::Failed);

    // nothing reached the provider context table
    drop(client);
    drop(credential);
    assert_eq!(provider.stats().live, 0);
}

#[test]
fn matching_channel_bindings() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);
    let bindings = ChannelBindings::from_application_data(b"tls-server-end-point:0123456789".to_vec());

    let mut client = gss
        .initialize_security_context()
        .with_credential(&client_credential)
        .with_target_name(gss.resolve_name(SERVICE, gss_negotiate::NameType::HostBasedService).unwrap())
        .with_context_requirements(ContextFlags::MUTUAL)
        .with_channel_bindings(bindings.clone())
        .build()
        .unwrap();
    let mut server = gss
        .accept_security_context()
        .with_credential(&server_credential)
        .with_channel_bindings(bindings)
        .build()
        .unwrap();

    common::negotiate(&mut client, &mut server).unwrap();
}

#[test]
fn mismatched_channel_bindings_are_rejected() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = gss
        .initialize_security_context()
        .with_credential(&client_credential)
        .with_target_name(gss.resolve_name(SERVICE, gss_negotiate::NameType::HostBasedService).unwrap())
        .with_context_requirements(ContextFlags::MUTUAL)
        .with_channel_bindings(ChannelBindings::from_application_data(b"client channel".to_vec()))
        .build()
        .unwrap();
    let mut server = gss
        .accept_security_context()
        .with_credential(&server_credential)
        .with_channel_bindings(ChannelBindings::from_application_data(b"server channel".to_vec()))
        .build()
        .unwrap();

    let err = common::negotiate(&mut client, &mut server).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(server.state(), NegotiationState::Failed);
    assert!(err.status.is_some());
}

#[test]
fn ticket_for_another_service_is_rejected() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, OTHER_SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    let mut server = common::server(&gss, &server_credential);

    let err = common::negotiate(&mut client, &mut server).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert!(!server.is_established());
}

#[test]
fn unknown_target_fails_on_the_initiator() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, "HTTP@nowhere.example.com", ContextFlags::MUTUAL);
    let err = client.initiate(None).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    let status = err.status.unwrap();
    assert!(status.major.routine_error().is_some());
    assert_eq!(status.mechanism, Some(MechanismId::Kerberos));
}

#[test]
fn acceptor_without_credential_accepts_any_service() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, OTHER_SERVICE, ContextFlags::MUTUAL);
    let mut server = gss.accept_security_context().build().unwrap();

    common::negotiate(&mut client, &mut server).unwrap();

    assert_eq!(server.peer_name(), Some(CLIENT));
    assert_eq!(server.negotiated_mechanism(), Some(&MechanismId::Kerberos));
}

const KRB5_OID: [u8; 11] = [0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02];

/// Token id following the mechanism OID of an RFC 4121 initial context token.
fn token_id(token: &[u8]) -> Option<[u8; 2]> {
    let at = token.windows(KRB5_OID.len()).position(|window| window == KRB5_OID)? + KRB5_OID.len();

    token.get(at..at + 2).map(|id| [id[0], id[1]])
}

#[test]
fn tokens_are_framed_kerberos_messages() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    let mut server = common::server(&gss, &server_credential);

    let ap_req = client.initiate(None).unwrap().output.unwrap();
    assert_eq!(ap_req[0], 0x60);
    assert_eq!(token_id(&ap_req), Some([0x01, 0x00]));

    let ap_rep = server.accept(&ap_req).unwrap().output.unwrap();
    assert_eq!(ap_rep[0], 0x60);
    assert_eq!(token_id(&ap_rep), Some([0x02, 0x00]));

    client.initiate(Some(&ap_rep[..])).unwrap();
    assert!(client.is_established());
}
