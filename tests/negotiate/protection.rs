use gss_negotiate::{ContextFlags, CredentialUsage, ErrorKind, GssConfig, MechanismId, NegotiationState, ProtectedMessage};
use proptest::prelude::*;

use crate::common::{self, CLIENT, SERVICE};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn wrapped_messages_survive_the_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512), confidentiality: bool) {
        let (_, gss) = common::setup(GssConfig::default());
        let (mut client, mut server) = common::established_kerberos_pair(&gss);

        let message = client.wrap(&plaintext, confidentiality).unwrap();
        if confidentiality && plaintext.len() >= 16 {
            prop_assert!(!message.as_bytes().windows(plaintext.len()).any(|window| window == plaintext.as_slice()));
        }

        let unwrapped = server.unwrap(&message).unwrap();
        prop_assert_eq!(&unwrapped.plaintext, &plaintext);
        prop_assert_eq!(unwrapped.confidentiality_used, confidentiality);

        let reply = server.wrap(&plaintext, confidentiality).unwrap();
        prop_assert_eq!(client.unwrap(&reply).unwrap().plaintext, plaintext);
    }
}

/// Flips every bit of messages of several sizes, sealed and signed, each against a fresh pair.
#[test]
fn every_bit_flip_is_detected() {
    let (_, gss) = common::setup(GssConfig::default());

    let mut flips = 0usize;
    let mut detected = 0usize;

    for size in [0usize, 1, 17, 64] {
        let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();

        for confidentiality in [false, true] {
            let (mut client, _) = common::established_kerberos_pair(&gss);
            let len = client.wrap(&plaintext, confidentiality).unwrap().into_vec().len();

            for position in 0..len {
                for bit in 0..8 {
                    let (mut client, mut server) = common::established_kerberos_pair(&gss);

                    let mut bytes = client.wrap(&plaintext, confidentiality).unwrap().into_vec();
                    bytes[position] ^= 1 << bit;

                    flips += 1;
                    match server.unwrap(&ProtectedMessage::from_bytes(bytes)) {
                        Ok(unwrapped) => assert_eq!(
                            unwrapped.plaintext, plaintext,
                            "altered plaintext accepted (size {size}, conf {confidentiality}, byte {position}, bit {bit})"
                        ),
                        Err(_) => detected += 1,
                    }
                }
            }
        }
    }

    let ratio = detected as f64 / flips as f64;
    assert!(ratio >= 0.999, "{detected} of {flips} bit flips detected");
}

#[test]
fn flipped_bit_fails_the_context() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let mut bytes = client.wrap(b"transfer 100 to bob", true).unwrap().into_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    let err = server.unwrap(&ProtectedMessage::from_bytes(bytes)).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert_eq!(server.state(), NegotiationState::Failed);
}

#[test]
fn integrity_only_message_is_readable() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let message = client.wrap(b"signed, not sealed", false).unwrap();
    assert!(message
        .as_bytes()
        .windows(b"signed, not sealed".len())
        .any(|window| window == b"signed, not sealed"));

    let unwrapped = server.unwrap(&message).unwrap();
    assert!(!unwrapped.confidentiality_used);
    assert_eq!(unwrapped.plaintext, b"signed, not sealed");
}

#[test]
fn own_message_is_rejected() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, _server) = common::established_kerberos_pair(&gss);

    let message = client.wrap(b"echo", true).unwrap();
    let err = client.unwrap(&message).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
}

#[test]
fn mic_verification() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let mic = client.get_mic(b"detached payload").unwrap();
    server.verify_mic(b"detached payload", &mic).unwrap();

    let mic = client.get_mic(b"detached payload").unwrap();
    let err = server.verify_mic(b"detached pay1oad", &mic).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
}

#[test]
fn replayed_message_is_a_sequence_violation() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let message = client.wrap(b"pay once", true).unwrap();
    server.unwrap(&message).unwrap();

    let err = server.unwrap(&message).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SequenceViolation);
    assert!(err.status.is_some_and(|status| !status.major.supplementary().is_empty()));
    assert_eq!(server.state(), NegotiationState::Failed);
}

#[test]
fn out_of_order_message_is_a_sequence_violation() {
    let (_, gss) = common::setup(GssConfig::default());
    let (mut client, mut server) = common::established_kerberos_pair(&gss);

    let _first = client.wrap(b"first", false).unwrap();
    let second = client.wrap(b"second", false).unwrap();

    let err = server.unwrap(&second).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SequenceViolation);
}

#[test]
fn confidentiality_must_be_negotiated() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL | ContextFlags::INTEGRITY);
    let mut server = common::server(&gss, &server_credential);
    common::negotiate(&mut client, &mut server).unwrap();

    let err = client.wrap(b"secret", true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfidentialityUnavailable);
    // a precondition failure leaves the context usable
    assert_eq!(client.state(), NegotiationState::Established);

    let message = client.wrap(b"public", false).unwrap();
    assert_eq!(server.unwrap(&message).unwrap().plaintext, b"public");
}

#[test]
fn protection_needs_an_established_context() {
    let (_, gss) = common::setup(GssConfig::default());
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, common::protection_flags());
    client.initiate(None).unwrap();

    let err = client.wrap(b"too early", true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextNotEstablished);
    assert_eq!(client.state(), NegotiationState::Negotiating);

    let err = client.get_mic(b"too early").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextNotEstablished);
}
