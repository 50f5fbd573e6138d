//! Provider behaviors the loopback mechanisms never show on their own, injected by a wrapper
//! that delegates everything else to a [`LoopbackProvider`].

use std::sync::Arc;

use gss_negotiate::loopback::LoopbackProvider;
use gss_negotiate::mechanism::ProviderFamily;
use gss_negotiate::name::NameType;
use gss_negotiate::provider::{
    AcceptSecContextCall, AcquireCredRequest, AcquiredCredential, CallStatus, ContextInfo, InitSecContextCall, Outcome,
    RawHandle, SecContextOutput, StatusType,
};
use gss_negotiate::registry::HandleKind;
use gss_negotiate::{
    ContextFlags, CredentialUsage, ErrorKind, Gss, GssConfig, GssProvider, MechanismId, NegotiationState, Secret,
    SecurityBuffer,
};

use crate::common::{self, CLIENT, SERVICE};

const ERROR_TOKEN: &[u8] = b"KRB-ERROR";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Quirk {
    /// Like MIT and Heimdal: a failed continuation deletes the context and returns no handle.
    DeleteContextOnFailure,
    /// The first initiator round hands back an allocated but empty output buffer.
    EmptyContinueToken,
    /// Failed accept rounds come with an error token for the peer.
    ErrorTokenOnFailure,
}

#[derive(Debug)]
struct QuirkyProvider {
    inner: LoopbackProvider,
    quirk: Quirk,
}

impl QuirkyProvider {
    fn replace_output(&self, output: &mut SecContextOutput, data: &[u8]) {
        if let Some(previous) = output.output.take() {
            self.inner.release_buffer(previous);
        }
        output.output = Some(self.inner.allocate_buffer(data.to_vec()));
    }
}

fn is_failure(status: CallStatus) -> bool {
    status.major >> 16 != 0
}

impl GssProvider for QuirkyProvider {
    fn family(&self) -> ProviderFamily {
        self.inner.family()
    }

    fn supports_password_credentials(&self) -> bool {
        self.inner.supports_password_credentials()
    }

    fn indicate_mechs(&self) -> Outcome<Vec<MechanismId>> {
        self.inner.indicate_mechs()
    }

    fn import_name(&self, name: &str, name_type: NameType) -> Outcome<Option<RawHandle>> {
        self.inner.import_name(name, name_type)
    }

    fn display_name(&self, name: RawHandle) -> Outcome<Option<String>> {
        self.inner.display_name(name)
    }

    fn release_name(&self, name: RawHandle) -> CallStatus {
        self.inner.release_name(name)
    }

    fn acquire_cred(&self, request: &AcquireCredRequest<'_>) -> Outcome<Option<AcquiredCredential>> {
        self.inner.acquire_cred(request)
    }

    fn acquire_cred_with_password(
        &self,
        name: RawHandle,
        password: &Secret<String>,
        request: &AcquireCredRequest<'_>,
    ) -> Outcome<Option<AcquiredCredential>> {
        self.inner.acquire_cred_with_password(name, password, request)
    }

    fn release_cred(&self, credential: RawHandle) -> CallStatus {
        self.inner.release_cred(credential)
    }

    fn init_sec_context(&self, call: InitSecContextCall<'_>) -> Outcome<SecContextOutput> {
        match (self.quirk, call.context) {
            (Quirk::DeleteContextOnFailure, Some(context)) => {
                let outcome = self.inner.init_sec_context(call);
                if !is_failure(outcome.status) {
                    return outcome;
                }

                self.inner.delete_sec_context(context);

                Outcome::failed(outcome.status)
            }
            (Quirk::EmptyContinueToken, None) => {
                let mut outcome = self.inner.init_sec_context(call);
                self.replace_output(&mut outcome.value, &[]);

                outcome
            }
            _ => self.inner.init_sec_context(call),
        }
    }

    fn accept_sec_context(&self, call: AcceptSecContextCall<'_>) -> Outcome<SecContextOutput> {
        let mut outcome = self.inner.accept_sec_context(call);

        if self.quirk == Quirk::ErrorTokenOnFailure && is_failure(outcome.status) {
            self.replace_output(&mut outcome.value, ERROR_TOKEN);
        }

        outcome
    }

    fn delete_sec_context(&self, context: RawHandle) -> CallStatus {
        self.inner.delete_sec_context(context)
    }

    fn inquire_context(&self, context: RawHandle) -> Outcome<Option<ContextInfo>> {
        self.inner.inquire_context(context)
    }

    fn wrap(&self, context: RawHandle, confidentiality: bool, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        self.inner.wrap(context, confidentiality, message)
    }

    fn unwrap(&self, context: RawHandle, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        self.inner.unwrap(context, message)
    }

    fn get_mic(&self, context: RawHandle, message: &[u8]) -> Outcome<Option<RawHandle>> {
        self.inner.get_mic(context, message)
    }

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> CallStatus {
        self.inner.verify_mic(context, message, mic)
    }

    fn buffer_contents(&self, buffer: RawHandle) -> Outcome<Vec<u8>> {
        self.inner.buffer_contents(buffer)
    }

    fn release_buffer(&self, buffer: RawHandle) -> CallStatus {
        self.inner.release_buffer(buffer)
    }

    fn display_status(&self, code: u32, status_type: StatusType, mechanism: Option<&MechanismId>) -> String {
        self.inner.display_status(code, status_type, mechanism)
    }
}

fn setup(quirk: Quirk) -> (Arc<QuirkyProvider>, Gss) {
    common::init_tracing();

    let provider = Arc::new(QuirkyProvider {
        inner: LoopbackProvider::new(common::realm()),
        quirk,
    });
    let gss = Gss::new(provider.clone(), GssConfig::default()).unwrap();

    (provider, gss)
}

#[test]
fn context_deleted_by_the_provider_is_not_released_again() {
    let (provider, gss) = setup(Quirk::DeleteContextOnFailure);
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    client.initiate(None).unwrap();
    assert_eq!(gss.registry_stats().live(HandleKind::Context), 1);

    let err = client.initiate(Some(b"not an AP-REP")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(client.state(), NegotiationState::Failed);
    assert_eq!(gss.registry_stats().live(HandleKind::Context), 0);

    client.destroy().unwrap();
    drop(client);
    drop(client_credential);

    let stats = provider.inner.stats();
    assert_eq!(stats.double_releases, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(gss.registry_stats().total_live(), 0);
}

#[test]
fn empty_continue_token_is_kept() {
    // Kerberos rejects a continuation without a token by default
    let (_, gss) = setup(Quirk::EmptyContinueToken);
    let client_credential = common::credential(&gss, CLIENT, CredentialUsage::Initiate, MechanismId::Kerberos);

    let mut client = common::client(&gss, &client_credential, SERVICE, ContextFlags::MUTUAL);
    let step = client.initiate(None).unwrap();

    assert!(!step.is_complete());
    assert_eq!(step.output.as_deref(), Some(&[][..]));
    assert_eq!(client.state(), NegotiationState::Negotiating);
}

#[test]
fn failed_round_carries_the_error_token() {
    let (provider, gss) = setup(Quirk::ErrorTokenOnFailure);
    let server_credential = common::credential(&gss, SERVICE, CredentialUsage::Accept, MechanismId::Kerberos);

    let mut server = common::server(&gss, &server_credential);
    let err = server.accept(b"not an AP-REQ").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NegotiationFailed);
    assert_eq!(err.output_token.as_deref(), Some(ERROR_TOKEN));
    assert_eq!(server.state(), NegotiationState::Failed);

    drop(server);
    drop(server_credential);
    assert_eq!(provider.inner.stats().live, 0);
}
