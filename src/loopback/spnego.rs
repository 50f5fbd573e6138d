//! Mechanism selection wrapped around the Kerberos and NTLM exchanges.
//!
//! The initiator offers its mechanisms, preferred first, with an optimistic token for the
//! preferred one. The acceptor picks the first offered mechanism it supports. When that is not
//! the preferred one, it ignores the optimistic token and names its choice so the initiator
//! starts over with it. The acceptor always ends the exchange with an `accept-completed`
//! response.

use std::mem;

use picky_asn1::wrapper::{ExplicitContextTag0, ExplicitContextTag1, ExplicitContextTag2, ObjectIdentifierAsn1, OctetStringAsn1, Optional};
use picky_asn1_der::Asn1RawDer;
use picky_asn1_x509::oids;
use picky_krb::constants::gss_api::{ACCEPT_COMPLETE, ACCEPT_INCOMPLETE};
use picky_krb::gss_api::{self, ApplicationTag0, GssApiNegInit, MechType, MechTypeList, NegTokenTarg, NegTokenTarg1};

use super::session::Session;
use super::{kerberos, minor, ntlm, InitiatorRequest, LoopbackRealm, Rejected, Rejection, Step};
use crate::channel_bindings::ChannelBindings;
use crate::mechanism::MechanismId;
use crate::status::RoutineError;

/// DER `ENUMERATED 2`.
const REJECT: [u8; 3] = [0x0a, 0x01, 0x02];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NegState {
    AcceptCompleted,
    AcceptIncomplete,
    Reject,
}

impl NegState {
    fn to_der(self) -> Vec<u8> {
        match self {
            NegState::AcceptCompleted => ACCEPT_COMPLETE.to_vec(),
            NegState::AcceptIncomplete => ACCEPT_INCOMPLETE.to_vec(),
            NegState::Reject => REJECT.to_vec(),
        }
    }

    fn from_der(der: &[u8]) -> Option<Self> {
        [NegState::AcceptCompleted, NegState::AcceptIncomplete, NegState::Reject]
            .into_iter()
            .find(|state| state.to_der() == der)
    }
}

fn mech_token(token: &[u8]) -> Optional<Option<ExplicitContextTag2<OctetStringAsn1>>> {
    Optional::from((!token.is_empty()).then(|| ExplicitContextTag2::from(OctetStringAsn1::from(token.to_vec()))))
}

/// Whether `data` is an initial SPNEGO token.
pub(super) fn is_neg_token_init(data: &[u8]) -> bool {
    NegTokenInit::decode(data).is_ok()
}

#[derive(Debug, PartialEq)]
struct NegTokenInit {
    mechanisms: Vec<MechanismId>,
    token: Vec<u8>,
}

impl NegTokenInit {
    fn encode(&self) -> Rejected<Vec<u8>> {
        let mech_types = self
            .mechanisms
            .iter()
            .map(|mechanism| MechType::from(mechanism.oid()))
            .collect::<Vec<_>>();

        let token = ApplicationTag0(GssApiNegInit {
            oid: ObjectIdentifierAsn1::from(oids::spnego()),
            neg_token_init: ExplicitContextTag0::from(gss_api::NegTokenInit {
                mech_types: Optional::from(Some(ExplicitContextTag0::from(MechTypeList::from(mech_types)))),
                req_flags: Optional::from(None),
                mech_token: mech_token(&self.token),
                mech_list_mic: Optional::from(None),
            }),
        });

        Ok(picky_asn1_der::to_vec(&token)?)
    }

    fn decode(data: &[u8]) -> Rejected<Self> {
        let token: ApplicationTag0<GssApiNegInit> = picky_asn1_der::from_bytes(data)?;
        if token.0.oid.0 != oids::spnego() {
            return Err(Rejection::defective());
        }

        let gss_api::NegTokenInit {
            mech_types, mech_token, ..
        } = token.0.neg_token_init.0;

        let mechanisms = mech_types
            .0
            .map(|mech_types| mech_types.0 .0.iter().map(|mech_type| MechanismId::from_oid(&mech_type.0)).collect())
            .unwrap_or_default();
        let token = mech_token.0.map(|token| token.0 .0).unwrap_or_default();

        Ok(Self { mechanisms, token })
    }
}

/// `state` is absent in the initiator's continuation tokens.
#[derive(Debug, PartialEq)]
struct NegTokenResp {
    state: Option<NegState>,
    mechanism: Option<MechanismId>,
    token: Vec<u8>,
}

impl NegTokenResp {
    fn new(state: NegState, mechanism: Option<MechanismId>, token: Vec<u8>) -> Self {
        Self {
            state: Some(state),
            mechanism,
            token,
        }
    }

    fn continuation(token: Vec<u8>) -> Self {
        Self {
            state: None,
            mechanism: None,
            token,
        }
    }

    fn encode(&self) -> Rejected<Vec<u8>> {
        let token = NegTokenTarg1::from(NegTokenTarg {
            neg_result: Optional::from(
                self.state
                    .map(|state| ExplicitContextTag0::from(Asn1RawDer(state.to_der()))),
            ),
            supported_mech: Optional::from(
                self.mechanism
                    .as_ref()
                    .map(|mechanism| ExplicitContextTag1::from(MechType::from(mechanism.oid()))),
            ),
            response_token: mech_token(&self.token),
            mech_list_mic: Optional::from(None),
        });

        Ok(picky_asn1_der::to_vec(&token)?)
    }

    fn decode(data: &[u8]) -> Rejected<Self> {
        let token: NegTokenTarg1 = picky_asn1_der::from_bytes(data)?;
        let NegTokenTarg {
            neg_result,
            supported_mech,
            response_token,
            ..
        } = token.0;

        let state = neg_result
            .0
            .map(|state| NegState::from_der(&state.0 .0).ok_or_else(Rejection::defective))
            .transpose()?;
        let mechanism = supported_mech.0.map(|mechanism| MechanismId::from_oid(&mechanism.0 .0));
        let token = response_token.0.map(|token| token.0 .0).unwrap_or_default();

        Ok(Self {
            state,
            mechanism,
            token,
        })
    }
}

/// Picks Kerberos when both principals have Kerberos keys and the target is a host name,
/// NTLM otherwise.
fn choose(realm: &LoopbackRealm, request: &InitiatorRequest, offered: &[MechanismId]) -> Option<MechanismId> {
    let kerberos_usable = offered.contains(&MechanismId::Kerberos)
        && !request.target_is_ip
        && realm.kerberos_key(&request.client).is_some()
        && realm.kerberos_key(&request.target).is_some();

    if kerberos_usable {
        return Some(MechanismId::Kerberos);
    }

    if offered.contains(&MechanismId::Ntlm) && realm.ntlm_key(&request.client).is_some() {
        debug!(target = %request.target, "Kerberos is not usable: falling back to NTLM");

        return Some(MechanismId::Ntlm);
    }

    None
}

#[derive(Debug)]
enum Inner {
    Kerberos(kerberos::Initiator),
    Ntlm(ntlm::Initiator),
}

impl Inner {
    fn start(mechanism: &MechanismId, realm: &LoopbackRealm, request: &InitiatorRequest) -> Rejected<(Self, Step)> {
        match mechanism {
            MechanismId::Kerberos => {
                let (initiator, step) = kerberos::Initiator::start(realm, request)?;
                Ok((Inner::Kerberos(initiator), step))
            }
            MechanismId::Ntlm => {
                let (initiator, step) = ntlm::Initiator::start(realm, request)?;
                Ok((Inner::Ntlm(initiator), step))
            }
            _ => Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM)),
        }
    }

    fn mechanism(&self) -> MechanismId {
        match self {
            Inner::Kerberos(_) => MechanismId::Kerberos,
            Inner::Ntlm(_) => MechanismId::Ntlm,
        }
    }

    fn step(&mut self, realm: &LoopbackRealm, input: &[u8]) -> Rejected<Step> {
        match self {
            Inner::Kerberos(initiator) => initiator.step(input),
            Inner::Ntlm(initiator) => initiator.step(realm, input),
        }
    }
}

#[derive(Debug)]
enum InitiatorState {
    Negotiating(Inner),
    /// The inner mechanism is done; waiting for `accept-completed`.
    AwaitCompletion(Session),
    Done,
}

#[derive(Debug)]
pub(super) struct Initiator {
    state: InitiatorState,
    offered: Vec<MechanismId>,
    request: InitiatorRequest,
}

impl Initiator {
    /// `hint` is the acceptor's unsolicited mechanism list, when it spoke first.
    pub(super) fn start(
        realm: &LoopbackRealm,
        request: InitiatorRequest,
        negotiable: &[MechanismId],
        hint: Option<&[u8]>,
    ) -> Rejected<(Self, Step)> {
        let mut offered: Vec<MechanismId> = negotiable.iter().filter(|m| !m.is_negotiating()).cloned().collect();

        if let Some(hint) = hint.filter(|hint| !hint.is_empty()) {
            let hint = NegTokenInit::decode(hint)?;
            offered.retain(|mechanism| hint.mechanisms.contains(mechanism));
        }

        let chosen = choose(realm, &request, &offered)
            .ok_or_else(|| Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM))?;
        offered.retain(|mechanism| *mechanism != chosen);
        offered.insert(0, chosen.clone());

        let (inner, step) = Inner::start(&chosen, realm, &request)?;
        let (state, token) = Self::after_inner_step(inner, step)?;

        let token = NegTokenInit {
            mechanisms: offered.clone(),
            token,
        }
        .encode()?;

        Ok((Self { state, offered, request }, Step::Continue(token)))
    }

    fn after_inner_step(inner: Inner, step: Step) -> Rejected<(InitiatorState, Vec<u8>)> {
        match step {
            Step::Continue(token) => Ok((InitiatorState::Negotiating(inner), token)),
            Step::Complete {
                output: Some(token),
                session,
            } => Ok((InitiatorState::AwaitCompletion(session), token)),
            // the inner mechanism has to send something before the acceptor can complete
            Step::Complete { output: None, .. } => Err(Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE)),
        }
    }

    pub(super) fn step(&mut self, realm: &LoopbackRealm, input: &[u8]) -> Rejected<Step> {
        let response = NegTokenResp::decode(input)?;
        let state = response.state.ok_or_else(Rejection::defective)?;

        if state == NegState::Reject {
            return Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM));
        }

        let current = match &self.state {
            InitiatorState::Negotiating(inner) => Some(inner.mechanism()),
            InitiatorState::AwaitCompletion(session) => Some(session.mechanism.clone()),
            InitiatorState::Done => None,
        };

        if let Some(selected) = response.mechanism.as_ref().filter(|m| Some(*m) != current.as_ref()) {
            if state != NegState::AcceptIncomplete || !self.offered.contains(selected) {
                return Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM));
            }

            debug!(mechanism = %selected, "acceptor selected another mechanism");

            let (inner, step) = Inner::start(selected, realm, &self.request)?;
            let (state, token) = Self::after_inner_step(inner, step)?;
            self.state = state;

            return Ok(Step::Continue(
                NegTokenResp::continuation(token).encode()?,
            ));
        }

        match mem::replace(&mut self.state, InitiatorState::Done) {
            InitiatorState::Negotiating(mut inner) => {
                match (state, inner.step(realm, &response.token)?) {
                    (NegState::AcceptIncomplete, step) => {
                        let (state, token) = Self::after_inner_step(inner, step)?;
                        self.state = state;

                        Ok(Step::Continue(
                            NegTokenResp::continuation(token).encode()?,
                        ))
                    }
                    // the acceptor's last inner token came with its completion
                    (_, Step::Complete { output: None, session }) => Ok(Step::Complete { output: None, session }),
                    _ => Err(Rejection::defective()),
                }
            }
            InitiatorState::AwaitCompletion(session) => {
                if state == NegState::AcceptCompleted && response.token.is_empty() {
                    Ok(Step::Complete { output: None, session })
                } else {
                    Err(Rejection::defective())
                }
            }
            InitiatorState::Done => Err(Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE)),
        }
    }
}

#[derive(Debug)]
enum AcceptorState {
    Start,
    /// A mechanism was selected but its first token is still to come.
    AwaitInitial(MechanismId),
    Ntlm(ntlm::Acceptor),
    Done,
}

#[derive(Debug)]
pub(super) struct Acceptor {
    state: AcceptorState,
    service: Option<String>,
    supported: Vec<MechanismId>,
}

impl Acceptor {
    pub(super) fn new(service: Option<String>, supported: Vec<MechanismId>) -> Self {
        Self {
            state: AcceptorState::Start,
            service,
            supported,
        }
    }

    pub(super) fn step(
        &mut self,
        realm: &LoopbackRealm,
        input: &[u8],
        bindings: Option<&ChannelBindings>,
    ) -> Rejected<Step> {
        match mem::replace(&mut self.state, AcceptorState::Done) {
            AcceptorState::Start if input.is_empty() => {
                // speak first: advertise what we accept
                self.state = AcceptorState::Start;

                let hint = NegTokenInit {
                    mechanisms: self.supported.clone(),
                    token: Vec::new(),
                };

                Ok(Step::Continue(hint.encode()?))
            }
            AcceptorState::Start => {
                let init = NegTokenInit::decode(input)?;

                let chosen = init
                    .mechanisms
                    .iter()
                    .find(|mechanism| self.supported.contains(mechanism))
                    .cloned()
                    .ok_or_else(|| Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM))?;

                if init.mechanisms.first() == Some(&chosen) && !init.token.is_empty() {
                    self.first_inner_token(realm, chosen.clone(), Some(chosen), &init.token, bindings)
                } else {
                    self.state = AcceptorState::AwaitInitial(chosen.clone());

                    Ok(Step::Continue(
                        NegTokenResp::new(NegState::AcceptIncomplete, Some(chosen), Vec::new()).encode()?,
                    ))
                }
            }
            AcceptorState::AwaitInitial(mechanism) => {
                let response = NegTokenResp::decode(input)?;

                self.first_inner_token(realm, mechanism, None, &response.token, bindings)
            }
            AcceptorState::Ntlm(mut acceptor) => {
                let response = NegTokenResp::decode(input)?;
                let session = acceptor.step(realm, &response.token, bindings)?;

                Ok(Step::Complete {
                    output: Some(NegTokenResp::new(NegState::AcceptCompleted, None, Vec::new()).encode()?),
                    session,
                })
            }
            AcceptorState::Done => Err(Rejection::new(RoutineError::Failure, minor::CONTEXT_STATE)),
        }
    }

    fn first_inner_token(
        &mut self,
        realm: &LoopbackRealm,
        mechanism: MechanismId,
        announced: Option<MechanismId>,
        token: &[u8],
        bindings: Option<&ChannelBindings>,
    ) -> Rejected<Step> {
        match mechanism {
            MechanismId::Kerberos => {
                let (output, session) = kerberos::accept(realm, self.service.as_deref(), token, bindings)?;

                Ok(Step::Complete {
                    output: Some(
                        NegTokenResp::new(NegState::AcceptCompleted, announced, output.unwrap_or_default()).encode()?,
                    ),
                    session,
                })
            }
            MechanismId::Ntlm => {
                let (acceptor, challenge) = ntlm::Acceptor::start(realm, self.service.as_deref(), token)?;
                self.state = AcceptorState::Ntlm(acceptor);

                Ok(Step::Continue(
                    NegTokenResp::new(NegState::AcceptIncomplete, announced, challenge).encode()?,
                ))
            }
            _ => Err(Rejection::new(RoutineError::BadMech, minor::NO_COMMON_MECHANISM)),
        }
    }
}
