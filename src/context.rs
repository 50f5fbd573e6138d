//! The negotiation state machine.
//!
//! A [`SecurityContext`] is driven one round at a time by the caller, who owns the transport:
//! `initiate`/`accept` take the peer's last token and return the token to send back.
//!
//! ```text
//! Idle -> Negotiating -> Established
//!   \          \
//!    `----------`-> Failed
//! ```
//!
//! Nothing leaves `Established` or `Failed`. A failure releases the provider context at once.

use std::fmt;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::buffer::{self, Token};
use crate::builders::{AcceptSecurityContext, FilledInitializeSecurityContext};
use crate::channel_bindings::ChannelBindings;
use crate::config::EmptyContinuePolicy;
use crate::credentials::CredentialHandle;
use crate::gss::GssShared;
use crate::mechanism::MechanismId;
use crate::name::PrincipalName;
use crate::provider::{AcceptSecContextCall, InitSecContextCall, Outcome, RawHandle, SecContextOutput};
use crate::registry::{kind, HandleKind, Owned};
use crate::status::CallSite;
use crate::{ContextFlags, Error, ErrorKind, Result, SecurityStatus};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Established,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextRole {
    Initiator,
    Acceptor,
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextRole::Initiator => f.write_str("initiator"),
            ContextRole::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Result of one negotiation round.
///
/// `output` is the token to send to the peer. It can be absent while `status` is
/// `ContinueNeeded` (the peer has to speak first). A present but empty token is kept as is in
/// both states: the mechanism produced a buffer and the peer expects the round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationStep {
    pub status: SecurityStatus,
    pub output: Option<Token>,
}

impl NegotiationStep {
    pub fn is_complete(&self) -> bool {
        self.status == SecurityStatus::Ok
    }
}

#[derive(Debug)]
pub struct SecurityContext {
    shared: Arc<GssShared>,
    role: ContextRole,
    state: NegotiationState,
    credential: Option<CredentialHandle>,
    target: Option<PrincipalName>,
    mechanism: MechanismId,
    negotiated_mechanism: Option<MechanismId>,
    requested_flags: ContextFlags,
    achieved_flags: ContextFlags,
    channel_bindings: Option<ChannelBindings>,
    lifetime: Option<u32>,
    handle: Option<Owned<kind::Context>>,
    destroyed: bool,
    peer_name: Option<String>,
    expiry: Option<OffsetDateTime>,
    rounds: u32,
}

impl SecurityContext {
    pub(crate) fn new_initiator(builder: FilledInitializeSecurityContext<'_>) -> Result<Self> {
        let FilledInitializeSecurityContext {
            shared,
            credential,
            target_name,
            context_requirements,
            mechanism,
            channel_bindings,
            lifetime,
            ..
        } = builder;

        let target = target_name.ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "missing target name"))?;

        if let Some(credential) = credential {
            credential.raw()?;

            if !credential.usage().can_initiate() {
                return Err(Error::new(
                    ErrorKind::InvalidParameter,
                    "the credential cannot be used to initiate contexts",
                ));
            }
        }

        let mut mechanism = mechanism
            .or_else(|| credential.map(|credential| credential.mechanism().clone()))
            .unwrap_or_else(|| shared.config.default_mechanism.into());
        shared.capabilities.ensure_supported(&mechanism)?;

        // Kerberos service tickets are issued for host names, never for addresses
        if mechanism.is_negotiating() && target.is_ip_address() {
            if shared.config.ntlm_fallback && shared.capabilities.is_ntlm_available() {
                debug!(target = %target, "target is an IP address: downgrading to NTLM");
                mechanism = MechanismId::Ntlm;
            } else {
                warn!(target = %target, "target is an IP address and NTLM fallback is not available");
            }
        }

        Ok(Self::new(
            shared,
            ContextRole::Initiator,
            credential.cloned(),
            Some(target),
            mechanism,
            context_requirements,
            channel_bindings,
            lifetime,
        ))
    }

    pub(crate) fn new_acceptor(builder: AcceptSecurityContext<'_>) -> Result<Self> {
        let AcceptSecurityContext {
            shared,
            credential,
            context_requirements,
            channel_bindings,
        } = builder;

        if let Some(credential) = credential {
            credential.raw()?;

            if !credential.usage().can_accept() {
                return Err(Error::new(
                    ErrorKind::InvalidParameter,
                    "the credential cannot be used to accept contexts",
                ));
            }
        }

        let mechanism = credential
            .map(|credential| credential.mechanism().clone())
            .unwrap_or_else(|| shared.config.default_mechanism.into());

        Ok(Self::new(
            shared,
            ContextRole::Acceptor,
            credential.cloned(),
            None,
            mechanism,
            context_requirements,
            channel_bindings,
            None,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        shared: Arc<GssShared>,
        role: ContextRole,
        credential: Option<CredentialHandle>,
        target: Option<PrincipalName>,
        mechanism: MechanismId,
        requested_flags: ContextFlags,
        channel_bindings: Option<ChannelBindings>,
        lifetime: Option<u32>,
    ) -> Self {
        Self {
            shared,
            role,
            state: NegotiationState::Idle,
            credential,
            target,
            mechanism,
            negotiated_mechanism: None,
            requested_flags,
            achieved_flags: ContextFlags::empty(),
            channel_bindings,
            lifetime,
            handle: None,
            destroyed: false,
            peer_name: None,
            expiry: None,
            rounds: 0,
        }
    }

    /// Runs one initiator round. Pass `None` on the first call and the acceptor's last token
    /// afterwards.
    #[instrument(level = "debug", skip_all, fields(mechanism = %self.mechanism, round = self.rounds + 1))]
    pub fn initiate(&mut self, input: Option<&[u8]>) -> Result<NegotiationStep> {
        self.ensure_role(ContextRole::Initiator)?;
        self.ensure_negotiable()?;

        let result = self.initiate_round(input);

        self.settle(result)
    }

    /// Runs one acceptor round with the initiator's last token. An empty first token asks a
    /// negotiating mechanism to speak first.
    #[instrument(level = "debug", skip_all, fields(mechanism = %self.mechanism, round = self.rounds + 1))]
    pub fn accept(&mut self, input: &[u8]) -> Result<NegotiationStep> {
        self.ensure_role(ContextRole::Acceptor)?;
        self.ensure_negotiable()?;

        let result = self.accept_round(input);

        self.settle(result)
    }

    fn initiate_round(&mut self, input: Option<&[u8]>) -> Result<NegotiationStep> {
        self.check_credential_expiry()?;
        self.begin();

        trace!(input_len = input.map(<[u8]>::len), "init_sec_context");

        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, "missing target name"))?
            .raw()?;

        let outcome = self.shared.provider.init_sec_context(InitSecContextCall {
            credential: self.credential.as_ref().map(CredentialHandle::raw).transpose()?,
            context: self.handle.as_ref().map(Owned::raw).transpose()?,
            target,
            mechanism: &self.mechanism,
            flags: self.requested_flags,
            lifetime: self.lifetime,
            channel_bindings: self.channel_bindings.as_ref(),
            input,
        });

        self.finish_round(outcome)
    }

    fn accept_round(&mut self, input: &[u8]) -> Result<NegotiationStep> {
        self.check_credential_expiry()?;
        self.begin();

        trace!(input_len = input.len(), "accept_sec_context");

        let outcome = self.shared.provider.accept_sec_context(AcceptSecContextCall {
            credential: self.credential.as_ref().map(CredentialHandle::raw).transpose()?,
            context: self.handle.as_ref().map(Owned::raw).transpose()?,
            channel_bindings: self.channel_bindings.as_ref(),
            input,
        });

        self.finish_round(outcome)
    }

    fn finish_round(&mut self, outcome: Outcome<SecContextOutput>) -> Result<NegotiationStep> {
        let Outcome { status, value: output } = outcome;
        let registry = Arc::clone(&self.shared.registry);

        // take ownership of everything the provider produced before looking at the status
        match output.context {
            Some(raw) => match &mut self.handle {
                Some(handle) => {
                    if handle.raw()? != raw {
                        handle.replace_raw(raw)?;
                    }
                }
                None => self.handle = Some(registry.adopt::<kind::Context>(raw)),
            },
            None => {
                // MIT and Heimdal delete the context on a failed round and hand back no handle
                if let Some(handle) = self.handle.take() {
                    debug!(role = %self.role, "the provider deleted the security context");

                    if let Err(err) = handle.forget() {
                        warn!(error = %err, "failed to forget the security context");
                    }
                }
            }
        }
        let source_name = output.source_name.map(|raw| registry.adopt::<kind::Name>(raw));
        let token = buffer::take_output_buffer(&registry, output.output);

        let reported_mechanism = output.mechanism.clone().unwrap_or_else(|| self.mechanism.clone());
        let status = match self.shared.translator().translate(
            CallSite::Negotiation,
            status.major,
            status.minor,
            Some(&reported_mechanism),
        ) {
            Ok(status) => status,
            Err(err) => {
                return Err(match token {
                    Ok(Some(token)) if !token.is_empty() => {
                        debug!(len = token.len(), "the provider produced an error token");

                        err.with_output_token(token.into_vec())
                    }
                    _ => err,
                })
            }
        };
        let token = token?;

        self.rounds += 1;

        match status {
            SecurityStatus::ContinueNeeded => match token {
                Some(token) => {
                    trace!(len = token.len(), "continue needed");

                    Ok(NegotiationStep {
                        status: SecurityStatus::ContinueNeeded,
                        output: Some(token),
                    })
                }
                None => match self.shared.config.empty_continue.for_mechanism(&self.mechanism) {
                    EmptyContinuePolicy::AwaitPeer => {
                        debug!("continue needed without an output token: waiting for the peer");

                        Ok(NegotiationStep {
                            status: SecurityStatus::ContinueNeeded,
                            output: None,
                        })
                    }
                    EmptyContinuePolicy::Reject => Err(Error::new(
                        ErrorKind::NegotiationFailed,
                        format!("{} asked for another round without producing a token", self.mechanism),
                    )),
                },
            },
            SecurityStatus::Ok => {
                self.establish(output, source_name)?;

                Ok(NegotiationStep {
                    status: SecurityStatus::Ok,
                    output: token,
                })
            }
        }
    }

    fn establish(&mut self, output: SecContextOutput, source_name: Option<Owned<kind::Name>>) -> Result<()> {
        let mut mechanism = output.mechanism;
        let mut flags = output.flags;
        let mut lifetime = output.lifetime;

        if mechanism.as_ref().map_or(true, MechanismId::is_negotiating) {
            let info = self.inquire()?;
            mechanism = info.mechanism.or(mechanism);
            flags |= info.flags;
            lifetime = lifetime.or(info.lifetime);
        }

        let mechanism = match mechanism {
            Some(mechanism) if !mechanism.is_negotiating() => mechanism,
            _ if !self.mechanism.is_negotiating() => self.mechanism.clone(),
            _ => {
                return Err(Error::new(
                    ErrorKind::NegotiationFailed,
                    "the GSS provider did not report the negotiated mechanism",
                ))
            }
        };

        self.peer_name = match (self.role, source_name) {
            (ContextRole::Acceptor, Some(name)) => {
                let display = self.shared.provider.display_name(name.raw()?);
                name.release()?;
                self.shared
                    .translator()
                    .translate(CallSite::Name, display.status.major, display.status.minor, None)?;

                display.value
            }
            (ContextRole::Acceptor, None) => None,
            (ContextRole::Initiator, _) => self.target.as_ref().map(|target| target.text().to_owned()),
        };

        self.achieved_flags = flags & self.requested_flags;
        self.expiry = lifetime.map(|seconds| OffsetDateTime::now_utc() + Duration::seconds(i64::from(seconds)));
        self.negotiated_mechanism = Some(mechanism);
        self.state = NegotiationState::Established;

        if self.requested_flags.contains(ContextFlags::MUTUAL) && !self.achieved_flags.contains(ContextFlags::MUTUAL) {
            warn!(role = %self.role, "mutual authentication was requested but not achieved");
        }

        debug!(
            role = %self.role,
            mechanism = ?self.negotiated_mechanism,
            flags = ?self.achieved_flags,
            peer = ?self.peer_name,
            rounds = self.rounds,
            "security context established"
        );

        Ok(())
    }

    fn inquire(&self) -> Result<crate::provider::ContextInfo> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::ContextNotEstablished, "no security context handle"))?;
        let outcome = self.shared.provider.inquire_context(handle.raw()?);

        self.shared
            .translator()
            .translate(CallSite::Query, outcome.status.major, outcome.status.minor, None)?;

        Ok(outcome.value.unwrap_or_default())
    }

    fn begin(&mut self) {
        if self.state == NegotiationState::Idle {
            debug!(role = %self.role, "Idle -> Negotiating");
            self.state = NegotiationState::Negotiating;
        }
    }

    fn check_credential_expiry(&self) -> Result<()> {
        match &self.credential {
            Some(credential) if credential.is_expired() => Err(Error::new(
                ErrorKind::ContextExpired,
                format!("the credential expired at {:?}", credential.expiry()),
            )),
            _ => Ok(()),
        }
    }

    fn ensure_role(&self, role: ContextRole) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("this context was created as an {}", self.role),
            ))
        }
    }

    fn ensure_negotiable(&self) -> Result<()> {
        self.ensure_not_destroyed()?;

        match self.state {
            NegotiationState::Idle | NegotiationState::Negotiating => Ok(()),
            NegotiationState::Established => Err(Error::new(
                ErrorKind::OutOfSequence,
                "the security context is already established",
            )),
            NegotiationState::Failed => Err(Error::new(
                ErrorKind::OutOfSequence,
                "the security context failed and cannot be reused",
            )),
        }
    }

    fn ensure_not_destroyed(&self) -> Result<()> {
        if self.destroyed {
            Err(Error::new(ErrorKind::InvalidHandle, "the security context was destroyed"))
        } else {
            Ok(())
        }
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fail(err);
        }

        result
    }

    /// Moves to `Failed` and releases the provider context.
    pub(crate) fn fail(&mut self, err: &Error) {
        debug!(role = %self.role, from = ?self.state, error = %err, "security context failed");

        self.state = NegotiationState::Failed;

        if let Some(handle) = self.handle.take() {
            if let Err(release_err) = handle.release() {
                warn!(error = %release_err, "failed to release the security context");
            }
        }
    }

    /// The provider context behind an established context.
    pub(crate) fn established_handle(&self) -> Result<RawHandle> {
        self.ensure_not_destroyed()?;

        if self.state != NegotiationState::Established {
            return Err(Error::new(
                ErrorKind::ContextNotEstablished,
                format!("the security context is {:?}", self.state),
            ));
        }

        if self.is_expired() {
            return Err(Error::new(ErrorKind::ContextExpired, "the security context expired"));
        }

        self.handle
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidHandle, "the security context was released"))?
            .raw()
    }

    pub(crate) fn shared(&self) -> &Arc<GssShared> {
        &self.shared
    }

    /// Releases the provider context. Destroying twice is an error.
    #[instrument(level = "debug", skip_all, fields(role = %self.role))]
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(self.shared.registry.report_double_release(HandleKind::Context));
        }

        self.destroyed = true;

        let released = self.handle.take().map(Owned::release).transpose();
        let target_released = self.target.take().map(PrincipalName::release).transpose();
        self.credential = None;

        debug!(state = ?self.state, "security context destroyed");

        released?;
        target_released?;

        Ok(())
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established && !self.destroyed
    }

    /// The mechanism in use: the requested one until the context is established, the
    /// concrete negotiated one afterwards.
    pub fn mechanism(&self) -> &MechanismId {
        self.negotiated_mechanism.as_ref().unwrap_or(&self.mechanism)
    }

    /// The concrete mechanism, known once the context is established.
    pub fn negotiated_mechanism(&self) -> Option<&MechanismId> {
        self.negotiated_mechanism.as_ref()
    }

    pub fn requested_flags(&self) -> ContextFlags {
        self.requested_flags
    }

    /// Empty until the context is established.
    pub fn achieved_flags(&self) -> ContextFlags {
        self.achieved_flags
    }

    /// The authenticated remote principal.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn expiry(&self) -> Option<OffsetDateTime> {
        self.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= OffsetDateTime::now_utc())
    }

    /// Number of completed negotiation rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}
