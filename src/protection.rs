//! Per-message protection under an established [`SecurityContext`].
//!
//! Precondition errors (`ContextNotEstablished`, `ConfidentialityUnavailable`) leave the context
//! untouched. Anything the provider rejects fails the context.

use crate::buffer::{self, BufferType, ProtectedMessage, SecurityBuffer, Token};
use crate::context::SecurityContext;
use crate::provider::RawHandle;
use crate::status::CallSite;
use crate::{ContextFlags, Error, ErrorKind, Result};

/// Plaintext recovered by [`SecurityContext::unwrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwrappedMessage {
    pub plaintext: Vec<u8>,
    pub confidentiality_used: bool,
}

impl SecurityContext {
    /// Protects `plaintext` for the peer: encrypted and signed with `confidentiality`, only
    /// signed otherwise.
    #[instrument(level = "debug", skip_all, fields(len = plaintext.len(), confidentiality))]
    pub fn wrap(&mut self, plaintext: &[u8], confidentiality: bool) -> Result<ProtectedMessage> {
        let context = self.established_handle()?;

        if confidentiality && !self.achieved_flags().contains(ContextFlags::CONFIDENTIALITY) {
            return Err(Error::new(
                ErrorKind::ConfidentialityUnavailable,
                "confidentiality was not negotiated for this context",
            ));
        }

        let result = self.wrap_with(context, plaintext, confidentiality);

        self.terminate_on_error(result)
    }

    /// Verifies and, when it was encrypted, decrypts a message produced by the peer's `wrap`.
    #[instrument(level = "debug", skip_all, fields(len = message.as_bytes().len()))]
    pub fn unwrap(&mut self, message: &ProtectedMessage) -> Result<UnwrappedMessage> {
        let context = self.established_handle()?;

        let result = self.unwrap_with(context, message);

        self.terminate_on_error(result)
    }

    /// Computes a detached integrity token over `message`.
    #[instrument(level = "debug", skip_all, fields(len = message.len()))]
    pub fn get_mic(&mut self, message: &[u8]) -> Result<Token> {
        let context = self.established_handle()?;

        let result = self.get_mic_with(context, message);

        self.terminate_on_error(result)
    }

    #[instrument(level = "debug", skip_all, fields(len = message.len(), mic_len = mic.len()))]
    pub fn verify_mic(&mut self, message: &[u8], mic: &[u8]) -> Result<()> {
        let context = self.established_handle()?;

        let status = self.shared().provider.verify_mic(context, message, mic);
        let result = self
            .shared()
            .translator()
            .translate(CallSite::Protection, status.major, status.minor, self.negotiated_mechanism())
            .map(|_| ());

        self.terminate_on_error(result)
    }

    fn wrap_with(&self, context: RawHandle, plaintext: &[u8], confidentiality: bool) -> Result<ProtectedMessage> {
        let mut buffers = buffer::wrap_input(plaintext);

        let outcome = self.shared().provider.wrap(context, confidentiality, &mut buffers);
        self.shared().translator().translate(
            CallSite::Protection,
            outcome.status.major,
            outcome.status.minor,
            self.negotiated_mechanism(),
        )?;

        if confidentiality && !outcome.value {
            return Err(Error::new(
                ErrorKind::ConfidentialityUnavailable,
                "the GSS provider did not encrypt the message",
            ));
        }

        let message = ProtectedMessage::from_wrap_output(&buffers)?;
        trace!(protected_len = message.as_bytes().len(), "wrapped message");

        Ok(message)
    }

    fn unwrap_with(&self, context: RawHandle, message: &ProtectedMessage) -> Result<UnwrappedMessage> {
        let mut buffers = message.to_unwrap_input().map_err(|err| {
            Error::new(
                ErrorKind::IntegrityViolation,
                format!("malformed protected message: {}", err.description),
            )
        })?;

        let outcome = self.shared().provider.unwrap(context, &mut buffers);
        self.shared().translator().translate(
            CallSite::Protection,
            outcome.status.major,
            outcome.status.minor,
            self.negotiated_mechanism(),
        )?;

        let plaintext = buffers
            .into_iter()
            .find(|buffer| buffer.buffer_type == BufferType::Data)
            .map(|SecurityBuffer { buffer, .. }| buffer)
            .ok_or_else(|| Error::new(ErrorKind::InternalError, "the GSS provider dropped the data buffer"))?;

        Ok(UnwrappedMessage {
            plaintext,
            confidentiality_used: outcome.value,
        })
    }

    fn get_mic_with(&self, context: RawHandle, message: &[u8]) -> Result<Token> {
        let outcome = self.shared().provider.get_mic(context, message);
        let mic = buffer::take_output_buffer(&self.shared().registry, outcome.value);

        self.shared().translator().translate(
            CallSite::Protection,
            outcome.status.major,
            outcome.status.minor,
            self.negotiated_mechanism(),
        )?;

        mic?.ok_or_else(|| Error::new(ErrorKind::InternalError, "the GSS provider produced no MIC"))
    }

    fn terminate_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fail(err);
        }

        result
    }
}
