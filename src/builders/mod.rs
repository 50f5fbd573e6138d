//! Builders for the operations that take many optional parameters.
//!
//! Required parameters are tracked in the type: `execute`/`build` only exist once every
//! required setter has been called.

mod accept_sec_context;
mod acq_cred_handle;
mod init_sec_context;

use std::fmt;

pub use self::accept_sec_context::AcceptSecurityContext;
pub use self::acq_cred_handle::{
    AcquireCredential, AcquireCredentialResult, EmptyAcquireCredential, FilledAcquireCredential,
    WithCredentialUse, WithoutCredentialUse,
};
pub use self::init_sec_context::{
    EmptyInitializeSecurityContext, FilledInitializeSecurityContext, InitializeSecurityContext, WithTargetName,
    WithoutTargetName,
};

pub trait ToAssign: fmt::Debug {}
pub trait Assigned: ToAssign {}
pub trait NotAssigned: ToAssign {}
