//! [`GssProvider`] backed by the system GSS-API library (MIT Kerberos, Heimdal or the macOS GSS
//! framework) through `libgssapi-sys`.
//!
//! Raw handles are the library's own pointers. Output buffers are boxed `gss_buffer_desc`s so
//! they can travel as a [`RawHandle`] until the registry releases them.
//!
//! Password credentials need `gss_acquire_cred_with_password`, which is an extension not every
//! library ships, so this provider reports them as unsupported.

use std::ffi::c_void;
use std::ptr;

use libgssapi_sys::{
    gss_OID, gss_OID_desc_struct, gss_OID_set, gss_OID_set_desc_struct, gss_accept_sec_context, gss_acquire_cred,
    gss_buffer_desc_struct, gss_channel_bindings_struct, gss_cred_id_struct, gss_ctx_id_struct,
    gss_delete_sec_context, gss_display_name, gss_display_status, gss_get_mic, gss_import_name, gss_indicate_mechs,
    gss_init_sec_context, gss_inquire_context, gss_name_struct, gss_release_buffer, gss_release_cred,
    gss_release_name, gss_release_oid_set, gss_unwrap, gss_verify_mic, gss_wrap, GSS_C_ACCEPT, GSS_C_BOTH,
    GSS_C_GSS_CODE, GSS_C_INITIATE, GSS_C_MECH_CODE, GSS_C_NT_HOSTBASED_SERVICE, GSS_C_NT_USER_NAME,
    GSS_C_QOP_DEFAULT, _GSS_C_INDEFINITE,
};
use oid::ObjectIdentifier;

use crate::buffer::{BufferType, SecurityBuffer};
use crate::channel_bindings::ChannelBindings;
use crate::credentials::CredentialUsage;
use crate::mechanism::{MechanismId, ProviderFamily};
use crate::name::NameType;
use crate::provider::{
    AcceptSecContextCall, AcquireCredRequest, AcquiredCredential, CallStatus, ContextInfo, GssProvider,
    InitSecContextCall, Outcome, RawHandle, SecContextOutput, StatusType,
};
use crate::status::RoutineError;
use crate::{ContextFlags, Secret};

/// `GSS_KRB5_NT_PRINCIPAL_NAME`, which not every library exports.
const NT_KRB5_PRINCIPAL_NAME: &str = "1.2.840.113554.1.2.2.1";

/// An OID whose contents outlive the descriptor handed to the library.
struct Oid(Vec<u8>);

impl Oid {
    fn of(mechanism: &MechanismId) -> Option<Self> {
        mechanism.to_der_content().ok().map(Self)
    }

    fn krb5_principal_name() -> Option<Self> {
        ObjectIdentifier::try_from(NT_KRB5_PRINCIPAL_NAME)
            .ok()
            .map(|oid| Self(Vec::from(&oid)))
    }

    fn desc(&mut self) -> gss_OID_desc_struct {
        gss_OID_desc_struct {
            length: self.0.len() as u32,
            elements: self.0.as_mut_ptr() as *mut c_void,
        }
    }
}

/// Reads an OID owned by the library.
///
/// # Safety
///
/// `oid` must be null or point to a valid `gss_OID_desc`.
unsafe fn mechanism_of(oid: gss_OID) -> Option<MechanismId> {
    if oid.is_null() {
        return None;
    }

    // SAFETY: checked for null, validity is guaranteed by the caller
    let oid = unsafe { &*oid };
    if oid.elements.is_null() {
        return None;
    }

    // SAFETY: the library hands out `length` bytes at `elements`
    let content = unsafe { std::slice::from_raw_parts(oid.elements as *const u8, oid.length as usize) };

    MechanismId::from_der_content(content).ok()
}

fn empty_buffer() -> gss_buffer_desc_struct {
    gss_buffer_desc_struct {
        length: 0,
        value: ptr::null_mut(),
    }
}

/// Borrows `data` for the duration of a call. The library never writes through input buffers.
fn input_buffer(data: &[u8]) -> gss_buffer_desc_struct {
    gss_buffer_desc_struct {
        length: data.len(),
        value: data.as_ptr() as *mut c_void,
    }
}

fn buffer_bytes(buffer: &gss_buffer_desc_struct) -> Vec<u8> {
    if buffer.value.is_null() || buffer.length == 0 {
        return Vec::new();
    }

    // SAFETY: a buffer filled by the library holds `length` bytes at `value`
    unsafe { std::slice::from_raw_parts(buffer.value as *const u8, buffer.length) }.to_vec()
}

fn release_buffer(buffer: &mut gss_buffer_desc_struct) -> CallStatus {
    let mut minor = 0;
    // SAFETY: the buffer was filled by the library or is empty
    let major = unsafe { gss_release_buffer(&mut minor, buffer) };

    CallStatus::new(major, minor)
}

/// Copies a library buffer and frees it.
fn take_bytes(mut buffer: gss_buffer_desc_struct) -> Vec<u8> {
    let bytes = buffer_bytes(&buffer);
    release_buffer(&mut buffer);

    bytes
}

/// Boxes a non-empty output buffer so it can be handed out as a raw handle.
fn buffer_handle(mut buffer: gss_buffer_desc_struct) -> Option<RawHandle> {
    if buffer.length == 0 {
        release_buffer(&mut buffer);
        return None;
    }

    Some(handle(Box::into_raw(Box::new(buffer))))
}

fn handle<T>(pointer: *mut T) -> RawHandle {
    RawHandle::from_raw(pointer as usize as u64)
}

fn non_null<T>(pointer: *mut T) -> Option<RawHandle> {
    (!pointer.is_null()).then(|| handle(pointer))
}

fn pointer<T>(handle: RawHandle) -> *mut T {
    handle.as_raw() as usize as *mut T
}

fn optional_pointer<T>(handle: Option<RawHandle>) -> *mut T {
    handle.map_or(ptr::null_mut(), pointer)
}

fn lifetime(time_rec: u32) -> Option<u32> {
    (time_rec != _GSS_C_INDEFINITE).then_some(time_rec)
}

fn requested_lifetime(lifetime: Option<u32>) -> u32 {
    lifetime.unwrap_or(_GSS_C_INDEFINITE)
}

fn usage(usage: CredentialUsage) -> i32 {
    (match usage {
        CredentialUsage::Initiate => GSS_C_INITIATE,
        CredentialUsage::Accept => GSS_C_ACCEPT,
        CredentialUsage::Both => GSS_C_BOTH,
    }) as i32
}

fn channel_bindings(bindings: &ChannelBindings) -> gss_channel_bindings_struct {
    gss_channel_bindings_struct {
        initiator_addrtype: bindings.initiator_addr_type,
        initiator_address: input_buffer(&bindings.initiator),
        acceptor_addrtype: bindings.acceptor_addr_type,
        acceptor_address: input_buffer(&bindings.acceptor),
        application_data: input_buffer(&bindings.application_data),
    }
}

fn unsupported() -> CallStatus {
    CallStatus::routine(RoutineError::Unavailable, 0)
}

/// The system GSS-API library.
#[derive(Debug, Clone)]
pub struct NativeProvider {
    family: ProviderFamily,
}

impl NativeProvider {
    pub fn new() -> Self {
        Self {
            family: ProviderFamily::native(),
        }
    }

    fn display(&self, name: *mut gss_name_struct) -> Option<String> {
        if name.is_null() {
            return None;
        }

        let mut minor = 0;
        let mut buffer = empty_buffer();
        // SAFETY: `name` is a live name handle
        let major = unsafe { gss_display_name(&mut minor, name, &mut buffer, ptr::null_mut()) };
        if major != 0 {
            return None;
        }

        String::from_utf8(take_bytes(buffer)).ok()
    }
}

impl Default for NativeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GssProvider for NativeProvider {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    fn supports_password_credentials(&self) -> bool {
        false
    }

    fn indicate_mechs(&self) -> Outcome<Vec<MechanismId>> {
        let mut minor = 0;
        let mut set: gss_OID_set = ptr::null_mut();

        // SAFETY: out-parameters only
        let major = unsafe { gss_indicate_mechs(&mut minor, &mut set) };
        if set.is_null() {
            return Outcome::failed(CallStatus::new(major, minor));
        }

        let mechanisms = {
            // SAFETY: a non-null set returned by the library
            let set: &gss_OID_set_desc_struct = unsafe { &*set };

            (0..set.count)
                // SAFETY: `elements` holds `count` OIDs
                .filter_map(|i| unsafe { mechanism_of(set.elements.add(i)) })
                .collect()
        };

        let mut release_minor = 0;
        // SAFETY: the set was allocated by gss_indicate_mechs
        unsafe { gss_release_oid_set(&mut release_minor, &mut set) };

        Outcome::new(CallStatus::new(major, minor), mechanisms)
    }

    fn import_name(&self, name: &str, name_type: NameType) -> Outcome<Option<RawHandle>> {
        let mut minor = 0;
        let mut buffer = input_buffer(name.as_bytes());
        let mut krb5_principal;
        let name_type: gss_OID = match name_type {
            // SAFETY: the name type OIDs are immutable statics of the library
            NameType::UserPrincipal => unsafe { GSS_C_NT_USER_NAME },
            NameType::HostBasedService => unsafe { GSS_C_NT_HOSTBASED_SERVICE },
            NameType::KerberosPrincipal => {
                let Some(mut oid) = Oid::krb5_principal_name() else {
                    return Outcome::failed(CallStatus::routine(RoutineError::BadNameType, 0));
                };
                krb5_principal = (oid.desc(), oid);

                &mut krb5_principal.0
            }
        };
        let mut output: *mut gss_name_struct = ptr::null_mut();

        // SAFETY: input buffers outlive the call
        let major = unsafe { gss_import_name(&mut minor, &mut buffer, name_type, &mut output) };

        Outcome::new(CallStatus::new(major, minor), non_null(output))
    }

    fn display_name(&self, name: RawHandle) -> Outcome<Option<String>> {
        match self.display(pointer(name)) {
            Some(text) => Outcome::complete(Some(text)),
            None => Outcome::failed(CallStatus::routine(RoutineError::BadName, 0)),
        }
    }

    fn release_name(&self, name: RawHandle) -> CallStatus {
        let mut minor = 0;
        let mut name = pointer::<gss_name_struct>(name);
        // SAFETY: the registry releases each handle once
        let major = unsafe { gss_release_name(&mut minor, &mut name) };

        CallStatus::new(major, minor)
    }

    fn acquire_cred(&self, request: &AcquireCredRequest<'_>) -> Outcome<Option<AcquiredCredential>> {
        let Some(mut mechanism) = Oid::of(request.mechanism) else {
            return Outcome::failed(CallStatus::routine(RoutineError::BadMech, 0));
        };
        let mut mechanism = mechanism.desc();
        let mut mechanisms = gss_OID_set_desc_struct {
            count: 1,
            elements: &mut mechanism,
        };

        let mut minor = 0;
        let mut credential: *mut gss_cred_id_struct = ptr::null_mut();
        let mut time_rec = 0;

        // SAFETY: input descriptors outlive the call
        let major = unsafe {
            gss_acquire_cred(
                &mut minor,
                optional_pointer(request.name),
                requested_lifetime(request.lifetime),
                &mut mechanisms,
                usage(request.usage),
                &mut credential,
                ptr::null_mut(),
                &mut time_rec,
            )
        };

        let acquired = non_null(credential).map(|handle| AcquiredCredential {
            handle,
            lifetime: lifetime(time_rec),
        });

        Outcome::new(CallStatus::new(major, minor), acquired)
    }

    fn acquire_cred_with_password(
        &self,
        _name: RawHandle,
        _password: &Secret<String>,
        _request: &AcquireCredRequest<'_>,
    ) -> Outcome<Option<AcquiredCredential>> {
        Outcome::failed(unsupported())
    }

    fn release_cred(&self, credential: RawHandle) -> CallStatus {
        let mut minor = 0;
        let mut credential = pointer::<gss_cred_id_struct>(credential);
        // SAFETY: the registry releases each handle once
        let major = unsafe { gss_release_cred(&mut minor, &mut credential) };

        CallStatus::new(major, minor)
    }

    fn init_sec_context(&self, call: InitSecContextCall<'_>) -> Outcome<SecContextOutput> {
        let Some(mut mechanism) = Oid::of(call.mechanism) else {
            return Outcome::failed(CallStatus::routine(RoutineError::BadMech, 0));
        };
        let mut mechanism = mechanism.desc();
        let mut bindings = call.channel_bindings.map(channel_bindings);
        let mut input = call.input.map(input_buffer);

        let mut minor = 0;
        let mut context = optional_pointer::<gss_ctx_id_struct>(call.context);
        let mut actual_mechanism: gss_OID = ptr::null_mut();
        let mut output = empty_buffer();
        let mut flags = 0;
        let mut time_rec = 0;

        // SAFETY: every input descriptor borrows data that outlives the call
        let major = unsafe {
            gss_init_sec_context(
                &mut minor,
                optional_pointer(call.credential),
                &mut context,
                pointer(call.target),
                &mut mechanism,
                call.flags.bits(),
                requested_lifetime(call.lifetime),
                bindings.as_mut().map_or(ptr::null_mut(), ptr::from_mut),
                input.as_mut().map_or(ptr::null_mut(), ptr::from_mut),
                &mut actual_mechanism,
                &mut output,
                &mut flags,
                &mut time_rec,
            )
        };

        trace!(major, minor, "gss_init_sec_context");

        Outcome::new(
            CallStatus::new(major, minor),
            SecContextOutput {
                context: non_null(context),
                output: buffer_handle(output),
                // SAFETY: mechanism OIDs returned by the library are static
                mechanism: unsafe { mechanism_of(actual_mechanism) },
                flags: ContextFlags::from_bits_truncate(flags),
                lifetime: lifetime(time_rec),
                source_name: None,
            },
        )
    }

    fn accept_sec_context(&self, call: AcceptSecContextCall<'_>) -> Outcome<SecContextOutput> {
        let mut bindings = call.channel_bindings.map(channel_bindings);
        let mut input = input_buffer(call.input);

        let mut minor = 0;
        let mut context = optional_pointer::<gss_ctx_id_struct>(call.context);
        let mut source_name: *mut gss_name_struct = ptr::null_mut();
        let mut mechanism: gss_OID = ptr::null_mut();
        let mut output = empty_buffer();
        let mut flags = 0;
        let mut time_rec = 0;

        // SAFETY: every input descriptor borrows data that outlives the call
        let major = unsafe {
            gss_accept_sec_context(
                &mut minor,
                &mut context,
                optional_pointer(call.credential),
                &mut input,
                bindings.as_mut().map_or(ptr::null_mut(), ptr::from_mut),
                &mut source_name,
                &mut mechanism,
                &mut output,
                &mut flags,
                &mut time_rec,
                ptr::null_mut(),
            )
        };

        trace!(major, minor, "gss_accept_sec_context");

        Outcome::new(
            CallStatus::new(major, minor),
            SecContextOutput {
                context: non_null(context),
                output: buffer_handle(output),
                // SAFETY: mechanism OIDs returned by the library are static
                mechanism: unsafe { mechanism_of(mechanism) },
                flags: ContextFlags::from_bits_truncate(flags),
                lifetime: lifetime(time_rec),
                source_name: non_null(source_name),
            },
        )
    }

    fn delete_sec_context(&self, context: RawHandle) -> CallStatus {
        let mut minor = 0;
        let mut context = pointer::<gss_ctx_id_struct>(context);
        // SAFETY: the registry releases each handle once
        let major = unsafe { gss_delete_sec_context(&mut minor, &mut context, ptr::null_mut()) };

        CallStatus::new(major, minor)
    }

    fn inquire_context(&self, context: RawHandle) -> Outcome<Option<ContextInfo>> {
        let mut minor = 0;
        let mut source: *mut gss_name_struct = ptr::null_mut();
        let mut target: *mut gss_name_struct = ptr::null_mut();
        let mut time_rec = 0;
        let mut mechanism: gss_OID = ptr::null_mut();
        let mut flags = 0;
        let mut locally_initiated = 0;
        let mut open = 0;

        // SAFETY: out-parameters only
        let major = unsafe {
            gss_inquire_context(
                &mut minor,
                pointer(context),
                &mut source,
                &mut target,
                &mut time_rec,
                &mut mechanism,
                &mut flags,
                &mut locally_initiated,
                &mut open,
            )
        };

        let info = ContextInfo {
            source: self.display(source),
            target: self.display(target),
            // SAFETY: mechanism OIDs returned by the library are static
            mechanism: unsafe { mechanism_of(mechanism) },
            flags: ContextFlags::from_bits_truncate(flags),
            lifetime: lifetime(time_rec),
            locally_initiated: locally_initiated != 0,
            open: open != 0,
        };

        for mut name in [source, target] {
            if !name.is_null() {
                let mut release_minor = 0;
                // SAFETY: names allocated by gss_inquire_context
                unsafe { gss_release_name(&mut release_minor, &mut name) };
            }
        }

        Outcome::new(CallStatus::new(major, minor), Some(info))
    }

    fn wrap(&self, context: RawHandle, confidentiality: bool, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        let Ok(data) = SecurityBuffer::find_buffer_mut(message, BufferType::Data) else {
            return Outcome::failed(CallStatus::routine(RoutineError::Failure, 0));
        };

        let mut minor = 0;
        let mut input = input_buffer(&data.buffer);
        let mut output = empty_buffer();
        let mut conf_state = 0;

        // SAFETY: the input buffer outlives the call
        let major = unsafe {
            gss_wrap(
                &mut minor,
                pointer(context),
                i32::from(confidentiality),
                GSS_C_QOP_DEFAULT,
                &mut input,
                &mut conf_state,
                &mut output,
            )
        };

        // the library produces one token; it travels in the data buffer
        data.buffer = take_bytes(output);
        if let Ok(token) = SecurityBuffer::find_buffer_mut(message, BufferType::Token) {
            token.buffer.clear();
        }

        Outcome::new(CallStatus::new(major, minor), conf_state != 0)
    }

    fn unwrap(&self, context: RawHandle, message: &mut [SecurityBuffer]) -> Outcome<bool> {
        let token = SecurityBuffer::find_buffer(message, BufferType::Token)
            .map(|token| token.buffer.clone())
            .unwrap_or_default();
        let Ok(data) = SecurityBuffer::find_buffer_mut(message, BufferType::Data) else {
            return Outcome::failed(CallStatus::routine(RoutineError::DefectiveToken, 0));
        };

        let wrapped = [token.as_slice(), data.buffer.as_slice()].concat();
        let mut minor = 0;
        let mut input = input_buffer(&wrapped);
        let mut output = empty_buffer();
        let mut conf_state = 0;

        // SAFETY: the input buffer outlives the call
        let major = unsafe {
            gss_unwrap(
                &mut minor,
                pointer(context),
                &mut input,
                &mut output,
                &mut conf_state,
                ptr::null_mut(),
            )
        };

        data.buffer = take_bytes(output);

        Outcome::new(CallStatus::new(major, minor), conf_state != 0)
    }

    fn get_mic(&self, context: RawHandle, message: &[u8]) -> Outcome<Option<RawHandle>> {
        let mut minor = 0;
        let mut input = input_buffer(message);
        let mut mic = empty_buffer();

        // SAFETY: the input buffer outlives the call
        let major = unsafe { gss_get_mic(&mut minor, pointer(context), GSS_C_QOP_DEFAULT, &mut input, &mut mic) };

        Outcome::new(CallStatus::new(major, minor), buffer_handle(mic))
    }

    fn verify_mic(&self, context: RawHandle, message: &[u8], mic: &[u8]) -> CallStatus {
        let mut minor = 0;
        let mut message = input_buffer(message);
        let mut mic = input_buffer(mic);

        // SAFETY: the input buffers outlive the call
        let major =
            unsafe { gss_verify_mic(&mut minor, pointer(context), &mut message, &mut mic, ptr::null_mut()) };

        CallStatus::new(major, minor)
    }

    fn buffer_contents(&self, buffer: RawHandle) -> Outcome<Vec<u8>> {
        // SAFETY: buffer handles are boxed descriptors from `buffer_handle`
        let buffer = unsafe { &*pointer::<gss_buffer_desc_struct>(buffer) };

        Outcome::complete(buffer_bytes(buffer))
    }

    fn release_buffer(&self, buffer: RawHandle) -> CallStatus {
        // SAFETY: buffer handles are boxed descriptors from `buffer_handle`, released once
        let mut buffer = unsafe { Box::from_raw(pointer::<gss_buffer_desc_struct>(buffer)) };

        release_buffer(&mut buffer)
    }

    fn display_status(&self, code: u32, status_type: StatusType, mechanism: Option<&MechanismId>) -> String {
        let status_type = (match status_type {
            StatusType::Gss => GSS_C_GSS_CODE,
            StatusType::Mechanism => GSS_C_MECH_CODE,
        }) as i32;
        let mut mechanism = mechanism.and_then(Oid::of);
        let mut mechanism = mechanism.as_mut().map(Oid::desc);

        let mut messages = Vec::new();
        let mut message_context = 0;

        loop {
            let mut minor = 0;
            let mut text = empty_buffer();

            // SAFETY: the mechanism descriptor outlives the call
            let major = unsafe {
                gss_display_status(
                    &mut minor,
                    code,
                    status_type,
                    mechanism.as_mut().map_or(ptr::null_mut(), ptr::from_mut),
                    &mut message_context,
                    &mut text,
                )
            };
            if major != 0 {
                break;
            }

            messages.push(String::from_utf8_lossy(&take_bytes(text)).into_owned());

            if message_context == 0 {
                break;
            }
        }

        if messages.is_empty() {
            format!("unknown status {:#x}", code)
        } else {
            messages.join("; ")
        }
    }
}
