//! OP-TEE `libteec` bindings.
//!
//! Every handle is boxed: libteec keeps pointers to the context and shared
//! memory structures, so they must not move between calls.

// Layouts follow tee_client_api.h; most fields are only read by libteec.
#![allow(non_snake_case, dead_code)]

use std::mem;
use std::ptr::{self, NonNull};

use libc::{c_char, c_int, c_void, size_t};

use crate::{
    param_types, TeecApi, TeecCall, TeecError, Uuid, TEEC_LOGIN_PUBLIC,
    TEEC_MEMREF_PARTIAL_INOUT, TEEC_NONE, TEEC_ORIGIN_API, TEEC_SUCCESS,
};

#[repr(C)]
pub struct TeecContext {
    fd: c_int,
    reg_mem: bool,
    memref_null: bool,
}

#[repr(C)]
struct TeecUuid {
    time_low: u32,
    time_mid: u16,
    time_hi_and_version: u16,
    clock_seq_and_node: [u8; 8],
}

impl From<&Uuid> for TeecUuid {
    fn from(uuid: &Uuid) -> Self {
        TeecUuid {
            time_low: uuid.time_low,
            time_mid: uuid.time_mid,
            time_hi_and_version: uuid.time_hi_and_version,
            clock_seq_and_node: uuid.clock_seq_and_node,
        }
    }
}

#[repr(C)]
pub struct TeecSharedMemory {
    buffer: *mut c_void,
    size: size_t,
    flags: u32,
    id: c_int,
    alloced_size: size_t,
    shadow_buffer: *mut c_void,
    registered_fd: c_int,
    internal: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TeecTempMemoryReference {
    buffer: *mut c_void,
    size: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TeecRegisteredMemoryReference {
    parent: *mut TeecSharedMemory,
    size: size_t,
    offset: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TeecValue {
    a: u32,
    b: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union TeecParameter {
    tmpref: TeecTempMemoryReference,
    memref: TeecRegisteredMemoryReference,
    value: TeecValue,
}

#[repr(C)]
pub struct TeecSession {
    ctx: *mut TeecContext,
    session_id: u32,
}

#[repr(C)]
struct TeecOperation {
    started: u32,
    param_types: u32,
    params: [TeecParameter; 4],
    session: *mut TeecSession,
}

#[link(name = "teec")]
extern "C" {
    fn TEEC_InitializeContext(name: *const c_char, context: *mut TeecContext) -> u32;
    fn TEEC_FinalizeContext(context: *mut TeecContext);
    fn TEEC_AllocateSharedMemory(context: *mut TeecContext, shared: *mut TeecSharedMemory)
        -> u32;
    fn TEEC_ReleaseSharedMemory(shared: *mut TeecSharedMemory);
    fn TEEC_OpenSession(
        context: *mut TeecContext,
        session: *mut TeecSession,
        destination: *const TeecUuid,
        connection_method: u32,
        connection_data: *const c_void,
        operation: *mut TeecOperation,
        return_origin: *mut u32,
    ) -> u32;
    fn TEEC_CloseSession(session: *mut TeecSession);
    fn TEEC_InvokeCommand(
        session: *mut TeecSession,
        command_id: u32,
        operation: *mut TeecOperation,
        return_origin: *mut u32,
    ) -> u32;
}

fn check(call: TeecCall, code: u32, origin: u32) -> Result<(), TeecError> {
    if code == TEEC_SUCCESS {
        Ok(())
    } else {
        Err(TeecError::new(call, code, origin))
    }
}

/// The system's libteec, talking to the OP-TEE driver.
#[derive(Debug, Default)]
pub struct LibTeec;

impl TeecApi for LibTeec {
    type Context = Box<TeecContext>;
    type SharedMemory = Box<TeecSharedMemory>;
    type Session = Box<TeecSession>;

    fn initialize_context(&mut self) -> Result<Box<TeecContext>, TeecError> {
        // All fields are integers, booleans or pointers: zero is a valid value.
        let mut context: Box<TeecContext> = Box::new(unsafe { mem::zeroed() });
        let code = unsafe { TEEC_InitializeContext(ptr::null(), &mut *context) };
        check(TeecCall::InitializeContext, code, TEEC_ORIGIN_API)?;
        Ok(context)
    }

    fn allocate_shared_memory(
        &mut self,
        context: &mut Box<TeecContext>,
        size: usize,
        flags: u32,
    ) -> Result<Box<TeecSharedMemory>, TeecError> {
        let mut shared: Box<TeecSharedMemory> = Box::new(unsafe { mem::zeroed() });
        shared.size = size;
        shared.flags = flags;
        let code = unsafe { TEEC_AllocateSharedMemory(&mut **context, &mut *shared) };
        check(TeecCall::AllocateSharedMemory, code, TEEC_ORIGIN_API)?;
        Ok(shared)
    }

    fn shared_buffer(&self, shared: &Box<TeecSharedMemory>) -> Option<NonNull<u8>> {
        NonNull::new(shared.buffer as *mut u8)
    }

    fn open_session(
        &mut self,
        context: &mut Box<TeecContext>,
        uuid: &Uuid,
    ) -> Result<Box<TeecSession>, TeecError> {
        let mut session: Box<TeecSession> = Box::new(unsafe { mem::zeroed() });
        let destination = TeecUuid::from(uuid);
        let mut origin = 0;
        let code = unsafe {
            TEEC_OpenSession(
                &mut **context,
                &mut *session,
                &destination,
                TEEC_LOGIN_PUBLIC,
                ptr::null(),
                ptr::null_mut(),
                &mut origin,
            )
        };
        check(TeecCall::OpenSession, code, origin)?;
        Ok(session)
    }

    fn invoke_command(
        &mut self,
        session: &mut Box<TeecSession>,
        command_id: u32,
        shared: &mut Box<TeecSharedMemory>,
        size: usize,
    ) -> Result<(), TeecError> {
        let mut operation: TeecOperation = unsafe { mem::zeroed() };
        operation.param_types =
            param_types(TEEC_MEMREF_PARTIAL_INOUT, TEEC_NONE, TEEC_NONE, TEEC_NONE);
        operation.params[0].memref = TeecRegisteredMemoryReference {
            parent: &mut **shared,
            size,
            offset: 0,
        };
        let mut origin = 0;
        let code =
            unsafe { TEEC_InvokeCommand(&mut **session, command_id, &mut operation, &mut origin) };
        check(TeecCall::InvokeCommand, code, origin)
    }

    fn close_session(&mut self, mut session: Box<TeecSession>) {
        unsafe { TEEC_CloseSession(&mut *session) };
    }

    fn release_shared_memory(&mut self, mut shared: Box<TeecSharedMemory>) {
        unsafe { TEEC_ReleaseSharedMemory(&mut *shared) };
    }

    fn finalize_context(&mut self, mut context: Box<TeecContext>) {
        unsafe { TEEC_FinalizeContext(&mut *context) };
    }
}
