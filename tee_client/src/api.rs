use std::ptr::NonNull;

use crate::{TeecError, Uuid};

/// The TEE client calls used by the observer.
///
/// Handles are owned values: whoever holds one is responsible for handing it
/// back to the matching release call, which [`crate::TeeSession`] does.
pub trait TeecApi {
    type Context;
    type SharedMemory;
    type Session;

    fn initialize_context(&mut self) -> Result<Self::Context, TeecError>;

    /// `flags` is a combination of `TEEC_MEM_INPUT` and `TEEC_MEM_OUTPUT`.
    fn allocate_shared_memory(
        &mut self,
        context: &mut Self::Context,
        size: usize,
        flags: u32,
    ) -> Result<Self::SharedMemory, TeecError>;

    /// Base of the block in the observer's address space.
    fn shared_buffer(&self, shared: &Self::SharedMemory) -> Option<NonNull<u8>>;

    fn open_session(
        &mut self,
        context: &mut Self::Context,
        uuid: &Uuid,
    ) -> Result<Self::Session, TeecError>;

    /// Synchronous invocation with the first `size` bytes of `shared` passed
    /// as a partial input/output memory reference.
    fn invoke_command(
        &mut self,
        session: &mut Self::Session,
        command_id: u32,
        shared: &mut Self::SharedMemory,
        size: usize,
    ) -> Result<(), TeecError>;

    fn close_session(&mut self, session: Self::Session);
    fn release_shared_memory(&mut self, shared: Self::SharedMemory);
    fn finalize_context(&mut self, context: Self::Context);
}

impl<A: TeecApi + ?Sized> TeecApi for &mut A {
    type Context = A::Context;
    type SharedMemory = A::SharedMemory;
    type Session = A::Session;

    fn initialize_context(&mut self) -> Result<Self::Context, TeecError> {
        (**self).initialize_context()
    }

    fn allocate_shared_memory(
        &mut self,
        context: &mut Self::Context,
        size: usize,
        flags: u32,
    ) -> Result<Self::SharedMemory, TeecError> {
        (**self).allocate_shared_memory(context, size, flags)
    }

    fn shared_buffer(&self, shared: &Self::SharedMemory) -> Option<NonNull<u8>> {
        (**self).shared_buffer(shared)
    }

    fn open_session(
        &mut self,
        context: &mut Self::Context,
        uuid: &Uuid,
    ) -> Result<Self::Session, TeecError> {
        (**self).open_session(context, uuid)
    }

    fn invoke_command(
        &mut self,
        session: &mut Self::Session,
        command_id: u32,
        shared: &mut Self::SharedMemory,
        size: usize,
    ) -> Result<(), TeecError> {
        (**self).invoke_command(session, command_id, shared, size)
    }

    fn close_session(&mut self, session: Self::Session) {
        (**self).close_session(session)
    }

    fn release_shared_memory(&mut self, shared: Self::SharedMemory) {
        (**self).release_shared_memory(shared)
    }

    fn finalize_context(&mut self, context: Self::Context) {
        (**self).finalize_context(context)
    }
}
