use std::fmt;
use std::ptr::NonNull;

use cache_side_channel::{Command, Oracle, SideChannelError};

use crate::{
    command_id, TeecApi, TeecCall, TeecError, Uuid, TEEC_ERROR_BAD_STATE,
    TEEC_ERROR_OUT_OF_MEMORY, TEEC_MEM_INPUT, TEEC_MEM_OUTPUT, TEEC_ORIGIN_API,
};

/// Context, shared memory and session, acquired in that order by
/// [`TeeSession::open`] and released in reverse order on drop, including
/// when `open` fails halfway.
pub struct TeeSession<A: TeecApi> {
    api: A,
    context: Option<A::Context>,
    shared: Option<A::SharedMemory>,
    session: Option<A::Session>,
    buffer: NonNull<u8>,
    shared_size: usize,
    invocations: usize,
}

impl<A: TeecApi> TeeSession<A> {
    pub fn open(api: A, uuid: &Uuid, shared_size: usize) -> Result<Self, TeecError> {
        let mut s = TeeSession {
            api,
            context: None,
            shared: None,
            session: None,
            buffer: NonNull::dangling(),
            shared_size,
            invocations: 0,
        };

        let context = s.context.insert(s.api.initialize_context()?);
        let shared = s.shared.insert(s.api.allocate_shared_memory(
            context,
            shared_size,
            TEEC_MEM_INPUT | TEEC_MEM_OUTPUT,
        )?);
        s.buffer = s.api.shared_buffer(shared).ok_or_else(|| {
            TeecError::new(
                TeecCall::AllocateSharedMemory,
                TEEC_ERROR_OUT_OF_MEMORY,
                TEEC_ORIGIN_API,
            )
        })?;
        log::info!("Allocated {} bytes of shared memory", shared_size);

        s.session = Some(s.api.open_session(context, uuid)?);
        log::info!("Opened TEE session with {}", uuid);
        Ok(s)
    }

    /// Base of the shared buffer, valid for `shared_size` bytes while `self`
    /// lives.
    pub fn shared_buffer(&self) -> NonNull<u8> {
        self.buffer
    }

    pub fn shared_size(&self) -> usize {
        self.shared_size
    }

    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn invoke_command(&mut self, command_id: u32) -> Result<(), TeecError> {
        let (session, shared) = match (self.session.as_mut(), self.shared.as_mut()) {
            (Some(session), Some(shared)) => (session, shared),
            _ => {
                return Err(TeecError::new(
                    TeecCall::InvokeCommand,
                    TEEC_ERROR_BAD_STATE,
                    TEEC_ORIGIN_API,
                ))
            }
        };
        self.invocations += 1;
        self.api
            .invoke_command(session, command_id, shared, self.shared_size)
    }
}

impl<A: TeecApi> Oracle for TeeSession<A> {
    fn invoke(&mut self, command: Command) -> Result<(), SideChannelError> {
        self.invoke_command(command_id(command))
            .map_err(|e| SideChannelError::Oracle {
                command,
                code: e.code,
                origin: e.origin,
            })
    }
}

impl<A: TeecApi> Drop for TeeSession<A> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.api.close_session(session);
            log::info!("Closed TEE session after {} invocations", self.invocations);
        }
        if let Some(shared) = self.shared.take() {
            self.api.release_shared_memory(shared);
            log::debug!("Released {} bytes of shared memory", self.shared_size);
        }
        if let Some(context) = self.context.take() {
            self.api.finalize_context(context);
        }
    }
}

impl<A: TeecApi> fmt::Debug for TeeSession<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeSession")
            .field("buffer", &self.buffer)
            .field("shared_size", &self.shared_size)
            .field("open", &self.session.is_some())
            .field("invocations", &self.invocations)
            .finish()
    }
}
