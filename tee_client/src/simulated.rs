//! In-process stand-in for the security test trusted application.
//!
//! The "TEE" runs on the observer's own core and shares its caches, so the
//! techniques see real timing differences without any secure world.

use std::ptr::NonNull;

use cache_utils::maccess;
use cache_utils::mmap::MMappedMemory;
use cache_utils::timing::ObservationSink;

use crate::{
    TeecApi, TeecCall, TeecError, Uuid, CMD_ACCESS_INTERNAL_MEMORY, CMD_DO_NOTHING,
    CMD_READ_SHARED_MEMORY, TEEC_ERROR_BAD_PARAMETERS, TEEC_ERROR_ITEM_NOT_FOUND,
    TEEC_ERROR_OUT_OF_MEMORY, TEEC_MEM_INPUT, TEEC_MEM_OUTPUT, TEEC_ORIGIN_API,
    TEEC_ORIGIN_TEE, TEEC_ORIGIN_TRUSTED_APP,
};

#[derive(Debug)]
pub struct SimulatedTeec {
    uuid: Uuid,
    internal_size: usize,
    line_size: usize,
    sink: ObservationSink,
}

#[derive(Debug)]
pub struct SimulatedContext;

pub struct SimulatedSession {
    internal: MMappedMemory<u8>,
}

impl SimulatedTeec {
    /// A trusted application answering to `uuid`, with an internal working
    /// set of `internal_size` bytes read line by line.
    pub fn new(uuid: Uuid, internal_size: usize, line_size: usize) -> Self {
        assert_ne!(line_size, 0);
        SimulatedTeec {
            uuid,
            internal_size,
            line_size,
            sink: ObservationSink::default(),
        }
    }

    /// Sum of every byte the application has read.
    pub fn observed(&self) -> u64 {
        self.sink.value()
    }
}

impl TeecApi for SimulatedTeec {
    type Context = SimulatedContext;
    type SharedMemory = MMappedMemory<u8>;
    type Session = SimulatedSession;

    fn initialize_context(&mut self) -> Result<SimulatedContext, TeecError> {
        Ok(SimulatedContext)
    }

    fn allocate_shared_memory(
        &mut self,
        _context: &mut SimulatedContext,
        size: usize,
        flags: u32,
    ) -> Result<MMappedMemory<u8>, TeecError> {
        let call = TeecCall::AllocateSharedMemory;
        if size == 0 || flags & !(TEEC_MEM_INPUT | TEEC_MEM_OUTPUT) != 0 {
            return Err(TeecError::new(call, TEEC_ERROR_BAD_PARAMETERS, TEEC_ORIGIN_API));
        }
        MMappedMemory::try_new(size, |_| 0u8).map_err(|e| {
            log::warn!("simulated shared memory: {}", e);
            TeecError::new(call, TEEC_ERROR_OUT_OF_MEMORY, TEEC_ORIGIN_API)
        })
    }

    fn shared_buffer(&self, shared: &MMappedMemory<u8>) -> Option<NonNull<u8>> {
        Some(shared.non_null())
    }

    fn open_session(
        &mut self,
        _context: &mut SimulatedContext,
        uuid: &Uuid,
    ) -> Result<SimulatedSession, TeecError> {
        let call = TeecCall::OpenSession;
        if *uuid != self.uuid {
            return Err(TeecError::new(call, TEEC_ERROR_ITEM_NOT_FOUND, TEEC_ORIGIN_TEE));
        }
        let internal = MMappedMemory::try_new(self.internal_size, |i| i as u8)
            .map_err(|_| TeecError::new(call, TEEC_ERROR_OUT_OF_MEMORY, TEEC_ORIGIN_TEE))?;
        Ok(SimulatedSession { internal })
    }

    fn invoke_command(
        &mut self,
        session: &mut SimulatedSession,
        command_id: u32,
        shared: &mut MMappedMemory<u8>,
        size: usize,
    ) -> Result<(), TeecError> {
        let call = TeecCall::InvokeCommand;
        if size == 0 || size > shared.len() {
            return Err(TeecError::new(call, TEEC_ERROR_BAD_PARAMETERS, TEEC_ORIGIN_API));
        }
        match command_id {
            CMD_DO_NOTHING => {}
            CMD_READ_SHARED_MEMORY => {
                self.sink.observe(unsafe { maccess(shared.as_ptr()) });
            }
            CMD_ACCESS_INTERNAL_MEMORY => {
                let base = session.internal.as_ptr();
                for offset in (0..session.internal.len()).step_by(self.line_size) {
                    self.sink.observe(unsafe { maccess(base.add(offset)) });
                }
            }
            _ => {
                return Err(TeecError::new(
                    call,
                    TEEC_ERROR_BAD_PARAMETERS,
                    TEEC_ORIGIN_TRUSTED_APP,
                ))
            }
        }
        Ok(())
    }

    fn close_session(&mut self, _session: SimulatedSession) {}

    fn release_shared_memory(&mut self, _shared: MMappedMemory<u8>) {}

    fn finalize_context(&mut self, _context: SimulatedContext) {}
}
