#![deny(unsafe_op_in_unsafe_fn)]

//! Normal world side of the TEE boundary.
//!
//! [`TeecApi`] mirrors the GlobalPlatform TEE client calls the observer needs,
//! [`TeeSession`] owns one context, one shared memory block and one session
//! and releases them in reverse order when dropped.

use cache_side_channel::Command;
use std::fmt;
use std::str::FromStr;

pub mod api;
#[cfg(feature = "optee")]
pub mod optee;
pub mod session;
pub mod simulated;

pub use api::TeecApi;
pub use session::TeeSession;
pub use simulated::SimulatedTeec;

pub const TEEC_SUCCESS: u32 = 0x0000_0000;
pub const TEEC_ERROR_GENERIC: u32 = 0xFFFF_0000;
pub const TEEC_ERROR_ACCESS_DENIED: u32 = 0xFFFF_0001;
pub const TEEC_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEEC_ERROR_BAD_STATE: u32 = 0xFFFF_0007;
pub const TEEC_ERROR_ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
pub const TEEC_ERROR_NOT_SUPPORTED: u32 = 0xFFFF_000A;
pub const TEEC_ERROR_OUT_OF_MEMORY: u32 = 0xFFFF_000C;
pub const TEEC_ERROR_BUSY: u32 = 0xFFFF_000D;
pub const TEEC_ERROR_COMMUNICATION: u32 = 0xFFFF_000E;
pub const TEEC_ERROR_TARGET_DEAD: u32 = 0xFFFF_3024;

pub const TEEC_ORIGIN_API: u32 = 1;
pub const TEEC_ORIGIN_COMMS: u32 = 2;
pub const TEEC_ORIGIN_TEE: u32 = 3;
pub const TEEC_ORIGIN_TRUSTED_APP: u32 = 4;

pub const TEEC_MEM_INPUT: u32 = 0x1;
pub const TEEC_MEM_OUTPUT: u32 = 0x2;

pub const TEEC_NONE: u32 = 0x0;
pub const TEEC_MEMREF_PARTIAL_INOUT: u32 = 0xF;

pub const TEEC_LOGIN_PUBLIC: u32 = 0x0;

pub const fn param_types(p0: u32, p1: u32, p2: u32, p3: u32) -> u32 {
    p0 | (p1 << 4) | (p2 << 8) | (p3 << 12)
}

// Command identifiers understood by the security test trusted application.
pub const CMD_DO_NOTHING: u32 = 0;
pub const CMD_READ_SHARED_MEMORY: u32 = 1;
pub const CMD_ACCESS_INTERNAL_MEMORY: u32 = 2;

pub fn command_id(command: Command) -> u32 {
    match command {
        Command::DoNothing => CMD_DO_NOTHING,
        Command::ReadSharedMemory => CMD_READ_SHARED_MEMORY,
        Command::AccessInternalMemory => CMD_ACCESS_INTERNAL_MEMORY,
    }
}

/// Default trusted application, overridable from the command line.
pub const SECURITY_TEST_TA_UUID: Uuid = Uuid {
    time_low: 0x8aaa_f200,
    time_mid: 0x2450,
    time_hi_and_version: 0x11e4,
    clock_seq_and_node: [0xab, 0xe2, 0x00, 0x02, 0xa5, 0xd5, 0xc5, 0x1b],
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TeecCall {
    InitializeContext,
    AllocateSharedMemory,
    OpenSession,
    InvokeCommand,
    CloseSession,
    ReleaseSharedMemory,
    FinalizeContext,
}

impl fmt::Display for TeecCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeecCall::InitializeContext => "TEEC_InitializeContext",
            TeecCall::AllocateSharedMemory => "TEEC_AllocateSharedMemory",
            TeecCall::OpenSession => "TEEC_OpenSession",
            TeecCall::InvokeCommand => "TEEC_InvokeCommand",
            TeecCall::CloseSession => "TEEC_CloseSession",
            TeecCall::ReleaseSharedMemory => "TEEC_ReleaseSharedMemory",
            TeecCall::FinalizeContext => "TEEC_FinalizeContext",
        };
        f.write_str(name)
    }
}

pub fn code_name(code: u32) -> Option<&'static str> {
    Some(match code {
        TEEC_SUCCESS => "TEEC_SUCCESS",
        TEEC_ERROR_GENERIC => "TEEC_ERROR_GENERIC",
        TEEC_ERROR_ACCESS_DENIED => "TEEC_ERROR_ACCESS_DENIED",
        TEEC_ERROR_BAD_PARAMETERS => "TEEC_ERROR_BAD_PARAMETERS",
        TEEC_ERROR_BAD_STATE => "TEEC_ERROR_BAD_STATE",
        TEEC_ERROR_ITEM_NOT_FOUND => "TEEC_ERROR_ITEM_NOT_FOUND",
        TEEC_ERROR_NOT_SUPPORTED => "TEEC_ERROR_NOT_SUPPORTED",
        TEEC_ERROR_OUT_OF_MEMORY => "TEEC_ERROR_OUT_OF_MEMORY",
        TEEC_ERROR_BUSY => "TEEC_ERROR_BUSY",
        TEEC_ERROR_COMMUNICATION => "TEEC_ERROR_COMMUNICATION",
        TEEC_ERROR_TARGET_DEAD => "TEEC_ERROR_TARGET_DEAD",
        _ => return None,
    })
}

pub fn origin_name(origin: u32) -> Option<&'static str> {
    Some(match origin {
        TEEC_ORIGIN_API => "TEEC_ORIGIN_API",
        TEEC_ORIGIN_COMMS => "TEEC_ORIGIN_COMMS",
        TEEC_ORIGIN_TEE => "TEEC_ORIGIN_TEE",
        TEEC_ORIGIN_TRUSTED_APP => "TEEC_ORIGIN_TRUSTED_APP",
        _ => return None,
    })
}

/// A failed TEE client call, with the result and origin codes it returned.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TeecError {
    pub call: TeecCall,
    pub code: u32,
    pub origin: u32,
}

impl TeecError {
    pub fn new(call: TeecCall, code: u32, origin: u32) -> Self {
        TeecError { call, code, origin }
    }
}

impl fmt::Display for TeecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with code 0x{:x}", self.call, self.code)?;
        if let Some(name) = code_name(self.code) {
            write!(f, " ({})", name)?;
        }
        write!(f, " origin 0x{:x}", self.origin)?;
        if let Some(name) = origin_name(self.origin) {
            write!(f, " ({})", name)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeecError {}

/// Trusted application identifier, laid out as `TEEC_UUID`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_and_node: [u8; 8],
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UuidError(String);

impl fmt::Display for UuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid UUID `{}`, expected xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx",
            self.0
        )
    }
}

impl std::error::Error for UuidError {}

impl FromStr for Uuid {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || UuidError(s.to_owned());
        let groups: Vec<&str> = s.split('-').collect();
        let lengths = [8, 4, 4, 4, 12];
        if groups.len() != lengths.len()
            || groups
                .iter()
                .zip(lengths.iter())
                .any(|(g, &l)| g.len() != l || !g.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(err());
        }
        let tail = [groups[3], groups[4]].concat();
        let mut clock_seq_and_node = [0u8; 8];
        for (i, byte) in clock_seq_and_node.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[2 * i..2 * i + 2], 16).map_err(|_| err())?;
        }
        Ok(Uuid {
            time_low: u32::from_str_radix(groups[0], 16).map_err(|_| err())?,
            time_mid: u16::from_str_radix(groups[1], 16).map_err(|_| err())?,
            time_hi_and_version: u16::from_str_radix(groups[2], 16).map_err(|_| err())?,
            clock_seq_and_node,
        })
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = &self.clock_seq_and_node;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            n[0],
            n[1],
            n[2],
            n[3],
            n[4],
            n[5],
            n[6],
            n[7]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_parses_and_prints() {
        let s = "8aaaf200-2450-11e4-abe2-0002a5d5c51b";
        let uuid: Uuid = s.parse().unwrap();
        assert_eq!(uuid, SECURITY_TEST_TA_UUID);
        assert_eq!(uuid.to_string(), s);
        let upper: Uuid = "8AAAF200-2450-11E4-ABE2-0002A5D5C51B".parse().unwrap();
        assert_eq!(upper, uuid);
    }

    #[test]
    fn malformed_uuids() {
        for s in &[
            "",
            "8aaaf200-2450-11e4-abe2",
            "8aaaf200-2450-11e4-abe2-0002a5d5c51",
            "8aaaf20g-2450-11e4-abe2-0002a5d5c51b",
            "8aaaf200+2450-11e4-abe2-0002a5d5c51b",
        ] {
            assert!(s.parse::<Uuid>().is_err(), "{}", s);
        }
    }

    #[test]
    fn error_names_codes() {
        let e = TeecError::new(
            TeecCall::OpenSession,
            TEEC_ERROR_ITEM_NOT_FOUND,
            TEEC_ORIGIN_TEE,
        );
        assert_eq!(
            e.to_string(),
            "TEEC_OpenSession failed with code 0xffff0008 (TEEC_ERROR_ITEM_NOT_FOUND) origin 0x3 (TEEC_ORIGIN_TEE)"
        );
        let e = TeecError::new(TeecCall::InvokeCommand, 0x1234, 0x9);
        assert_eq!(
            e.to_string(),
            "TEEC_InvokeCommand failed with code 0x1234 origin 0x9"
        );
    }

    #[test]
    fn commands_map_to_distinct_ids() {
        let ids: Vec<u32> = Command::ALL.iter().map(|&c| command_id(c)).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn partial_inout_in_first_slot() {
        assert_eq!(
            param_types(TEEC_MEMREF_PARTIAL_INOUT, TEEC_NONE, TEEC_NONE, TEEC_NONE),
            0xF
        );
        assert_eq!(param_types(1, 2, 3, 4), 0x4321);
    }
}
