#![deny(unsafe_op_in_unsafe_fn)]

use std::fmt;

pub mod engine;
pub mod model;

pub use engine::{Calibration, Technique, TrialEngine};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Hit => write!(f, "likely hit range"),
            CacheStatus::Miss => write!(f, "likely miss range"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Verdict {
    ProbablyAccessed,
    ProbablyNotAccessed,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::ProbablyAccessed => write!(f, "probably accessed"),
            Verdict::ProbablyNotAccessed => write!(f, "probably not accessed"),
            Verdict::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// The two buffers the observer can probe.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Region {
    /// Shared with the TEE.
    Shared,
    /// Observer only, same size as the shared buffer.
    Private,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Shared => write!(f, "shared"),
            Region::Private => write!(f, "private"),
        }
    }
}

/// Closed set of oracle commands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Command {
    /// Baseline, touches nothing the observer can see.
    DoNothing,
    /// The TEE reads the shared buffer.
    ReadSharedMemory,
    /// The TEE touches its own private working set.
    AccessInternalMemory,
}

impl Command {
    pub const ALL: [Command; 3] = [
        Command::DoNothing,
        Command::ReadSharedMemory,
        Command::AccessInternalMemory,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::DoNothing => "DO_NOTHING",
            Command::ReadSharedMemory => "READ_SHARED_MEMORY",
            Command::AccessInternalMemory => "ACCESS_INTERNAL_MEMORY",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChannelError {
    /// An invocation returned something other than success. Fatal: the run
    /// no longer rests on a consistent TEE state.
    Oracle {
        command: Command,
        code: u32,
        origin: u32,
    },
    EmptyRegion(Region),
}

impl fmt::Display for SideChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideChannelError::Oracle {
                command,
                code,
                origin,
            } => write!(
                f,
                "invocation of {} failed with code 0x{:x} origin 0x{:x}",
                command, code, origin
            ),
            SideChannelError::EmptyRegion(region) => {
                write!(f, "{} buffer holds no complete cache line", region)
            }
        }
    }
}

impl std::error::Error for SideChannelError {}

/// Synchronous call into the TEE.
pub trait Oracle {
    fn invoke(&mut self, command: Command) -> Result<(), SideChannelError>;
}

impl<O: Oracle + ?Sized> Oracle for &mut O {
    fn invoke(&mut self, command: Command) -> Result<(), SideChannelError> {
        (**self).invoke(command)
    }
}

/// Cache state control over the observer's buffers.
///
/// Timing is not part of this trait: the engine wraps `access` in its own
/// fenced timer, so implementations backed by real memory and deterministic
/// models are interchangeable.
pub trait CacheControl {
    fn line_size(&self) -> usize;
    fn region_len(&self, region: Region) -> usize;

    fn lines(&self, region: Region) -> usize {
        self.region_len(region) / self.line_size()
    }

    /// Evicts the target cache level (probabilistically on real hardware).
    fn flush(&mut self);
    /// Writes one byte per line of `region`, leaving it resident.
    fn fill(&mut self, region: Region);
    /// Single untimed read of `region[offset]`.
    fn access(&mut self, region: Region, offset: usize) -> u8;
}

impl<K: CacheControl + ?Sized> CacheControl for &mut K {
    fn line_size(&self) -> usize {
        (**self).line_size()
    }

    fn region_len(&self, region: Region) -> usize {
        (**self).region_len(region)
    }

    fn flush(&mut self) {
        (**self).flush()
    }

    fn fill(&mut self, region: Region) {
        (**self).fill(region)
    }

    fn access(&mut self, region: Region, offset: usize) -> u8 {
        (**self).access(region, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_error_names_command_and_codes() {
        let e = SideChannelError::Oracle {
            command: Command::ReadSharedMemory,
            code: 0xffff0006,
            origin: 4,
        };
        assert_eq!(
            e.to_string(),
            "invocation of READ_SHARED_MEMORY failed with code 0xffff0006 origin 0x4"
        );
    }
}
