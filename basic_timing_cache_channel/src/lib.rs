#![deny(unsafe_op_in_unsafe_fn)]

// Cache control over real memory: the shared buffer handed out by the TEE
// client, a private buffer of the same size, and one scratch buffer that is
// swept to evict the cache level under test. The scratch buffer is allocated
// once and reused for every flush.

use cache_side_channel::{CacheControl, Region};
use cache_utils::cache_info::CacheGeometry;
use cache_utils::mmap::MMappedMemory;
use cache_utils::{evict, maccess, touch_lines};
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum ChannelError {
    Nix(nix::Error),
    /// The scratch buffer must exceed the cache capacity or flush evicts nothing.
    ScratchTooSmall { scratch: usize, cache: usize },
    BadLineSize(usize),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Nix(e) => write!(f, "buffer allocation failed: {}", e),
            ChannelError::ScratchTooSmall { scratch, cache } => write!(
                f,
                "scratch buffer of {} bytes does not exceed the {} byte cache",
                scratch, cache
            ),
            ChannelError::BadLineSize(line_size) => {
                write!(f, "cache line size {} is not a power of two", line_size)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<nix::Error> for ChannelError {
    fn from(e: nix::Error) -> Self {
        ChannelError::Nix(e)
    }
}

pub struct HardwareChannel {
    shared: NonNull<u8>,
    shared_len: usize,
    private: MMappedMemory<u8>,
    scratch: MMappedMemory<u8>,
    line_size: usize,
}

impl HardwareChannel {
    /// # Safety
    ///
    /// `shared` must be valid for reads and writes of `shared_len` bytes for
    /// the whole lifetime of the channel.
    pub unsafe fn new(
        shared: NonNull<u8>,
        shared_len: usize,
        geometry: CacheGeometry,
        scratch_size: usize,
    ) -> Result<Self, ChannelError> {
        if !geometry.line_size.is_power_of_two() {
            return Err(ChannelError::BadLineSize(geometry.line_size));
        }
        if scratch_size <= geometry.cache_size {
            return Err(ChannelError::ScratchTooSmall {
                scratch: scratch_size,
                cache: geometry.cache_size,
            });
        }
        let private = MMappedMemory::try_new(shared_len, |i| i as u8)?;
        let scratch = MMappedMemory::try_new(scratch_size, |i| i as u8)?;
        log::debug!(
            "Hardware channel: {} byte buffers, {} byte scratch, {}",
            shared_len,
            scratch_size,
            geometry
        );
        Ok(HardwareChannel {
            shared,
            shared_len,
            private,
            scratch,
            line_size: geometry.line_size,
        })
    }

    fn base(&mut self, region: Region) -> *mut u8 {
        match region {
            Region::Shared => self.shared.as_ptr(),
            Region::Private => self.private.as_mut_ptr(),
        }
    }
}

impl fmt::Debug for HardwareChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareChannel")
            .field("shared", &self.shared)
            .field("shared_len", &self.shared_len)
            .field("private", &self.private.as_ptr())
            .field("scratch_len", &self.scratch.len())
            .field("line_size", &self.line_size)
            .finish()
    }
}

impl CacheControl for HardwareChannel {
    fn line_size(&self) -> usize {
        self.line_size
    }

    fn region_len(&self, region: Region) -> usize {
        match region {
            Region::Shared => self.shared_len,
            Region::Private => self.private.len(),
        }
    }

    fn flush(&mut self) {
        evict(self.scratch.slice_mut(), self.line_size);
    }

    fn fill(&mut self, region: Region) {
        let len = self.region_len(region);
        let line_size = self.line_size;
        let p = self.base(region);
        unsafe { touch_lines(p, len, line_size) };
    }

    fn access(&mut self, region: Region, offset: usize) -> u8 {
        assert!(offset < self.region_len(region));
        let p = self.base(region);
        unsafe { maccess(p.add(offset)) }
    }
}
