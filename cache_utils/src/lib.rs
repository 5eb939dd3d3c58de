#![allow(clippy::missing_safety_doc)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::ptr;

pub mod cache_info;
pub mod calibration;
pub mod mmap;
pub mod stats;
pub mod timing;

pub unsafe fn maccess<T: Copy>(p: *const T) -> T {
    unsafe { ptr::read_volatile(p) }
}

/// Writes one byte in every `line_size` bytes of `[p, p + len)`.
pub unsafe fn touch_lines(p: *mut u8, len: usize, line_size: usize) {
    assert_ne!(line_size, 0);
    for (i, offset) in (0..len).step_by(line_size).enumerate() {
        unsafe { ptr::write_volatile(p.add(offset), i as u8) };
    }
}

/// Sweeps a buffer larger than the target cache level so that previous
/// residents of that level are (most likely) evicted.
///
/// This is probabilistic: replacement policies and prefetchers can leave a
/// few lines behind, callers must tolerate residual noise.
pub fn evict(scratch: &mut [u8], line_size: usize) {
    unsafe { touch_lines(scratch.as_mut_ptr(), scratch.len(), line_size) };
}
