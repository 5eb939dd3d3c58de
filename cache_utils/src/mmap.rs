use core::borrow::{Borrow, BorrowMut};
use core::ffi::c_void;
use core::mem::size_of;
use core::num::NonZeroUsize;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::errno::Errno::EINVAL;
use nix::sys::mman;

/// Anonymous private mapping, used for the buffers whose cache footprint we
/// control (private probe buffer, eviction scratch, simulated TEE memory).
///
/// Safety issue : if T is non trivially constructable and destructable this is dangerous
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
}

impl<T> MMappedMemory<T> {
    pub fn try_new(
        size: usize,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, nix::Error> {
        assert_ne!(size_of::<T>(), 0);
        let length = size
            .checked_mul(size_of::<T>())
            .and_then(NonZeroUsize::new)
            .ok_or(EINVAL)?;
        let p = unsafe {
            mman::mmap(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        let pointer = NonNull::new(p as *mut T).ok_or(EINVAL)?;
        let s = MMappedMemory { pointer, size };
        for i in 0..s.size {
            unsafe { ptr::write(s.pointer.as_ptr().add(i), initializer(i)) };
        }
        Ok(s)
    }

    pub fn new(size: usize, init: impl Fn(usize) -> T) -> MMappedMemory<T> {
        Self::try_new(size, init).unwrap()
    }

    pub fn as_ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.pointer.as_ptr()
    }

    pub fn non_null(&self) -> NonNull<T> {
        self.pointer
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        for i in 0..self.size {
            unsafe { ptr::drop_in_place(self.pointer.as_ptr().add(i)) };
        }
        let length = self.size * size_of::<T>();
        if let Err(e) = unsafe { mman::munmap(self.pointer.as_ptr() as *mut c_void, length) } {
            log::warn!("munmap of {} bytes failed: {}", length, e);
        }
    }
}

impl<T> Deref for MMappedMemory<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<T> DerefMut for MMappedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

impl<T> AsRef<[T]> for MMappedMemory<T> {
    fn as_ref(&self) -> &[T] {
        self.slice()
    }
}

impl<T> AsMut<[T]> for MMappedMemory<T> {
    fn as_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

impl<T> Borrow<[T]> for MMappedMemory<T> {
    fn borrow(&self) -> &[T] {
        self.slice()
    }
}

impl<T> BorrowMut<[T]> for MMappedMemory<T> {
    fn borrow_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialized_and_writable() {
        let mut m = MMappedMemory::new(4096, |i| i as u8);
        assert_eq!(m.len(), 4096);
        assert_eq!(m[255], 255);
        assert_eq!(m[256], 0);
        m[10] = 42;
        assert_eq!(m.slice()[10], 42);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(MMappedMemory::<u8>::try_new(0, |_| 0).is_err());
    }
}
