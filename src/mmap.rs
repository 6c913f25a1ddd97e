//! Raw address-space reservations backing the super region.
//!
//! A reservation is mapped once and over-sized by `align` bytes so that
//! `aligned()` can hand out a base address that is a multiple of `align`.
//! Pages are committed and decommitted lazily as regions come and go.

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    use crate::error::HeapError;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        pub fn reserve(size: usize, align: usize) -> Result<Self, HeapError> {
            unsafe {
                let total = size + align;
                let mem = VirtualAlloc(null_mut(), total, MEM_RESERVE, PAGE_READWRITE);
                if mem.is_null() {
                    return Err(HeapError::MapFailed(std::io::Error::last_os_error()));
                }
                let mem = mem as *mut u8;

                Ok(Self {
                    start: mem,
                    end: mem.add(total),
                    size: total,
                    align,
                })
            }
        }
        /// Return an `align` aligned pointer into the reservation.
        pub fn aligned(&self) -> *mut u8 {
            let offset = (self.align - (self.start as usize) % self.align) % self.align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn decommit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { VirtualFree(page.cast(), size, MEM_DECOMMIT) != 0 }
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { !VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE).is_null() }
        }
        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::error::HeapError;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        pub const fn size(&self) -> usize {
            self.size
        }
        pub fn reserve(size: usize, align: usize) -> Result<Self, HeapError> {
            let total = size + align;
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    total as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(HeapError::MapFailed(std::io::Error::last_os_error()));
                }
                Ok(Self {
                    start: map as *mut u8,
                    end: (map as usize + total) as *mut u8,
                    size: total,
                    align,
                })
            }
        }
        /// Return an `align` aligned pointer into the reservation.
        pub fn aligned(&self) -> *mut u8 {
            let offset = (self.align - (self.start as usize) % self.align) % self.align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn decommit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED) == 0 }
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED) == 0 }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

// The reservation is only touched through the super region lock.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
