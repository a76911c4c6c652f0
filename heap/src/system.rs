use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    /// Reserves zero-filled, lazily committed memory.
    ///
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn reserve(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no file involved
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be a mapping returned by [`reserve`] with the same length
    #[inline]
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: guaranteed by caller
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// An anonymous memory mapping that backs the heap arena.
///
/// The start is aligned to `align` by over-reserving and skipping the
/// unaligned prefix; the whole mapping is released on drop.
#[derive(Debug)]
pub struct Reservation {
    mapping: NonNull<u8>,
    mapping_len: usize,
    start: usize,
    len: usize,
}

// SAFETY: the reservation is plain memory owned by the heap
unsafe impl Send for Reservation {}
// SAFETY: the reservation is plain memory owned by the heap
unsafe impl Sync for Reservation {}

impl Reservation {
    #[must_use]
    pub fn new(len: usize, align: usize) -> Option<Self> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(OS_PAGE_SIZE);
        let mapping_len = len.checked_add(align)?;
        // SAFETY: result is null checked
        let mapping = NonNull::new(unsafe { unix::reserve(mapping_len) })?;
        let base = mapping.as_ptr() as usize;
        let start = (base + align - 1) & !(align - 1);
        Some(Self {
            mapping,
            mapping_len,
            start,
            len,
        })
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: mapping came from reserve with this length
        unsafe { unix::release(self.mapping.as_ptr(), self.mapping_len) };
    }
}
