#![allow(clippy::arithmetic_side_effects)]

use {
    crate::numa::SocketId,
    libc::{sysconf, _SC_PAGESIZE},
    std::{io, ptr::NonNull},
};

pub const HUGE_2MB: usize = 2 * 1024 * 1024;

// mbind(2) policy
const MPOL_PREFERRED: libc::c_int = 1;

pub fn page_size() -> usize {
    unsafe { sysconf(_SC_PAGESIZE) as usize }
}

/// Anonymous, page aligned mapping holding `frame_count` frames of
/// `frame_size` bytes each.
pub struct PageAlignedMemory {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
}

// safety: the mapping is plain memory; the pool that owns it hands out
// disjoint frames and never aliases a frame between owners.
unsafe impl Send for PageAlignedMemory {}
unsafe impl Sync for PageAlignedMemory {}

impl PageAlignedMemory {
    pub fn alloc(frame_size: usize, frame_count: usize) -> io::Result<Self> {
        Self::alloc_with_page_size(frame_size, frame_count, page_size(), false)
    }

    pub fn alloc_with_page_size(
        frame_size: usize,
        frame_count: usize,
        page_size: usize,
        huge: bool,
    ) -> io::Result<Self> {
        if frame_size == 0 || frame_count == 0 || !page_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame size, frame count and page size must be non-zero",
            ));
        }
        let len = frame_size
            .checked_mul(frame_count)
            .and_then(|n| n.checked_next_multiple_of(page_size))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)?;

        Ok(Self { ptr, len, huge })
    }

    /// Prefer allocating the backing pages on `socket`. Must run before the
    /// pages are first touched to have any effect.
    pub fn bind_to_socket(&self, socket: SocketId) -> io::Result<()> {
        let SocketId::Node(node) = socket else {
            return Ok(());
        };
        if node >= u64::BITS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "numa node out of range",
            ));
        }
        let mask: u64 = 1 << node;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.ptr.as_ptr(),
                self.len,
                MPOL_PREFERRED,
                &mask as *const u64,
                u64::BITS as libc::c_ulong + 1,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_huge(&self) -> bool {
        self.huge
    }
}

impl Drop for PageAlignedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
