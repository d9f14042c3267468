//! Executable memory for loading finished code.
//!
//! A thin mmap wrapper: memory starts writable, the finished bytes are
//! copied in, and the mapping is flipped to read+execute. This is the one
//! external call in the pipeline that can fail for resource reasons.

use std::ptr::NonNull;
use thiserror::Error;

/// Error type for executable-memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid size or alignment")]
    InvalidRequest,
}

/// A block of memory allocated via mmap, initially writable.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a block of at least `size` bytes whose base satisfies
    /// `align`. Mappings are page-aligned, so any alignment up to the page
    /// size is free; larger requests are rejected.
    pub fn new(size: usize, align: usize) -> Result<Self, MemoryError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(MemoryError::InvalidRequest);
        }
        let page_size = Self::page_size();
        if align > page_size {
            return Err(MemoryError::InvalidRequest);
        }
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = Self::map_alloc(aligned_size)?;
        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn map_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn map_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidRequest)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy bytes into the block at `offset`. Fails once the block has been
    /// made executable, or if the write would run past the end.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidRequest);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the mapping to read+execute. The block can no longer be written.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.executable = true;
        Ok(())
    }

    /// Pointer to the code at `offset`; the block must be executable.
    pub fn entry_ptr(&self, offset: usize) -> Option<*const u8> {
        if !self.executable || offset >= self.size {
            return None;
        }
        Some(unsafe { self.ptr.as_ptr().add(offset) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.size, Self::page_size())
                .expect("invalid layout");
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

// The block owns its mapping exclusively.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        let mem = ExecutableMemory::new(100, 16).unwrap();
        assert!(mem.size() >= 100);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_rejects_bad_requests() {
        assert!(ExecutableMemory::new(0, 16).is_err());
        assert!(ExecutableMemory::new(64, 3).is_err());
        assert!(ExecutableMemory::new(64, 1 << 30).is_err());
    }

    #[test]
    fn test_write_then_execute() {
        let mut mem = ExecutableMemory::new(4096, 16).unwrap();
        mem.write(0, &[0xC3]).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.entry_ptr(0).is_some());
        assert!(mem.write(0, &[0x90]).is_err());
    }

    #[test]
    fn test_write_out_of_range() {
        let mut mem = ExecutableMemory::new(64, 8).unwrap();
        let size = mem.size();
        assert!(mem.write(size, &[0x90]).is_err());
    }
}
