//! Executable code segments backed by anonymous `mmap` regions.
//!
//! A [`CodeSegment`] is mapped read/write, filled with machine code, patched
//! in place (the base address is final as soon as the mapping exists), and
//! then sealed read+execute. Pages are unmapped exactly once when the segment
//! drops; a failed `munmap` would leave executable pages behind with no owner,
//! so it aborts the process.

use crate::error::Error;
use libc::c_void;
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::ptr;
use std::slice;

#[derive(Debug)]
pub struct CodeSegment {
    base: *mut u8,
    len: usize,
    executable: bool,
}

// The raw base pointer is owned by the segment alone; after `make_executable`
// the contents are immutable.
unsafe impl Send for CodeSegment {}
unsafe impl Sync for CodeSegment {}

impl CodeSegment {
    /// Map `len` bytes of machine code read from `source`.
    ///
    /// The returned segment is writable so that relocations can be applied in
    /// place; call [`make_executable`](Self::make_executable) before handing
    /// the base address to anything that will jump to it. Zero-length
    /// segments allocate nothing and have a null base.
    pub fn map<R: Read>(mut source: R, len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Ok(CodeSegment {
                base: ptr::null_mut(),
                len: 0,
                executable: false,
            });
        }

        let length = NonZeroUsize::new(len).expect("length is non-zero");
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                -1,
                0,
            )
            .map_err(|e| Error::CodeMapping(io::Error::from_raw_os_error(e as i32)))?
        };

        let mut segment = CodeSegment {
            base: base as *mut u8,
            len,
            executable: false,
        };
        // A short read leaves the mapping owned by `segment`, so the error
        // path unmaps it.
        source.read_exact(segment.as_mut_slice())?;
        Ok(segment)
    }

    /// Map a segment directly from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        CodeSegment::map(bytes, bytes.len())
    }

    /// Seal the segment: pages become read+execute and the contents are
    /// immutable from here on.
    pub fn make_executable(&mut self) -> Result<(), Error> {
        if self.len == 0 {
            self.executable = true;
            return Ok(());
        }
        unsafe {
            mprotect(
                self.base as *mut c_void,
                self.len,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            )?
        };
        self.executable = true;
        Ok(())
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.base, self.len) }
        }
    }

    /// Mutable view of the mapped bytes, for relocation patching.
    ///
    /// Panics if the segment was already sealed.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.executable, "BUG: write to a sealed code segment");
        if self.len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.base, self.len) }
        }
    }
}

impl Drop for CodeSegment {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        let res = unsafe { munmap(self.base as *mut c_void, self.len) };
        res.expect("BUG: munmap of code segment failed");
    }
}
