// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux implementation for memory mapping abstractions.

use crate::Protection;
use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::io::Error;
use std::os::unix::prelude::*;
use std::ptr::null_mut;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Returns the host page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no safety requirements.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

/// A reserved virtual address range that may be partially populated with memory
/// mappings.
#[derive(Debug)]
pub struct SparseMapping {
    address: *mut c_void,
    len: usize,
}

// SAFETY: SparseMapping's internal pointer represents an owned virtual address
// range. There is no safety issue accessing this pointer across threads.
unsafe impl Send for SparseMapping {}
// SAFETY: See above comment
unsafe impl Sync for SparseMapping {}

unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut c_void, Error> {
    // SAFETY: guaranteed by caller.
    let address = unsafe { libc::mmap(addr, len, prot, flags, fd, offset as libc::off_t) };
    if address == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(address)
}

unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<(), Error> {
    // SAFETY: guaranteed by caller.
    if unsafe { libc::munmap(addr, len) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

impl SparseMapping {
    /// Reserves a sparse mapping range with the given size.
    ///
    /// The range will be aligned to the largest system page size that's smaller
    /// or equal to `len`. The whole range starts out inaccessible.
    pub fn new(len: usize) -> Result<Self, Error> {
        // Length of 0 return an OS error, so we need to handle it explicitly.
        if len == 0 {
            return Err(Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let size_4k = 4096;
        let size_2m = 0x200000;
        let size_1g = 0x40000000;
        let alignment = if len < size_2m {
            size_4k
        } else if len < size_1g {
            size_2m
        } else {
            size_1g
        };

        let len = len
            .checked_add(alignment - 1)
            .map(|temp| temp & !(alignment - 1))
            .ok_or_else(|| {
                Error::new(
                    io::ErrorKind::InvalidInput,
                    "length and alignment combination causes overflow",
                )
            })?;

        let alloc_len = len
            .checked_add(alignment)
            .map(|temp| temp - size_4k)
            .ok_or_else(|| {
                Error::new(
                    io::ErrorKind::InvalidInput,
                    "length and alignment combination causes overflow",
                )
            })?;

        // SAFETY: calling mmap to allocate a new range.
        let address = unsafe {
            mmap(
                null_mut(),
                alloc_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )? as usize
        };
        let aligned_address = (address + alignment - 1) & !(alignment - 1);
        let end = address + alloc_len;
        let aligned_end = aligned_address + len;
        assert!(aligned_end <= end);

        // Trim the slack used for alignment. The range was just allocated
        // above, so these only fail on a kernel bug.
        if address != aligned_address {
            // SAFETY: freeing VA just allocated above.
            unsafe { munmap(address as *mut _, aligned_address - address)? };
        }
        if aligned_end != end {
            // SAFETY: freeing VA just allocated above.
            unsafe { munmap(aligned_end as *mut _, end - aligned_end)? };
        }
        Ok(Self {
            address: aligned_address as *mut _,
            len,
        })
    }

    /// Returns the pointer to the beginning of the sparse mapping.
    pub fn as_ptr(&self) -> *mut c_void {
        self.address
    }

    /// Returns the length of the mapping, in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping has zero length. Never true in practice.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn validate_offset_len(&self, offset: usize, len: usize) -> io::Result<usize> {
        let end = offset.checked_add(len).ok_or(io::ErrorKind::InvalidInput)?;
        let page_size = page_size();
        if offset % page_size != 0 || end % page_size != 0 || end > self.len {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(end)
    }

    fn validate_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset.checked_add(len).ok_or(io::ErrorKind::InvalidInput)?;
        if end > self.len {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(())
    }

    /// Maps a portion of a file at `offset` with exactly the access in
    /// `protection`.
    ///
    /// `offset`, `len` and `file_offset` must be page aligned.
    pub fn map_file(
        &self,
        offset: usize,
        len: usize,
        file: impl AsFd,
        file_offset: u64,
        protection: Protection,
    ) -> io::Result<()> {
        self.validate_offset_len(offset, len)?;
        if len == 0 || protection.is_none() {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let file_offset: i64 = file_offset
            .try_into()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: the range is within the reservation owned by self, so
        // MAP_FIXED only replaces pages that this object controls.
        unsafe {
            let address = self.address.add(offset);
            let mapped_address = mmap(
                address,
                len,
                protection.prot_flags(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_fd().as_raw_fd(),
                file_offset,
            )?;
            assert_eq!(mapped_address, address);
        }
        Ok(())
    }

    /// Unmaps memory from the mapping, leaving the range reserved but
    /// inaccessible.
    pub fn unmap(&self, offset: usize, len: usize) -> io::Result<()> {
        self.validate_offset_len(offset, len)?;
        if len == 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        // Remap to PROT_NONE to preserve the reservation.
        // SAFETY: the range is within the reservation owned by self.
        unsafe {
            let address = self.address.add(offset);
            let mapped_address = mmap(
                address,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
                -1,
                0,
            )?;
            assert_eq!(mapped_address, address);
        }
        Ok(())
    }

    /// Fills `len` bytes at `offset` with data read from `file` at
    /// `file_offset`.
    ///
    /// No alignment is required. If the destination is not mapped writable the
    /// kernel fails the transfer with `EFAULT`. Reaching end of file before
    /// `len` bytes are transferred fails with [`io::ErrorKind::UnexpectedEof`].
    pub fn read_from_file(
        &self,
        offset: usize,
        len: usize,
        file: impl AsFd,
        file_offset: u64,
    ) -> io::Result<()> {
        self.validate_range(offset, len)?;
        let fd = file.as_fd().as_raw_fd();
        transfer(len, file_offset, |done, file_offset| {
            // SAFETY: the buffer is within the reservation. The kernel
            // validates the page protection and reports EFAULT instead of
            // faulting.
            unsafe {
                libc::pread(
                    fd,
                    self.address.add(offset + done),
                    len - done,
                    file_offset,
                )
            }
        })
    }

    /// Writes `len` bytes at `offset` to `file` at `file_offset`.
    ///
    /// The counterpart of [`Self::read_from_file`].
    pub fn write_to_file(
        &self,
        offset: usize,
        len: usize,
        file: impl AsFd,
        file_offset: u64,
    ) -> io::Result<()> {
        self.validate_range(offset, len)?;
        let fd = file.as_fd().as_raw_fd();
        transfer(len, file_offset, |done, file_offset| {
            // SAFETY: the buffer is within the reservation. The kernel
            // validates the page protection and reports EFAULT instead of
            // faulting.
            unsafe {
                libc::pwrite(
                    fd,
                    self.address.add(offset + done).cast_const(),
                    len - done,
                    file_offset,
                )
            }
        })
    }
}

/// Runs `op` until `len` bytes are transferred, retrying on `EINTR`.
fn transfer(
    len: usize,
    file_offset: u64,
    mut op: impl FnMut(usize, libc::off_t) -> isize,
) -> io::Result<()> {
    let mut done = 0;
    while done < len {
        let pos: libc::off_t = file_offset
            .checked_add(done as u64)
            .and_then(|pos| pos.try_into().ok())
            .ok_or(io::ErrorKind::InvalidInput)?;
        let n = op(done, pos);
        if n < 0 {
            let err = Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        done += n as usize;
    }
    Ok(())
}

impl Drop for SparseMapping {
    fn drop(&mut self) {
        // SAFETY: the range is owned by self and no longer referenced.
        if let Err(err) = unsafe { munmap(self.address, self.len) } {
            panic!("unmap should not fail: {err}");
        }
    }
}

fn new_memfd() -> io::Result<File> {
    // SAFETY: creating a new file descriptor according to the documented
    // contract.
    unsafe {
        let fd = libc::memfd_create(c"mem".as_ptr(), libc::MFD_CLOEXEC);
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(File::from_raw_fd(fd))
    }
}

/// Allocates a mappable shared memory object of `size` bytes.
pub fn alloc_shared_memory(size: usize) -> io::Result<OwnedFd> {
    let fd = new_memfd()?;
    fd.set_len(size as u64)?;
    Ok(fd.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    fn bytes_at(mapping: &SparseMapping, offset: usize, len: usize) -> Vec<u8> {
        // SAFETY: callers only read ranges they mapped readable.
        unsafe {
            std::slice::from_raw_parts(mapping.as_ptr().cast::<u8>().add(offset), len).to_vec()
        }
    }

    #[test]
    fn test_reserve_rounds_up() {
        let mapping = SparseMapping::new(100).unwrap();
        assert_eq!(mapping.len(), 4096);
        SparseMapping::new(0).unwrap_err();
    }

    #[test]
    fn test_map_and_unmap_file() {
        let page_size = page_size();
        let mapping = SparseMapping::new(4 * page_size).unwrap();
        let shmem = alloc_shared_memory(2 * page_size).unwrap();
        let mut file = File::from(shmem.try_clone().unwrap());
        file.seek(SeekFrom::Start(page_size as u64)).unwrap();
        file.write_all(b"hello").unwrap();

        mapping
            .map_file(page_size, page_size, &shmem, page_size as u64, Protection::READ)
            .unwrap();
        assert_eq!(bytes_at(&mapping, page_size, 5), b"hello");
        mapping.unmap(page_size, page_size).unwrap();

        // Unaligned requests are rejected before reaching the kernel.
        mapping
            .map_file(1, page_size, &shmem, 0, Protection::READ)
            .unwrap_err();
        mapping
            .map_file(0, 8 * page_size, &shmem, 0, Protection::READ)
            .unwrap_err();
        mapping
            .map_file(0, page_size, &shmem, 0, Protection::default())
            .unwrap_err();
        mapping.unmap(0, 0).unwrap_err();
    }

    #[test]
    fn test_file_transfers() {
        let page_size = page_size();
        let mapping = SparseMapping::new(2 * page_size).unwrap();
        let window_backing = alloc_shared_memory(2 * page_size).unwrap();
        mapping
            .map_file(0, 2 * page_size, &window_backing, 0, Protection::READ_WRITE)
            .unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0xab; 64]).unwrap();

        mapping.read_from_file(10, 64, &file, 0).unwrap();
        assert_eq!(bytes_at(&mapping, 10, 64), [0xab; 64]);

        // Past end of file.
        let err = mapping.read_from_file(0, 128, &file, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        mapping.write_to_file(0, 100, &file, 200).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 300);

        mapping.read_from_file(page_size, page_size + 1, &file, 0).unwrap_err();
    }

    #[test]
    fn test_transfer_into_unmapped_fails() {
        let page_size = page_size();
        let mapping = SparseMapping::new(page_size).unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1; 16]).unwrap();
        let err = mapping.read_from_file(0, 16, &file, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EFAULT));
    }
}
