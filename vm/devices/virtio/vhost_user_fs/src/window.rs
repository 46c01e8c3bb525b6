// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The DAX cache window and the file handles mapped into it.

use crate::range_tracker::CacheRange;
use sparse_mmap::Protection;
use sparse_mmap::SparseMapping;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// A file descriptor that can be mapped into the window.
///
/// This uses `Arc` so that every record split from one mapping shares the
/// descriptor, which is closed once the last of them is gone.
#[derive(Debug, Clone)]
pub struct Mappable(Arc<OwnedFd>);

impl From<OwnedFd> for Mappable {
    fn from(value: OwnedFd) -> Self {
        Self(Arc::new(value))
    }
}

impl PartialEq for Mappable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Mappable {}

impl AsFd for Mappable {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// A fixed-size region of address space that the guest sees as the
/// virtio-fs shared memory region.
///
/// The window starts out inaccessible. Pages only become accessible when a
/// file range is mapped over them.
#[derive(Debug)]
pub struct CacheWindow {
    mapping: SparseMapping,
    capacity: u64,
}

impl CacheWindow {
    /// Reserves a window of `capacity` bytes, which must be a non-zero
    /// multiple of the page size.
    pub fn new(capacity: u64) -> io::Result<Self> {
        let len: usize = capacity
            .try_into()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        if len == 0 || len % sparse_mmap::page_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cache window size must be a non-zero multiple of the page size",
            ));
        }
        let mapping = SparseMapping::new(len)?;
        tracing::debug!(capacity, address = ?mapping.as_ptr(), "reserved cache window");
        Ok(Self { mapping, capacity })
    }

    /// The size of the window in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The base address of the window, for handing to the guest memory
    /// mapper.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr().cast()
    }

    /// Maps `range` to `file` at `file_offset`.
    pub(crate) fn map(
        &self,
        range: CacheRange,
        file: &Mappable,
        file_offset: u64,
        protection: Protection,
    ) -> io::Result<()> {
        let (offset, len) = usize_range(range)?;
        self.mapping
            .map_file(offset, len, file, file_offset, protection)
    }

    /// Returns `range` to the inaccessible state.
    pub(crate) fn unmap(&self, range: CacheRange) -> io::Result<()> {
        let (offset, len) = usize_range(range)?;
        self.mapping.unmap(offset, len)
    }

    /// Returns the whole window to the inaccessible state.
    pub(crate) fn clear(&self) -> io::Result<()> {
        self.unmap(CacheRange::new(0, self.capacity))
    }

    /// Copies `range.len()` bytes from `file` at `file_offset` into the
    /// window.
    pub fn read_from_file(
        &self,
        range: CacheRange,
        file: impl AsFd,
        file_offset: u64,
    ) -> io::Result<()> {
        let (offset, len) = usize_range(range)?;
        self.mapping.read_from_file(offset, len, file, file_offset)
    }

    /// Copies `range.len()` bytes from the window to `file` at `file_offset`.
    pub fn write_to_file(
        &self,
        range: CacheRange,
        file: impl AsFd,
        file_offset: u64,
    ) -> io::Result<()> {
        let (offset, len) = usize_range(range)?;
        self.mapping.write_to_file(offset, len, file, file_offset)
    }
}

fn usize_range(range: CacheRange) -> io::Result<(usize, usize)> {
    let offset = range
        .start()
        .try_into()
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let len = range
        .len()
        .try_into()
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    Ok((offset, len))
}
