// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory-related abstractions.
//!
//! [`SparseMapping`] reserves a range of virtual address space that starts out
//! inaccessible and can be populated, page by page, with shared file mappings.
//! It is the backing for device memory windows whose contents are supplied at
//! runtime by another process.

#![cfg(target_os = "linux")]
// UNSAFETY: Manual pointer manipulation and dealing with mmap.
#![expect(unsafe_code)]

mod unix;

pub use unix::alloc_shared_memory;
pub use unix::page_size;
pub use unix::SparseMapping;

/// The access rights to grant to a file mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Protection {
    /// Allow loads from the mapping.
    pub read: bool,
    /// Allow stores to the mapping.
    pub write: bool,
}

impl Protection {
    /// Read-only access.
    pub const READ: Self = Self {
        read: true,
        write: false,
    };

    /// Read-write access.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Returns true if no access is granted.
    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }

    fn prot_flags(&self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}
