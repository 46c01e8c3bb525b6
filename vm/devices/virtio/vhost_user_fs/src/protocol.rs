// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format of the messages the filesystem backend sends over the slave
//! channel to map, unmap, or transfer ranges of the cache window.
//!
//! A message is a fixed header followed by `count` entries. All fields are
//! little endian and there is no padding between them.

use bitfield_struct::bitfield;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LE;
use zerocopy::U16;
use zerocopy::U32;
use zerocopy::U64;

/// Maximum number of entries in a single message.
pub const MAX_ENTRIES: usize = 32;

/// Size of [`SlaveMessageHeader`] on the wire.
pub const HEADER_SIZE: usize = size_of::<SlaveMessageHeader>();

/// Size of one [`SlaveMessageEntry`] on the wire.
pub const ENTRY_SIZE: usize = size_of::<SlaveMessageEntry>();

/// Size of a message carrying [`MAX_ENTRIES`] entries.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + MAX_ENTRIES * ENTRY_SIZE;

/// The message header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SlaveMessageHeader {
    /// Spare.
    pub align32: U32<LE>,
    /// Number of entries that follow.
    pub count: U16<LE>,
    /// Spare.
    pub align16: U16<LE>,
}

/// One entry of a message, as laid out on the wire.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SlaveMessageEntry {
    /// Offset within the file being mapped.
    pub fd_offset: U64<LE>,
    /// Offset within the cache window.
    pub c_offset: U64<LE>,
    /// Length of the section.
    pub len: U64<LE>,
    /// [`MapFlags`].
    pub flags: U64<LE>,
}

/// Access flags of an entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MapFlags {
    /// The mapping may be read. For I/O, data moves from the file to the
    /// window.
    pub read: bool,
    /// The mapping may be written. For I/O, data moves from the window to the
    /// file.
    pub write: bool,
    #[bits(62)]
    _reserved: u64,
}

impl MapFlags {
    /// Returns true if only defined bits are set.
    pub fn is_known(&self) -> bool {
        let known = Self::new().with_read(true).with_write(true).into_bits();
        self.into_bits() & !known == 0
    }
}

/// A decoded message entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Offset within the backing file.
    pub file_offset: u64,
    /// Offset within the cache window.
    pub cache_offset: u64,
    /// Length in bytes.
    pub len: u64,
    /// Access flags.
    pub flags: MapFlags,
}

impl From<&SlaveMessageEntry> for MappingEntry {
    fn from(entry: &SlaveMessageEntry) -> Self {
        Self {
            file_offset: entry.fd_offset.get(),
            cache_offset: entry.c_offset.get(),
            len: entry.len.get(),
            flags: MapFlags::from_bits(entry.flags.get()),
        }
    }
}

impl From<&MappingEntry> for SlaveMessageEntry {
    fn from(entry: &MappingEntry) -> Self {
        Self {
            fd_offset: entry.file_offset.into(),
            c_offset: entry.cache_offset.into(),
            len: entry.len.into(),
            flags: entry.flags.into_bits().into(),
        }
    }
}

/// A decoded message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveMessage {
    /// The entries, in wire order.
    pub entries: Vec<MappingEntry>,
}

/// Error returned when a buffer does not hold a well-formed message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message of {0} bytes is shorter than the header")]
    Truncated(usize),
    #[error("message has {0} entries, maximum is {MAX_ENTRIES}")]
    TooManyEntries(usize),
    #[error("message is {len} bytes, expected {expected} for its entry count")]
    LengthMismatch { len: usize, expected: usize },
    #[error("message of {0} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}")]
    TooLong(usize),
    #[error("message carried {0} file descriptors")]
    UnexpectedFdCount(usize),
}

impl SlaveMessage {
    /// Returns a message holding `entries`.
    pub fn new(entries: impl Into<Vec<MappingEntry>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Decodes a message whose length is exactly the size implied by its
    /// entry count.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let count = Self::read_count(buf)?;
        let expected = HEADER_SIZE + count * ENTRY_SIZE;
        if buf.len() != expected {
            return Err(DecodeError::LengthMismatch {
                len: buf.len(),
                expected,
            });
        }
        Self::read_entries(&buf[HEADER_SIZE..], count)
    }

    /// Decodes a message framed in a buffer sized for [`MAX_ENTRIES`]
    /// entries. Only the first `count` entries are read.
    pub fn decode_max_framed(buf: &[u8]) -> Result<Self, DecodeError> {
        let count = Self::read_count(buf)?;
        if buf.len() != MAX_MESSAGE_SIZE {
            return Err(DecodeError::LengthMismatch {
                len: buf.len(),
                expected: MAX_MESSAGE_SIZE,
            });
        }
        Self::read_entries(&buf[HEADER_SIZE..HEADER_SIZE + count * ENTRY_SIZE], count)
    }

    fn read_count(buf: &[u8]) -> Result<usize, DecodeError> {
        let (header, _) = SlaveMessageHeader::read_from_prefix(buf)
            .map_err(|_| DecodeError::Truncated(buf.len()))?;
        let count = header.count.get().into();
        if count > MAX_ENTRIES {
            return Err(DecodeError::TooManyEntries(count));
        }
        Ok(count)
    }

    fn read_entries(buf: &[u8], count: usize) -> Result<Self, DecodeError> {
        let entries = <[SlaveMessageEntry]>::ref_from_bytes_with_elems(buf, count).map_err(|_| {
            DecodeError::LengthMismatch {
                len: HEADER_SIZE + buf.len(),
                expected: HEADER_SIZE + count * ENTRY_SIZE,
            }
        })?;
        Ok(Self {
            entries: entries.iter().map(MappingEntry::from).collect(),
        })
    }

    /// Encodes the message in its variable-length form.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(DecodeError::TooManyEntries(self.entries.len()));
        }
        let header = SlaveMessageHeader {
            align32: 0.into(),
            count: (self.entries.len() as u16).into(),
            align16: 0.into(),
        };
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE);
        buf.extend_from_slice(header.as_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(SlaveMessageEntry::from(entry).as_bytes());
        }
        Ok(buf)
    }
}
