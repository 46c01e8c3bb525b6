// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bookkeeping for which parts of the cache window are backed by files.

use crate::window::Mappable;
use crate::SlaveError;
use sparse_mmap::Protection;
use std::collections::BTreeMap;
use std::fmt;

/// A half-open byte range within the cache window.
///
/// Unlike guest memory ranges, this has no alignment requirement. The
/// tracker works at byte granularity; alignment is enforced when the range is
/// actually mapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheRange {
    start: u64,
    end: u64,
}

impl fmt::Display for CacheRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

impl CacheRange {
    /// Returns a new range.
    ///
    /// Panics if `start > end`.
    #[track_caller]
    pub const fn new(start: u64, end: u64) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    /// The start offset.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The end offset.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns whether `self` and `other` overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.end > other.start && self.start < other.end
    }

    /// Returns whether `self` contains `other`.
    pub fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Returns the intersection of `self` and `other`, which may be empty.
    pub fn intersection(&self, other: &Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Self::new(start, end)
        } else {
            Self::new(start, start)
        }
    }
}

/// A live association between a window range and a file range.
#[derive(Debug, Clone)]
pub struct ActiveMapping {
    /// The window range.
    pub range: CacheRange,
    /// Offset within the file of `range.start()`.
    pub file_offset: u64,
    /// The access granted to the mapping.
    pub protection: Protection,
    /// The backing file.
    pub mappable: Mappable,
}

impl ActiveMapping {
    /// Returns the part of the mapping covering `range`, which must be
    /// contained within the mapping.
    fn slice(&self, range: CacheRange) -> Self {
        assert!(self.range.contains(&range));
        Self {
            range,
            file_offset: self.file_offset + (range.start() - self.range.start()),
            protection: self.protection,
            mappable: self.mappable.clone(),
        }
    }
}

/// The set of active mappings in a cache window of fixed capacity.
///
/// Records are keyed by start offset and never overlap. Adjacent records are
/// never merged, even if they are contiguous in the same file.
#[derive(Debug)]
pub struct RangeTracker {
    capacity: u64,
    mappings: BTreeMap<u64, ActiveMapping>,
}

impl RangeTracker {
    /// Returns an empty tracker for a window of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            mappings: BTreeMap::new(),
        }
    }

    /// The window capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Validates that `offset..offset+len` is a non-empty range within the
    /// window.
    pub fn bounds(&self, offset: u64, len: u64) -> Result<CacheRange, SlaveError> {
        let out_of_bounds = || SlaveError::OutOfBounds {
            offset,
            len,
            capacity: self.capacity,
        };
        if len == 0 {
            return Err(out_of_bounds());
        }
        let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.capacity {
            return Err(out_of_bounds());
        }
        Ok(CacheRange::new(offset, end))
    }

    /// Checks that `offset..offset+len` is within the window and does not
    /// intersect any active mapping.
    pub fn reserve(&self, offset: u64, len: u64) -> Result<CacheRange, SlaveError> {
        let range = self.bounds(offset, len)?;
        if let Some(existing) = self.overlapping(range).next() {
            return Err(SlaveError::Overlap {
                range,
                existing: existing.range,
            });
        }
        Ok(range)
    }

    /// Records a new mapping. The range must have been reserved.
    pub fn insert(&mut self, mapping: ActiveMapping) -> Result<(), SlaveError> {
        let range = self.reserve(mapping.range.start(), mapping.range.len())?;
        self.mappings.insert(range.start(), mapping);
        Ok(())
    }

    /// Removes `offset..offset+len` from every record it touches, splitting
    /// records that extend past either end. Parts of the range that are not
    /// mapped are ignored.
    ///
    /// Returns the ranges that were actually removed, in order.
    pub fn remove(&mut self, offset: u64, len: u64) -> Result<Vec<CacheRange>, SlaveError> {
        let range = self.bounds(offset, len)?;
        let starts: Vec<u64> = self.overlapping(range).map(|m| m.range.start()).collect();
        let mut removed = Vec::with_capacity(starts.len());
        for start in starts {
            let Some(mapping) = self.mappings.remove(&start) else {
                continue;
            };
            let hole = mapping.range.intersection(&range);
            if mapping.range.start() < hole.start() {
                let head = mapping.slice(CacheRange::new(mapping.range.start(), hole.start()));
                self.mappings.insert(head.range.start(), head);
            }
            if hole.end() < mapping.range.end() {
                let tail = mapping.slice(CacheRange::new(hole.end(), mapping.range.end()));
                self.mappings.insert(tail.range.start(), tail);
            }
            removed.push(hole);
        }
        Ok(removed)
    }

    /// Returns the mapped parts of `range`, in order.
    pub fn mapped_within(&self, range: CacheRange) -> Vec<CacheRange> {
        self.overlapping(range)
            .map(|m| m.range.intersection(&range))
            .collect()
    }

    /// Removes all records.
    pub fn clear(&mut self) -> Vec<ActiveMapping> {
        std::mem::take(&mut self.mappings).into_values().collect()
    }

    /// Returns the record starting at `offset`, if any.
    pub fn get(&self, offset: u64) -> Option<&ActiveMapping> {
        self.mappings.get(&offset)
    }

    /// Iterates over the records in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveMapping> {
        self.mappings.values()
    }

    /// The number of records.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn overlapping(&self, range: CacheRange) -> impl Iterator<Item = &ActiveMapping> {
        // At most one record starting before the range can reach into it.
        let before = self
            .mappings
            .range(..range.start())
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.range.overlaps(&range));
        let within = self
            .mappings
            .range(range.start()..range.end())
            .map(|(_, m)| m);
        before.into_iter().chain(within)
    }
}
