// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::protocol::MapFlags;
use crate::protocol::MappingEntry;
use crate::protocol::SlaveMessage;
use crate::range_tracker::ActiveMapping;
use crate::range_tracker::CacheRange;
use crate::range_tracker::RangeTracker;
use crate::window::CacheWindow;
use crate::window::Mappable;
use crate::SlaveCommand;
use crate::SlaveError;
use parking_lot::Mutex;
use sparse_mmap::Protection;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Applies slave commands to a cache window.
///
/// Commands are serialized by a lock held for the duration of each command.
/// Guest accesses to the window are not synchronized with commands.
#[derive(Debug)]
pub struct SlaveDispatcher {
    window: Arc<CacheWindow>,
    tracker: Mutex<RangeTracker>,
}

impl SlaveDispatcher {
    /// Returns a dispatcher for `window`, which must not have any mappings.
    pub fn new(window: Arc<CacheWindow>) -> Self {
        let tracker = RangeTracker::new(window.capacity());
        Self {
            window,
            tracker: Mutex::new(tracker),
        }
    }

    /// The window this dispatcher manages.
    pub fn window(&self) -> &Arc<CacheWindow> {
        &self.window
    }

    /// Applies `command` with the entries in `message`.
    pub fn dispatch(&self, command: SlaveCommand, message: &SlaveMessage) -> Result<(), SlaveError> {
        match command {
            SlaveCommand::Map(fd) => self.map(message, fd),
            SlaveCommand::Unmap => self.unmap(message),
            SlaveCommand::Io(fd) => self.io(message, fd),
        }
    }

    /// Maps every entry of `message` to `fd`.
    ///
    /// Either every entry is mapped or, on failure, none are.
    pub fn map(&self, message: &SlaveMessage, fd: OwnedFd) -> Result<(), SlaveError> {
        let mappable = Mappable::from(fd);
        let mut tracker = self.tracker.lock();
        let mut transaction = MapTransaction {
            window: &self.window,
            tracker: &mut *tracker,
            applied: Vec::new(),
        };
        for entry in &message.entries {
            transaction.apply(entry, &mappable)?;
        }
        transaction.commit();
        Ok(())
    }

    /// Unmaps every entry of `message`. Flags are ignored, and ranges that
    /// are not mapped are skipped.
    ///
    /// A length of `u64::MAX` unmaps from `cache_offset` through the end of
    /// the window, for any offset up to the capacity. This is broader than
    /// treating it as the window size and bounds checking the result, which
    /// would only accept an offset of zero.
    pub fn unmap(&self, message: &SlaveMessage) -> Result<(), SlaveError> {
        let mut tracker = self.tracker.lock();
        for entry in &message.entries {
            let len = if entry.len == u64::MAX {
                let capacity = tracker.capacity();
                if entry.cache_offset > capacity {
                    return Err(SlaveError::OutOfBounds {
                        offset: entry.cache_offset,
                        len: entry.len,
                        capacity,
                    });
                }
                if entry.cache_offset == capacity {
                    continue;
                }
                capacity - entry.cache_offset
            } else {
                entry.len
            };
            let range = tracker.bounds(entry.cache_offset, len)?;
            let holes = tracker.mapped_within(range);
            if holes.is_empty() {
                tracing::debug!(%range, "unmap of unmapped range");
                continue;
            }
            // Only the mapped parts touch the window, so gaps in the request
            // need not be page aligned.
            for hole in holes {
                if let Err(err) = self.window.unmap(hole) {
                    // Forget the parts already gone from the window.
                    if hole.start() > range.start() {
                        tracker.remove(range.start(), hole.start() - range.start())?;
                    }
                    return Err(SlaveError::BackingIo(err));
                }
            }
            tracker.remove(range.start(), range.len())?;
            tracing::debug!(%range, "unmapped");
        }
        Ok(())
    }

    /// Copies data between `file` and the window for every entry of
    /// `message`.
    ///
    /// Stops at the first entry that fails. Entries before it remain applied.
    pub fn io(&self, message: &SlaveMessage, file: impl AsFd) -> Result<(), SlaveError> {
        let file = file.as_fd();
        let tracker = self.tracker.lock();
        for entry in &message.entries {
            let protection = protection(entry.flags)?;
            let range = tracker.bounds(entry.cache_offset, entry.len)?;
            if protection.read {
                self.window
                    .read_from_file(range, file, entry.file_offset)
                    .map_err(SlaveError::BackingIo)?;
            }
            if protection.write {
                self.window
                    .write_to_file(range, file, entry.file_offset)
                    .map_err(SlaveError::BackingIo)?;
            }
            tracing::debug!(
                %range,
                file_offset = entry.file_offset,
                read = protection.read,
                write = protection.write,
                "io"
            );
        }
        Ok(())
    }

    /// Unmaps everything, releasing all file references.
    pub fn reset(&self) {
        let mut tracker = self.tracker.lock();
        let mappings = tracker.clear();
        if mappings.is_empty() {
            return;
        }
        if let Err(err) = self.window.clear() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to unmap cache window"
            );
        }
        tracing::info!(count = mappings.len(), "released cache window mappings");
    }

    /// Returns a snapshot of the active mappings, in offset order.
    pub fn mappings(&self) -> Vec<ActiveMapping> {
        self.tracker.lock().iter().cloned().collect()
    }
}

fn protection(flags: MapFlags) -> Result<Protection, SlaveError> {
    if !flags.is_known() || (!flags.read() && !flags.write()) {
        return Err(SlaveError::InvalidFlags(flags.into_bits()));
    }
    Ok(Protection {
        read: flags.read(),
        write: flags.write(),
    })
}

/// The entries of a map command applied so far. Undone on drop unless
/// committed.
struct MapTransaction<'a> {
    window: &'a CacheWindow,
    tracker: &'a mut RangeTracker,
    applied: Vec<CacheRange>,
}

impl MapTransaction<'_> {
    fn apply(&mut self, entry: &MappingEntry, mappable: &Mappable) -> Result<(), SlaveError> {
        let protection = protection(entry.flags)?;
        let range = self.tracker.reserve(entry.cache_offset, entry.len)?;
        self.window
            .map(range, mappable, entry.file_offset, protection)
            .map_err(SlaveError::BackingIo)?;
        self.tracker.insert(ActiveMapping {
            range,
            file_offset: entry.file_offset,
            protection,
            mappable: mappable.clone(),
        })?;
        self.applied.push(range);
        tracing::debug!(
            %range,
            file_offset = entry.file_offset,
            writable = protection.write,
            "mapped"
        );
        Ok(())
    }

    fn commit(mut self) {
        self.applied.clear();
    }
}

impl Drop for MapTransaction<'_> {
    fn drop(&mut self) {
        for range in self.applied.drain(..).rev() {
            if let Err(err) = self.window.unmap(range) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %range,
                    "failed to roll back mapping"
                );
            }
            if let Err(err) = self.tracker.remove(range.start(), range.len()) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %range,
                    "failed to roll back mapping record"
                );
            }
            tracing::debug!(%range, "rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;
    use test_with_tracing::test;

    fn page() -> u64 {
        sparse_mmap::page_size() as u64
    }

    fn dispatcher(pages: u64) -> SlaveDispatcher {
        SlaveDispatcher::new(Arc::new(CacheWindow::new(pages * page()).unwrap()))
    }

    /// A shared memory file of `pages` pages, each filled with its page index.
    fn backing(pages: u64) -> File {
        let file = File::from(sparse_mmap::alloc_shared_memory((pages * page()) as usize).unwrap());
        for i in 0..pages {
            file.write_all_at(&vec![i as u8 + 1; page() as usize], i * page())
                .unwrap();
        }
        file
    }

    fn fd(file: &File) -> OwnedFd {
        file.try_clone().unwrap().into()
    }

    fn entry(file_offset: u64, cache_offset: u64, len: u64, flags: u64) -> MappingEntry {
        MappingEntry {
            file_offset,
            cache_offset,
            len,
            flags: MapFlags::from_bits(flags),
        }
    }

    const R: u64 = 1;
    const W: u64 = 2;
    const RW: u64 = 3;

    fn message(entries: &[MappingEntry]) -> SlaveMessage {
        SlaveMessage::new(entries.to_vec())
    }

    /// Reads window contents by writing them out to a scratch file.
    fn read_window(dispatcher: &SlaveDispatcher, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let out = tempfile::tempfile().unwrap();
        dispatcher
            .window()
            .write_to_file(CacheRange::new(offset, offset + len), &out, 0)?;
        let mut buf = vec![0; len as usize];
        out.read_exact_at(&mut buf, 0).unwrap();
        Ok(buf)
    }

    fn ranges(dispatcher: &SlaveDispatcher) -> Vec<(u64, u64, u64)> {
        dispatcher
            .mappings()
            .iter()
            .map(|m| (m.range.start(), m.range.end(), m.file_offset))
            .collect()
    }

    #[test]
    fn test_map_unmap_whole_window() {
        let d = dispatcher(1);
        let file = backing(1);
        let full = [entry(0, 0, page(), RW)];
        d.map(&message(&full), fd(&file)).unwrap();
        let mappings = d.mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].range, CacheRange::new(0, page()));
        assert_eq!(mappings[0].protection, Protection::READ_WRITE);
        assert_eq!(read_window(&d, 0, 16).unwrap(), [1; 16]);

        d.unmap(&message(&full)).unwrap();
        assert!(d.mappings().is_empty());
        read_window(&d, 0, 16).unwrap_err();

        // The range can be mapped again.
        d.map(&message(&full), fd(&file)).unwrap();
    }

    #[test]
    fn test_map_out_of_bounds() {
        let d = dispatcher(2);
        let file = backing(4);
        for e in [
            entry(0, page(), 2 * page(), R),
            entry(0, 3 * page(), page(), R),
            entry(0, 0, 0, R),
            entry(0, page(), u64::MAX, R),
        ] {
            assert!(matches!(
                d.map(&message(&[e]), fd(&file)),
                Err(SlaveError::OutOfBounds { .. })
            ));
        }
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_map_overlap() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(&message(&[entry(0, page(), 2 * page(), R)]), fd(&file))
            .unwrap();
        let err = d
            .map(&message(&[entry(0, 2 * page(), 2 * page(), R)]), fd(&file))
            .unwrap_err();
        assert!(matches!(err, SlaveError::Overlap { .. }), "{err:?}");
        assert_eq!(ranges(&d), [(page(), 3 * page(), 0)]);
        assert_eq!(read_window(&d, page(), 4).unwrap(), [1; 4]);
        assert_eq!(read_window(&d, 2 * page(), 4).unwrap(), [2; 4]);
    }

    #[test]
    fn test_map_rollback() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(&message(&[entry(0, 3 * page(), page(), R)]), fd(&file))
            .unwrap();
        let err = d
            .map(
                &message(&[
                    entry(page(), 0, page(), RW),
                    entry(0, 2 * page(), 2 * page(), R),
                ]),
                fd(&file),
            )
            .unwrap_err();
        assert!(matches!(err, SlaveError::Overlap { .. }), "{err:?}");
        assert_eq!(ranges(&d), [(3 * page(), 4 * page(), 0)]);
        // The first entry's mapping is gone from the window too.
        let err = read_window(&d, 0, 4).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EFAULT));
    }

    #[test]
    fn test_map_invalid_flags() {
        let d = dispatcher(1);
        let file = backing(1);
        for flags in [0, 4, RW | 1 << 40] {
            match d.map(&message(&[entry(0, 0, page(), flags)]), fd(&file)) {
                Err(SlaveError::InvalidFlags(bits)) => assert_eq!(bits, flags),
                r => panic!("{flags:#x}: {r:?}"),
            }
        }
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_map_backing_failure() {
        let d = dispatcher(2);
        let file = backing(2);
        // Unaligned ranges cannot be mapped.
        let err = d
            .map(&message(&[entry(0, 0, 100, R)]), fd(&file))
            .unwrap_err();
        match err {
            SlaveError::BackingIo(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            err => panic!("{err:?}"),
        }

        // A read-only descriptor cannot back a shared writable mapping.
        let path = tempfile::NamedTempFile::new().unwrap();
        path.as_file().set_len(page()).unwrap();
        let read_only = File::open(path.path()).unwrap();
        let err = d
            .map(
                &message(&[entry(0, 0, page(), R), entry(0, page(), page(), RW)]),
                read_only.into(),
            )
            .unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_partial_unmap() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(&message(&[entry(0, 0, 4 * page(), R)]), fd(&file))
            .unwrap();
        d.unmap(&message(&[entry(0, page(), page(), 0)])).unwrap();
        assert_eq!(
            ranges(&d),
            [(0, page(), 0), (2 * page(), 4 * page(), 2 * page())]
        );
        assert_eq!(read_window(&d, 0, 4).unwrap(), [1; 4]);
        read_window(&d, page(), 4).unwrap_err();
        assert_eq!(read_window(&d, 3 * page(), 4).unwrap(), [4; 4]);
    }

    #[test]
    fn test_unmap_idempotent() {
        let d = dispatcher(4);
        let file = backing(4);
        d.unmap(&message(&[entry(0, 0, 4 * page(), 0)])).unwrap();
        // Unaligned is fine when nothing is mapped there.
        d.unmap(&message(&[entry(0, 10, 20, RW)])).unwrap();
        d.map(&message(&[entry(0, 0, page(), R)]), fd(&file))
            .unwrap();
        let unmap = message(&[entry(0, 0, page(), 0), entry(0, 0, page(), 0)]);
        d.unmap(&unmap).unwrap();
        d.unmap(&unmap).unwrap();
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_unmap_unaligned_past_mapping() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(&message(&[entry(0, page(), page(), R)]), fd(&file))
            .unwrap();
        // The request spills unaligned into unmapped space on both sides.
        d.unmap(&message(&[entry(0, 100, 2 * page() + 100, 0)]))
            .unwrap();
        assert!(d.mappings().is_empty());
        read_window(&d, page(), 4).unwrap_err();

        d.map(&message(&[entry(0, 0, page(), R)]), fd(&file))
            .unwrap();
        d.unmap(&message(&[entry(0, 0, page() + 100, 0)])).unwrap();
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_unmap_unaligned_within_mapping() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(&message(&[entry(0, 0, 2 * page(), R)]), fd(&file))
            .unwrap();
        // Splitting a mapping mid-page cannot be applied to the window.
        let err = d
            .unmap(&message(&[entry(0, 0, page() + 100, 0)]))
            .unwrap_err();
        match err {
            SlaveError::BackingIo(err) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            err => panic!("{err:?}"),
        }
        assert_eq!(ranges(&d), [(0, 2 * page(), 0)]);
        assert_eq!(read_window(&d, 0, 4).unwrap(), [1; 4]);
    }

    #[test]
    fn test_unmap_to_end() {
        let d = dispatcher(4);
        let file = backing(4);
        d.map(
            &message(&[entry(0, 0, page(), R), entry(0, 2 * page(), 2 * page(), R)]),
            fd(&file),
        )
        .unwrap();
        d.unmap(&message(&[entry(0, page(), u64::MAX, 0)])).unwrap();
        assert_eq!(ranges(&d), [(0, page(), 0)]);
        d.unmap(&message(&[entry(0, 4 * page(), u64::MAX, 0)]))
            .unwrap();
        assert!(matches!(
            d.unmap(&message(&[entry(0, 4 * page() + 1, u64::MAX, 0)])),
            Err(SlaveError::OutOfBounds { .. })
        ));
        d.unmap(&message(&[entry(0, 0, u64::MAX, 0)])).unwrap();
        assert!(d.mappings().is_empty());
    }

    #[test]
    fn test_io() {
        let d = dispatcher(2);
        let cache = backing(2);
        d.map(&message(&[entry(0, 0, 2 * page(), RW)]), fd(&cache))
            .unwrap();

        let file = tempfile::tempfile().unwrap();
        file.write_all_at(b"hello world", 0).unwrap();
        d.io(&message(&[entry(6, page() + 100, 5, R)]), &file)
            .unwrap();
        let mut buf = [0; 7];
        cache.read_exact_at(&mut buf, page() + 99).unwrap();
        assert_eq!(&buf, b"\x02world\x02");

        d.io(&message(&[entry(20, 0, 3, W)]), &file).unwrap();
        let mut buf = [0; 3];
        file.read_exact_at(&mut buf, 20).unwrap();
        assert_eq!(buf, [1; 3]);

        // Read then write leaves the file unchanged.
        d.io(&message(&[entry(0, 50, 5, RW)]), &file).unwrap();
        let mut buf = [0; 5];
        cache.read_exact_at(&mut buf, 50).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(ranges(&d), [(0, 2 * page(), 0)]);
    }

    #[test]
    fn test_io_failures() {
        let d = dispatcher(2);
        let cache = backing(1);
        d.map(&message(&[entry(0, 0, page(), RW)]), fd(&cache))
            .unwrap();
        let file = tempfile::tempfile().unwrap();
        file.write_all_at(&[9; 16], 0).unwrap();

        // The first entry applies; the second hits the unmapped page.
        let err = d
            .io(
                &message(&[
                    entry(0, 0, 4, R),
                    entry(0, page(), 4, R),
                    entry(8, 8, 4, R),
                ]),
                &file,
            )
            .unwrap_err();
        assert_eq!(err.errno(), libc::EFAULT);
        let mut buf = [0; 12];
        cache.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [9, 9, 9, 9, 1, 1, 1, 1, 1, 1, 1, 1]);

        // Short file.
        let err = d.io(&message(&[entry(8, 0, 16, R)]), &file).unwrap_err();
        assert_eq!(err.errno(), libc::EIO);

        assert!(matches!(
            d.io(&message(&[entry(0, 0, 4, 0)]), &file),
            Err(SlaveError::InvalidFlags(0))
        ));
        assert!(matches!(
            d.io(&message(&[entry(0, 2 * page() - 2, 4, R)]), &file),
            Err(SlaveError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_reset() {
        let d = dispatcher(2);
        let file = backing(2);
        d.map(
            &message(&[entry(0, 0, page(), R), entry(page(), page(), page(), RW)]),
            fd(&file),
        )
        .unwrap();
        d.reset();
        assert!(d.mappings().is_empty());
        read_window(&d, 0, 4).unwrap_err();
        read_window(&d, page(), 4).unwrap_err();
        d.reset();
    }
}
