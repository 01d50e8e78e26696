use super::{FillPolicy, WriteDone, Written, fill_error};
use crate::addresses::Pfn;
use crate::error::{IoError, VmError};
use crate::io::BackingStore;
use crate::phys::Physical;
use crate::pset::{PageSet, PsetKind, SlotFlags};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_info::memory::PAGE_SIZE;
use log::debug;

/// Pages read from a backing-store connection, starting at a byte offset.
///
/// Views over file-backed page sets are read-only, so a frame can always be
/// dropped and re-read; there is never anything to write back.
pub struct FileBacked {
    conn: Box<dyn BackingStore>,
    offset: u64,
}

impl FileBacked {
    #[must_use]
    pub fn new(conn: Box<dyn BackingStore>, offset: u64) -> Self {
        Self { conn, offset }
    }
}

impl FillPolicy for FileBacked {
    fn kind(&self) -> PsetKind {
        PsetKind::File
    }

    fn load_page(
        &self,
        phys: &Physical,
        _pset: &PageSet,
        index: u32,
        _flags: SlotFlags,
        pfn: Pfn,
    ) -> Result<(), VmError> {
        let at = self.offset + u64::from(index) * PAGE_SIZE as u64;
        // SAFETY: The frame is private to the filling thread.
        let frame = unsafe { phys.frame_mut(pfn) };
        let got = self.conn.read_page(at, frame, PAGE_SIZE).map_err(fill_error)?;
        if got < PAGE_SIZE {
            return Err(fill_error(IoError::ShortRead {
                got,
                want: PAGE_SIZE,
            }));
        }
        Ok(())
    }

    fn caches_pages(&self) -> bool {
        true
    }

    fn write_slot(
        &self,
        _phys: &Physical,
        pset: &PageSet,
        index: u32,
        _pfn: Pfn,
        flags: SlotFlags,
        done: WriteDone<'_>,
    ) {
        assert!(
            !flags.modified(),
            "{} slot {index}: file-backed page modified at write-back",
            pset.id()
        );
        done(Ok(Written::Clean));
    }

    fn dup(&self, old: &Arc<PageSet>) -> Result<Option<Box<dyn FillPolicy>>, VmError> {
        let conn = self.conn.dup().map_err(VmError::Io)?;
        debug!("{}: duplicated backing-store connection", old.id());
        Ok(Some(Box::new(Self {
            conn,
            offset: self.offset,
        })))
    }

    fn free(&self, _phys: &Physical, _pset: &PageSet) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::{PhysicalAddress, PsetId};
    use crate::frame::{FrameTable, MemoryRegion};
    use crate::io::{SwapBlock, SwapDevice};
    use crate::phys::{HeapPhysMapper, PageFrame};
    use alloc::vec::Vec;

    struct Bytes(Vec<u8>);

    impl BackingStore for Bytes {
        fn read_page(&self, offset: u64, buf: &mut PageFrame, len: usize) -> Result<usize, IoError> {
            let start = (offset as usize).min(self.0.len());
            let n = len.min(self.0.len() - start);
            buf.as_bytes_mut()[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn write_page(&self, _: u64, _: &PageFrame, _: usize) -> Result<(), IoError> {
            Err(IoError::Failed)
        }

        fn dup(&self) -> Result<Box<dyn BackingStore>, IoError> {
            Ok(Box::new(Self(self.0.clone())))
        }

        fn close(&self) {}
    }

    struct NoSwap;

    impl SwapDevice for NoSwap {
        fn alloc(&self, _: u32) -> Result<SwapBlock, IoError> {
            Err(IoError::NoSpace)
        }
        fn free(&self, _: SwapBlock, _: u32) {}
        fn read_page(&self, _: SwapBlock, _: &mut PageFrame) -> Result<(), IoError> {
            Err(IoError::Failed)
        }
        fn write_page(&self, _: SwapBlock, _: &PageFrame) -> Result<(), IoError> {
            Err(IoError::Failed)
        }
    }

    fn physical() -> Physical {
        let map = [MemoryRegion::usable(PhysicalAddress::new(0x10_000), 4)];
        Physical::new(
            FrameTable::from_memory_map(&map),
            Box::new(HeapPhysMapper::from_memory_map(&map)),
            Arc::new(NoSwap),
        )
    }

    /// Three pages, filled with 1, 2 and 3, mapped from the second page on.
    fn file_set() -> PageSet {
        #[allow(clippy::cast_possible_truncation)]
        let data = (0..3 * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8 + 1).collect();
        let policy = FileBacked::new(Box::new(Bytes(data)), PAGE_SIZE as u64);
        PageSet::new(PsetId(1), Box::new(policy), 2)
    }

    #[test]
    fn reads_at_the_byte_offset() {
        let phys = physical();
        let pset = file_set();
        let pfn = phys.frames.allocate().unwrap();
        pset.policy()
            .load_page(&phys, &pset, 1, SlotFlags::new(), pfn)
            .unwrap();
        let frame = unsafe { phys.frame(pfn) };
        assert!(frame.as_bytes().iter().all(|&b| b == 3));
    }

    #[test]
    fn short_read_is_a_fill_error() {
        let phys = physical();
        let pset = file_set();
        let pfn = phys.frames.allocate().unwrap();
        let err = pset
            .policy()
            .load_page(&phys, &pset, 2, SlotFlags::new(), pfn)
            .unwrap_err();
        assert_eq!(
            err,
            fill_error(IoError::ShortRead {
                got: 0,
                want: PAGE_SIZE
            })
        );
    }

    #[test]
    fn clean_pages_are_dropped_without_io() {
        let phys = physical();
        let pset = file_set();
        let mut outcome = None;
        pset.policy().write_slot(
            &phys,
            &pset,
            0,
            Pfn::new(0x10),
            SlotFlags::new().with_valid(true),
            &mut |r| outcome = Some(r),
        );
        assert_eq!(outcome, Some(Ok(Written::Clean)));
    }

    #[test]
    #[should_panic(expected = "modified at write-back")]
    fn modified_file_page_panics() {
        let phys = physical();
        let pset = file_set();
        pset.policy().write_slot(
            &phys,
            &pset,
            0,
            Pfn::new(0x10),
            SlotFlags::new().with_valid(true).with_modified(true),
            &mut |_| {},
        );
    }
}
