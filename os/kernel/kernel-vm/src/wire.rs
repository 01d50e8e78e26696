//! # Page wiring
//!
//! A wire pins the frame behind a user address so a device can DMA into it:
//! the frame can be neither evicted nor migrated until the wire is released.
//! Wire records come from a fixed pool guarded by a FIFO semaphore; when the
//! pool is exhausted, [`Vm::wire`] sleeps and [`Vm::try_wire`] fails with
//! [`VmError::Busy`].
//!
//! Devices limited to the low 16 MiB ask for `dma_low`. A frame above the
//! limit is then replaced by a low one:
//!
//! ```text
//!   1. allocate low frame            (slot locked)
//!   2. remove translations of old    (old frame locked)
//!   3. copy old → new
//!   4. move attach list and owner    (new frame locked)
//!   5. re-add translations, read-only
//!   6. point slot at new, free old
//! ```

use crate::Vm;
use crate::addresses::{Pfn, PhysicalAddress, VasId, VirtualAddress};
use crate::error::{FaultKind, VmError};
use crate::pset::{PageSet, Slot};
use crate::vas::{Access, View};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::ids::Pid;
use kernel_sync::{Semaphore, SpinMutex};
use log::{debug, warn};

/// Names an outstanding wire. Stale handles are rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WireHandle(u64);

impl WireHandle {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn from_u64(v: u64) -> Self {
        Self(v)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn split(self) -> (usize, u32) {
        ((self.0 & 0xFFFF_FFFF) as usize, (self.0 >> 32) as u32)
    }
}

impl fmt::Display for WireHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (index, generation) = self.split();
        write!(f, "wire {index}.{generation}")
    }
}

/// A pinned page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Wired {
    pub handle: WireHandle,
    /// Physical address of the wired byte.
    pub phys: PhysicalAddress,
}

pub(crate) struct WireRecord {
    pid: Pid,
    vas: VasId,
    generation: u32,
    pset: Arc<PageSet>,
    index: u32,
    pfn: Pfn,
}

struct Records {
    entries: Vec<Option<WireRecord>>,
    generation: u32,
}

pub(crate) struct WirePool {
    gate: Semaphore,
    records: SpinMutex<Records>,
}

impl WirePool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            gate: Semaphore::new(size),
            records: SpinMutex::new(Records {
                entries: (0..size).map(|_| None).collect(),
                generation: 0,
            }),
        }
    }

    /// Store a record; the caller holds a permit of the gate.
    fn insert(&self, mut record: WireRecord) -> WireHandle {
        let mut records = self.records.lock();
        records.generation = records.generation.wrapping_add(1);
        record.generation = records.generation;
        let index = records
            .entries
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| panic!("wire pool admitted more records than entries"));
        records.entries[index] = Some(record);
        WireHandle((u64::from(records.generation) << 32) | index as u64)
    }

    fn take(&self, pid: Pid, handle: WireHandle) -> Result<WireRecord, VmError> {
        let (index, generation) = handle.split();
        let mut records = self.records.lock();
        let entry = records
            .entries
            .get_mut(index)
            .ok_or(VmError::InvalidArgument)?;
        let owned = entry
            .as_ref()
            .is_some_and(|r| r.pid == pid && r.generation == generation);
        if !owned {
            return Err(VmError::InvalidArgument);
        }
        entry.take().ok_or(VmError::InvalidArgument)
    }

    fn take_all(&self, matches: impl Fn(&WireRecord) -> bool) -> Vec<WireRecord> {
        let mut records = self.records.lock();
        records
            .entries
            .iter_mut()
            .filter(|e| e.as_ref().is_some_and(&matches))
            .filter_map(Option::take)
            .collect()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.records
            .lock()
            .entries
            .iter()
            .filter(|e| e.is_some())
            .count()
    }
}

impl Vm {
    /// Pin the page behind `vaddr`, waiting for a free wire record.
    ///
    /// # Errors
    /// * [`VmError::Permission`]: DMA is not enabled for `vas`.
    /// * [`VmError::Fault`]: `vaddr` is unmapped or cannot be filled.
    /// * [`VmError::OutOfMemory`]: no frame below the DMA limit.
    /// * [`VmError::Busy`]: `dma_low` on a page already wired above the limit.
    pub fn wire(&self, vas: VasId, vaddr: VirtualAddress, dma_low: bool) -> Result<Wired, VmError> {
        self.wire_page(vas, vaddr, dma_low, true)
    }

    /// As [`wire`](Self::wire), but fails with [`VmError::Busy`] instead of
    /// waiting when every wire record is in use.
    ///
    /// # Errors
    /// As for [`wire`](Self::wire).
    pub fn try_wire(
        &self,
        vas: VasId,
        vaddr: VirtualAddress,
        dma_low: bool,
    ) -> Result<Wired, VmError> {
        self.wire_page(vas, vaddr, dma_low, false)
    }

    /// Number of wire records in use.
    #[must_use]
    pub fn wired_count(&self) -> usize {
        self.wires.outstanding()
    }

    fn wire_page(
        &self,
        vas_id: VasId,
        vaddr: VirtualAddress,
        dma_low: bool,
        block: bool,
    ) -> Result<Wired, VmError> {
        let vas = self.vas(vas_id)?;
        if !vas.dma_enabled() {
            return Err(VmError::Permission);
        }
        let (view, index) = self.resolve(vas_id, vaddr, Access::Read)?;
        self.fault_view(&view, index, Access::Read)?;

        if block {
            self.wires.gate.acquire();
        } else if !self.wires.gate.try_acquire() {
            debug!("wire pool exhausted, {} refused", vas.pid());
            return Err(VmError::Busy);
        }

        match self.pin(&view, index, dma_low) {
            Ok(pfn) => {
                let handle = self.wires.insert(WireRecord {
                    pid: vas.pid(),
                    vas: vas_id,
                    generation: 0,
                    pset: Arc::clone(view.pset()),
                    index,
                    pfn,
                });
                debug!("{handle}: {} slot {index} at {pfn} for {}", view.pset().id(), vas.pid());
                Ok(Wired {
                    handle,
                    phys: pfn.base() + vaddr.page_offset(),
                })
            }
            Err(e) => {
                self.wires.gate.release();
                Err(e)
            }
        }
    }

    fn pin(&self, view: &View, index: u32, dma_low: bool) -> Result<Pfn, VmError> {
        let pset = view.pset();
        let cell = pset.slot(index);
        let limit = self.config.dma_limit.pfn();
        loop {
            self.fault_view(view, index, Access::Read)?;
            let mut slot = cell.lock();
            if slot.flags.in_transit() {
                cell.wait(slot);
                continue;
            }
            if view.is_detached() {
                return Err(FaultKind::Unmapped.into());
            }
            // Evicted again before we got the lock.
            let Some(mut pfn) = slot.resident() else {
                continue;
            };
            if dma_low && pfn >= limit {
                if slot.wired > 0 {
                    return Err(VmError::Busy);
                }
                pfn = self.migrate(pset, index, pfn, &mut slot)?;
            }
            slot.wired += 1;
            self.phys.frames.lock(pfn).set_wired(true);
            pset.add_ref();
            return Ok(pfn);
        }
    }

    /// Move slot `index` of `pset` from `old` to a frame below the DMA limit.
    /// The caller holds the slot lock.
    fn migrate(&self, pset: &PageSet, index: u32, old: Pfn, slot: &mut Slot) -> Result<Pfn, VmError> {
        let limit = self.config.dma_limit.pfn();
        let new = self
            .phys
            .frames
            .allocate_matching(|pfn| pfn < limit)
            .map_err(|e| {
                warn!("{} slot {index}: no frame below {limit}: {e}", pset.id());
                VmError::OutOfMemory
            })?;

        {
            let mut from = self.phys.frames.lock(old);
            let mut nodes = from.attach_mut().take();
            nodes.clear_writable();
            for (view, at) in nodes.mappings() {
                self.hat.remove_translation(view, self.mapped_addr(view, at), old);
            }
            // SAFETY: The slot lock is held and no translation reaches `old`; `new` is private.
            unsafe { self.phys.copy(old, new) };

            let mut to = self.phys.frames.lock(new);
            to.set_owner(pset.id(), index);
            for (view, at) in nodes.mappings() {
                self.hat.add_translation(view, self.mapped_addr(view, at), new, false);
            }
            *to.attach_mut() = nodes;
            from.clear_owner();
        }
        slot.pfn = Some(new);
        self.phys.frames.free(old);
        debug!("{} slot {index}: migrated {old} to {new}", pset.id());
        Ok(new)
    }

    /// Release a wire owned by `pid`.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if `handle` is unknown, stale, or owned
    /// by another process.
    pub fn release_wire(&self, pid: Pid, handle: WireHandle) -> Result<(), VmError> {
        let record = self.wires.take(pid, handle)?;
        self.unpin(&record);
        self.wires.gate.release();
        debug!("{handle}: released by {pid}");
        Ok(())
    }

    /// Release every wire owned by `pid`; returns how many there were.
    pub fn release_all(&self, pid: Pid) -> usize {
        self.release_matching(|r| r.pid == pid)
    }

    /// Release every wire taken through `vas`; returns how many there were.
    pub(crate) fn release_vas(&self, vas: VasId) -> usize {
        self.release_matching(|r| r.vas == vas)
    }

    fn release_matching(&self, matches: impl Fn(&WireRecord) -> bool) -> usize {
        let records = self.wires.take_all(matches);
        for record in &records {
            self.unpin(record);
        }
        self.wires.gate.release_n(records.len());
        records.len()
    }

    fn unpin(&self, record: &WireRecord) {
        {
            let mut slot = record.pset.slot(record.index).lock();
            assert!(slot.wired > 0, "{} slot {} not wired", record.pset.id(), record.index);
            debug_assert_eq!(slot.pfn, Some(record.pfn));
            slot.wired -= 1;
            if slot.wired == 0 {
                self.phys.frames.lock(record.pfn).set_wired(false);
            }
        }
        self.put_pset(&record.pset);
    }
}
