//! # The paging core
//!
//! [`Vm`] owns physical memory, the page-set, view and address-space arenas,
//! and the HAT handle. Page sets are reference counted: one reference per
//! attached view, per copy-on-write child, per wire record, plus one held by
//! whoever created the set until they call [`Vm::release_pset`].

use crate::addresses::{Pfn, PhysicalAddress, PsetId, VasId, ViewId, VirtualAddress};
use crate::atl::AttachNode;
use crate::error::{FaultKind, VmError};
use crate::frame::{FrameTable, MemoryRegion};
use crate::hat::Hat;
use crate::io::{BackingStore, SwapDevice};
use crate::phys::{PageFrame, PhysMapper, Physical};
use crate::policy::{CopyOnWrite, FileBacked, FillPolicy, ZeroFill};
use crate::pset::{PageSet, PsetKind, Slot, SlotCell, SlotFlags};
use crate::vas::{Access, Protection, Vas, View};
use crate::wire::WirePool;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::ids::Pid;
use kernel_info::memory::{CLOCK_HAND_GAP, DMA_PHYS_LIMIT, PAGE_SIZE, WIRE_POOL_SIZE};
use kernel_sync::SpinMutex;
use log::{debug, error, trace, warn};

/// Runtime tunables. The defaults come from [`kernel_info::memory`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum number of simultaneously wired pages.
    pub wire_pool_size: usize,
    /// Frames at or above this address are migrated when wired for DMA.
    pub dma_limit: PhysicalAddress,
    /// Frames between the page clock's front and back hands.
    pub clock_gap: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            wire_pool_size: WIRE_POOL_SIZE,
            dma_limit: PhysicalAddress::new(DMA_PHYS_LIMIT),
            clock_gap: CLOCK_HAND_GAP,
        }
    }
}

/// Snapshot of a slot and its frame, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub flags: SlotFlags,
    pub refs: u32,
    pub pfn: Option<Pfn>,
    pub wired: u32,
    /// Attach-list length of the backing frame.
    pub attached: usize,
    pub mappings: usize,
    pub cached: bool,
}

pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) phys: Physical,
    pub(crate) hat: Arc<dyn Hat>,
    psets: SpinMutex<BTreeMap<PsetId, Arc<PageSet>>>,
    views: SpinMutex<BTreeMap<ViewId, Arc<View>>>,
    vases: SpinMutex<BTreeMap<VasId, Arc<Vas>>>,
    next_pset: AtomicU32,
    next_view: AtomicU32,
    next_vas: AtomicU32,
    pub(crate) wires: WirePool,
    pub(crate) clock_hand: SpinMutex<usize>,
}

impl Vm {
    #[must_use]
    pub fn new(
        config: VmConfig,
        map: &[MemoryRegion],
        mapper: Box<dyn PhysMapper>,
        hat: Arc<dyn Hat>,
        swap: Arc<dyn SwapDevice>,
    ) -> Self {
        let frames = FrameTable::from_memory_map(map);
        debug!(
            "vm: {} frames, {} free, dma limit {}",
            frames.total(),
            frames.free_count(),
            config.dma_limit
        );
        Self {
            wires: WirePool::new(config.wire_pool_size),
            config,
            phys: Physical::new(frames, mapper, swap),
            hat,
            psets: SpinMutex::new(BTreeMap::new()),
            views: SpinMutex::new(BTreeMap::new()),
            vases: SpinMutex::new(BTreeMap::new()),
            next_pset: AtomicU32::new(1),
            next_view: AtomicU32::new(1),
            next_vas: AtomicU32::new(1),
            clock_hand: SpinMutex::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameTable {
        &self.phys.frames
    }

    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown id.
    pub fn pset(&self, id: PsetId) -> Result<Arc<PageSet>, VmError> {
        self.psets
            .lock()
            .get(&id)
            .cloned()
            .ok_or(VmError::InvalidArgument)
    }

    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown id.
    pub fn view(&self, id: ViewId) -> Result<Arc<View>, VmError> {
        self.views
            .lock()
            .get(&id)
            .cloned()
            .ok_or(VmError::InvalidArgument)
    }

    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown id.
    pub fn vas(&self, id: VasId) -> Result<Arc<Vas>, VmError> {
        self.vases
            .lock()
            .get(&id)
            .cloned()
            .ok_or(VmError::InvalidArgument)
    }

    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown page set or index.
    pub fn slot_info(&self, pset: PsetId, index: u32) -> Result<SlotInfo, VmError> {
        let pset = self.pset(pset)?;
        if index >= pset.pages() {
            return Err(VmError::InvalidArgument);
        }
        let slot = pset.slot(index).lock();
        let (attached, mappings, cached) = slot.resident().map_or((0, 0, false), |pfn| {
            let frame = self.phys.frames.lock(pfn);
            let atl = frame.attach();
            (atl.len(), atl.mapping_count(), atl.has_cache())
        });
        Ok(SlotInfo {
            flags: slot.flags,
            refs: slot.refs,
            pfn: slot.pfn,
            wired: slot.wired,
            attached,
            mappings,
            cached,
        })
    }

    // Page sets

    /// Anonymous memory of `pages` pages. The caller holds one reference.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an empty page set.
    pub fn create_zero_fill(&self, pages: u32) -> Result<PsetId, VmError> {
        Ok(self.install(Box::new(ZeroFill::new()), pages)?.id())
    }

    /// Pages of the object behind `conn`, starting at byte `offset`.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an empty page set or unaligned offset.
    pub fn create_file(
        &self,
        conn: Box<dyn BackingStore>,
        offset: u64,
        pages: u32,
    ) -> Result<PsetId, VmError> {
        if pages == 0 || offset % PAGE_SIZE as u64 != 0 {
            conn.close();
            return Err(VmError::InvalidArgument);
        }
        Ok(self.install(Box::new(FileBacked::new(conn, offset)), pages)?.id())
    }

    /// Private copy of `pages` pages of `master`, starting at slot `offset`.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if the window exceeds the master.
    pub fn create_cow(&self, master: PsetId, offset: u32, pages: u32) -> Result<PsetId, VmError> {
        let master = self.pset(master)?;
        Ok(self.install_cow(&master, offset, pages)?.id())
    }

    /// Drop the creator's reference obtained from a `create_*` call.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown page set.
    pub fn release_pset(&self, id: PsetId) -> Result<(), VmError> {
        let pset = self.pset(id)?;
        self.put_pset(&pset);
        Ok(())
    }

    fn install(&self, policy: Box<dyn FillPolicy>, pages: u32) -> Result<Arc<PageSet>, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }
        let id = PsetId(self.next_pset.fetch_add(1, Ordering::Relaxed));
        let pset = Arc::new(PageSet::new(id, policy, pages));
        self.psets.lock().insert(id, Arc::clone(&pset));
        if let Err(e) = pset.policy().init(&self.phys, &pset) {
            warn!("{id}: init failed: {e}");
            self.put_pset(&pset);
            return Err(e);
        }
        debug!("{id}: created {:?} with {pages} pages", pset.kind());
        Ok(pset)
    }

    fn install_cow(
        &self,
        master: &Arc<PageSet>,
        offset: u32,
        pages: u32,
    ) -> Result<Arc<PageSet>, VmError> {
        if pages == 0 || offset.checked_add(pages).is_none_or(|end| end > master.pages()) {
            return Err(VmError::InvalidArgument);
        }
        // Released by `destroy_pset` of the child, including a failed install.
        master.add_ref();
        let policy = CopyOnWrite::new(Arc::clone(master), offset);
        let child = self.install(Box::new(policy), pages)?;
        master.add_cow_child(&child, offset);
        Ok(child)
    }

    pub(crate) fn put_pset(&self, pset: &Arc<PageSet>) {
        if pset.release_ref() {
            self.destroy_pset(pset);
        }
    }

    fn destroy_pset(&self, pset: &Arc<PageSet>) {
        let id = pset.id();
        self.psets.lock().remove(&id);
        pset.policy().last_ref(pset);

        for index in 0..pset.pages() {
            let mut slot = pset.slot(index).lock();
            assert!(
                !slot.flags.in_transit(),
                "{id} slot {index} in transit after the last reference"
            );
            if let Some(pfn) = slot.resident() {
                {
                    let mut frame = self.phys.frames.lock(pfn);
                    if frame.attach_mut().delete_cache().is_some() {
                        slot.refs -= 1;
                    }
                    frame.clear_owner();
                }
                debug_assert_eq!(slot.refs, 0);
                self.phys.frames.free(pfn);
            }
            *slot = Slot::default();
        }

        pset.policy().free(&self.phys, pset);
        if let Some(master) = pset.policy().master() {
            master.remove_cow_child(id);
            self.put_pset(master);
        }
        debug!("{id}: released");
    }

    // Address spaces and views

    pub fn create_vas(&self, pid: Pid) -> VasId {
        let id = VasId(self.next_vas.fetch_add(1, Ordering::Relaxed));
        self.vases.lock().insert(id, Arc::new(Vas::new(id, pid)));
        debug!("{id}: created for {pid}");
        id
    }

    /// Allow the address space to wire pages for DMA.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown address space.
    pub fn enable_dma(&self, vas: VasId) -> Result<(), VmError> {
        self.vas(vas)?.enable_dma();
        Ok(())
    }

    /// Force-release the wires taken through this address space and detach
    /// every view.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown address space.
    pub fn destroy_vas(&self, id: VasId) -> Result<(), VmError> {
        let vas = self
            .vases
            .lock()
            .remove(&id)
            .ok_or(VmError::InvalidArgument)?;
        let released = self.release_vas(id);
        for view in vas.views() {
            self.detach(view.id())?;
        }
        debug!("{id}: destroyed, {released} wires force-released");
        Ok(())
    }

    /// Map `pages` slots of `pset`, starting at slot `offset`, at `base`.
    ///
    /// # Errors
    /// * [`VmError::InvalidArgument`]: unknown ids, unaligned base, the
    ///   window exceeds the page set, or it overlaps another view.
    /// * [`VmError::Permission`]: a writable view over a file-backed page set.
    pub fn attach(
        &self,
        vas: VasId,
        pset: PsetId,
        base: VirtualAddress,
        offset: u32,
        pages: u32,
        prot: Protection,
    ) -> Result<ViewId, VmError> {
        let vas = self.vas(vas)?;
        let pset = self.pset(pset)?;
        self.attach_pset(&vas, &pset, base, offset, pages, prot)
    }

    fn attach_pset(
        &self,
        vas: &Vas,
        pset: &Arc<PageSet>,
        base: VirtualAddress,
        offset: u32,
        pages: u32,
        prot: Protection,
    ) -> Result<ViewId, VmError> {
        if !base.is_page_aligned()
            || pages == 0
            || offset.checked_add(pages).is_none_or(|end| end > pset.pages())
        {
            return Err(VmError::InvalidArgument);
        }
        if prot.writable && pset.kind() == PsetKind::File {
            return Err(VmError::Permission);
        }

        let id = ViewId(self.next_view.fetch_add(1, Ordering::Relaxed));
        let view = Arc::new(View::new(
            id,
            vas.id(),
            base,
            Arc::clone(pset),
            offset,
            pages,
            prot,
        ));
        self.views.lock().insert(id, Arc::clone(&view));
        if !vas.insert(view) {
            self.views.lock().remove(&id);
            return Err(VmError::InvalidArgument);
        }
        pset.add_ref();
        trace!("{id}: {} pages of {} at {base} in {}", pages, pset.id(), vas.id());
        Ok(id)
    }

    /// Remove every translation of the view and drop its page-set reference.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] for an unknown or already detached view.
    pub fn detach(&self, id: ViewId) -> Result<(), VmError> {
        let view = self.view(id)?;
        if !view.mark_detached() {
            return Err(VmError::InvalidArgument);
        }
        for index in view.offset()..view.offset() + view.pages() {
            self.unmap_view_page(&view, index);
        }
        self.views.lock().remove(&id);
        if let Ok(vas) = self.vas(view.vas()) {
            vas.remove(id);
        }
        self.put_pset(view.pset());
        trace!("{id}: detached");
        Ok(())
    }

    fn unmap_view_page(&self, view: &View, index: u32) {
        let mut slot = view.pset().slot(index).lock();
        let Some(pfn) = slot.resident() else { return };
        let mut frame = self.phys.frames.lock(pfn);
        if frame.attach().contains(view.id(), index) {
            self.hat
                .remove_translation(view.id(), view.page_addr(index), pfn);
            report(frame.attach_mut().delete(view.id(), index).map(drop));
            slot.refs -= 1;
        }
    }

    /// Remove every view translation of a resident slot. Cache nodes stay.
    pub(crate) fn unmap_all(&self, index: u32, pfn: Pfn, slot: &mut Slot) {
        let mut frame = self.phys.frames.lock(pfn);
        loop {
            let Some((view, at)) = frame.attach().mappings().next() else {
                break;
            };
            debug_assert_eq!(at, index);
            let vaddr = self.mapped_addr(view, at);
            self.hat.remove_translation(view, vaddr, pfn);
            report(frame.attach_mut().delete(view, at).map(drop));
            slot.refs -= 1;
        }
    }

    /// Where `view` shows slot `index`. The view must still be registered,
    /// which holds for every view named by an attach node.
    pub(crate) fn mapped_addr(&self, view: ViewId, index: u32) -> VirtualAddress {
        let view = self
            .views
            .lock()
            .get(&view)
            .cloned()
            .unwrap_or_else(|| panic!("attach list names unknown {view}"));
        view.page_addr(index)
    }

    // Faults

    pub(crate) fn resolve(
        &self,
        vas: VasId,
        vaddr: VirtualAddress,
        access: Access,
    ) -> Result<(Arc<View>, u32), VmError> {
        let vas = self.vas(vas)?;
        let view = vas.find(vaddr).ok_or(FaultKind::Unmapped)?;
        if access.is_write() && !view.protection().writable {
            return Err(FaultKind::Protection.into());
        }
        let index = view.slot_of(vaddr);
        Ok((view, index))
    }

    /// Make `vaddr` accessible in `vas` and return the backing frame.
    ///
    /// # Errors
    /// * [`VmError::Fault`]: unmapped address, protection violation, bad
    ///   page, or fill failure. A failed fill can be retried.
    /// * [`VmError::OutOfMemory`]: no frame for the fill or a copy-on-write push.
    pub fn fault(&self, vas: VasId, vaddr: VirtualAddress, access: Access) -> Result<Pfn, VmError> {
        let (view, index) = self.resolve(vas, vaddr, access)?;
        self.fault_view(&view, index, access)
    }

    pub(crate) fn fault_view(&self, view: &View, index: u32, access: Access) -> Result<Pfn, VmError> {
        let pset = view.pset();
        let cell = pset.slot(index);
        loop {
            let mut slot = cell.lock();
            if view.is_detached() {
                return Err(FaultKind::Unmapped.into());
            }
            if slot.flags.bad() {
                return Err(FaultKind::BadPage.into());
            }
            if slot.flags.in_transit() {
                cell.wait(slot);
                continue;
            }

            if let Some(pfn) = slot.resident() {
                if access.is_write() {
                    self.cow_push(pset, index, pfn)?;
                    slot.flags.set_modified(true);
                }
                slot.flags.set_referenced(true);
                self.map(view, index, pfn, &mut slot, access.is_write());
                return Ok(pfn);
            }

            // Fill with no lock held; other faulters wait for us.
            slot.flags.set_in_transit(true);
            let flags = slot.flags;
            drop(slot);
            trace!("{} slot {index}: fill", pset.id());
            let filled = pset.policy().fill_slot(&self.phys, pset, index, flags);

            let mut slot = cell.lock();
            let sleepers = SlotCell::end_transit(&mut slot);
            let outcome = match filled {
                // A copy-on-write push beat us to it.
                Ok(filled) if slot.flags.valid() => Ok(Some(filled.pfn)),
                Ok(filled) => {
                    {
                        let mut frame = self.phys.frames.lock(filled.pfn);
                        frame.set_owner(pset.id(), index);
                        if filled.cached {
                            frame.attach_mut().add(AttachNode::cache(index));
                        }
                    }
                    slot.commit(filled.pfn, u32::from(filled.cached));
                    if filled.dirty {
                        slot.flags.set_modified(true);
                    }
                    Ok(None)
                }
                Err(e) => Err(e),
            };
            drop(slot);
            cell.wake(sleepers);

            match outcome {
                Ok(Some(unused)) => self.phys.frames.free(unused),
                Ok(None) => {}
                Err(e) => {
                    warn!("{} slot {index}: fill failed: {e}", pset.id());
                    return Err(e);
                }
            }
        }
    }

    /// Translate slot `index` in `view`. An existing writable translation
    /// stays writable.
    fn map(&self, view: &View, index: u32, pfn: Pfn, slot: &mut Slot, write: bool) {
        let mut frame = self.phys.frames.lock(pfn);
        let attach = frame.attach_mut();
        let writable = if let Some(node) = attach.find_mut(view.id(), index) {
            node.writable |= write;
            node.writable
        } else {
            attach.add(AttachNode {
                writable: write,
                ..AttachNode::mapping(view.id(), index)
            });
            slot.refs += 1;
            write
        };
        self.hat
            .add_translation(view.id(), view.page_addr(index), pfn, writable);
        debug_assert_eq!(slot.refs as usize, frame.attach().len());
    }

    /// Give every copy-on-write child lacking its own copy of slot `index`
    /// a snapshot of `src` before the master overwrites it. The caller holds
    /// the master slot lock.
    fn cow_push(&self, master: &PageSet, index: u32, src: Pfn) -> Result<(), VmError> {
        if !master.has_cow_children() {
            return Ok(());
        }
        for (child, at) in master.cow_children_at(index) {
            let mut slot = child.slot(at).lock();
            if slot.flags.valid() || slot.flags.swapped() || slot.flags.bad() {
                continue;
            }
            let pfn = self.phys.frames.allocate()?;
            // SAFETY: The master slot lock keeps `src` stable; `pfn` is private.
            unsafe { self.phys.copy(src, pfn) };
            self.phys.frames.lock(pfn).set_owner(child.id(), at);
            slot.commit(pfn, 0);
            slot.flags.set_modified(true);
            trace!("{} slot {index}: pushed copy to {} slot {at}", master.id(), child.id());
        }
        Ok(())
    }

    // Simulated user access

    /// Copy from user memory, faulting pages in as needed.
    ///
    /// # Errors
    /// As for [`fault`](Self::fault).
    pub fn read(&self, vas: VasId, vaddr: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = vaddr + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let offset = at.page_offset() as usize;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            self.with_page(vas, at, Access::Read, |frame| {
                dst.copy_from_slice(&frame.as_bytes()[offset..offset + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy into user memory, faulting pages in (and copies out) as needed.
    ///
    /// # Errors
    /// As for [`fault`](Self::fault).
    pub fn write(&self, vas: VasId, vaddr: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let at = vaddr + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let offset = at.page_offset() as usize;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let src = &data[done..done + chunk];
            self.with_page(vas, at, Access::Write, |frame| {
                frame.as_bytes_mut()[offset..offset + chunk].copy_from_slice(src);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Run `f` on the frame behind `vaddr` while the view translates it.
    fn with_page(
        &self,
        vas: VasId,
        vaddr: VirtualAddress,
        access: Access,
        f: impl FnOnce(&mut PageFrame),
    ) -> Result<(), VmError> {
        let (view, index) = self.resolve(vas, vaddr, access)?;
        let mut f = Some(f);
        loop {
            let pfn = self.fault_view(&view, index, access)?;
            let slot = view.pset().slot(index).lock();
            let translated = slot.resident() == Some(pfn)
                && !slot.flags.in_transit()
                && self.phys.frames.lock(pfn).attach().contains(view.id(), index);
            if translated && let Some(f) = f.take() {
                // SAFETY: The slot lock serializes every access to the frame content.
                f(unsafe { self.phys.frame_mut(pfn) });
                return Ok(());
            }
        }
    }

    // Fork

    /// Give `target` a view equivalent to `view`.
    ///
    /// Shared views share the page set. Private views over anonymous memory
    /// get a copy-on-write child; the parent's translations are removed so
    /// its next write pushes a copy. Private file views get a second page
    /// set over a duplicated connection.
    ///
    /// # Errors
    /// Unknown ids, overlap in `target`, or a failed connection `dup`.
    pub fn fork_view(&self, view: ViewId, target: VasId) -> Result<ViewId, VmError> {
        let view = self.view(view)?;
        let target = self.vas(target)?;
        let pset = view.pset();

        let child = if view.protection().shared {
            pset.add_ref();
            Arc::clone(pset)
        } else if let Some(policy) = pset.policy().dup(pset)? {
            self.install(policy, pset.pages())?
        } else {
            let child = self.install_cow(pset, 0, pset.pages())?;
            self.protect(pset);
            child
        };

        let result = self.attach_pset(
            &target,
            &child,
            view.base(),
            view.offset(),
            view.pages(),
            view.protection(),
        );
        self.put_pset(&child);
        let id = result?;
        debug!("{}: forked into {id} over {}", view.id(), child.id());
        Ok(id)
    }

    /// Fork every view of `parent` into a new address space for `pid`.
    /// DMA permission is not inherited.
    ///
    /// # Errors
    /// As for [`fork_view`](Self::fork_view); the half-built child is destroyed.
    pub fn fork_vas(&self, parent: VasId, pid: Pid) -> Result<VasId, VmError> {
        let parent = self.vas(parent)?;
        let child = self.create_vas(pid);
        for view in parent.views() {
            if let Err(e) = self.fork_view(view.id(), child) {
                self.destroy_vas(child)?;
                return Err(e);
            }
        }
        Ok(child)
    }

    /// Remove every translation of every resident slot of `pset`.
    fn protect(&self, pset: &PageSet) {
        for index in 0..pset.pages() {
            let mut slot = pset.slot(index).lock();
            if let Some(pfn) = slot.resident() {
                self.unmap_all(index, pfn, &mut slot);
            }
        }
    }
}

/// Attach-list misses are caller bugs: fatal in debug builds, logged otherwise.
fn report(result: Result<(), crate::error::AtlError>) {
    if let Err(e) = result {
        error!("attach list: {e}");
        debug_assert!(false, "attach list: {e}");
    }
}
